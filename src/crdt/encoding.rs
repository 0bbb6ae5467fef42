//! Versioned binary encoding of CRDT state.
//!
//! Layout: the magic bytes `RTMC`, one format version byte, one payload
//! kind byte, then the borsh-encoded payload. Decoding refuses unknown
//! versions and trailing bytes rather than guessing.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use crate::crdt::StoreState;

/// Leading bytes of every encoded blob.
pub const MAGIC: [u8; 4] = *b"RTMC";

/// The format version written by this build.
pub const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = MAGIC.len() + 2;

/// What an encoded blob contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PayloadKind {
    /// Bare field state, as exchanged between peers.
    State,
    /// A whole store: replica id, clock, state and offline queue.
    Store,
}

impl PayloadKind {
    const fn tag(self) -> u8 {
        match self {
            Self::State => 0,
            Self::Store => 1,
        }
    }

    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::State),
            1 => Some(Self::Store),
            _ => None,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Store => "store",
        }
    }
}

/// Encoded state could not be decoded.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The blob is shorter than the header.
    #[error("encoded state is truncated")]
    Truncated,

    /// The blob does not start with the expected magic bytes.
    #[error("not an encoded requirement store")]
    BadMagic,

    /// The blob was written by a newer (or unknown) format version.
    #[error("unsupported encoding version {found} (this build reads version {supported})")]
    UnsupportedVersion {
        /// The version found in the blob.
        found: u8,
        /// The version this build understands.
        supported: u8,
    },

    /// The blob holds a different kind of payload than requested.
    #[error("expected an encoded {expected} but found an encoded {found}")]
    WrongPayload {
        /// The payload the caller asked for.
        expected: &'static str,
        /// The payload found, or `unknown`.
        found: &'static str,
    },

    /// The payload itself is malformed.
    #[error("corrupt payload: {0}")]
    Corrupt(#[from] std::io::Error),
}

/// Encodes bare state.
#[must_use]
pub fn encode_state(state: &StoreState) -> Vec<u8> {
    encode(PayloadKind::State, state)
}

/// Decodes bare state.
///
/// # Errors
///
/// Returns an [`EncodingError`] for a blob that is truncated, carries the
/// wrong magic bytes, version or payload kind, or whose payload does not
/// decode exactly.
pub fn decode_state(bytes: &[u8]) -> Result<StoreState, EncodingError> {
    decode(bytes, PayloadKind::State)
}

/// Frames a borsh payload.
///
/// # Panics
///
/// Panics if borsh serialization fails (which should never happen when
/// writing to memory).
pub(crate) fn encode<T: BorshSerialize>(kind: PayloadKind, payload: &T) -> Vec<u8> {
    let mut buffer = header(kind);
    payload
        .serialize(&mut buffer)
        .expect("writing to a Vec should never fail");
    buffer
}

/// Unframes a borsh payload, requiring it to span the rest of the blob.
pub(crate) fn decode<T: BorshDeserialize>(
    bytes: &[u8],
    kind: PayloadKind,
) -> Result<T, EncodingError> {
    let mut payload = open(bytes, kind)?;
    let value = T::deserialize(&mut payload)?;
    finish(payload)?;
    Ok(value)
}

fn header(kind: PayloadKind) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(&MAGIC);
    buffer.push(FORMAT_VERSION);
    buffer.push(kind.tag());
    buffer
}

fn open(bytes: &[u8], expected: PayloadKind) -> Result<&[u8], EncodingError> {
    if bytes.len() < HEADER_LEN {
        return Err(if bytes.starts_with(&MAGIC[..bytes.len().min(MAGIC.len())]) {
            EncodingError::Truncated
        } else {
            EncodingError::BadMagic
        });
    }
    let (head, payload) = bytes.split_at(HEADER_LEN);
    if head[..MAGIC.len()] != MAGIC {
        return Err(EncodingError::BadMagic);
    }
    let version = head[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(EncodingError::UnsupportedVersion {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    match PayloadKind::from_tag(head[MAGIC.len() + 1]) {
        Some(kind) if kind == expected => Ok(payload),
        found => Err(EncodingError::WrongPayload {
            expected: expected.name(),
            found: found.map_or("unknown", PayloadKind::name),
        }),
    }
}

fn finish(rest: &[u8]) -> Result<(), EncodingError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(EncodingError::Corrupt(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} trailing bytes", rest.len()),
        )))
    }
}
