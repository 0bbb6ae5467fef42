use std::{cmp::Ordering, fmt, str::FromStr};

use borsh::{BorshDeserialize, BorshSerialize};
use non_empty_string::NonEmptyString;
use serde::{Deserialize, Serialize};

const PREFIX: &str = "REQ";

/// A requirement identifier of the form `REQ-{CATEGORY}-{NNN}`.
///
/// - `CATEGORY` is an uppercase token (`A-Z`, `0-9`, `_`) beginning with a
///   letter, e.g. `CORE` or `GIT_SYNC`
/// - `NNN` is a decimal number of at least one digit, e.g. `001`
///
/// The original token is kept verbatim so that ids round-trip through a
/// snapshot unchanged. Ordering is numeric within a category, so `REQ-A-9`
/// sorts before `REQ-A-10`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementId {
    token: NonEmptyString,
    category: NonEmptyString,
    number: u64,
}

impl RequirementId {
    /// Parses and validates an id.
    ///
    /// # Errors
    ///
    /// Returns an [`IdError`] if the token does not follow the
    /// `REQ-{CATEGORY}-{NNN}` format.
    pub fn new(token: impl Into<String>) -> Result<Self, IdError> {
        let token = token.into();
        let trimmed = token.trim();

        let rest = trimmed
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_prefix('-'))
            .ok_or_else(|| IdError::Prefix(token.clone()))?;

        let (category, digits) = rest
            .rsplit_once('-')
            .ok_or_else(|| IdError::Syntax(token.clone()))?;

        if !is_valid_category(category) {
            return Err(IdError::Category(token.clone(), category.to_string()));
        }

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(IdError::Number(token.clone(), digits.to_string()));
        }
        let number = digits
            .parse::<u64>()
            .map_err(|_| IdError::Number(token.clone(), digits.to_string()))?;

        let category = NonEmptyString::new(category.to_string())
            .map_err(|_| IdError::Syntax(token.clone()))?;
        let token = NonEmptyString::new(trimmed.to_string()).map_err(|_| IdError::Syntax(token))?;

        Ok(Self {
            token,
            category,
            number,
        })
    }

    /// The category segment, e.g. `CORE` for `REQ-CORE-001`.
    #[must_use]
    pub fn category(&self) -> &str {
        self.category.as_str()
    }

    /// The numeric segment.
    #[must_use]
    pub const fn number(&self) -> u64 {
        self.number
    }

    /// The id exactly as it was written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.token.as_str()
    }
}

fn is_valid_category(category: &str) -> bool {
    let mut chars = category.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

impl Ord for RequirementId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.category
            .as_str()
            .cmp(other.category.as_str())
            .then(self.number.cmp(&other.number))
            .then_with(|| self.token.as_str().cmp(other.token.as_str()))
    }
}

impl PartialOrd for RequirementId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RequirementId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequirementId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for RequirementId {
    type Error = IdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl AsRef<str> for RequirementId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Serialize for RequirementId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RequirementId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

// Encoded as the raw token; decoding re-validates it.
impl BorshSerialize for RequirementId {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        BorshSerialize::serialize(self.as_str(), writer)
    }
}

impl BorshDeserialize for RequirementId {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        let token = String::deserialize_reader(reader)?;
        Self::new(token)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }
}

/// Errors that can occur while parsing a [`RequirementId`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    /// The id does not start with `REQ-`.
    #[error("Invalid requirement id '{0}': expected the 'REQ-' prefix")]
    Prefix(String),

    /// The id has no `-` separating category and number.
    #[error("Invalid requirement id format: {0}")]
    Syntax(String),

    /// The category is empty or contains invalid characters.
    #[error(
        "Invalid category in requirement id '{0}': '{1}' must be uppercase letters, digits or '_', starting with a letter"
    )]
    Category(String, String),

    /// The numeric segment is missing or not a number.
    #[error("Invalid number in requirement id '{0}': expected digits, got '{1}'")]
    Number(String, String),
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn parses_category_and_number() {
        let id = RequirementId::new("REQ-CORE-042").unwrap();
        assert_eq!(id.category(), "CORE");
        assert_eq!(id.number(), 42);
        assert_eq!(id.as_str(), "REQ-CORE-042");
    }

    #[test]
    fn keeps_token_verbatim() {
        let id = RequirementId::new("REQ-X-1").unwrap();
        assert_eq!(id.to_string(), "REQ-X-1");

        let padded = RequirementId::new("REQ-X-001").unwrap();
        assert_ne!(id, padded);
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        let id = RequirementId::new("  REQ-GIT-003 ").unwrap();
        assert_eq!(id.as_str(), "REQ-GIT-003");
    }

    #[test_case("REQ-GIT_SYNC-7"; "underscore")]
    #[test_case("REQ-V2-100"; "digits after letter")]
    #[test_case("REQ-A-0"; "zero")]
    fn accepts_valid(token: &str) {
        assert!(RequirementId::new(token).is_ok());
    }

    #[test_case("", "prefix"; "empty")]
    #[test_case("SYS-001", "prefix"; "wrong prefix")]
    #[test_case("REQ-001", "syntax"; "missing category")]
    #[test_case("REQ-core-001", "category"; "lowercase category")]
    #[test_case("REQ-2FA-001", "category"; "category starts with digit")]
    #[test_case("REQ--001", "category"; "empty category")]
    #[test_case("REQ-CORE-", "number"; "empty number")]
    #[test_case("REQ-CORE-01a", "number"; "non numeric")]
    fn rejects_invalid(token: &str, kind: &str) {
        let err = RequirementId::new(token).unwrap_err();
        let actual = match &err {
            IdError::Prefix(_) => "prefix",
            IdError::Syntax(_) => "syntax",
            IdError::Category(..) => "category",
            IdError::Number(..) => "number",
        };
        assert_eq!(actual, kind, "{token}: {err}");
    }

    #[test]
    fn orders_numerically_within_category() {
        let mut ids: Vec<RequirementId> = ["REQ-B-1", "REQ-A-10", "REQ-A-9"]
            .into_iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let tokens: Vec<_> = ids.iter().map(RequirementId::as_str).collect();
        assert_eq!(tokens, ["REQ-A-9", "REQ-A-10", "REQ-B-1"]);
    }

    #[test]
    fn borsh_decoding_revalidates() {
        let bytes = borsh::to_vec("not-an-id").unwrap();
        assert!(borsh::from_slice::<RequirementId>(&bytes).is_err());

        let id = RequirementId::new("REQ-X-001").unwrap();
        let bytes = borsh::to_vec(&id).unwrap();
        assert_eq!(borsh::from_slice::<RequirementId>(&bytes).unwrap(), id);
    }

    #[test]
    fn serde_decoding_revalidates() {
        let id: RequirementId = serde_json::from_str("\"REQ-X-001\"").unwrap();
        assert_eq!(id.as_str(), "REQ-X-001");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"REQ-X-001\"");
        assert!(serde_json::from_str::<RequirementId>("\"not-an-id\"").is_err());
    }

    #[test]
    fn error_display() {
        let err = RequirementId::new("REQ-CORE-x").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid number in requirement id 'REQ-CORE-x': expected digits, got 'x'"
        );
    }
}
