use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::{
    crdt::{Field, FieldValue, MergePolicy, StoreState},
    domain::{EngineConfig, FieldTieBreak, RequirementId, RequirementRecord},
    storage::Table,
};

/// One side of a three-way merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The current branch.
    Ours,
    /// The branch being merged in.
    Theirs,
}

impl Side {
    /// The opposite side.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Ours => Self::Theirs,
            Self::Theirs => Self::Ours,
        }
    }
}

impl From<FieldTieBreak> for Side {
    fn from(tie_break: FieldTieBreak) -> Self {
        match tie_break {
            FieldTieBreak::Ours => Self::Ours,
            FieldTieBreak::Theirs => Self::Theirs,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ours => "ours",
            Self::Theirs => "theirs",
        })
    }
}

/// How a record was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// At most one side changed the record.
    Clean,
    /// Both sides changed it and every difference was resolved by rule.
    AutoResolved,
    /// A human should review the result.
    Conflicted,
    /// The record was deleted and the deletion honored.
    Deleted,
}

/// The three versions of one record and how they were resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEnvelope {
    /// The record id.
    pub id: RequirementId,
    /// The common ancestor's version.
    pub base: Option<RequirementRecord>,
    /// Our version.
    pub ours: Option<RequirementRecord>,
    /// Their version.
    pub theirs: Option<RequirementRecord>,
    /// The outcome.
    pub resolution: Resolution,
}

/// What a conflict is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    /// One side deleted the record, the other modified it. The modified
    /// version is kept.
    DeleteModify {
        /// The side that deleted the record.
        deleted_on: Side,
    },
    /// Both sides changed a field to different values.
    Field {
        /// The field.
        field: Field,
        /// The ancestor's value, if the record existed there.
        base: Option<String>,
        /// Our value.
        ours: String,
        /// Their value.
        theirs: String,
        /// The side whose value was kept.
        chosen: Side,
    },
}

/// A difference that needs human review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeConflict {
    /// The record.
    pub id: RequirementId,
    /// The details.
    #[serde(flatten)]
    pub kind: ConflictKind,
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConflictKind::DeleteModify { deleted_on } => write!(
                f,
                "{}: deleted on {deleted_on} but modified on {}; record kept",
                self.id,
                deleted_on.other()
            ),
            ConflictKind::Field {
                field,
                ours,
                theirs,
                chosen,
                ..
            } => write!(
                f,
                "{}.{field}: ours '{ours}' vs theirs '{theirs}'; kept {chosen}",
                self.id
            ),
        }
    }
}

impl std::error::Error for MergeConflict {}

/// The result of a three-way merge.
///
/// There is always a merged table, even when conflicts remain.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The merged snapshot.
    pub table: Table,
    /// One envelope per id seen on any side, in output order.
    pub envelopes: Vec<MergeEnvelope>,
    /// Everything that needs review.
    pub conflicts: Vec<MergeConflict>,
}

impl MergeOutcome {
    /// Whether the merge needs no review.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// The envelope of one record.
    #[must_use]
    pub fn envelope(&self, id: &RequirementId) -> Option<&MergeEnvelope> {
        self.envelopes.iter().find(|envelope| envelope.id == *id)
    }

    /// The merged snapshot as CSV, with each conflicted row replaced by a
    /// git-style block holding both sides' versions.
    #[must_use]
    pub fn render_with_markers(&self, marker_size: usize) -> String {
        let header = self.table.output_header();
        if header.is_empty() {
            return String::new();
        }

        let conflicted: BTreeMap<&RequirementId, &MergeEnvelope> = self
            .envelopes
            .iter()
            .filter(|envelope| envelope.resolution == Resolution::Conflicted)
            .map(|envelope| (&envelope.id, envelope))
            .collect();

        let mut out = Table::render_header(&header);
        out.push('\n');
        for record in self.table.rows() {
            let Some(envelope) = conflicted.get(&record.id) else {
                out.push_str(&self.table.render_record(&header, record));
                out.push('\n');
                continue;
            };
            out.push_str(&format!("{} ours\n", "<".repeat(marker_size)));
            if let Some(ours) = &envelope.ours {
                out.push_str(&self.table.render_record(&header, ours));
                out.push('\n');
            }
            out.push_str(&"=".repeat(marker_size));
            out.push('\n');
            if let Some(theirs) = &envelope.theirs {
                out.push_str(&self.table.render_record(&header, theirs));
                out.push('\n');
            }
            out.push_str(&format!("{} theirs\n", ">".repeat(marker_size)));
        }
        out
    }
}

/// Field-aware three-way merge of requirement snapshots.
#[derive(Debug, Clone)]
pub struct MergeDriver {
    config: EngineConfig,
    history: Option<History>,
}

#[derive(Debug, Clone)]
struct History {
    ours: StoreState,
    theirs: StoreState,
    policy: MergePolicy,
}

/// A record-level merge result.
struct Merged {
    record: Option<RequirementRecord>,
    resolution: Resolution,
    conflicts: Vec<ConflictKind>,
}

impl Merged {
    const fn clean(record: Option<RequirementRecord>) -> Self {
        Self {
            record,
            resolution: Resolution::Clean,
            conflicts: Vec::new(),
        }
    }

    const fn deleted() -> Self {
        Self {
            record: None,
            resolution: Resolution::Deleted,
            conflicts: Vec::new(),
        }
    }
}

impl MergeDriver {
    /// Creates a driver for plain git merges.
    #[must_use]
    pub const fn new(config: EngineConfig) -> Self {
        Self {
            config,
            history: None,
        }
    }

    /// Supplies each side's field history.
    ///
    /// When both sides carry timestamps for a field changed on both sides,
    /// the field store's join picks the winner instead of the tie-break.
    #[must_use]
    pub fn with_history(mut self, ours: StoreState, theirs: StoreState) -> Self {
        let policy = MergePolicy::from_config(&self.config);
        self.history = Some(History {
            ours,
            theirs,
            policy,
        });
        self
    }

    /// Merges `ours` and `theirs` against their common ancestor `base`.
    ///
    /// Never fails: conflicts are returned alongside the merged table.
    #[instrument(skip_all, fields(base = base.len(), ours = ours.len(), theirs = theirs.len()))]
    #[must_use]
    pub fn merge(&self, base: &Table, ours: &Table, theirs: &Table) -> MergeOutcome {
        let header = merged_header(base, ours, theirs);
        let mut table = Table::new(header, self.config.id_delimiter);
        let mut envelopes = Vec::new();
        let mut conflicts = Vec::new();

        for id in output_order(base, ours, theirs) {
            let base_record = base.records().get(&id);
            let ours_record = ours.records().get(&id);
            let theirs_record = theirs.records().get(&id);

            let merged = self.merge_record(&id, base_record, ours_record, theirs_record);
            debug!(%id, resolution = ?merged.resolution, "merged record");

            for kind in merged.conflicts {
                let conflict = MergeConflict {
                    id: id.clone(),
                    kind,
                };
                warn!(%conflict, "merge conflict");
                conflicts.push(conflict);
            }
            if let Some(record) = merged.record {
                // output_order yields each id once
                let _ = table.push(record);
            }
            envelopes.push(MergeEnvelope {
                id,
                base: base_record.cloned(),
                ours: ours_record.cloned(),
                theirs: theirs_record.cloned(),
                resolution: merged.resolution,
            });
        }

        MergeOutcome {
            table,
            envelopes,
            conflicts,
        }
    }

    fn merge_record(
        &self,
        id: &RequirementId,
        base: Option<&RequirementRecord>,
        ours: Option<&RequirementRecord>,
        theirs: Option<&RequirementRecord>,
    ) -> Merged {
        match (base, ours, theirs) {
            (_, Some(o), Some(t)) if o == t => Merged::clean(Some(o.clone())),
            (None, Some(o), None) => Merged::clean(Some(o.clone())),
            (None, None, Some(t)) => Merged::clean(Some(t.clone())),
            (None, Some(o), Some(t)) => self.merge_fields(id, None, o, t),
            (Some(_), None, None) | (None, None, None) => Merged::deleted(),
            (Some(b), None, Some(t)) => delete_vs_keep(b, t, Side::Ours),
            (Some(b), Some(o), None) => delete_vs_keep(b, o, Side::Theirs),
            (Some(b), Some(o), Some(t)) if o == b => Merged::clean(Some(t.clone())),
            (Some(b), Some(o), Some(t)) if t == b => Merged::clean(Some(o.clone())),
            (Some(b), Some(o), Some(t)) => self.merge_fields(id, Some(b), o, t),
        }
    }

    fn merge_fields(
        &self,
        id: &RequirementId,
        base: Option<&RequirementRecord>,
        ours: &RequirementRecord,
        theirs: &RequirementRecord,
    ) -> Merged {
        let mut merged = ours.clone();
        let mut conflicts = Vec::new();

        let metadata: BTreeSet<&String> = base
            .into_iter()
            .chain([ours, theirs])
            .flat_map(|record| record.metadata.keys())
            .collect();
        let fields = Field::CORE
            .into_iter()
            .chain(metadata.into_iter().cloned().map(Field::Metadata));

        for field in fields {
            let base_value = base.and_then(|record| field.read(record));
            let ours_value = field.read(ours);
            let theirs_value = field.read(theirs);

            if ours_value == theirs_value || theirs_value == base_value {
                continue;
            }
            if ours_value == base_value {
                assign(&mut merged, &field, theirs_value);
                continue;
            }

            match &field {
                Field::Dependencies => {
                    let empty = BTreeSet::new();
                    let base_ids = base.map_or(&empty, |record| &record.dependencies);
                    merged.dependencies =
                        merge_sets(base_ids, &ours.dependencies, &theirs.dependencies);
                }
                Field::Blocks => {
                    let empty = BTreeSet::new();
                    let base_ids = base.map_or(&empty, |record| &record.blocks);
                    merged.blocks = merge_sets(base_ids, &ours.blocks, &theirs.blocks);
                }
                Field::Deleted => {
                    // only reachable for records added on both sides
                    merged.deleted = false;
                    let deleted_on = if ours.deleted { Side::Ours } else { Side::Theirs };
                    conflicts.push(ConflictKind::DeleteModify { deleted_on });
                }
                _ => {
                    let statuses = match (&ours_value, &theirs_value) {
                        (Some(FieldValue::Status(o)), Some(FieldValue::Status(t))) => {
                            Some((*o, *t))
                        }
                        _ => None,
                    };
                    if let Some(winner) = self.history_winner(id, &field) {
                        let value = match winner {
                            Side::Ours => ours_value,
                            Side::Theirs => theirs_value,
                        };
                        assign(&mut merged, &field, value);
                    } else if let Some((o, t)) = statuses {
                        merged.status = self.config.status_order.max(o, t);
                    } else {
                        let chosen = Side::from(self.config.field_tie_break);
                        let render = |value: Option<&FieldValue>| {
                            value
                                .map(|value| value.to_cell(self.config.id_delimiter))
                                .unwrap_or_default()
                        };
                        conflicts.push(ConflictKind::Field {
                            field: field.clone(),
                            base: base_value.as_ref().map(|value| render(Some(value))),
                            ours: render(ours_value.as_ref()),
                            theirs: render(theirs_value.as_ref()),
                            chosen,
                        });
                        if chosen == Side::Theirs {
                            assign(&mut merged, &field, theirs_value);
                        }
                    }
                }
            }
        }

        if let Some(deleted_on) = tombstone_vs_modify(base, ours, theirs) {
            merged.deleted = false;
            conflicts.push(ConflictKind::DeleteModify { deleted_on });
        }

        let resolution = if conflicts.is_empty() {
            Resolution::AutoResolved
        } else {
            Resolution::Conflicted
        };
        Merged {
            record: Some(merged),
            resolution,
            conflicts,
        }
    }

    /// The side whose history entry for `field` wins, if both sides have
    /// one.
    fn history_winner(&self, id: &RequirementId, field: &Field) -> Option<Side> {
        let history = self.history.as_ref()?;
        let ours = history.ours.record(id)?.get(field)?;
        let theirs = history.theirs.record(id)?.get(field)?;
        let winner = if history.policy.compare(field, ours, theirs).is_ge() {
            Side::Ours
        } else {
            Side::Theirs
        };
        debug!(%id, %field, %winner, "resolved from field history");
        Some(winner)
    }
}

/// The record was removed on `deleted_on` and kept on the other side.
fn delete_vs_keep(
    base: &RequirementRecord,
    kept: &RequirementRecord,
    deleted_on: Side,
) -> Merged {
    if kept == base {
        return Merged::deleted();
    }
    Merged {
        record: Some(kept.clone()),
        resolution: Resolution::Conflicted,
        conflicts: vec![ConflictKind::DeleteModify { deleted_on }],
    }
}

/// Detects one side tombstoning a record the other side modified.
fn tombstone_vs_modify(
    base: Option<&RequirementRecord>,
    ours: &RequirementRecord,
    theirs: &RequirementRecord,
) -> Option<Side> {
    let base = base.filter(|record| record.is_live())?;
    let modified = |record: &RequirementRecord| {
        let mut live = record.clone();
        live.deleted = false;
        live != *base
    };
    match (ours.is_live(), theirs.is_live()) {
        (false, true) if modified(theirs) => Some(Side::Ours),
        (true, false) if modified(ours) => Some(Side::Theirs),
        _ => None,
    }
}

fn assign(record: &mut RequirementRecord, field: &Field, value: Option<FieldValue>) {
    match value {
        Some(value) => {
            field.write(record, value);
        }
        None => {
            if let Field::Metadata(name) = field {
                record.metadata.remove(name);
            }
        }
    }
}

/// Keeps every id both sides kept, plus every id either side added.
fn merge_sets(
    base: &BTreeSet<RequirementId>,
    ours: &BTreeSet<RequirementId>,
    theirs: &BTreeSet<RequirementId>,
) -> BTreeSet<RequirementId> {
    ours.union(theirs)
        .filter(|id| !base.contains(*id) || (ours.contains(*id) && theirs.contains(*id)))
        .cloned()
        .collect()
}

/// Ours' header followed by columns only theirs has. Falls back to the
/// first non-empty header if ours has none.
fn merged_header(base: &Table, ours: &Table, theirs: &Table) -> Vec<String> {
    if ours.header().is_empty() {
        return if theirs.header().is_empty() {
            base.header().to_vec()
        } else {
            theirs.header().to_vec()
        };
    }
    let mut header = ours.header().to_vec();
    for column in theirs.header() {
        if !header.iter().any(|present| Table::same_column(present, column)) {
            header.push(column.clone());
        }
    }
    header
}

/// Ours' row order, then ids only theirs has, then ids only the base has.
fn output_order(base: &Table, ours: &Table, theirs: &Table) -> Vec<RequirementId> {
    let mut seen = BTreeSet::new();
    let mut order = Vec::new();
    for record in ours.rows().chain(theirs.rows()).chain(base.rows()) {
        if seen.insert(&record.id) {
            order.push(record.id.clone());
        }
    }
    order
}
