use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::StatusOrder;

/// Engine configuration.
///
/// Passed by value into the coordinator, merge driver and field store. There
/// is no process-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Versions", into = "Versions")]
pub struct EngineConfig {
    /// The progression of statuses, lowest first.
    ///
    /// Used to detect regressions and to break status ties during git merges.
    pub status_order: StatusOrder,

    /// Whether CRDT merges may move a status backward.
    ///
    /// When `true`, the status field merges by rank first and timestamp
    /// second, so a newer but lower status never overwrites a higher one.
    /// Every replica must use the same setting for replicas to converge.
    pub no_status_regression: bool,

    /// Which side wins a non-status field conflict in a git merge when no
    /// timestamps are available. The losing value is always reported.
    pub field_tie_break: FieldTieBreak,

    /// Separator between ids in the `dependencies` and `blocks` columns.
    pub id_delimiter: char,

    /// Metadata column holding the effort used to weight the critical path.
    pub effort_column: String,
}

/// Winner of a non-status field conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldTieBreak {
    /// Keep our value.
    #[default]
    Ours,
    /// Keep their value.
    Theirs,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            status_order: StatusOrder::default(),
            no_status_regression: false,
            field_tie_break: FieldTieBreak::default(),
            id_delimiter: default_id_delimiter(),
            effort_column: default_effort_column(),
        }
    }
}

impl EngineConfig {
    /// Loads the configuration from a TOML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or if the TOML content is
    /// invalid.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {e}"))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {e}"))
    }

    /// Saves the configuration to a TOML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized to TOML or if
    /// the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content =
            toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, content).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Builder-style toggle for the no-regression policy.
    #[must_use]
    pub const fn with_no_status_regression(mut self, enabled: bool) -> Self {
        self.no_status_regression = enabled;
        self
    }
}

const fn default_id_delimiter() -> char {
    '|'
}

fn default_effort_column() -> String {
    "effort_weeks".to_string()
}

/// The serialized versions of the configuration.
///
/// New versions are added as variants so that older files keep loading.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "_version")]
enum Versions {
    #[serde(rename = "1")]
    V1 {
        #[serde(default)]
        status_order: StatusOrder,

        #[serde(default)]
        no_status_regression: bool,

        #[serde(default)]
        field_tie_break: FieldTieBreak,

        #[serde(default = "default_id_delimiter")]
        id_delimiter: char,

        #[serde(default = "default_effort_column")]
        effort_column: String,
    },
}

impl From<Versions> for EngineConfig {
    fn from(versions: Versions) -> Self {
        match versions {
            Versions::V1 {
                status_order,
                no_status_regression,
                field_tie_break,
                id_delimiter,
                effort_column,
            } => Self {
                status_order,
                no_status_regression,
                field_tie_break,
                id_delimiter,
                effort_column,
            },
        }
    }
}

impl From<EngineConfig> for Versions {
    fn from(config: EngineConfig) -> Self {
        Self::V1 {
            status_order: config.status_order,
            no_status_regression: config.no_status_regression,
            field_tie_break: config.field_tie_break,
            id_delimiter: config.id_delimiter,
            effort_column: config.effort_column,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::domain::Status;

    #[test]
    fn load_reads_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"_version = \"1\"\nstatus_order = [\"MISSING\", \"NOT_STARTED\", \"PARTIAL\", \"COMPLETE\"]\nno_status_regression = true\nfield_tie_break = \"theirs\"\nid_delimiter = \";\"\neffort_column = \"effort\"\n",
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();

        assert!(config.no_status_regression);
        assert_eq!(config.field_tie_break, FieldTieBreak::Theirs);
        assert_eq!(config.id_delimiter, ';');
        assert_eq!(config.effort_column, "effort");
        assert!(
            config
                .status_order
                .is_regression(Status::NotStarted, Status::Missing)
        );
    }

    #[test]
    fn load_missing_file_returns_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("missing.toml");

        let error = EngineConfig::load(&missing).unwrap_err();
        assert!(error.starts_with("Failed to read config file:"));
    }

    #[test]
    fn load_invalid_status_order_returns_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"_version = \"1\"\nstatus_order = [\"COMPLETE\"]\n")
            .unwrap();

        let error = EngineConfig::load(file.path()).unwrap_err();
        assert!(error.starts_with("Failed to parse config file:"));
    }

    #[test]
    fn empty_file_returns_default() {
        let expected = EngineConfig::default();
        let actual: EngineConfig = toml::from_str(r#"_version = "1""#).unwrap();
        assert_eq!(actual, expected);
        assert!(!actual.no_status_regression, "pure LWW unless opted in");
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rtm.toml");
        let config = EngineConfig::default().with_no_status_regression(true);

        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }
}
