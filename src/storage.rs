//! Tabular (CSV) snapshots of the traceability matrix.

mod table;
pub use table::{DEFAULT_HEADER, LoadError, Table};
