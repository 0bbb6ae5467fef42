use std::{
    fs::File,
    io::{self, BufWriter, Read, Write},
    num::NonZeroU32,
    path::Path,
};

use tracing::{debug, instrument};

use crate::{
    crdt::Field,
    domain::{DuplicateId, RequirementId, RequirementRecord, RequirementSet},
};

/// Header written when a table has none of its own.
pub const DEFAULT_HEADER: [&str; 9] = [
    "req_id",
    "category",
    "subcategory",
    "requirement_text",
    "status",
    "priority",
    "phase",
    "dependencies",
    "blocks",
];

/// Errors that can occur when loading a tabular snapshot.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// An I/O error occurred.
    #[error("failed to read snapshot: {0}")]
    Io(#[from] io::Error),

    /// The header lacks a required column.
    #[error("missing required column '{0}'")]
    MissingColumn(&'static str),

    /// A row could not be parsed.
    #[error("line {line}: {reason}")]
    MalformedRecord {
        /// 1-based line on which the row starts.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Two rows share an id.
    #[error("line {line}: duplicate requirement id {id}")]
    DuplicateId {
        /// 1-based line of the second occurrence.
        line: usize,
        /// The repeated id.
        id: RequirementId,
    },
}

/// What a header cell holds.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Column {
    Id,
    Field(Field),
}

impl Column {
    fn classify(name: &str) -> Self {
        let lower = name.trim().to_ascii_lowercase();
        match lower.as_str() {
            "req_id" | "id" => Self::Id,
            "requirement_text" => Self::Field(Field::Text),
            _ => match Field::from_column(&lower) {
                Field::Metadata(_) => Self::Field(Field::Metadata(name.to_string())),
                field => Self::Field(field),
            },
        }
    }
}

/// A requirements snapshot as a table: a header and ordered rows.
///
/// Columns the engine does not interpret are kept in each record's
/// metadata under their header name and written back in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    header: Vec<String>,
    order: Vec<RequirementId>,
    records: RequirementSet,
    id_delimiter: char,
}

impl Default for Table {
    fn default() -> Self {
        Self::new(Vec::new(), '|')
    }
}

impl Table {
    /// Creates an empty table with the given header.
    #[must_use]
    pub fn new(header: Vec<String>, id_delimiter: char) -> Self {
        Self {
            header,
            order: Vec::new(),
            records: RequirementSet::new(),
            id_delimiter,
        }
    }

    /// The header, as read.
    #[must_use]
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// The separator used in `dependencies` and `blocks` cells.
    #[must_use]
    pub const fn id_delimiter(&self) -> char {
        self.id_delimiter
    }

    /// The records, keyed by id.
    #[must_use]
    pub const fn records(&self) -> &RequirementSet {
        &self.records
    }

    /// Mutable access to the records.
    ///
    /// Records inserted this way are written after the existing rows, in id
    /// order.
    pub const fn records_mut(&mut self) -> &mut RequirementSet {
        &mut self.records
    }

    /// Consumes the table, returning its records.
    #[must_use]
    pub fn into_records(self) -> RequirementSet {
        self.records
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends a row.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateId`] if a row with the same id exists.
    pub fn push(&mut self, record: RequirementRecord) -> Result<(), DuplicateId> {
        let id = record.id.clone();
        self.records.insert(record)?;
        self.order.push(id);
        Ok(())
    }

    /// Records in row order.
    pub fn rows(&self) -> impl Iterator<Item = &RequirementRecord> {
        let listed = self.order.iter().filter_map(|id| self.records.get(id));
        let unlisted = self
            .records
            .iter()
            .filter(|record| !self.order.contains(&record.id));
        listed.chain(unlisted)
    }

    /// Parses a table from CSV text.
    ///
    /// Empty input yields an empty table.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] if a required column is missing, a row is
    /// malformed, or an id repeats.
    #[instrument(level = "debug", skip(text), fields(bytes = text.len()))]
    pub fn parse(text: &str, id_delimiter: char) -> Result<Self, LoadError> {
        let mut rows = parse_csv(text)?.into_iter();
        let Some((_, header)) = rows.next() else {
            return Ok(Self::new(Vec::new(), id_delimiter));
        };

        let columns: Vec<Column> = header.iter().map(|name| Column::classify(name)).collect();
        for (index, column) in columns.iter().enumerate() {
            if columns[..index].contains(column) {
                return Err(LoadError::MalformedRecord {
                    line: 1,
                    reason: format!("duplicate column '{}'", header[index]),
                });
            }
        }
        let required = [
            (Column::Id, "req_id"),
            (Column::Field(Field::Category), "category"),
            (Column::Field(Field::Status), "status"),
            (Column::Field(Field::Priority), "priority"),
        ];
        for (column, name) in required {
            if !columns.contains(&column) {
                return Err(LoadError::MissingColumn(name));
            }
        }

        let mut table = Self::new(header, id_delimiter);
        for (line, cells) in rows {
            if cells.len() != columns.len() {
                return Err(LoadError::MalformedRecord {
                    line,
                    reason: format!(
                        "expected {} cells, found {}",
                        columns.len(),
                        cells.len()
                    ),
                });
            }
            let record = parse_record(&columns, cells, id_delimiter)
                .map_err(|reason| LoadError::MalformedRecord { line, reason })?;
            table
                .push(record)
                .map_err(|DuplicateId(id)| LoadError::DuplicateId { line, id })?;
        }

        debug!(rows = table.len(), "parsed table");
        Ok(table)
    }

    /// Reads a table from CSV.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] if reading fails or the content is invalid.
    pub fn read<R: Read>(reader: &mut R, id_delimiter: char) -> Result<Self, LoadError> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Self::parse(&text, id_delimiter)
    }

    /// Loads a table from a CSV file.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] if the file cannot be read or is invalid.
    pub fn load(path: &Path, id_delimiter: char) -> Result<Self, LoadError> {
        let mut file = File::open(path)?;
        Self::read(&mut file, id_delimiter)
    }

    /// Whether two header cells name the same column once aliases and case
    /// are resolved (`id` and `req_id`, `Status` and `status`).
    #[must_use]
    pub fn same_column(a: &str, b: &str) -> bool {
        Column::classify(a) == Column::classify(b)
    }

    /// The columns written: the header, then `deleted` if any row is
    /// tombstoned and the header lacks it, then metadata keys no header
    /// cell names, sorted.
    #[must_use]
    pub fn output_header(&self) -> Vec<String> {
        let mut header = if self.header.is_empty() && !self.records.is_empty() {
            DEFAULT_HEADER.map(String::from).to_vec()
        } else {
            self.header.clone()
        };
        let mut columns: Vec<Column> = header.iter().map(|name| Column::classify(name)).collect();

        let deleted = Column::Field(Field::Deleted);
        if !columns.contains(&deleted) && self.records.iter().any(|r| !r.is_live()) {
            header.push("deleted".to_string());
            columns.push(deleted);
        }

        let mut extra: Vec<&String> = self
            .records
            .iter()
            .flat_map(|record| record.metadata.keys())
            .filter(|key| !columns.contains(&Column::Field(Field::Metadata((*key).clone()))))
            .collect();
        extra.sort();
        extra.dedup();
        header.extend(extra.into_iter().cloned());
        header
    }

    /// Renders one record as a CSV line (without the line terminator),
    /// using the given output header.
    #[must_use]
    pub fn render_record(&self, header: &[String], record: &RequirementRecord) -> String {
        header
            .iter()
            .map(|name| csv_escape(&self.cell(&Column::classify(name), record)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Renders a header as a CSV line (without the line terminator).
    #[must_use]
    pub fn render_header(header: &[String]) -> String {
        header
            .iter()
            .map(|name| csv_escape(name))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Writes the table as CSV with LF line endings.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let header = self.output_header();
        if header.is_empty() {
            return Ok(());
        }
        writeln!(writer, "{}", Self::render_header(&header))?;
        for record in self.rows() {
            writeln!(writer, "{}", self.render_record(&header, record))?;
        }
        Ok(())
    }

    /// The table as CSV text.
    ///
    /// # Panics
    ///
    /// Panics if writing to memory fails (which should never happen).
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut buffer = Vec::new();
        self.write(&mut buffer)
            .expect("writing to a Vec should never fail");
        String::from_utf8(buffer).expect("all cells are valid UTF-8")
    }

    /// Writes the table to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written to.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write(&mut writer)?;
        writer.flush()
    }

    fn cell(&self, column: &Column, record: &RequirementRecord) -> String {
        let join = |ids: &std::collections::BTreeSet<RequirementId>| {
            ids.iter()
                .map(RequirementId::as_str)
                .collect::<Vec<_>>()
                .join(&self.id_delimiter.to_string())
        };
        match column {
            Column::Id => record.id.to_string(),
            Column::Field(field) => match field {
                Field::Category => record.category.clone(),
                Field::Subcategory => record.subcategory.clone(),
                Field::Text => record.text.clone(),
                Field::Status => record.status.to_string(),
                Field::Priority => record.priority.to_string(),
                Field::Phase => record.phase.map(|p| p.to_string()).unwrap_or_default(),
                Field::Dependencies => join(&record.dependencies),
                Field::Blocks => join(&record.blocks),
                Field::Deleted => {
                    let flag = if record.deleted { "true" } else { "" };
                    flag.to_string()
                }
                Field::Metadata(name) => record.metadata.get(name).cloned().unwrap_or_default(),
            },
        }
    }
}

fn parse_record(
    columns: &[Column],
    cells: Vec<String>,
    id_delimiter: char,
) -> Result<RequirementRecord, String> {
    let id_index = columns
        .iter()
        .position(|column| *column == Column::Id)
        .unwrap_or_default();
    let id: RequirementId = cells[id_index].parse().map_err(|e| format!("{e}"))?;
    let mut record = RequirementRecord::new(id);

    for (column, cell) in columns.iter().zip(cells) {
        let Column::Field(field) = column else {
            continue;
        };
        let trimmed = cell.trim();
        match field {
            Field::Category => {
                if trimmed.is_empty() {
                    return Err("empty category".to_string());
                }
                record.category = trimmed.to_string();
            }
            Field::Subcategory => record.subcategory = trimmed.to_string(),
            Field::Text => record.text = cell,
            Field::Status => record.status = trimmed.parse().map_err(|e| format!("{e}"))?,
            Field::Priority => record.priority = trimmed.parse().map_err(|e| format!("{e}"))?,
            Field::Phase => record.phase = parse_phase(trimmed)?,
            Field::Dependencies => record.dependencies = parse_ids(trimmed, id_delimiter)?,
            Field::Blocks => record.blocks = parse_ids(trimmed, id_delimiter)?,
            Field::Deleted => record.deleted = parse_flag(trimmed)?,
            Field::Metadata(name) => {
                if !cell.is_empty() {
                    record.metadata.insert(name.clone(), cell);
                }
            }
        }
    }

    Ok(record)
}

fn parse_phase(cell: &str) -> Result<Option<NonZeroU32>, String> {
    if cell.is_empty() {
        return Ok(None);
    }
    cell.parse()
        .map(Some)
        .map_err(|_| format!("invalid phase '{cell}'"))
}

fn parse_ids(
    cell: &str,
    delimiter: char,
) -> Result<std::collections::BTreeSet<RequirementId>, String> {
    cell.split(delimiter)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| id.parse().map_err(|e| format!("{e}")))
        .collect()
}

fn parse_flag(cell: &str) -> Result<bool, String> {
    match cell.to_ascii_lowercase().as_str() {
        "" | "false" | "no" | "0" => Ok(false),
        "true" | "yes" | "1" => Ok(true),
        _ => Err(format!("invalid deleted flag '{cell}'")),
    }
}

/// Splits CSV text into rows of cells, each tagged with its starting line.
///
/// Blank lines are skipped.
fn parse_csv(text: &str) -> Result<Vec<(usize, Vec<String>)>, LoadError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut cell = String::new();
    let mut line = 1;
    let mut row_line = 1;
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    let mut finish_row = |row: &mut Vec<String>, row_line: usize| {
        let cells = std::mem::take(row);
        if !(cells.len() == 1 && cells[0].is_empty()) {
            rows.push((row_line, cells));
        }
    };

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => quoted = false,
                '\n' => {
                    line += 1;
                    cell.push(c);
                }
                _ => cell.push(c),
            }
            continue;
        }

        match c {
            '"' if cell.is_empty() => quoted = true,
            '"' => {
                return Err(LoadError::MalformedRecord {
                    line,
                    reason: "unexpected quote in unquoted cell".to_string(),
                });
            }
            ',' => row.push(std::mem::take(&mut cell)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                row.push(std::mem::take(&mut cell));
                finish_row(&mut row, row_line);
                line += 1;
                row_line = line;
            }
            _ => cell.push(c),
        }
    }

    if quoted {
        return Err(LoadError::MalformedRecord {
            line: row_line,
            reason: "unterminated quoted cell".to_string(),
        });
    }
    if !cell.is_empty() || !row.is_empty() {
        row.push(cell);
        finish_row(&mut row, row_line);
    }

    Ok(rows)
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        let escaped = value.replace('"', "\"\"");
        format!("\"{escaped}\"")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::domain::{Priority, Status};

    const SAMPLE: &str = "\
req_id,category,subcategory,requirement_text,status,priority,phase,effort_weeks,dependencies,blocks,assignee
REQ-GIT-001,GIT,MERGE,\"Merge CSV files, semantically\",PARTIAL,HIGH,1,2.5,REQ-GIT-002,,sam
REQ-GIT-002,GIT,MERGE,\"Multi-line
text with \"\"quotes\"\"\",COMPLETE,P0,,,,REQ-GIT-001,
";

    fn id(s: &str) -> RequirementId {
        s.parse().unwrap()
    }

    #[test]
    fn parses_sample() {
        let table = Table::parse(SAMPLE, '|').unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.header().len(), 11);

        let first = table.records().get(&id("REQ-GIT-001")).unwrap();
        assert_eq!(first.text, "Merge CSV files, semantically");
        assert_eq!(first.status, Status::Partial);
        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.phase, NonZeroU32::new(1));
        assert_eq!(first.dependencies, [id("REQ-GIT-002")].into());
        assert_eq!(first.metadata["effort_weeks"], "2.5");
        assert_eq!(first.metadata["assignee"], "sam");

        let second = table.records().get(&id("REQ-GIT-002")).unwrap();
        assert_eq!(second.text, "Multi-line\ntext with \"quotes\"");
        assert_eq!(second.phase, None);
        assert!(second.metadata.is_empty());
    }

    #[test]
    fn writing_preserves_content_and_order() {
        let table = Table::parse(SAMPLE, '|').unwrap();
        assert_eq!(table.to_csv(), SAMPLE);
    }

    #[test]
    fn accepts_aliases_and_crlf() {
        let text = "id,category,text,status,priority\r\nREQ-X-001,X,hello,not started,low\r\n";
        let table = Table::parse(text, '|').unwrap();
        let record = table.records().get(&id("REQ-X-001")).unwrap();
        assert_eq!(record.text, "hello");
        assert_eq!(record.status, Status::NotStarted);
        assert_eq!(record.priority, Priority::Low);
    }

    #[test_case("req_id", "id", true)]
    #[test_case("requirement_text", "text", true)]
    #[test_case("Status", "status", true)]
    #[test_case("owner", "Owner", false; "metadata names are exact")]
    #[test_case("status", "priority", false)]
    fn header_cells_compare_by_column(a: &str, b: &str, same: bool) {
        assert_eq!(Table::same_column(a, b), same);
    }

    #[test]
    fn splits_ids_on_configured_delimiter() {
        let text = "req_id,category,status,priority,dependencies\nREQ-X-001,X,MISSING,LOW, REQ-X-002 ; REQ-X-003 \n";
        let table = Table::parse(text, ';').unwrap();
        let record = table.records().get(&id("REQ-X-001")).unwrap();
        assert_eq!(record.dependencies, [id("REQ-X-002"), id("REQ-X-003")].into());
        assert!(table.to_csv().contains("REQ-X-002;REQ-X-003"));
    }

    #[test]
    fn empty_input_is_an_empty_table() {
        let table = Table::parse("", '|').unwrap();
        assert!(table.is_empty());
        assert_eq!(table.to_csv(), "");
    }

    #[test_case("req_id,category,status\n", "priority"; "no priority")]
    #[test_case("category,status,priority\n", "req_id"; "no id")]
    fn reports_missing_column(text: &str, expected: &str) {
        let err = Table::parse(text, '|').unwrap_err();
        assert!(matches!(err, LoadError::MissingColumn(name) if name == expected));
    }

    #[test_case("REQ-X-001,X,DONE,LOW", 2; "bad status")]
    #[test_case("REQ-X-001,X,MISSING,URGENT", 2; "bad priority")]
    #[test_case("REQ-X-001,X,MISSING", 2; "short row")]
    #[test_case("REQ-1,X,MISSING,LOW", 2; "bad id")]
    #[test_case("REQ-X-001,,MISSING,LOW", 2; "empty category")]
    #[test_case("REQ-X-001,X,MISSING,LOW\nREQ-X-002,\"X,MISSING,LOW", 3; "unterminated quote")]
    fn reports_malformed_rows(rows: &str, expected_line: usize) {
        let text = format!("req_id,category,status,priority\n{rows}\n");
        match Table::parse(&text, '|').unwrap_err() {
            LoadError::MalformedRecord { line, .. } => assert_eq!(line, expected_line),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reports_duplicate_ids() {
        let text = "req_id,category,status,priority\nREQ-X-001,X,MISSING,LOW\n\nREQ-X-001,X,MISSING,LOW\n";
        let err = Table::parse(text, '|').unwrap_err();
        assert!(matches!(err, LoadError::DuplicateId { line: 4, .. }));
    }

    #[test]
    fn tombstones_add_deleted_column() {
        let mut table = Table::parse(SAMPLE, '|').unwrap();
        table.records_mut().tombstone(&id("REQ-GIT-002"));
        let written = table.to_csv();
        assert!(written.lines().next().unwrap().ends_with(",deleted"));

        let reread = Table::parse(&written, '|').unwrap();
        assert!(!reread.records().get(&id("REQ-GIT-002")).unwrap().is_live());
        assert!(reread.records().get(&id("REQ-GIT-001")).unwrap().is_live());
    }

    #[test]
    fn unlisted_metadata_is_appended() {
        let mut table = Table::parse("req_id,category,status,priority\n", '|').unwrap();
        table
            .push(
                RequirementRecord::new(id("REQ-X-001"))
                    .with_status(Status::Missing)
                    .with_metadata("owner", "kim"),
            )
            .unwrap();
        assert_eq!(
            table.to_csv(),
            "req_id,category,status,priority,owner\nREQ-X-001,X,MISSING,MEDIUM,kim\n"
        );
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtm.csv");
        std::fs::write(&path, SAMPLE).unwrap();

        let table = Table::load(&path, '|').unwrap();
        let copy = dir.path().join("copy.csv");
        table.save(&copy).unwrap();
        assert_eq!(std::fs::read_to_string(copy).unwrap(), SAMPLE);
    }
}
