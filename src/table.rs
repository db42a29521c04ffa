//! In-memory tabular files.
//!
//! Every input (site list, thresholds, raw counts) is read into a [`Table`]
//! of trimmed string cells; typed interpretation happens in the component
//! that owns the file.

use csv::{ReaderBuilder, StringRecord, Trim};
use std::path::Path;
use tracing::debug;

use crate::error::{AtcError, Result};

/// A CSV file held in memory with its header.
#[derive(Debug, Clone)]
pub struct Table {
    /// Display name used in error messages (usually the file name).
    pub name: String,
    headers: Vec<String>,
    rows: Vec<StringRecord>,
}

impl Table {
    /// Reads the CSV file at `path`.
    ///
    /// # Errors
    ///
    /// [`AtcError::NotFound`] if the file does not exist, or a CSV error if
    /// it cannot be parsed.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(AtcError::NotFound(path.to_path_buf()));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("<unnamed>")
            .to_string();

        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(&name, file)?;
        debug!(file = %name, rows = table.len(), columns = table.headers.len(), "Table loaded");
        Ok(table)
    }

    /// Reads CSV content from any reader. Used for files and in-memory data.
    pub fn from_reader<R: std::io::Read>(name: &str, reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().trim(Trim::All).from_reader(reader);

        let headers = rdr
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            rows.push(record);
        }

        Ok(Table {
            name: name.to_string(),
            headers,
            rows,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of the column called `name`, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Resolves all `names` to column positions at once.
    ///
    /// # Errors
    ///
    /// [`AtcError::MissingColumns`] naming every absent column, not just the
    /// first.
    pub fn require_columns(&self, names: &[&str]) -> Result<Vec<usize>> {
        let mut found = Vec::with_capacity(names.len());
        let mut missing = Vec::new();

        for name in names {
            match self.column_index(name) {
                Some(idx) => found.push(idx),
                None => missing.push(name.to_string()),
            }
        }

        if missing.is_empty() {
            Ok(found)
        } else {
            Err(AtcError::MissingColumns {
                file: self.name.clone(),
                columns: missing,
            })
        }
    }

    /// Iterates `(line, record)` pairs; line numbers are 1-based and count
    /// the header.
    pub fn rows(&self) -> impl Iterator<Item = (u64, &StringRecord)> {
        self.rows.iter().map(|r| {
            let line = r.position().map(|p| p.line()).unwrap_or(0);
            (line, r)
        })
    }

    /// Builds an [`AtcError::InvalidValue`] for a cell of this table.
    pub fn invalid_value(&self, line: u64, column: &str, value: &str, reason: &str) -> AtcError {
        AtcError::InvalidValue {
            file: self.name.clone(),
            line,
            column: column.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Returns the cell at `idx`, or an empty string for short rows.
pub fn cell(record: &StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or("")
}
