//! Error types for loading, validating and cleaning count data.

use std::path::PathBuf;
use thiserror::Error;

/// Broad category of an [`AtcError`], used by batch drivers to report
/// per-file failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Schema,
    Coverage,
    Configuration,
    NotFound,
    Data,
    Io,
    Internal,
}

/// Errors that can occur while processing count site data.
#[derive(Error, Debug)]
pub enum AtcError {
    /// A structural problem with an input table.
    #[error("schema error: {0}")]
    Schema(String),

    /// Required columns are absent. Every missing column is listed.
    #[error("schema error: {file} is missing column(s): {}", .columns.join(", "))]
    MissingColumns { file: String, columns: Vec<String> },

    /// Site category combinations with no matching threshold row.
    #[error(
        "coverage error: the following {} combination(s) listed in the site list are missing from the thresholds:\n{}",
        .categories.join(" / "),
        format_combinations(.missing)
    )]
    Coverage {
        categories: Vec<String>,
        missing: Vec<Vec<String>>,
    },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Input file does not exist.
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A cell that could not be interpreted.
    #[error("invalid value {value:?} in column {column} of {file} (line {line}): {reason}")]
    InvalidValue {
        file: String,
        line: u64,
        column: String,
        value: String,
        reason: String,
    },

    /// The worker cleaning a file stopped before returning a result.
    #[error("cleaning aborted: {0}")]
    Aborted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AtcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AtcError::Schema(_) | AtcError::MissingColumns { .. } => ErrorKind::Schema,
            AtcError::Coverage { .. } => ErrorKind::Coverage,
            AtcError::Configuration(_) => ErrorKind::Configuration,
            AtcError::NotFound(_) => ErrorKind::NotFound,
            AtcError::InvalidValue { .. } | AtcError::Csv(_) | AtcError::Json(_) => {
                ErrorKind::Data
            }
            AtcError::Io(_) => ErrorKind::Io,
            AtcError::Aborted(_) => ErrorKind::Internal,
        }
    }
}

fn format_combinations(missing: &[Vec<String>]) -> String {
    missing
        .iter()
        .map(|combo| combo.join(" / "))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, AtcError>;
