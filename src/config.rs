//! Column schema and cleaning configuration.
//!
//! Column names are resolved against a file's header once, when the file is
//! loaded, and never looked up again per row.
//!
//! Stored as JSON on disk, every field optional:
//! ```json
//! {
//!   "columns": { "site_col": "Site", "count_col": "Count", "time_col": "Hour" },
//!   "std_range": 2.5,
//!   "dimensions": ["Year", "Month", "Weekday"]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{AtcError, Result};

/// Calendar dimensions that can be derived from an observation timestamp.
///
/// The declaration order is the column order used in every output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CalendarDimension {
    Year,
    Month,
    Week,
    Weekday,
}

impl CalendarDimension {
    pub fn column_name(self) -> &'static str {
        match self {
            CalendarDimension::Year => "Year",
            CalendarDimension::Month => "Month",
            CalendarDimension::Week => "Week",
            CalendarDimension::Weekday => "Weekday",
        }
    }
}

impl fmt::Display for CalendarDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

impl FromStr for CalendarDimension {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "year" => Ok(CalendarDimension::Year),
            "month" => Ok(CalendarDimension::Month),
            "week" => Ok(CalendarDimension::Week),
            "weekday" | "day" => Ok(CalendarDimension::Weekday),
            other => Err(format!("unknown calendar dimension: {other}")),
        }
    }
}

/// Names of the raw observation columns and how to read the time fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub site_col: String,
    pub count_col: String,
    pub dir_col: String,
    pub date_col: String,
    /// Required unless `combined_datetime` is set.
    pub time_col: Option<String>,
    /// The date column already carries the time of day.
    pub combined_datetime: bool,
    /// The time column is an integer hour rather than a duration.
    pub hour_only: bool,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        ColumnConfig {
            site_col: "SiteName".to_string(),
            count_col: "VehicleCount".to_string(),
            dir_col: "DirectionName".to_string(),
            date_col: "IntervalStartDate".to_string(),
            time_col: Some("Hour".to_string()),
            combined_datetime: false,
            hour_only: true,
        }
    }
}

impl ColumnConfig {
    /// The raw columns a file must carry under this configuration.
    pub fn required_columns(&self) -> Vec<&str> {
        let mut cols = vec![
            self.site_col.as_str(),
            self.count_col.as_str(),
            self.dir_col.as_str(),
            self.date_col.as_str(),
        ];
        if !self.combined_datetime {
            if let Some(time_col) = &self.time_col {
                cols.push(time_col.as_str());
            }
        }
        cols
    }
}

/// Everything the cleaning engine and reporters need for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    pub columns: ColumnConfig,
    /// Width of the statistical band in standard deviations.
    pub std_range: f64,
    /// Calendar dimensions derived for grouping and summaries.
    pub dimensions: Vec<CalendarDimension>,
    /// Only valid rows go to the chart feed.
    pub valid_only: bool,
    /// Summaries are broken down per direction.
    pub by_direction: bool,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        CleaningConfig {
            columns: ColumnConfig::default(),
            std_range: 2.0,
            dimensions: vec![CalendarDimension::Year, CalendarDimension::Month],
            valid_only: false,
            by_direction: false,
        }
    }
}

impl CleaningConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AtcError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: CleaningConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Checks mutually required fields. Sorts and de-duplicates `dimensions`.
    pub fn validate(mut self) -> Result<Self> {
        let cols = &self.columns;

        if !cols.combined_datetime && cols.time_col.is_none() {
            return Err(AtcError::Configuration(
                "a time column is required unless combined_datetime is set".to_string(),
            ));
        }

        if !self.std_range.is_finite() || self.std_range < 0.0 {
            return Err(AtcError::Configuration(format!(
                "std_range must be a non-negative number, got {}",
                self.std_range
            )));
        }

        let required = cols.required_columns();
        if let Some(empty) = required.iter().find(|c| c.trim().is_empty()) {
            return Err(AtcError::Configuration(format!(
                "column names must not be empty (got {empty:?})"
            )));
        }

        let mut seen = HashSet::new();
        for col in &required {
            if !seen.insert(*col) {
                return Err(AtcError::Configuration(format!(
                    "column {col:?} is configured for more than one field"
                )));
            }
        }

        self.dimensions.sort();
        self.dimensions.dedup();

        Ok(self)
    }

    pub fn tracks(&self, dimension: CalendarDimension) -> bool {
        self.dimensions.contains(&dimension)
    }
}
