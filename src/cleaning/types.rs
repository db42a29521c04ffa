//! Data types produced by the cleaning pipeline.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::CalendarDimension;
use crate::summary::DimensionValue;
pub use crate::thresholds::ThreshCheck;

/// One raw row after normalisation, before lane totals are summed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub site_id: String,
    pub direction: String,
    pub timestamp: NaiveDateTime,
    pub count: f64,
}

/// Final label for a cleaned row, by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Status {
    #[serde(rename = "Warning - Outside SD Range")]
    OutsideSdRange,
    #[serde(rename = "Full day missing")]
    FullDayMissing,
    #[serde(rename = "Below threshold")]
    BelowThreshold,
    #[serde(rename = "Above threshold")]
    AboveThreshold,
    Valid,
}

impl Status {
    /// First match wins: SD warning, missing day, below, above, valid.
    pub fn derive(std_warning: bool, missing_day: bool, thresh_check: ThreshCheck) -> Self {
        if std_warning {
            Status::OutsideSdRange
        } else if missing_day {
            Status::FullDayMissing
        } else if thresh_check == ThreshCheck::Below {
            Status::BelowThreshold
        } else if thresh_check == ThreshCheck::Above {
            Status::AboveThreshold
        } else {
            Status::Valid
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::OutsideSdRange => "Warning - Outside SD Range",
            Status::FullDayMissing => "Full day missing",
            Status::BelowThreshold => "Below threshold",
            Status::AboveThreshold => "Above threshold",
            Status::Valid => "Valid",
        }
    }

    /// Chart colour used by plotting tools.
    pub fn colour(self) -> &'static str {
        match self {
            Status::OutsideSdRange => "orange",
            Status::FullDayMissing => "grey",
            Status::BelowThreshold => "black",
            Status::AboveThreshold => "red",
            Status::Valid => "green",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One (site, timestamp, direction) total with its validation flags.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedObservation {
    pub site_id: String,
    pub timestamp: NaiveDateTime,
    pub direction: String,
    pub count: f64,
    pub thresh_check: ThreshCheck,
    pub missing_day: bool,
    pub valid: bool,
    pub std_warning: bool,
    pub status: Status,
}

impl CleanedObservation {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    pub fn hour(&self) -> u32 {
        self.timestamp.hour()
    }

    /// Numeric value of a calendar dimension (weekday counts from Monday = 0).
    pub fn dimension_value(&self, dimension: CalendarDimension) -> i32 {
        match dimension {
            CalendarDimension::Year => self.timestamp.year(),
            CalendarDimension::Month => self.timestamp.month() as i32,
            CalendarDimension::Week => self.timestamp.iso_week().week() as i32,
            CalendarDimension::Weekday => self.timestamp.weekday().num_days_from_monday() as i32,
        }
    }

    /// Display form of a calendar dimension: month and weekday by name.
    pub fn dimension_label(&self, dimension: CalendarDimension) -> String {
        DimensionValue::Value(self.dimension_value(dimension)).label(dimension)
    }
}

/// The cleaned history of one site.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedDataset {
    pub site_id: String,
    /// Calendar dimensions derived for this run, in output order.
    pub dimensions: Vec<CalendarDimension>,
    pub rows: Vec<CleanedObservation>,
    /// Rows for which no threshold bound was found.
    pub unbounded_rows: usize,
}

impl CleanedDataset {
    pub fn valid_count(&self) -> usize {
        self.rows.iter().filter(|r| r.valid).count()
    }

    pub fn status_counts(&self) -> BTreeMap<Status, usize> {
        let mut counts = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(row.status).or_default() += 1;
        }
        counts
    }

    pub fn total_count(&self) -> f64 {
        self.rows.iter().map(|r| r.count).sum()
    }
}
