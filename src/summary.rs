//! Valid/not-valid drill-down summaries of a cleaned site.
//!
//! One pass per subset of the tracked calendar dimensions; dimensions left
//! out of a subset read as `All`. With `[Year, Month]` tracked the result
//! holds per-year-per-month, per-year, per-month and overall rows.

use chrono::{Month, NaiveDate, Weekday};
use std::collections::BTreeMap;

use crate::cleaning::types::CleanedDataset;
use crate::config::CalendarDimension;

/// Label for an aggregated-over dimension.
pub const ALL_LABEL: &str = "All";

/// A concrete dimension value, or the aggregate over that dimension.
///
/// Concrete values order before `All`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DimensionValue {
    Value(i32),
    All,
}

impl DimensionValue {
    /// Month and weekday by name, other dimensions by number.
    pub fn label(self, dimension: CalendarDimension) -> String {
        let DimensionValue::Value(v) = self else {
            return ALL_LABEL.to_string();
        };
        match dimension {
            CalendarDimension::Month => u8::try_from(v)
                .ok()
                .and_then(|m| Month::try_from(m).ok())
                .map(|m| m.name().to_string())
                .unwrap_or_else(|| v.to_string()),
            // Any date on that weekday formats to its full name.
            CalendarDimension::Weekday => u8::try_from(v)
                .ok()
                .and_then(|d| Weekday::try_from(d).ok())
                .and_then(|d| NaiveDate::from_isoywd_opt(2024, 1, d))
                .map(|d| d.format("%A").to_string())
                .unwrap_or_else(|| v.to_string()),
            _ => v.to_string(),
        }
    }
}

/// Valid and not-valid row counts for one grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    /// One value per tracked dimension, in [`SiteSummary::dimensions`] order.
    pub values: Vec<DimensionValue>,
    /// Set when summarising by direction.
    pub direction: Option<String>,
    pub valid: usize,
    pub not_valid: usize,
}

impl SummaryRow {
    /// Share of valid rows, 0.0 to 1.0.
    pub fn valid_pct(&self) -> f64 {
        let total = self.valid + self.not_valid;
        if total == 0 {
            0.0
        } else {
            self.valid as f64 / total as f64
        }
    }

    /// True for the row that aggregates over every dimension.
    pub fn is_overall(&self) -> bool {
        self.values.iter().all(|v| *v == DimensionValue::All)
    }
}

/// Summary table for one site.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteSummary {
    pub site_id: String,
    pub dimensions: Vec<CalendarDimension>,
    pub by_direction: bool,
    pub rows: Vec<SummaryRow>,
}

impl SiteSummary {
    pub fn overall(&self) -> impl Iterator<Item = &SummaryRow> {
        self.rows.iter().filter(|r| r.is_overall())
    }
}

type SummaryKey = (Vec<DimensionValue>, Option<String>);

/// Builds the drill-down summary for a cleaned site.
///
/// Every subset of `dataset.dimensions` is grouped (a bitmask walk over at
/// most four dimensions) and the groups are merged into one table sorted by
/// dimension values.
pub fn summarize(dataset: &CleanedDataset, by_direction: bool) -> SiteSummary {
    let dims = &dataset.dimensions;
    let mut groups: BTreeMap<SummaryKey, (usize, usize)> = BTreeMap::new();

    for mask in 0u32..(1 << dims.len()) {
        for row in &dataset.rows {
            let values = dims
                .iter()
                .enumerate()
                .map(|(i, dim)| {
                    if mask & (1 << i) != 0 {
                        DimensionValue::Value(row.dimension_value(*dim))
                    } else {
                        DimensionValue::All
                    }
                })
                .collect();
            let direction = by_direction.then(|| row.direction.clone());

            let entry = groups.entry((values, direction)).or_default();
            if row.valid {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
    }

    let rows = groups
        .into_iter()
        .map(|((values, direction), (valid, not_valid))| SummaryRow {
            values,
            direction,
            valid,
            not_valid,
        })
        .collect();

    SiteSummary {
        site_id: dataset.site_id.clone(),
        dimensions: dims.clone(),
        by_direction,
        rows,
    }
}
