//! Stage 1: read raw count rows into typed observations.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use tracing::debug;

use crate::cleaning::types::RawObservation;
use crate::config::ColumnConfig;
use crate::error::Result;
use crate::sites::canonical_site_id;
use crate::table::{Table, cell};

/// Reciprocal direction codes and the direction they stand for.
/// `N_R` is the reverse of North, i.e. southbound.
static DIRECTION_SYNONYMS: &[(&str, &str)] = &[
    ("N_R", "S"),
    ("S_R", "N"),
    ("E_R", "W"),
    ("W_R", "E"),
];

static DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y"];

static DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

/// Canonical direction for a raw direction code.
pub fn normalize_direction(raw: &str) -> String {
    let raw = raw.trim();
    DIRECTION_SYNONYMS
        .iter()
        .find(|(code, _)| *code == raw)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Column positions of the observation fields, resolved once per file.
struct ObservationColumns {
    site: usize,
    count: usize,
    direction: usize,
    date: usize,
    time: Option<usize>,
}

impl ObservationColumns {
    fn resolve(table: &Table, columns: &ColumnConfig) -> Result<Self> {
        let idx = table.require_columns(&columns.required_columns())?;
        Ok(ObservationColumns {
            site: idx[0],
            count: idx[1],
            direction: idx[2],
            date: idx[3],
            time: idx.get(4).copied(),
        })
    }
}

/// Reads every row of `table` into a [`RawObservation`].
///
/// # Errors
///
/// [`crate::AtcError::MissingColumns`] naming every configured column the
/// file lacks; [`crate::AtcError::InvalidValue`] for unreadable cells.
pub fn read_observations(table: &Table, columns: &ColumnConfig) -> Result<Vec<RawObservation>> {
    let cols = ObservationColumns::resolve(table, columns)?;
    let mut observations = Vec::with_capacity(table.len());

    for (line, row) in table.rows() {
        let raw_site = cell(row, cols.site);
        let site_id = canonical_site_id(raw_site);
        if site_id.is_empty() {
            return Err(table.invalid_value(line, &columns.site_col, raw_site, "empty site identifier"));
        }

        let raw_count = cell(row, cols.count);
        let count = parse_count(raw_count)
            .map_err(|reason| table.invalid_value(line, &columns.count_col, raw_count, &reason))?;

        let raw_date = cell(row, cols.date);
        let parsed = if columns.combined_datetime {
            parse_datetime(raw_date)
        } else {
            parse_date(raw_date).map(|d| d.and_time(chrono::NaiveTime::MIN))
        };
        let timestamp = parsed
            .ok_or_else(|| table.invalid_value(line, &columns.date_col, raw_date, "unrecognised date"))?;

        let timestamp = match (cols.time, &columns.time_col) {
            (Some(idx), Some(time_col)) => {
                let raw_time = cell(row, idx);
                parse_time_of_day(raw_time, columns.hour_only)
                    .and_then(|offset| {
                        timestamp
                            .checked_add_signed(offset)
                            .ok_or_else(|| "time of day is out of range".to_string())
                    })
                    .map_err(|reason| table.invalid_value(line, time_col, raw_time, &reason))?
            }
            _ => timestamp,
        };

        observations.push(RawObservation {
            site_id,
            direction: normalize_direction(cell(row, cols.direction)),
            timestamp,
            count,
        });
    }

    debug!(file = %table.name, rows = observations.len(), "Observations normalised");
    Ok(observations)
}

/// Blank counts contribute nothing to a total.
fn parse_count(raw: &str) -> std::result::Result<f64, String> {
    if raw.is_empty() {
        return Ok(0.0);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_nan() => Ok(0.0),
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err("expected a number".to_string()),
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Date with time of day; a bare date reads as midnight.
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| parse_date(raw).map(|d| d.and_time(chrono::NaiveTime::MIN)))
}

/// Offset from midnight.
///
/// With `hour_only` the cell is a whole hour 0-23. Otherwise it is a
/// duration, either `H:MM[:SS]` or a decimal number of hours.
pub fn parse_time_of_day(raw: &str, hour_only: bool) -> std::result::Result<Duration, String> {
    if hour_only {
        let hour_error = || "expected a whole hour 0-23".to_string();
        let hours: f64 = raw.parse().map_err(|_| hour_error())?;
        if hours.fract() != 0.0 || !(0.0..=23.0).contains(&hours) {
            return Err(hour_error());
        }
        return Duration::try_hours(hours as i64).ok_or_else(hour_error);
    }

    let range_error = || "duration is out of range".to_string();

    if raw.contains(':') {
        let parts: Vec<&str> = raw.split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err("expected H:MM or H:MM:SS".to_string());
        }
        let mut numbers = [0i64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .parse::<i64>()
                .ok()
                .filter(|v| *v >= 0)
                .ok_or_else(|| "expected H:MM or H:MM:SS".to_string())?;
        }
        let [h, m, s] = numbers;
        if m >= 60 || s >= 60 {
            return Err("minutes and seconds must be below 60".to_string());
        }
        let seconds = h
            .checked_mul(3600)
            .and_then(|v| v.checked_add(m * 60 + s))
            .ok_or_else(range_error)?;
        return Duration::try_seconds(seconds).ok_or_else(range_error);
    }

    let hours: f64 = raw
        .parse()
        .map_err(|_| "expected a time of day".to_string())?;
    if !hours.is_finite() || hours < 0.0 {
        return Err("expected a time of day".to_string());
    }
    let seconds = (hours * 3600.0).round();
    if seconds >= i64::MAX as f64 {
        return Err(range_error());
    }
    Duration::try_seconds(seconds as i64).ok_or_else(range_error)
}
