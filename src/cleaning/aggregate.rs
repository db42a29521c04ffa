//! Stage 2: sum lane-level rows into one total per site, timestamp and direction.

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use tracing::debug;

use crate::cleaning::types::RawObservation;

/// A summed count for one (site, timestamp, direction) key.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyTotal {
    pub site_id: String,
    pub timestamp: NaiveDateTime,
    pub direction: String,
    pub count: f64,
    /// Number of raw rows folded into this total.
    pub records: usize,
}

/// Sums counts sharing a key. Output is ordered by site, timestamp, direction.
pub fn aggregate_observations(raw: Vec<RawObservation>) -> Vec<HourlyTotal> {
    let raw_rows = raw.len();
    let mut totals: BTreeMap<(String, NaiveDateTime, String), (f64, usize)> = BTreeMap::new();

    for obs in raw {
        let entry = totals
            .entry((obs.site_id, obs.timestamp, obs.direction))
            .or_insert((0.0, 0));
        entry.0 += obs.count;
        entry.1 += 1;
    }

    let aggregated: Vec<HourlyTotal> = totals
        .into_iter()
        .map(
            |((site_id, timestamp, direction), (count, records))| HourlyTotal {
                site_id,
                timestamp,
                direction,
                count,
                records,
            },
        )
        .collect();

    debug!(
        raw_rows,
        aggregated = aggregated.len(),
        "Lane rows aggregated"
    );
    aggregated
}
