//! The cleaning pipeline.
//!
//! Stages run in a fixed order and none may be skipped:
//!
//! 1. normalise raw rows ([`normalize`](crate::cleaning::normalize))
//! 2. sum lane rows ([`aggregate`](crate::cleaning::aggregate))
//! 3. compare totals with threshold bounds
//! 4. flag days whose total across directions is zero
//! 5. derive validity
//! 6. flag valid counts outside the mean ± k·σ band of their group
//! 7. pick a status label
//! 8. sort by date, hour and direction and split per site

use chrono::{Datelike, NaiveDate, Timelike};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::cleaning::aggregate::{HourlyTotal, aggregate_observations};
use crate::cleaning::normalize::read_observations;
use crate::cleaning::types::{CleanedDataset, CleanedObservation, RawObservation, Status};
use crate::cleaning::utility::{mean, sample_stddev};
use crate::config::{CalendarDimension, CleaningConfig};
use crate::error::{AtcError, Result};
use crate::table::Table;
use crate::thresholds::{ThreshCheck, ThresholdTable};

/// Grouping key for the statistical band: site, hour, direction and,
/// when weekdays are tracked, day of week.
type BandKey = (String, u32, String, Option<u32>);

/// Mean ± k·σ range for one band group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub fn contains(&self, count: f64) -> bool {
        count >= self.min && count <= self.max
    }
}

/// Cleans count files against a shared threshold table.
///
/// The engine borrows the thresholds, so one table can serve any number of
/// engines at once.
#[derive(Debug, Clone)]
pub struct CleaningEngine<'a> {
    config: CleaningConfig,
    thresholds: Option<&'a ThresholdTable>,
}

impl<'a> CleaningEngine<'a> {
    /// Validates `config` and builds an engine.
    pub fn new(config: CleaningConfig, thresholds: Option<&'a ThresholdTable>) -> Result<Self> {
        Ok(CleaningEngine {
            config: config.validate()?,
            thresholds,
        })
    }

    pub fn config(&self) -> &CleaningConfig {
        &self.config
    }

    /// Cleans one raw count file, returning one dataset per site it contains.
    ///
    /// # Errors
    ///
    /// [`AtcError::Configuration`] if the engine has no thresholds (checked
    /// before anything is read), [`AtcError::MissingColumns`] if configured
    /// columns are absent, [`AtcError::InvalidValue`] for unreadable cells.
    #[tracing::instrument(skip_all, fields(file = %table.name))]
    pub fn clean_data(&self, table: &Table) -> Result<Vec<CleanedDataset>> {
        let thresholds = self.require_thresholds()?;
        let raw = read_observations(table, &self.config.columns)?;
        Ok(self.run_stages(thresholds, raw))
    }

    /// Cleans observations that were already normalised.
    pub fn clean_observations(&self, raw: Vec<RawObservation>) -> Result<Vec<CleanedDataset>> {
        let thresholds = self.require_thresholds()?;
        Ok(self.run_stages(thresholds, raw))
    }

    fn require_thresholds(&self) -> Result<&'a ThresholdTable> {
        self.thresholds.ok_or_else(|| {
            AtcError::Configuration("cleaning requires a threshold table".to_string())
        })
    }

    fn run_stages(&self, thresholds: &ThresholdTable, raw: Vec<RawObservation>) -> Vec<CleanedDataset> {
        let totals = aggregate_observations(raw);
        let (mut rows, unbounded) = evaluate_thresholds(totals, thresholds);
        flag_missing_days(&mut rows);
        derive_validity(&mut rows);

        let by_weekday = self.config.tracks(CalendarDimension::Weekday);
        let bands = compute_bands(&rows, self.config.std_range, by_weekday);
        flag_std_warnings(&mut rows, &bands, by_weekday);
        label_status(&mut rows);

        rows.sort_by(|a, b| {
            (a.date(), a.hour(), &a.direction).cmp(&(b.date(), b.hour(), &b.direction))
        });

        let datasets = split_by_site(rows, &self.config.dimensions, thresholds, unbounded);
        for ds in &datasets {
            info!(
                site = %ds.site_id,
                rows = ds.rows.len(),
                valid = ds.valid_count(),
                unbounded = ds.unbounded_rows,
                statuses = ?ds.status_counts(),
                "Site cleaned"
            );
        }
        datasets
    }
}

/// Stage 3. A row with no bound counts as within range. Returns the number
/// of such rows per site alongside the evaluated rows.
fn evaluate_thresholds(
    totals: Vec<HourlyTotal>,
    thresholds: &ThresholdTable,
) -> (Vec<CleanedObservation>, BTreeMap<String, usize>) {
    let mut unbounded: BTreeMap<String, usize> = BTreeMap::new();

    let rows = totals
        .into_iter()
        .map(|t| {
            let bounds = thresholds.lookup(&t.site_id, t.timestamp.hour(), t.timestamp.month());
            if bounds.is_none() {
                *unbounded.entry(t.site_id.clone()).or_default() += 1;
            }
            CleanedObservation {
                thresh_check: bounds.map_or(ThreshCheck::Within, |b| b.classify(t.count)),
                site_id: t.site_id,
                timestamp: t.timestamp,
                direction: t.direction,
                count: t.count,
                missing_day: false,
                valid: false,
                std_warning: false,
                status: Status::Valid,
            }
        })
        .collect();

    (rows, unbounded)
}

/// Stage 4. A site-day whose total across all directions is exactly zero.
fn flag_missing_days(rows: &mut [CleanedObservation]) {
    let mut daily: BTreeMap<(&str, NaiveDate), f64> = BTreeMap::new();
    for row in rows.iter() {
        *daily.entry((row.site_id.as_str(), row.date())).or_default() += row.count;
    }

    let missing: Vec<(String, NaiveDate)> = daily
        .into_iter()
        .filter(|(_, total)| *total == 0.0)
        .map(|((site, date), _)| (site.to_string(), date))
        .collect();

    if !missing.is_empty() {
        debug!(days = missing.len(), "Full days missing");
    }

    for row in rows.iter_mut() {
        row.missing_day = missing
            .binary_search_by(|(site, date)| {
                (site.as_str(), *date).cmp(&(row.site_id.as_str(), row.date()))
            })
            .is_ok();
    }
}

/// Stage 5.
fn derive_validity(rows: &mut [CleanedObservation]) {
    for row in rows.iter_mut() {
        row.valid = row.thresh_check == ThreshCheck::Within && !row.missing_day;
    }
}

fn band_key(row: &CleanedObservation, by_weekday: bool) -> BandKey {
    (
        row.site_id.clone(),
        row.hour(),
        row.direction.clone(),
        by_weekday.then(|| row.timestamp.weekday().num_days_from_monday()),
    )
}

/// Stage 6a. Bands from valid rows only. Groups with fewer than two valid
/// samples have no band.
fn compute_bands(
    rows: &[CleanedObservation],
    std_range: f64,
    by_weekday: bool,
) -> BTreeMap<BandKey, Band> {
    let mut samples: BTreeMap<BandKey, Vec<f64>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.valid) {
        samples.entry(band_key(row, by_weekday)).or_default().push(row.count);
    }

    samples
        .into_iter()
        .filter_map(|(key, values)| {
            let avg = mean(&values);
            let sd = sample_stddev(&values, avg)?;
            Some((
                key,
                Band {
                    min: avg - sd * std_range,
                    max: avg + sd * std_range,
                },
            ))
        })
        .collect()
}

/// Stage 6b. Applied to every row; only valid rows can be flagged.
fn flag_std_warnings(
    rows: &mut [CleanedObservation],
    bands: &BTreeMap<BandKey, Band>,
    by_weekday: bool,
) {
    for row in rows.iter_mut().filter(|r| r.valid) {
        row.std_warning = bands
            .get(&band_key(row, by_weekday))
            .is_some_and(|band| !band.contains(row.count));
    }
}

/// Stage 7.
fn label_status(rows: &mut [CleanedObservation]) {
    for row in rows.iter_mut() {
        row.status = Status::derive(row.std_warning, row.missing_day, row.thresh_check);
    }
}

/// Stage 8. Keeps the row order within each site.
fn split_by_site(
    rows: Vec<CleanedObservation>,
    dimensions: &[CalendarDimension],
    thresholds: &ThresholdTable,
    mut unbounded: BTreeMap<String, usize>,
) -> Vec<CleanedDataset> {
    let mut sites: BTreeMap<String, Vec<CleanedObservation>> = BTreeMap::new();
    for row in rows {
        sites.entry(row.site_id.clone()).or_default().push(row);
    }

    sites
        .into_iter()
        .map(|(site_id, rows)| {
            let unbounded_rows = unbounded.remove(&site_id).unwrap_or(0);
            if !thresholds.covers_site(&site_id) {
                warn!(site = %site_id, "Site is not in the site list; no threshold bounds apply");
            } else if unbounded_rows > 0 {
                warn!(site = %site_id, unbounded_rows, "Rows without a threshold bound treated as within range");
            }
            CleanedDataset {
                site_id,
                dimensions: dimensions.to_vec(),
                rows,
                unbounded_rows,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnConfig;
    use crate::sites::SiteMetadata;

    const SITE_LIST: &str = "SiteName,RoadClass\n1,A\n2,B\n";
    const THRESHOLDS: &str = "RoadClass,Low,High\nA,10,50\nB,0,5000\n";

    fn thresholds(sites: &str, thresholds: &str) -> ThresholdTable {
        let sites = Table::from_reader("site list.csv", sites.as_bytes()).unwrap();
        let sites = SiteMetadata::from_table(&sites).unwrap();
        let table = Table::from_reader("thresholds.csv", thresholds.as_bytes()).unwrap();
        ThresholdTable::build(&table, &sites).unwrap()
    }

    fn config() -> CleaningConfig {
        CleaningConfig {
            columns: ColumnConfig {
                site_col: "Site".to_string(),
                count_col: "Count".to_string(),
                dir_col: "Direction".to_string(),
                date_col: "Date".to_string(),
                time_col: Some("Hour".to_string()),
                combined_datetime: false,
                hour_only: true,
            },
            ..Default::default()
        }
    }

    fn counts(rows: &[(&str, &str, u32, &str, f64)]) -> Table {
        let mut content = String::from("Site,Date,Hour,Direction,Count\n");
        for (site, date, hour, dir, count) in rows {
            content.push_str(&format!("{site},{date},{hour},{dir},{count}\n"));
        }
        Table::from_reader("counts.csv", content.as_bytes()).unwrap()
    }

    #[test]
    fn test_clean_without_thresholds_is_configuration_error() {
        let engine = CleaningEngine::new(config(), None).unwrap();
        // Columns are wrong too; the threshold check must come first.
        let table = Table::from_reader("counts.csv", "A,B\n1,2\n".as_bytes()).unwrap();
        let err = engine.clean_data(&table).unwrap_err();
        assert!(matches!(err, AtcError::Configuration(_)));
    }

    #[test]
    fn test_lane_totals_missing_day_and_status() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();
        let table = counts(&[
            ("1", "2024-01-01", 7, "N", 5.0),
            ("1", "2024-01-01", 7, "N", 7.0),
            ("1", "2024-01-02", 7, "N", 0.0),
            ("1", "2024-01-02", 8, "S", 0.0),
        ]);

        let datasets = engine.clean_data(&table).unwrap();
        assert_eq!(datasets.len(), 1);
        let rows = &datasets[0].rows;
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].count, 12.0);
        assert_eq!(rows[0].thresh_check, ThreshCheck::Within);
        assert!(!rows[0].missing_day);
        assert!(rows[0].valid);
        assert_eq!(rows[0].status, Status::Valid);

        for row in &rows[1..] {
            assert!(row.missing_day);
            assert!(!row.valid);
            // Also below the Low bound, but a missing day takes priority.
            assert_eq!(row.thresh_check, ThreshCheck::Below);
            assert_eq!(row.status, Status::FullDayMissing);
        }
    }

    #[test]
    fn test_clean_observations_matches_clean_data() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();
        let at = |day: u32, hour: u32| {
            NaiveDate::from_ymd_opt(2024, 1, day)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap()
        };
        let raw = vec![
            RawObservation {
                site_id: "1".to_string(),
                direction: "N".to_string(),
                timestamp: at(1, 7),
                count: 5.0,
            },
            RawObservation {
                site_id: "1".to_string(),
                direction: "N".to_string(),
                timestamp: at(1, 7),
                count: 7.0,
            },
            RawObservation {
                site_id: "1".to_string(),
                direction: "S".to_string(),
                timestamp: at(2, 8),
                count: 0.0,
            },
        ];

        let direct = engine.clean_observations(raw).unwrap();
        let from_table = engine
            .clean_data(&counts(&[
                ("1", "2024-01-01", 7, "N", 5.0),
                ("1", "2024-01-01", 7, "N", 7.0),
                ("1", "2024-01-02", 8, "S", 0.0),
            ]))
            .unwrap();
        assert_eq!(direct, from_table);
        assert_eq!(direct[0].rows[0].count, 12.0);
        assert_eq!(direct[0].rows[1].status, Status::FullDayMissing);

        let unconfigured = CleaningEngine::new(config(), None).unwrap();
        assert!(matches!(
            unconfigured.clean_observations(vec![]),
            Err(AtcError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_day_is_per_site() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();
        let table = counts(&[
            ("1", "2024-01-01", 7, "N", 0.0),
            ("2", "2024-01-01", 7, "N", 40.0),
        ]);

        let datasets = engine.clean_data(&table).unwrap();
        assert_eq!(datasets.len(), 2);
        assert!(datasets[0].rows[0].missing_day);
        assert!(!datasets[1].rows[0].missing_day);
    }

    #[test]
    fn test_threshold_flags() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();
        let table = counts(&[
            ("1", "2024-01-01", 7, "N", 5.0),
            ("1", "2024-01-01", 8, "N", 60.0),
            ("1", "2024-01-01", 9, "N", 30.0),
        ]);

        let rows = &engine.clean_data(&table).unwrap()[0].rows;
        let statuses: Vec<_> = rows.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![Status::BelowThreshold, Status::AboveThreshold, Status::Valid]
        );
        assert!(rows.iter().all(|r| !r.std_warning));
    }

    #[test]
    fn test_outlier_outside_band_is_warned() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();

        let mut raw: Vec<(String, u32, f64)> = (1..=10)
            .map(|day| (format!("2024-03-{day:02}"), 7, 100.0))
            .collect();
        raw.push(("2024-03-11".to_string(), 7, 1000.0));
        let rows: Vec<_> = raw
            .iter()
            .map(|(date, hour, count)| ("2", date.as_str(), *hour, "N", *count))
            .collect();

        let cleaned = &engine.clean_data(&counts(&rows)).unwrap()[0];
        let warned: Vec<_> = cleaned.rows.iter().filter(|r| r.std_warning).collect();
        assert_eq!(warned.len(), 1);
        assert_eq!(warned[0].count, 1000.0);
        assert!(warned[0].valid);
        assert_eq!(warned[0].status, Status::OutsideSdRange);
    }

    #[test]
    fn test_single_sample_group_never_warns() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();
        let table = counts(&[
            ("2", "2024-01-01", 7, "N", 10.0),
            ("2", "2024-01-01", 8, "N", 4000.0),
        ]);

        let rows = &engine.clean_data(&table).unwrap()[0].rows;
        assert!(rows.iter().all(|r| !r.std_warning));
    }

    #[test]
    fn test_invalid_rows_are_kept_and_never_warned() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let mut cfg = config();
        cfg.std_range = 0.0;
        let engine = CleaningEngine::new(cfg, Some(&t)).unwrap();
        let table = counts(&[
            ("1", "2024-01-01", 7, "N", 20.0),
            ("1", "2024-01-02", 7, "N", 30.0),
            ("1", "2024-01-03", 7, "N", 90.0),
            ("1", "2024-01-04", 8, "N", 95.0),
        ]);

        let rows = &engine.clean_data(&table).unwrap()[0].rows;
        assert_eq!(rows.len(), 4);
        for row in rows {
            if row.std_warning {
                assert!(row.valid);
                assert_eq!(row.thresh_check, ThreshCheck::Within);
                assert!(!row.missing_day);
            }
        }
        // With a zero-width band both valid 07:00 counts sit off the mean.
        assert_eq!(rows.iter().filter(|r| r.std_warning).count(), 2);
        // The 08:00 group has no valid samples at all.
        assert_eq!(rows[3].status, Status::AboveThreshold);
    }

    #[test]
    fn test_weekday_tracking_splits_band_groups() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let mut cfg = config();
        cfg.std_range = 1.0;
        cfg.dimensions = vec![CalendarDimension::Weekday];
        let engine = CleaningEngine::new(cfg, Some(&t)).unwrap();

        // Mondays are busy, Tuesdays quiet. Pooled, 1σ would flag both
        // extremes; split by weekday, each group is uniform.
        let table = counts(&[
            ("2", "2024-01-01", 7, "N", 500.0),
            ("2", "2024-01-08", 7, "N", 500.0),
            ("2", "2024-01-02", 7, "N", 50.0),
            ("2", "2024-01-09", 7, "N", 50.0),
        ]);

        let rows = &engine.clean_data(&table).unwrap()[0].rows;
        assert!(rows.iter().all(|r| !r.std_warning));
    }

    #[test]
    fn test_pooled_band_without_weekday_tracking() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let mut cfg = config();
        cfg.std_range = 0.5;
        let engine = CleaningEngine::new(cfg, Some(&t)).unwrap();

        let table = counts(&[
            ("2", "2024-01-01", 7, "N", 500.0),
            ("2", "2024-01-08", 7, "N", 500.0),
            ("2", "2024-01-02", 7, "N", 50.0),
            ("2", "2024-01-09", 7, "N", 50.0),
        ]);

        let rows = &engine.clean_data(&table).unwrap()[0].rows;
        assert_eq!(rows.iter().filter(|r| r.std_warning).count(), 4);
    }

    #[test]
    fn test_site_without_bounds_is_treated_as_within_range() {
        // Permissive default: a site absent from the site list has no bounds,
        // so even an absurd count passes the threshold stage.
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();
        let table = counts(&[("99", "2024-01-01", 7, "N", 1_000_000.0)]);

        let cleaned = &engine.clean_data(&table).unwrap()[0];
        assert_eq!(cleaned.site_id, "99");
        assert_eq!(cleaned.unbounded_rows, 1);
        assert_eq!(cleaned.rows[0].thresh_check, ThreshCheck::Within);
        assert!(cleaned.rows[0].valid);
    }

    #[test]
    fn test_hourly_thresholds_without_matching_hour() {
        let t = thresholds(SITE_LIST, "Hour,Low,High\n7,10,50\n");
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();
        let table = counts(&[
            ("1", "2024-01-01", 7, "N", 5.0),
            ("1", "2024-01-01", 8, "N", 5.0),
        ]);

        let cleaned = &engine.clean_data(&table).unwrap()[0];
        assert_eq!(cleaned.rows[0].thresh_check, ThreshCheck::Below);
        assert_eq!(cleaned.rows[1].thresh_check, ThreshCheck::Within);
        assert_eq!(cleaned.unbounded_rows, 1);
    }

    #[test]
    fn test_rows_sorted_by_date_hour_direction() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();
        let table = counts(&[
            ("1", "2024-01-02", 1, "N", 20.0),
            ("1", "2024-01-01", 9, "S", 20.0),
            ("1", "2024-01-01", 9, "N", 20.0),
            ("1", "2024-01-01", 3, "S", 20.0),
        ]);

        let rows = &engine.clean_data(&table).unwrap()[0].rows;
        let keys: Vec<_> = rows
            .iter()
            .map(|r| (r.date().day(), r.hour(), r.direction.as_str()))
            .collect();
        assert_eq!(keys, vec![(1, 3, "S"), (1, 9, "N"), (1, 9, "S"), (2, 1, "N")]);
    }

    #[test]
    fn test_cleaning_is_deterministic() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();
        let table = counts(&[
            ("1", "2024-01-01", 7, "N", 20.0),
            ("2", "2024-01-01", 7, "S", 30.0),
            ("1", "2024-01-02", 7, "N", 25.0),
            ("1", "2024-01-03", 7, "N", 49.0),
        ]);

        let first = engine.clean_data(&table).unwrap();
        let second = engine.clean_data(&table).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_status_agrees_with_flags() {
        let t = thresholds(SITE_LIST, THRESHOLDS);
        let engine = CleaningEngine::new(config(), Some(&t)).unwrap();
        let table = counts(&[
            ("1", "2024-01-01", 7, "N", 20.0),
            ("1", "2024-01-01", 8, "N", 2.0),
            ("1", "2024-01-02", 7, "N", 0.0),
            ("1", "2024-01-03", 7, "N", 70.0),
            ("1", "2024-01-04", 7, "N", 21.0),
        ]);

        for row in &engine.clean_data(&table).unwrap()[0].rows {
            assert_eq!(
                row.valid,
                row.thresh_check == ThreshCheck::Within && !row.missing_day
            );
            assert_eq!(
                row.status,
                Status::derive(row.std_warning, row.missing_day, row.thresh_check)
            );
        }
    }
}
