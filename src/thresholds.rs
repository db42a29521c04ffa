//! Acceptance thresholds per site category combination.
//!
//! A threshold file carries `Low` and `High` bounds, optional `Hour` and
//! `Month` discriminators, and any subset of the site list's category
//! columns. Coverage of every site combination is proven once, when the
//! table is built, so cleaning never has to handle a site that silently
//! lacks bounds because of a gap in the file.

use chrono::Month;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{AtcError, Result};
use crate::sites::SiteMetadata;
use crate::table::{Table, cell};

pub const LOW_COL: &str = "Low";
pub const HIGH_COL: &str = "High";
pub const HOUR_COL: &str = "Hour";
pub const MONTH_COL: &str = "Month";

/// Result of comparing a count against its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreshCheck {
    Below,
    Within,
    Above,
}

impl ThreshCheck {
    /// -1 below, 0 within, +1 above.
    pub fn as_i8(self) -> i8 {
        match self {
            ThreshCheck::Below => -1,
            ThreshCheck::Within => 0,
            ThreshCheck::Above => 1,
        }
    }
}

/// Low/High bounds. A blank cell leaves that side open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

impl Bounds {
    pub fn classify(&self, count: f64) -> ThreshCheck {
        if self.low.is_some_and(|low| count < low) {
            ThreshCheck::Below
        } else if self.high.is_some_and(|high| count > high) {
            ThreshCheck::Above
        } else {
            ThreshCheck::Within
        }
    }
}

/// One row of the threshold file.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRecord {
    pub categories: BTreeMap<String, String>,
    /// `None` applies to every hour.
    pub hour: Option<u32>,
    /// `None` applies to every month.
    pub month: Option<u32>,
    pub bounds: Bounds,
}

impl ThresholdRecord {
    fn matches(&self, hour: u32, month: u32) -> bool {
        self.hour.is_none_or(|h| h == hour) && self.month.is_none_or(|m| m == month)
    }
}

/// A threshold row joined with the site it applies to.
///
/// Threshold rows that match no site still appear once, with `site_id` unset.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedThreshold {
    pub site_id: Option<String>,
    /// Site attributes (when matched) overlaid with the threshold's own
    /// category values.
    pub attributes: BTreeMap<String, String>,
    pub record: ThresholdRecord,
}

/// Validated thresholds merged with the site list.
#[derive(Debug, Clone)]
pub struct ThresholdTable {
    /// Category columns of the threshold file, sorted. Always a subset of the
    /// site list's categories.
    pub shared_categories: Vec<String>,
    pub has_hour: bool,
    pub has_month: bool,
    merged: Vec<MergedThreshold>,
    by_site: HashMap<String, Vec<usize>>,
}

impl ThresholdTable {
    /// Reads the threshold file at `path` and validates it against `sites`.
    #[tracing::instrument(skip(sites), fields(path = %path.display()))]
    pub fn load(path: &Path, sites: &SiteMetadata) -> Result<Self> {
        let table = Table::read(path)?;
        Self::build(&table, sites)
    }

    /// Validates threshold rows against the site list and merges the two.
    ///
    /// # Errors
    ///
    /// - [`AtcError::MissingColumns`] if `Low` or `High` is absent.
    /// - [`AtcError::Schema`] if a category column is not in the site list.
    /// - [`AtcError::Coverage`] listing every site combination without a
    ///   threshold row.
    /// - [`AtcError::InvalidValue`] for unreadable bounds or discriminators.
    pub fn build(table: &Table, sites: &SiteMetadata) -> Result<Self> {
        let bound_idx = table.require_columns(&[LOW_COL, HIGH_COL])?;
        let (low_idx, high_idx) = (bound_idx[0], bound_idx[1]);
        let hour_idx = table.column_index(HOUR_COL);
        let month_idx = table.column_index(MONTH_COL);

        let category_cols: BTreeMap<String, usize> = table
            .headers()
            .iter()
            .enumerate()
            .filter(|(_, h)| ![HOUR_COL, MONTH_COL, LOW_COL, HIGH_COL].contains(&h.as_str()))
            .map(|(i, h)| (h.clone(), i))
            .collect();

        let unknown: Vec<&str> = category_cols
            .keys()
            .filter(|c| !sites.categories.contains(*c))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(AtcError::Schema(format!(
                "{} features the following columns not included in the site list: {}",
                table.name,
                unknown.join(", ")
            )));
        }

        let shared_categories: Vec<String> = category_cols.keys().cloned().collect();

        let mut records = Vec::with_capacity(table.len());
        for (line, row) in table.rows() {
            let categories = category_cols
                .iter()
                .map(|(name, i)| (name.clone(), cell(row, *i).to_string()))
                .collect();

            let hour = match hour_idx {
                Some(i) => parse_hour(cell(row, i))
                    .map_err(|reason| table.invalid_value(line, HOUR_COL, cell(row, i), &reason))?,
                None => None,
            };
            let month = match month_idx {
                Some(i) => parse_month(cell(row, i)).map_err(|reason| {
                    table.invalid_value(line, MONTH_COL, cell(row, i), &reason)
                })?,
                None => None,
            };

            let low = parse_bound(cell(row, low_idx))
                .map_err(|reason| table.invalid_value(line, LOW_COL, cell(row, low_idx), &reason))?;
            let high = parse_bound(cell(row, high_idx)).map_err(|reason| {
                table.invalid_value(line, HIGH_COL, cell(row, high_idx), &reason)
            })?;

            if let (Some(l), Some(h)) = (low, high) {
                if l > h {
                    warn!(file = %table.name, line, low = l, high = h, "Low bound exceeds High bound");
                }
            }

            records.push(ThresholdRecord {
                categories,
                hour,
                month,
                bounds: Bounds { low, high },
            });
        }

        check_coverage(&shared_categories, &records, sites)?;
        warn_duplicate_keys(&table.name, &shared_categories, &records);

        let merged = merge_with_sites(&shared_categories, records, sites);

        let mut by_site: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, m) in merged.iter().enumerate() {
            if let Some(site) = &m.site_id {
                by_site.entry(site.clone()).or_default().push(i);
            }
        }

        info!(
            file = %table.name,
            rows = table.len(),
            merged = merged.len(),
            shared_categories = ?shared_categories,
            has_hour = hour_idx.is_some(),
            has_month = month_idx.is_some(),
            "Thresholds validated"
        );

        Ok(ThresholdTable {
            shared_categories,
            has_hour: hour_idx.is_some(),
            has_month: month_idx.is_some(),
            merged,
            by_site,
        })
    }

    /// Right-join of the site list onto the threshold rows.
    pub fn merged(&self) -> &[MergedThreshold] {
        &self.merged
    }

    /// Bounds for a site at a given hour (0-23) and month (1-12).
    ///
    /// The first matching row in file order wins. Returns `None` when the site
    /// is not in the site list or no row covers that hour/month.
    pub fn lookup(&self, site_id: &str, hour: u32, month: u32) -> Option<Bounds> {
        self.by_site
            .get(site_id)?
            .iter()
            .map(|&i| &self.merged[i].record)
            .find(|r| r.matches(hour, month))
            .map(|r| r.bounds)
    }

    pub fn covers_site(&self, site_id: &str) -> bool {
        self.by_site.contains_key(site_id)
    }
}

/// Anti-join: site combinations with no threshold combination.
fn check_coverage(
    shared: &[String],
    records: &[ThresholdRecord],
    sites: &SiteMetadata,
) -> Result<()> {
    if shared.is_empty() {
        debug!("Thresholds carry no category columns; every row applies to every site");
        return Ok(());
    }

    let threshold_combos: BTreeSet<Vec<String>> =
        records.iter().map(|r| combination(&r.categories, shared)).collect();
    let site_combos = sites.combinations(shared);

    let missing: Vec<Vec<String>> = site_combos
        .into_iter()
        .filter(|c| !threshold_combos.contains(c))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AtcError::Coverage {
            categories: shared.to_vec(),
            missing,
        })
    }
}

fn warn_duplicate_keys(file: &str, shared: &[String], records: &[ThresholdRecord]) {
    let mut counts: BTreeMap<(Vec<String>, Option<u32>, Option<u32>), usize> = BTreeMap::new();
    for r in records {
        *counts
            .entry((combination(&r.categories, shared), r.hour, r.month))
            .or_default() += 1;
    }
    let duplicates = counts.values().filter(|&&n| n > 1).count();
    if duplicates > 0 {
        warn!(
            file,
            duplicates, "Threshold keys repeat; the first matching row is used"
        );
    }
}

fn merge_with_sites(
    shared: &[String],
    records: Vec<ThresholdRecord>,
    sites: &SiteMetadata,
) -> Vec<MergedThreshold> {
    let mut merged = Vec::new();

    for record in records {
        let key = combination(&record.categories, shared);
        let matching: Vec<_> = sites
            .sites
            .iter()
            .filter(|s| s.combination(shared) == key)
            .collect();

        if matching.is_empty() {
            merged.push(MergedThreshold {
                site_id: None,
                attributes: record.categories.clone(),
                record,
            });
            continue;
        }

        for site in matching {
            let mut attributes = site.categories.clone();
            attributes.extend(record.categories.clone());
            merged.push(MergedThreshold {
                site_id: Some(site.site_id.clone()),
                attributes,
                record: record.clone(),
            });
        }
    }

    merged
}

fn combination(categories: &BTreeMap<String, String>, names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|n| categories.get(n).cloned().unwrap_or_default())
        .collect()
}

fn parse_bound(raw: &str) -> std::result::Result<Option<f64>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_nan() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(_) => Err("expected a number".to_string()),
    }
}

fn parse_hour(raw: &str) -> std::result::Result<Option<u32>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    let value: f64 = raw.parse().map_err(|_| "expected an hour 0-23".to_string())?;
    if value.fract() != 0.0 || !(0.0..=23.0).contains(&value) {
        return Err("expected an hour 0-23".to_string());
    }
    Ok(Some(value as u32))
}

/// Month as 1-12; accepts numbers, full English names and 3-letter
/// abbreviations.
pub fn parse_month(raw: &str) -> std::result::Result<Option<u32>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(value) = raw.parse::<f64>() {
        if value.fract() == 0.0 && (1.0..=12.0).contains(&value) {
            return Ok(Some(value as u32));
        }
        return Err("expected a month 1-12".to_string());
    }
    raw.parse::<Month>()
        .map(|m| Some(m.number_from_month()))
        .map_err(|_| "expected a month number or name".to_string())
}
