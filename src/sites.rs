//! Site list: one identifier column plus descriptive category columns.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{AtcError, Result};
use crate::table::{Table, cell};

/// Column names with a fixed meaning in threshold tables. A site list may not
/// use them as categories.
pub const RESERVED_COLUMNS: &[&str] = &["Low", "High", "Hour", "Month"];

/// A monitoring site and its category values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRecord {
    pub site_id: String,
    pub categories: BTreeMap<String, String>,
}

impl SiteRecord {
    /// Values of `names`, in that order. Missing categories read as "".
    pub fn combination(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .map(|n| self.categories.get(n).cloned().unwrap_or_default())
            .collect()
    }
}

/// The loaded site list.
#[derive(Debug, Clone)]
pub struct SiteMetadata {
    /// Name of the identifier column in the source file.
    pub id_column: String,
    /// Every column other than the identifier.
    pub categories: BTreeSet<String>,
    pub sites: Vec<SiteRecord>,
}

impl SiteMetadata {
    /// Reads and validates the site list at `path`.
    #[tracing::instrument(fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        let table = Table::read(path)?;
        Self::from_table(&table)
    }

    /// Builds site metadata from an already loaded table.
    ///
    /// # Errors
    ///
    /// [`AtcError::Schema`] when there is not exactly one identifier column
    /// (a column whose name starts with "site", any case), when a category
    /// uses a reserved name, when the list is empty, or when an identifier
    /// repeats.
    pub fn from_table(table: &Table) -> Result<Self> {
        let id_candidates: Vec<usize> = table
            .headers()
            .iter()
            .enumerate()
            .filter(|(_, h)| h.to_lowercase().starts_with("site"))
            .map(|(i, _)| i)
            .collect();

        let id_idx = match id_candidates.as_slice() {
            [idx] => *idx,
            [] => {
                return Err(AtcError::Schema(format!(
                    "{} has no site identifier column (a column name starting with \"Site\")",
                    table.name
                )));
            }
            many => {
                let names: Vec<&str> = many.iter().map(|i| table.headers()[*i].as_str()).collect();
                return Err(AtcError::Schema(format!(
                    "{} has more than one candidate site identifier column: {}",
                    table.name,
                    names.join(", ")
                )));
            }
        };

        let id_column = table.headers()[id_idx].clone();
        let category_cols: Vec<(usize, String)> = table
            .headers()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != id_idx)
            .map(|(i, h)| (i, h.clone()))
            .collect();

        let reserved: Vec<&str> = category_cols
            .iter()
            .filter(|(_, h)| RESERVED_COLUMNS.contains(&h.as_str()))
            .map(|(_, h)| h.as_str())
            .collect();
        if !reserved.is_empty() {
            return Err(AtcError::Schema(format!(
                "{} uses reserved column name(s): {}",
                table.name,
                reserved.join(", ")
            )));
        }

        if table.is_empty() {
            return Err(AtcError::Schema(format!("{} lists no sites", table.name)));
        }

        let mut seen = HashSet::new();
        let mut sites = Vec::with_capacity(table.len());

        for (line, record) in table.rows() {
            let raw_id = cell(record, id_idx);
            let site_id = canonical_site_id(raw_id);
            if site_id.is_empty() {
                return Err(table.invalid_value(line, &id_column, raw_id, "empty site identifier"));
            }
            if !seen.insert(site_id.clone()) {
                return Err(AtcError::Schema(format!(
                    "{} lists site {site_id:?} more than once",
                    table.name
                )));
            }

            let categories = category_cols
                .iter()
                .map(|(i, name)| (name.clone(), cell(record, *i).to_string()))
                .collect();

            sites.push(SiteRecord {
                site_id,
                categories,
            });
        }

        let categories: BTreeSet<String> = category_cols.into_iter().map(|(_, h)| h).collect();

        info!(
            sites = sites.len(),
            id_column = %id_column,
            categories = ?categories,
            "Site list loaded"
        );

        Ok(SiteMetadata {
            id_column,
            categories,
            sites,
        })
    }

    /// Distinct combinations of `names` across all sites, sorted.
    pub fn combinations(&self, names: &[String]) -> BTreeSet<Vec<String>> {
        let combos: BTreeSet<Vec<String>> =
            self.sites.iter().map(|s| s.combination(names)).collect();
        debug!(distinct = combos.len(), "Site category combinations");
        combos
    }
}

/// Canonical string form of a site identifier.
///
/// Identifiers read from numeric spreadsheet columns often come through as
/// `"12.0"`; those collapse to `"12"` so raw counts and site lists agree.
pub fn canonical_site_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some((int, frac)) = trimmed.split_once('.') {
        if !int.is_empty()
            && int.bytes().all(|b| b.is_ascii_digit())
            && !frac.is_empty()
            && frac.bytes().all(|b| b == b'0')
        {
            return int.to_string();
        }
    }
    trimmed.to_string()
}
