//! Output formatting and persistence for cleaned data and summaries.
//!
//! Every artifact is a CSV file, optionally gzip-compressed. Output is fully
//! determined by its input so reruns produce identical files.

use csv::WriterBuilder;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::cleaning::types::CleanedDataset;
use crate::config::ColumnConfig;
use crate::error::{AtcError, Result};
use crate::summary::SiteSummary;

pub const CLEANED_DIR: &str = "cleaned";
pub const SUMMARY_DIR: &str = "summary";
pub const CHART_DIR: &str = "chart";

/// Logs a site summary using Rust's debug pretty-print format.
pub fn print_pretty(summary: &SiteSummary) {
    debug!("{:#?}", summary);
}

/// Logs the overall valid share of a site summary.
pub fn log_overall(summary: &SiteSummary) {
    for row in summary.overall() {
        info!(
            site = %summary.site_id,
            direction = row.direction.as_deref().unwrap_or("All"),
            valid = row.valid,
            not_valid = row.not_valid,
            valid_pct = row.valid_pct(),
            "Site summary"
        );
    }
}

/// Integral counts print without a decimal point.
pub fn format_count(count: f64) -> String {
    if count.fract() == 0.0 && count.abs() < 1e15 {
        format!("{}", count as i64)
    } else {
        count.to_string()
    }
}

fn format_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Path of an artifact under `output_dir/<kind>/<source>/`, where `source`
/// is the stem of the input file the site was read from.
///
/// # Errors
///
/// [`AtcError::Schema`] if `source` or `site_id` is not a single plain
/// file name (empty, `.`, `..` or containing a path separator).
pub fn artifact_path(
    output_dir: &Path,
    kind: &str,
    source: &str,
    site_id: &str,
    gzip: bool,
) -> Result<PathBuf> {
    let source = file_component(source, "input file")?;
    let site_id = file_component(site_id, "site identifier")?;
    let file_name = if gzip {
        format!("{site_id}.csv.gz")
    } else {
        format!("{site_id}.csv")
    };
    Ok(output_dir.join(kind).join(source).join(file_name))
}

fn file_component<'s>(value: &'s str, what: &str) -> Result<&'s str> {
    let mut components = Path::new(value).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == value
    );
    if single && !value.contains(['/', '\\']) {
        Ok(value)
    } else {
        Err(AtcError::Schema(format!(
            "{what} {value:?} cannot be used as an output file name"
        )))
    }
}

/// Renders the cleaned rows of a site as CSV.
pub fn cleaned_csv(dataset: &CleanedDataset, columns: &ColumnConfig) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    let mut header = vec![
        columns.site_col.clone(),
        "DateTime".to_string(),
        columns.date_col.clone(),
        "Hour".to_string(),
    ];
    header.extend(dataset.dimensions.iter().map(|d| d.column_name().to_string()));
    header.extend([
        columns.dir_col.clone(),
        columns.count_col.clone(),
        "ThreshCheck".to_string(),
        "MissingDay".to_string(),
        "Valid".to_string(),
        "StdWarning".to_string(),
        "Status".to_string(),
    ]);
    writer.write_record(&header)?;

    for row in &dataset.rows {
        let mut record = vec![
            row.site_id.clone(),
            row.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            row.date().format("%Y-%m-%d").to_string(),
            row.hour().to_string(),
        ];
        record.extend(dataset.dimensions.iter().map(|d| row.dimension_label(*d)));
        record.extend([
            row.direction.clone(),
            format_count(row.count),
            row.thresh_check.as_i8().to_string(),
            u8::from(row.missing_day).to_string(),
            format_bool(row.valid).to_string(),
            u8::from(row.std_warning).to_string(),
            row.status.label().to_string(),
        ]);
        writer.write_record(&record)?;
    }

    finish(writer)
}

/// Renders a site summary as CSV.
pub fn summary_csv(summary: &SiteSummary, columns: &ColumnConfig) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    let mut header = vec![columns.site_col.clone()];
    header.extend(summary.dimensions.iter().map(|d| d.column_name().to_string()));
    if summary.by_direction {
        header.push(columns.dir_col.clone());
    }
    header.extend(["Valid", "Not Valid", "Valid%"].map(String::from));
    writer.write_record(&header)?;

    for row in &summary.rows {
        let mut record = vec![summary.site_id.clone()];
        record.extend(
            summary
                .dimensions
                .iter()
                .zip(&row.values)
                .map(|(dim, value)| value.label(*dim)),
        );
        if let Some(direction) = &row.direction {
            record.push(direction.clone());
        }
        record.extend([
            row.valid.to_string(),
            row.not_valid.to_string(),
            row.valid_pct().to_string(),
        ]);
        writer.write_record(&record)?;
    }

    finish(writer)
}

/// Renders the plotting feed: one point per row with its status colour.
pub fn chart_csv(
    dataset: &CleanedDataset,
    columns: &ColumnConfig,
    valid_only: bool,
) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer.write_record([
        "DateTime",
        columns.dir_col.as_str(),
        columns.count_col.as_str(),
        "Status",
        "Colour",
    ])?;

    for row in dataset.rows.iter().filter(|r| !valid_only || r.valid) {
        writer.write_record([
            row.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().as_str(),
            row.direction.as_str(),
            format_count(row.count).as_str(),
            row.status.label(),
            row.status.colour(),
        ])?;
    }

    finish(writer)
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| AtcError::Io(e.into_error()))
}

/// Writes `bytes` to `path`, creating parent directories and optionally
/// gzip-compressing the content. Replaces any existing file.
pub fn persist(path: &Path, bytes: &[u8], gzip: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let body = if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()?
    } else {
        bytes.to_vec()
    };

    std::fs::write(path, body)?;
    debug!(path = %path.display(), gzip, "Artifact written");
    Ok(())
}
