//! Per-file processing: read, clean, summarise and persist one count file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{Instrument, error, info};

use crate::cleaning::CleaningEngine;
use crate::config::CleaningConfig;
use crate::error::{AtcError, Result};
use crate::output::{
    CHART_DIR, CLEANED_DIR, SUMMARY_DIR, artifact_path, chart_csv, cleaned_csv, log_overall,
    persist, print_pretty, summary_csv,
};
use crate::summary::summarize;
use crate::table::Table;
use crate::thresholds::ThresholdTable;

/// Where and how artifacts are written.
#[derive(Debug, Clone)]
pub struct OutputOptions {
    pub output_dir: PathBuf,
    pub gzip: bool,
}

/// What was produced for one site of a file.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteOutcome {
    pub site_id: String,
    pub rows: usize,
    pub valid: usize,
    pub cleaned_path: PathBuf,
    pub summary_path: PathBuf,
    pub chart_path: PathBuf,
}

/// Cleans the count file at `path` and writes cleaned, summary and chart
/// artifacts for every site it contains.
///
/// Artifacts land in `<kind>/<file stem>/<site>.csv`, so two files carrying
/// the same site never overwrite each other. Every path is checked before
/// anything is written.
#[tracing::instrument(skip(engine, options), fields(path = %path.display()))]
pub fn process_site_file(
    path: &Path,
    engine: &CleaningEngine<'_>,
    options: &OutputOptions,
) -> Result<Vec<SiteOutcome>> {
    let table = Table::read(path)?;
    let datasets = engine.clean_data(&table)?;
    let config = engine.config();
    let source = source_stem(path)?;

    let mut planned = Vec::with_capacity(datasets.len());
    for dataset in &datasets {
        let site = &dataset.site_id;
        let dir = &options.output_dir;
        planned.push((
            dataset,
            artifact_path(dir, CLEANED_DIR, source, site, options.gzip)?,
            artifact_path(dir, SUMMARY_DIR, source, site, options.gzip)?,
            artifact_path(dir, CHART_DIR, source, site, options.gzip)?,
        ));
    }

    let mut outcomes = Vec::with_capacity(planned.len());
    for (dataset, cleaned_path, summary_path, chart_path) in planned {
        let summary = summarize(dataset, config.by_direction);
        print_pretty(&summary);
        log_overall(&summary);

        persist(
            &cleaned_path,
            &cleaned_csv(dataset, &config.columns)?,
            options.gzip,
        )?;
        persist(
            &summary_path,
            &summary_csv(&summary, &config.columns)?,
            options.gzip,
        )?;
        persist(
            &chart_path,
            &chart_csv(dataset, &config.columns, config.valid_only)?,
            options.gzip,
        )?;

        outcomes.push(SiteOutcome {
            site_id: dataset.site_id.clone(),
            rows: dataset.rows.len(),
            valid: dataset.valid_count(),
            cleaned_path,
            summary_path,
            chart_path,
        });
    }

    info!(sites = outcomes.len(), "File processed");
    Ok(outcomes)
}

fn source_stem(path: &Path) -> Result<&str> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            AtcError::Configuration(format!(
                "{} has no usable file name",
                path.display()
            ))
        })
}

/// Rejects batches in which two inputs share a file stem, since their
/// artifacts would share a directory.
pub fn check_unique_sources(inputs: &[PathBuf]) -> Result<()> {
    let mut seen: BTreeMap<&str, &Path> = BTreeMap::new();
    for path in inputs {
        let stem = source_stem(path)?;
        if let Some(first) = seen.insert(stem, path) {
            return Err(AtcError::Configuration(format!(
                "{} and {} would write to the same output directory {stem:?}",
                first.display(),
                path.display()
            )));
        }
    }
    Ok(())
}

/// Outcome of one file of a batch.
#[derive(Debug)]
pub struct FileReport {
    pub path: PathBuf,
    pub result: Result<Vec<SiteOutcome>>,
}

/// Runs `job` for the file at `path` on the blocking pool. A panicking job
/// is reported as [`AtcError::Aborted`] against that file.
pub async fn run_blocking<F>(path: PathBuf, job: F) -> FileReport
where
    F: FnOnce() -> Result<Vec<SiteOutcome>> + Send + 'static,
{
    let result = match tokio::task::spawn_blocking(job).await {
        Ok(result) => result,
        Err(e) => Err(AtcError::Aborted(e.to_string())),
    };
    FileReport { path, result }
}

/// Cleans every input file, at most `concurrency` at a time, sharing one
/// threshold table. Reports come back in input order; a failing file does
/// not stop the others.
///
/// # Errors
///
/// [`AtcError::Configuration`] if two inputs share a file stem, checked
/// before any file runs.
#[tracing::instrument(skip_all, fields(files = inputs.len(), concurrency = concurrency))]
pub async fn clean_batch(
    inputs: Vec<PathBuf>,
    thresholds: Arc<ThresholdTable>,
    config: CleaningConfig,
    options: OutputOptions,
    concurrency: usize,
) -> Result<Vec<FileReport>> {
    check_unique_sources(&inputs)?;

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let options = Arc::new(options);

    let mut tasks = vec![];

    for path in inputs {
        let sem = semaphore.clone();
        let thresholds = thresholds.clone();
        let config = config.clone();
        let options = options.clone();

        let file_span = tracing::info_span!("clean_file", file = %path.display());
        let task_path = path.clone();

        let task = tokio::spawn(
            async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return FileReport {
                            path: task_path,
                            result: Err(AtcError::Aborted(e.to_string())),
                        };
                    }
                };
                let file = task_path.clone();
                run_blocking(task_path, move || {
                    let engine = CleaningEngine::new(config, Some(thresholds.as_ref()))?;
                    process_site_file(&file, &engine, &options)
                })
                .await
            }
            .instrument(file_span),
        );

        tasks.push((path, task));
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for (path, task) in tasks {
        let report = match task.await {
            Ok(report) => report,
            Err(e) => FileReport {
                path,
                result: Err(AtcError::Aborted(e.to_string())),
            },
        };
        if let Err(e) = &report.result {
            error!(file = %report.path.display(), kind = ?e.kind(), error = %e, "File failed");
        }
        reports.push(report);
    }
    Ok(reports)
}

/// Lists the `.csv` files directly inside `dir`, sorted by name.
pub fn discover_inputs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(AtcError::NotFound(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("csv") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
