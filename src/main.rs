//! CLI entry point for the ATC processor.
//!
//! Provides subcommands for validating a site list against its thresholds
//! and for cleaning a batch of automatic traffic count files.

use anyhow::{Result, bail};
use atc_processor::config::{CalendarDimension, CleaningConfig};
use atc_processor::pipeline::{OutputOptions, clean_batch, discover_inputs};
use atc_processor::sites::SiteMetadata;
use atc_processor::thresholds::ThresholdTable;
use clap::{Args, Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "atc_processor")]
#[command(about = "Clean and validate automatic traffic count data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a threshold file covers every site in a site list
    CheckThresholds {
        /// Site list CSV
        #[arg(long)]
        site_list: PathBuf,

        /// Thresholds CSV
        #[arg(long)]
        thresholds: PathBuf,
    },
    /// Clean count files and write cleaned data, summaries and chart feeds
    Clean {
        /// Site list CSV
        #[arg(long)]
        site_list: PathBuf,

        /// Thresholds CSV
        #[arg(long)]
        thresholds: PathBuf,

        /// Count files to clean
        #[arg(value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Directory of count CSVs to clean (in addition to FILE arguments)
        #[arg(short, long)]
        input_dir: Option<PathBuf>,

        /// Directory to write artifacts into
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Maximum number of files cleaned at once
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// Gzip compress every artifact
        #[arg(long, default_value_t = false)]
        gzip: bool,

        #[command(flatten)]
        settings: SettingsArgs,
    },
}

/// Overrides for the cleaning configuration.
#[derive(Args)]
struct SettingsArgs {
    /// JSON configuration file; flags below take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    site_col: Option<String>,

    #[arg(long)]
    count_col: Option<String>,

    #[arg(long)]
    dir_col: Option<String>,

    #[arg(long)]
    date_col: Option<String>,

    #[arg(long)]
    time_col: Option<String>,

    /// The date column already carries the time of day
    #[arg(long)]
    combined_datetime: bool,

    /// The time column is a duration (e.g. 07:15) rather than a whole hour
    #[arg(long)]
    duration_time: bool,

    /// Width of the statistical band in standard deviations
    #[arg(long)]
    std_range: Option<f64>,

    /// Calendar dimensions to track, comma separated (year,month,week,weekday)
    #[arg(long, value_delimiter = ',')]
    dimensions: Option<Vec<CalendarDimension>>,

    /// Only valid rows go to the chart feed
    #[arg(long)]
    valid_only: bool,

    /// Break summaries down by direction
    #[arg(long)]
    by_direction: bool,
}

impl SettingsArgs {
    fn resolve(self) -> Result<CleaningConfig> {
        let mut config = match &self.config {
            Some(path) => CleaningConfig::load(path)?,
            None => CleaningConfig::default(),
        };

        let cols = &mut config.columns;
        if let Some(v) = self.site_col {
            cols.site_col = v;
        }
        if let Some(v) = self.count_col {
            cols.count_col = v;
        }
        if let Some(v) = self.dir_col {
            cols.dir_col = v;
        }
        if let Some(v) = self.date_col {
            cols.date_col = v;
        }
        if let Some(v) = self.time_col {
            cols.time_col = Some(v);
        }
        if self.combined_datetime {
            cols.combined_datetime = true;
        }
        if self.duration_time {
            cols.hour_only = false;
        }
        if let Some(v) = self.std_range {
            config.std_range = v;
        }
        if let Some(v) = self.dimensions {
            config.dimensions = v;
        }
        config.valid_only |= self.valid_only;
        config.by_direction |= self.by_direction;

        Ok(config.validate()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/atc_processor.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("atc_processor.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckThresholds {
            site_list,
            thresholds,
        } => {
            let sites = SiteMetadata::load(&site_list)?;
            let table = ThresholdTable::load(&thresholds, &sites)?;
            let unmatched = table.merged().iter().filter(|m| m.site_id.is_none()).count();
            info!(
                sites = sites.sites.len(),
                categories = ?sites.categories,
                threshold_rows = table.merged().len(),
                unmatched,
                "Thresholds cover every site"
            );
        }
        Commands::Clean {
            site_list,
            thresholds,
            files,
            input_dir,
            output_dir,
            concurrency,
            gzip,
            settings,
        } => {
            let config = settings.resolve()?;

            let mut inputs = files;
            if let Some(dir) = &input_dir {
                inputs.extend(discover_inputs(dir)?);
            }
            if inputs.is_empty() {
                bail!("no count files given; pass FILE arguments or --input-dir");
            }

            // Construction errors here abort the whole run.
            let sites = SiteMetadata::load(&site_list)?;
            let thresholds = ThresholdTable::load(&thresholds, &sites)?;

            clean_all(
                inputs,
                Arc::new(thresholds),
                config,
                OutputOptions { output_dir, gzip },
                concurrency,
            )
            .await?;
        }
    }

    Ok(())
}

/// Cleans every input file and logs what each produced. A failing file is
/// reported and skipped; the run fails at the end if any file did.
async fn clean_all(
    inputs: Vec<PathBuf>,
    thresholds: Arc<ThresholdTable>,
    config: CleaningConfig,
    options: OutputOptions,
    concurrency: usize,
) -> Result<()> {
    std::fs::create_dir_all(&options.output_dir)?;
    let output_dir = options.output_dir.clone();
    let total = inputs.len();

    let reports = clean_batch(inputs, thresholds, config, options, concurrency).await?;

    let mut failed = 0;
    let mut sites_written = 0;

    for report in reports {
        match report.result {
            Ok(outcomes) => {
                sites_written += outcomes.len();
                for o in outcomes {
                    info!(
                        file = %report.path.display(),
                        site = %o.site_id,
                        rows = o.rows,
                        valid = o.valid,
                        cleaned = %o.cleaned_path.display(),
                        "Site written"
                    );
                }
            }
            Err(_) => failed += 1,
        }
    }

    info!(
        files = total,
        failed,
        sites = sites_written,
        output_dir = %output_dir.display(),
        "Finished cleaning"
    );

    if failed > 0 {
        warn!(failed, "Some files could not be cleaned");
        bail!("{failed} of {total} files failed");
    }
    Ok(())
}
