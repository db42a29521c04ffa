use atc_processor::cleaning::{CleaningEngine, Status};
use atc_processor::config::{CleaningConfig, ColumnConfig};
use atc_processor::pipeline::{
    OutputOptions, check_unique_sources, clean_batch, discover_inputs, process_site_file,
};
use atc_processor::sites::SiteMetadata;
use atc_processor::table::Table;
use atc_processor::thresholds::ThresholdTable;
use atc_processor::{AtcError, ErrorKind};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(name);
    let _ = fs::remove_dir_all(&dir); // clean up any prior run
    dir
}

fn thresholds() -> ThresholdTable {
    let sites = SiteMetadata::load(&fixture("site_list.csv")).expect("Failed to load site list");
    ThresholdTable::load(&fixture("thresholds.csv"), &sites).expect("Failed to load thresholds")
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

#[test]
fn test_full_pipeline_matches_known_clean_output() {
    let thresholds = thresholds();
    let engine = CleaningEngine::new(config(), Some(&thresholds)).unwrap();
    let out = temp_dir("atc_processor_it_full");
    let options = OutputOptions {
        output_dir: out.clone(),
        gzip: false,
    };

    let outcomes = process_site_file(&fixture("sites/Site 1.csv"), &engine, &options).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].site_id, "1");
    assert_eq!(outcomes[0].rows, 12);
    assert_eq!(outcomes[0].valid, 6);

    let cleaned = fs::read_to_string(&outcomes[0].cleaned_path).unwrap();
    let expected = fs::read_to_string(fixture("expected/Site 1 cleaned.csv")).unwrap();
    assert_eq!(
        cleaned.lines().collect::<Vec<_>>(),
        expected.lines().collect::<Vec<_>>()
    );

    let summary = fs::read_to_string(&outcomes[0].summary_path).unwrap();
    let lines: Vec<_> = summary.lines().collect();
    assert_eq!(lines[0], "Site,Year,Month,Valid,Not Valid,Valid%");
    assert!(lines.contains(&"1,2024,January,6,6,0.5"));
    assert!(lines.contains(&"1,All,All,6,6,0.5"));

    let chart = fs::read_to_string(&outcomes[0].chart_path).unwrap();
    assert_eq!(chart.lines().count(), 13);

    fs::remove_dir_all(&out).unwrap();
}

#[test]
fn test_cleaning_twice_is_byte_identical() {
    let thresholds = thresholds();
    let engine = CleaningEngine::new(config(), Some(&thresholds)).unwrap();

    let first_dir = temp_dir("atc_processor_it_idem_a");
    let second_dir = temp_dir("atc_processor_it_idem_b");

    let first = process_site_file(
        &fixture("sites/Site 1.csv"),
        &engine,
        &OutputOptions {
            output_dir: first_dir.clone(),
            gzip: false,
        },
    )
    .unwrap();
    let second = process_site_file(
        &fixture("sites/Site 1.csv"),
        &engine,
        &OutputOptions {
            output_dir: second_dir.clone(),
            gzip: false,
        },
    )
    .unwrap();

    for (a, b) in first.iter().zip(&second) {
        assert_eq!(fs::read(&a.cleaned_path).unwrap(), fs::read(&b.cleaned_path).unwrap());
        assert_eq!(fs::read(&a.summary_path).unwrap(), fs::read(&b.summary_path).unwrap());
    }

    fs::remove_dir_all(&first_dir).unwrap();
    fs::remove_dir_all(&second_dir).unwrap();
}

#[test]
fn test_aggregation_preserves_raw_total() {
    let thresholds = thresholds();
    let engine = CleaningEngine::new(config(), Some(&thresholds)).unwrap();
    let table = Table::read(&fixture("sites/Site 1.csv")).unwrap();

    let count_idx = table.column_index("Count").unwrap();
    let raw_total: f64 = table
        .rows()
        .map(|(_, r)| r[count_idx].parse::<f64>().unwrap())
        .sum();

    let datasets = engine.clean_data(&table).unwrap();
    let cleaned_total: f64 = datasets.iter().map(|d| d.total_count()).sum();
    assert_eq!(raw_total, cleaned_total);
}

#[test]
fn test_missing_day_rows_are_never_valid() {
    let thresholds = thresholds();
    let engine = CleaningEngine::new(config(), Some(&thresholds)).unwrap();
    let table = Table::read(&fixture("sites/Site 1.csv")).unwrap();

    let datasets = engine.clean_data(&table).unwrap();
    let missing: Vec<_> = datasets[0].rows.iter().filter(|r| r.missing_day).collect();
    assert_eq!(missing.len(), 4);
    for row in missing {
        assert!(!row.valid);
        assert_eq!(row.status, Status::FullDayMissing);
    }
}

#[test]
fn test_coverage_gap_fails_at_construction() {
    let sites = SiteMetadata::load(&fixture("site_list.csv")).unwrap();
    let err = ThresholdTable::load(&fixture("thresholds_missing.csv"), &sites).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Coverage);
    match err {
        AtcError::Coverage { missing, .. } => {
            assert_eq!(
                missing,
                vec![
                    vec!["North".to_string(), "Rural".to_string()],
                    vec!["South".to_string(), "Rural".to_string()],
                ]
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_columns_fail_the_file() {
    let thresholds = thresholds();
    let engine = CleaningEngine::new(config(), Some(&thresholds)).unwrap();
    let out = temp_dir("atc_processor_it_bad_columns");

    let err = process_site_file(
        &fixture("sites/Site 2 bad columns.csv"),
        &engine,
        &OutputOptions {
            output_dir: out.clone(),
            gzip: false,
        },
    )
    .unwrap_err();

    match err {
        AtcError::MissingColumns { columns, .. } => {
            assert_eq!(columns, vec!["Count", "Hour"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!out.exists());
}

#[test]
fn test_missing_input_file_is_not_found() {
    let thresholds = thresholds();
    let engine = CleaningEngine::new(config(), Some(&thresholds)).unwrap();

    let err = process_site_file(
        &fixture("sites/NOT A FILE.csv"),
        &engine,
        &OutputOptions {
            output_dir: env::temp_dir(),
            gzip: false,
        },
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_discover_inputs_lists_csv_files_in_order() {
    let files = discover_inputs(&fixture("sites")).unwrap();
    let names: Vec<_> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["Site 1.csv", "Site 2 bad columns.csv"]);
}

#[test]
fn test_gzip_artifacts() {
    let thresholds = thresholds();
    let engine = CleaningEngine::new(config(), Some(&thresholds)).unwrap();
    let out = temp_dir("atc_processor_it_gzip");

    let outcomes = process_site_file(
        &fixture("sites/Site 1.csv"),
        &engine,
        &OutputOptions {
            output_dir: out.clone(),
            gzip: true,
        },
    )
    .unwrap();

    let bytes = fs::read(&outcomes[0].cleaned_path).unwrap();
    // gzip magic number
    assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

    fs::remove_dir_all(&out).unwrap();
}

#[test]
fn test_same_site_in_two_files_keeps_both_outputs() {
    let thresholds = thresholds();
    let engine = CleaningEngine::new(config(), Some(&thresholds)).unwrap();
    let input = temp_dir("atc_processor_it_history_in");
    let out = temp_dir("atc_processor_it_history_out");
    fs::create_dir_all(&input).unwrap();

    let first = input.join("Site 1 2024.csv");
    let second = input.join("Site 1 2025.csv");
    fs::write(&first, "Site,Date,Hour,Direction,Count\n1,2024-01-01,7,N,20\n").unwrap();
    fs::write(&second, "Site,Date,Hour,Direction,Count\n1,2025-01-01,7,N,30\n").unwrap();
    check_unique_sources(&[first.clone(), second.clone()]).unwrap();

    let options = OutputOptions {
        output_dir: out.clone(),
        gzip: false,
    };
    let a = process_site_file(&first, &engine, &options).unwrap();
    let b = process_site_file(&second, &engine, &options).unwrap();
    assert_ne!(a[0].cleaned_path, b[0].cleaned_path);

    let older = fs::read_to_string(&a[0].cleaned_path).unwrap();
    let newer = fs::read_to_string(&b[0].cleaned_path).unwrap();
    assert!(older.contains("1,2024-01-01 07:00:00"));
    assert!(newer.contains("1,2025-01-01 07:00:00"));

    fs::remove_dir_all(&input).unwrap();
    fs::remove_dir_all(&out).unwrap();
}

#[test]
fn test_path_like_site_id_fails_before_writing() {
    let thresholds = thresholds();
    let engine = CleaningEngine::new(config(), Some(&thresholds)).unwrap();
    let input = temp_dir("atc_processor_it_escape_in");
    let out = temp_dir("atc_processor_it_escape_out");
    fs::create_dir_all(&input).unwrap();

    let path = input.join("Mixed.csv");
    fs::write(
        &path,
        "Site,Date,Hour,Direction,Count\n1,2024-01-01,7,N,20\n../x,2024-01-01,7,N,20\n",
    )
    .unwrap();

    let err = process_site_file(
        &path,
        &engine,
        &OutputOptions {
            output_dir: out.clone(),
            gzip: false,
        },
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Schema);
    assert!(!out.exists());
    assert!(!input.parent().unwrap().join("x.csv").exists());

    fs::remove_dir_all(&input).unwrap();
}

#[tokio::test]
async fn test_batch_reports_each_file_in_input_order() {
    let thresholds = Arc::new(thresholds());
    let out = temp_dir("atc_processor_it_batch");
    let inputs = vec![
        fixture("sites/Site 1.csv"),
        fixture("sites/Site 2 bad columns.csv"),
    ];

    let reports = clean_batch(
        inputs.clone(),
        thresholds,
        config(),
        OutputOptions {
            output_dir: out.clone(),
            gzip: false,
        },
        2,
    )
    .await
    .unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].path, inputs[0]);
    assert_eq!(reports[0].result.as_ref().unwrap()[0].valid, 6);
    assert_eq!(reports[1].path, inputs[1]);
    assert_eq!(
        reports[1].result.as_ref().unwrap_err().kind(),
        ErrorKind::Schema
    );

    fs::remove_dir_all(&out).unwrap();
}

#[tokio::test]
async fn test_batch_with_clashing_file_stems_runs_nothing() {
    let out = temp_dir("atc_processor_it_batch_clash");
    let err = clean_batch(
        vec![
            PathBuf::from("a/Site 1.csv"),
            PathBuf::from("b/Site 1.csv"),
        ],
        Arc::new(thresholds()),
        config(),
        OutputOptions {
            output_dir: out.clone(),
            gzip: false,
        },
        2,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!out.exists());
}
