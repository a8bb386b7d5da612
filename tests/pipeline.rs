mod common;

use common::{COUNTRIES, FIRST_YEAR, GAP, LAST_YEAR, observation_count, write_dataset};
use growthcast::config::{ConfigError, PipelineConfig};
use growthcast::data::load_dataset;
use growthcast::estimate::{TrainingError, compare_splits, run_training};
use growthcast::features::{FeatureMode, drop_incomplete, engineer};
use growthcast::forest::ForestConfig;
use growthcast::model::TrainedModel;
use growthcast::service::{ScoreError, ServingState, StartupError};
use growthcast::split::{SplitError, split};
use growthcast::validate::ValidationError;
use serde_json::{Value, json};
use std::path::Path;
use tempfile::tempdir;

fn pipeline_config(dir: &Path, mode: FeatureMode) -> PipelineConfig {
    PipelineConfig {
        dataset_path: write_dataset(dir),
        model_path: dir.join("model.toml"),
        encoder_path: dir.join("encoder.toml"),
        feature_mode: mode,
        forest: ForestConfig {
            n_trees: 20,
            ..ForestConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn germany_request() -> Value {
    json!({
        "Country": "Germany",
        "Population": 0.3,
        "Exports": 12.5,
        "Imports": 8.7,
        "Investment": 6.2,
        "Consumption": 4.8,
        "Govt_Spend": 3.1
    })
}

fn trained_state(dir: &Path) -> ServingState {
    let config = pipeline_config(dir, FeatureMode::Lagged);
    run_training(&config).expect("Training should succeed");
    ServingState::load(config).expect("Artifacts should load")
}

#[test]
fn training_reports_counts_and_persists_artifacts() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let config = pipeline_config(tmp.path(), FeatureMode::Lagged);

    let outcome = run_training(&config).expect("Training should succeed");

    let years = (LAST_YEAR - FIRST_YEAR + 1) as usize;
    assert_eq!(outcome.dataset_rows, observation_count());
    assert_eq!(outcome.entity_count, COUNTRIES.len());
    assert_eq!(outcome.time_range, Some((FIRST_YEAR, LAST_YEAR)));
    assert_eq!(outcome.engineered_rows, COUNTRIES.len() * (years - 1));
    assert_eq!(outcome.dropped_rows, 1);
    assert_eq!(outcome.test_rows, COUNTRIES.len() * 4);
    assert_eq!(
        outcome.train_rows + outcome.test_rows,
        outcome.engineered_rows - outcome.dropped_rows
    );
    assert!(outcome.train_metrics.r2 > 0.5, "train R2 was {}", outcome.train_metrics.r2);
    assert!(outcome.test_metrics.rmse.is_finite());
    assert_eq!(outcome.importances.len(), 7);

    let example = outcome.example.expect("Temporal test set is not empty");
    assert!(example.time >= 2019);
    assert!(example.predicted.is_finite());

    assert!(config.model_path.exists());
    assert!(config.encoder_path.exists());

    let model = TrainedModel::load(&config.model_path).expect("Model artifact should reload");
    assert_eq!(model.feature_names, config.feature_names());
    assert_eq!(model.entity_count, COUNTRIES.len());
    let evaluation = model.evaluation.expect("Evaluation is stored with the model");
    assert_eq!(evaluation.dropped_rows, 1);
    assert_eq!(evaluation.test.n, outcome.test_rows);
}

#[test]
fn scenario_a_known_entity_scores_a_finite_growth() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let state = trained_state(tmp.path());

    let response = state.score(&germany_request()).expect("Request should score");
    assert_eq!(response.entity, "Germany");
    assert!(response.raw.is_finite());
    assert!((response.growth - response.raw).abs() <= 0.005 + 1e-12);
    assert!(response.note.contains("lagged"));
}

#[test]
fn scenario_b_missing_field_is_reported_before_prediction() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let state = trained_state(tmp.path());

    let mut request = germany_request();
    request
        .as_object_mut()
        .expect("Request is an object")
        .remove("Consumption");
    // An out-of-range value elsewhere must not mask the missing field.
    request["Population"] = json!(500.0);

    match state.score(&request) {
        Err(ScoreError::Invalid(ValidationError::MissingFields { names })) => {
            assert_eq!(names, vec!["Consumption".to_string()]);
        }
        other => panic!("Expected MissingFields, got {other:?}"),
    }
}

#[test]
fn scenario_c_unknown_entity_lists_alternatives() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let state = trained_state(tmp.path());

    let mut request = germany_request();
    request["Country"] = json!("Atlantis");

    match state.score(&request) {
        Err(ScoreError::Invalid(ValidationError::UnknownEntity { name, available })) => {
            assert_eq!(name, "Atlantis");
            assert_eq!(available, COUNTRIES.map(String::from).to_vec());
        }
        other => panic!("Expected UnknownEntity, got {other:?}"),
    }
}

#[test]
fn scenario_d_out_of_range_value_is_rejected() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let state = trained_state(tmp.path());

    let mut request = germany_request();
    request["Population"] = json!(500);

    match state.score(&request) {
        Err(ScoreError::Invalid(ValidationError::RangeError {
            field,
            value,
            range,
        })) => {
            assert_eq!(field, "Population");
            assert_eq!(value, 500.0);
            assert_eq!((range.min, range.max), (-100.0, 100.0));
        }
        other => panic!("Expected RangeError, got {other:?}"),
    }

    request["Population"] = json!(100.0);
    assert!(state.score(&request).is_ok());
    request["Population"] = json!(-100.0001);
    assert!(matches!(
        state.score(&request),
        Err(ScoreError::Invalid(ValidationError::RangeError { .. }))
    ));
}

#[test]
fn reloaded_artifacts_score_identically() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let config = pipeline_config(tmp.path(), FeatureMode::Lagged);
    run_training(&config).expect("Training should succeed");

    let first = ServingState::load(config.clone()).expect("Artifacts should load");
    let second = ServingState::load(config).expect("Artifacts should load");
    let a = first.score(&germany_request()).expect("Request should score");
    let b = first.score(&germany_request()).expect("Request should score");
    let c = second.score(&germany_request()).expect("Request should score");
    assert_eq!(a.raw, b.raw);
    assert_eq!(a.raw, c.raw);
}

#[test]
fn serving_state_exposes_dataset_operations() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let state = trained_state(tmp.path());

    assert_eq!(state.list_entities(), COUNTRIES.map(String::from).to_vec());

    let status = state.status();
    assert_eq!(status.dataset_rows, observation_count());
    assert_eq!(status.entity_count, COUNTRIES.len());
    assert_eq!(status.feature_names.len(), 7);
    assert!(status.model_loaded && status.encoder_loaded && status.data_loaded);

    let (gap_country, gap_year) = GAP;
    let history = state.history(gap_country).expect("France has history");
    assert_eq!(history.records.len(), (LAST_YEAR - FIRST_YEAR + 1) as usize);
    assert!(history.records.windows(2).all(|w| w[0].time < w[1].time));
    let imports = history
        .fields
        .iter()
        .position(|f| f == "Imports")
        .expect("Imports is a request field");
    let gap = history
        .records
        .iter()
        .find(|r| r.time == gap_year)
        .expect("Gap year is present");
    assert_eq!(gap.indicators[imports], None);
    assert!(gap.target.is_some());

    assert!(state.history("Atlantis").is_err());

    let baseline = state.baseline();
    assert_eq!(baseline.values.len(), 6);
    assert!(baseline.values.iter().all(|v| v.value == 2.0));
    let scored = state.baseline_for("Japan").expect("Baseline scores for a known country");
    assert!(scored.raw.is_finite());
}

#[test]
fn temporal_split_separates_past_from_future() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let config = pipeline_config(tmp.path(), FeatureMode::Lagged);
    let dataset = load_dataset(&config.dataset_path, &config.dataset_schema())
        .expect("Dataset should load");
    let (table, dropped) = drop_incomplete(engineer(&dataset, FeatureMode::Lagged));
    assert_eq!(dropped, 1);
    assert!(
        !table
            .entities
            .iter()
            .zip(&table.times)
            .any(|(e, &t)| e == GAP.0 && t == GAP.1 + 1)
    );
    assert!(!table.times.contains(&FIRST_YEAR));

    let parts = split(&table, &config.split.strategy()).expect("Both sides are populated");
    assert_eq!(parts.train.len() + parts.test.len(), table.len());
    assert!(parts.train.times.iter().all(|&t| t < 2019));
    assert!(parts.test.times.iter().all(|&t| t >= 2019));
}

#[test]
fn concurrent_mode_trains_and_serves_with_its_own_feature_names() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let config = pipeline_config(tmp.path(), FeatureMode::Concurrent);

    let outcome = run_training(&config).expect("Training should succeed");
    assert_eq!(outcome.engineered_rows, observation_count());
    assert_eq!(outcome.dropped_rows, 1);
    assert_eq!(outcome.test_rows, COUNTRIES.len() * 4);

    let state = ServingState::load(config.clone()).expect("Artifacts should load");
    assert!(state.model().feature_names.iter().all(|n| !n.ends_with("_lag1")));
    let response = state.score(&germany_request()).expect("Request should score");
    assert!(response.note.contains("same-period"));

    let mismatched = PipelineConfig {
        feature_mode: FeatureMode::Lagged,
        ..config
    };
    assert!(matches!(
        ServingState::load(mismatched),
        Err(StartupError::Mismatch(_))
    ));
}

#[test]
fn split_comparison_evaluates_both_strategies() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let config = pipeline_config(tmp.path(), FeatureMode::Lagged);

    let comparison = compare_splits(&config).expect("Comparison should succeed");
    let usable = COUNTRIES.len() * (LAST_YEAR - FIRST_YEAR) as usize - 1;
    assert_eq!(comparison.random.train_rows + comparison.random.test_rows, usable);
    assert_eq!(comparison.random.test_rows, (usable as f64 * 0.2).ceil() as usize);
    assert_eq!(comparison.temporal.test_rows, COUNTRIES.len() * 4);

    let report = comparison.report();
    assert!(report.contains("Random split vs temporal split"));
    assert!(report.contains(&comparison.temporal.description));

    assert!(!config.model_path.exists());
    assert!(!config.encoder_path.exists());
}

#[test]
fn threshold_past_the_data_leaves_no_test_rows() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let mut config = pipeline_config(tmp.path(), FeatureMode::Lagged);
    config.split.threshold_year = LAST_YEAR + 5;

    match run_training(&config) {
        Err(TrainingError::Split(SplitError::InsufficientData {
            train_rows,
            test_rows,
        })) => {
            assert_eq!(test_rows, 0);
            assert!(train_rows > 0);
        }
        other => panic!("Expected InsufficientData, got {other:?}"),
    }
    assert!(!config.model_path.exists());
}

#[test]
fn serving_without_artifacts_is_a_startup_error() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let config = pipeline_config(tmp.path(), FeatureMode::Lagged);

    let err = match ServingState::load(config) {
        Err(e) => e,
        Ok(_) => panic!("Serving must not start without a model"),
    };
    assert!(matches!(err, StartupError::Model(_)));
    assert!(err.to_string().starts_with("Data unavailable"));
}

#[test]
fn serving_rejects_an_invalid_configuration_before_loading() {
    let tmp = tempdir().expect("Failed to create temp dir");
    let mut config = pipeline_config(tmp.path(), FeatureMode::Lagged);
    config.validation.min = 50.0;
    config.validation.max = -50.0;

    assert!(matches!(
        ServingState::load(config),
        Err(StartupError::Config(ConfigError::Invalid(_)))
    ));
}
