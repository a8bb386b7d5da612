//! # Model Training and Evaluation
//!
//! This module orchestrates the offline training run:
//!
//! 1. Load the dataset and engineer the supervised table for the configured
//!    feature mode, dropping rows with missing values.
//! 2. Fit the entity encoder on the full dataset's entity set, so entities
//!    that only appear in the held-out split still have a code.
//! 3. Split, fit the forest on the training rows, and evaluate on both subsets.
//! 4. Persist the model and the encoder as two independent artifacts.
//!
//! Artifacts are written only after every previous step succeeded, and each
//! write is atomic, so a failed run never leaves a partial model to serve.

use crate::config::{ConfigError, PipelineConfig, SplitKind};
use crate::data::{DataError, Dataset, load_dataset};
use crate::encoder::{EncoderError, EntityEncoder};
use crate::features::{ENTITY_FEATURE_INDEX, EngineeredTable, drop_incomplete, engineer};
use crate::forest::{ForestError, RegressionForest};
use crate::model::{EvaluationSummary, ModelError, TrainedModel};
use crate::split::{Split, SplitError, split};
use itertools::Itertools;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A comprehensive error type for the training process.
#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Forest(#[from] ForestError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(
        "Feature engineering left no usable rows ({dropped} rows were dropped for missing values)."
    )]
    NoUsableRows { dropped: usize },
    #[error("Cannot evaluate a model on an empty table.")]
    EmptyEvaluationSet,
    #[error("The model expects {expected} inputs but the design matrix has {found} columns.")]
    FeatureCountMismatch { expected: usize, found: usize },
}

/// Goodness-of-fit of a model on one table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    /// Coefficient of determination. Negative when the model is worse than
    /// predicting the mean.
    pub r2: f64,
    pub rmse: f64,
    pub mae: f64,
    /// Mean absolute percentage error, in percent.
    pub mape: f64,
    pub n: usize,
}

impl RegressionMetrics {
    /// Computes the metrics of `predicted` against `actual`. Both must have the
    /// same non-zero length.
    pub fn compute(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Self {
        let n = actual.len();
        let nf = n as f64;
        let mean = actual.sum() / nf;

        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        let mut abs_sum = 0.0;
        let mut pct_sum = 0.0;
        for (&y, &p) in actual.iter().zip(predicted.iter()) {
            let residual = y - p;
            ss_res += residual * residual;
            ss_tot += (y - mean) * (y - mean);
            abs_sum += residual.abs();
            pct_sum += residual.abs() / y.abs().max(f64::EPSILON);
        }

        let r2 = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };

        Self {
            r2,
            rmse: (ss_res / nf).sqrt(),
            mae: abs_sum / nf,
            mape: pct_sum / nf * 100.0,
            n,
        }
    }
}

/// Classification of the train/test R² gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverfittingStatus {
    GoodGeneralization,
    SlightOverfitting,
    SignificantOverfitting,
}

impl OverfittingStatus {
    pub fn from_r2(train_r2: f64, test_r2: f64) -> Self {
        let gap = train_r2 - test_r2;
        if gap < 0.1 {
            OverfittingStatus::GoodGeneralization
        } else if gap < 0.2 {
            OverfittingStatus::SlightOverfitting
        } else {
            OverfittingStatus::SignificantOverfitting
        }
    }
}

impl fmt::Display for OverfittingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OverfittingStatus::GoodGeneralization => "good generalization",
            OverfittingStatus::SlightOverfitting => "slight overfitting",
            OverfittingStatus::SignificantOverfitting => "significant overfitting",
        };
        f.write_str(text)
    }
}

/// Fits a model on the training table.
pub fn train(
    table: &EngineeredTable,
    encoder: &EntityEncoder,
    config: &PipelineConfig,
) -> Result<TrainedModel, TrainingError> {
    let feature_names = config.feature_names();
    let x = table.design_matrix(encoder)?;
    if x.ncols() != feature_names.len() {
        return Err(TrainingError::FeatureCountMismatch {
            expected: feature_names.len(),
            found: x.ncols(),
        });
    }

    let forest = RegressionForest::fit(x.view(), table.labels.view(), &config.forest)?;
    Ok(TrainedModel {
        feature_names,
        entity_feature_index: ENTITY_FEATURE_INDEX,
        feature_mode: config.feature_mode,
        entity_count: encoder.len(),
        evaluation: None,
        forest,
    })
}

/// Scores `table` with `model` and compares against its labels.
pub fn evaluate(
    model: &TrainedModel,
    table: &EngineeredTable,
    encoder: &EntityEncoder,
) -> Result<RegressionMetrics, TrainingError> {
    if table.is_empty() {
        return Err(TrainingError::EmptyEvaluationSet);
    }
    let x = table.design_matrix(encoder)?;
    let predicted = model.predict(x.view())?;
    Ok(RegressionMetrics::compute(
        table.labels.view(),
        predicted.view(),
    ))
}

/// The first held-out row scored by the freshly trained model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExamplePrediction {
    pub entity: String,
    pub time: i64,
    pub predicted: f64,
    pub actual: f64,
    pub abs_error: f64,
}

/// Everything a training run reports.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub dataset_rows: usize,
    pub entity_count: usize,
    pub time_range: Option<(i64, i64)>,
    pub engineered_rows: usize,
    pub dropped_rows: usize,
    pub split_description: String,
    pub train_rows: usize,
    pub test_rows: usize,
    pub train_metrics: RegressionMetrics,
    pub test_metrics: RegressionMetrics,
    pub overfitting: OverfittingStatus,
    pub importances: Vec<(String, f64)>,
    pub example: Option<ExamplePrediction>,
    pub model_path: PathBuf,
    pub encoder_path: PathBuf,
}

/// Metrics of one split strategy inside a comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitEvaluation {
    pub description: String,
    pub train_rows: usize,
    pub test_rows: usize,
    pub train: RegressionMetrics,
    pub test: RegressionMetrics,
    pub overfitting: OverfittingStatus,
}

/// Random versus temporal evaluation of the same pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitComparison {
    pub random: SplitEvaluation,
    pub temporal: SplitEvaluation,
}

/// The engineered, cleaned table and the encoder fitted on the dataset.
struct Prepared {
    dataset: Dataset,
    table: EngineeredTable,
    /// Rows produced by feature engineering, before incomplete rows are dropped.
    engineered_rows: usize,
    dropped: usize,
    encoder: EntityEncoder,
}

fn prepare(config: &PipelineConfig) -> Result<Prepared, TrainingError> {
    config.validate()?;
    let dataset = load_dataset(&config.dataset_path, &config.dataset_schema())?;

    let engineered = engineer(&dataset, config.feature_mode);
    let engineered_rows = engineered.len();
    let (table, dropped) = drop_incomplete(engineered);
    if table.is_empty() {
        return Err(TrainingError::NoUsableRows { dropped });
    }

    let encoder = EntityEncoder::fit(dataset.entities().iter().map(String::as_str));
    Ok(Prepared {
        dataset,
        table,
        engineered_rows,
        dropped,
        encoder,
    })
}

struct FittedSplit {
    split: Split,
    model: TrainedModel,
    train: RegressionMetrics,
    test: RegressionMetrics,
}

fn fit_split(
    prepared: &Prepared,
    config: &PipelineConfig,
    kind: SplitKind,
) -> Result<FittedSplit, TrainingError> {
    let strategy = config.split.strategy_for(kind);
    let split = split(&prepared.table, &strategy)?;
    let model = train(&split.train, &prepared.encoder, config)?;
    let train_metrics = evaluate(&model, &split.train, &prepared.encoder)?;
    let test_metrics = evaluate(&model, &split.test, &prepared.encoder)?;

    log::info!(
        "{}: train R2={:.4} RMSE={:.4}, test R2={:.4} RMSE={:.4}",
        strategy.describe(),
        train_metrics.r2,
        train_metrics.rmse,
        test_metrics.r2,
        test_metrics.rmse
    );
    if test_metrics.r2 < 0.0 {
        log::warn!(
            "Held-out R2 is negative ({:.4}): the model predicts worse than the held-out mean.",
            test_metrics.r2
        );
    }

    Ok(FittedSplit {
        split,
        model,
        train: train_metrics,
        test: test_metrics,
    })
}

/// Runs the full training pipeline and persists the model and encoder.
pub fn run_training(config: &PipelineConfig) -> Result<TrainingOutcome, TrainingError> {
    let prepared = prepare(config)?;
    let fitted = fit_split(&prepared, config, config.split.kind)?;
    let FittedSplit {
        split,
        mut model,
        train: train_metrics,
        test: test_metrics,
    } = fitted;

    let split_description = config.split.strategy().describe();
    model.evaluation = Some(EvaluationSummary {
        split: split_description.clone(),
        dropped_rows: prepared.dropped,
        train: train_metrics,
        test: test_metrics,
    });

    let example = example_prediction(&model, &split.test, &prepared.encoder)?;

    model.save(&config.model_path)?;
    prepared.encoder.save(&config.encoder_path)?;

    Ok(TrainingOutcome {
        dataset_rows: prepared.dataset.len(),
        entity_count: prepared.dataset.entity_count(),
        time_range: prepared.dataset.time_range(),
        engineered_rows: prepared.engineered_rows,
        dropped_rows: prepared.dropped,
        split_description,
        train_rows: split.train.len(),
        test_rows: split.test.len(),
        train_metrics,
        test_metrics,
        overfitting: OverfittingStatus::from_r2(train_metrics.r2, test_metrics.r2),
        importances: model.ranked_importances(),
        example,
        model_path: config.model_path.clone(),
        encoder_path: config.encoder_path.clone(),
    })
}

fn example_prediction(
    model: &TrainedModel,
    test: &EngineeredTable,
    encoder: &EntityEncoder,
) -> Result<Option<ExamplePrediction>, TrainingError> {
    if test.is_empty() {
        return Ok(None);
    }
    let first = test.select(&[0]);
    let x = first.design_matrix(encoder)?;
    let predicted = model.predict_row(x.row(0))?;
    let actual = first.labels[0];
    Ok(Some(ExamplePrediction {
        entity: first.entities[0].clone(),
        time: first.times[0],
        predicted,
        actual,
        abs_error: (predicted - actual).abs(),
    }))
}

/// Evaluates the pipeline under the random and the temporal split. Nothing is
/// persisted.
pub fn compare_splits(config: &PipelineConfig) -> Result<SplitComparison, TrainingError> {
    let prepared = prepare(config)?;
    let evaluation = |kind: SplitKind| -> Result<SplitEvaluation, TrainingError> {
        let fitted = fit_split(&prepared, config, kind)?;
        Ok(SplitEvaluation {
            description: config.split.strategy_for(kind).describe(),
            train_rows: fitted.split.train.len(),
            test_rows: fitted.split.test.len(),
            train: fitted.train,
            test: fitted.test,
            overfitting: OverfittingStatus::from_r2(fitted.train.r2, fitted.test.r2),
        })
    };
    Ok(SplitComparison {
        random: evaluation(SplitKind::Random)?,
        temporal: evaluation(SplitKind::Temporal)?,
    })
}

impl SplitComparison {
    /// Plain-text side-by-side report.
    pub fn report(&self) -> String {
        let rows: Vec<(&str, String, String)> = vec![
            ("Split", self.random.description.clone(), self.temporal.description.clone()),
            (
                "Train rows",
                self.random.train_rows.to_string(),
                self.temporal.train_rows.to_string(),
            ),
            (
                "Test rows",
                self.random.test_rows.to_string(),
                self.temporal.test_rows.to_string(),
            ),
            ("Train R2", fmt4(self.random.train.r2), fmt4(self.temporal.train.r2)),
            ("Test R2", fmt4(self.random.test.r2), fmt4(self.temporal.test.r2)),
            ("Train RMSE", fmt4(self.random.train.rmse), fmt4(self.temporal.train.rmse)),
            ("Test RMSE", fmt4(self.random.test.rmse), fmt4(self.temporal.test.rmse)),
            ("Train MAE", fmt4(self.random.train.mae), fmt4(self.temporal.train.mae)),
            ("Test MAE", fmt4(self.random.test.mae), fmt4(self.temporal.test.mae)),
            ("Train MAPE", pct(self.random.train.mape), pct(self.temporal.train.mape)),
            ("Test MAPE", pct(self.random.test.mape), pct(self.temporal.test.mape)),
            (
                "Verdict",
                self.random.overfitting.to_string(),
                self.temporal.overfitting.to_string(),
            ),
        ];

        let first = rows.iter().map(|r| r.0.len()).max().unwrap_or(0);
        let second = rows
            .iter()
            .map(|r| r.1.len())
            .chain(std::iter::once("Random".len()))
            .max()
            .unwrap_or(0);

        let header = format!("{:<first$}  {:<second$}  Temporal", "Metric", "Random");
        let body = rows
            .iter()
            .map(|(name, random, temporal)| format!("{name:<first$}  {random:<second$}  {temporal}"))
            .join("\n");

        let rule = "=".repeat(header.len());
        format!(
            "Random split vs temporal split\n{rule}\n{header}\n{}\n{body}\n",
            "-".repeat(header.len())
        )
    }
}

fn fmt4(v: f64) -> String {
    format!("{v:.4}")
}

fn pct(v: f64) -> String {
    format!("{v:.2}%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnConfig, IndicatorColumn};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::fs;
    use tempfile::tempdir;

    fn single_indicator_config(dataset_path: PathBuf) -> PipelineConfig {
        PipelineConfig {
            dataset_path,
            columns: ColumnConfig {
                entity: "Country".to_string(),
                time: "Year".to_string(),
                target: "GDP".to_string(),
                entity_field: "Country".to_string(),
                indicators: vec![IndicatorColumn {
                    column: "Exports".to_string(),
                    field: "Exports".to_string(),
                }],
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn prepare_counts_engineered_rows_before_dropping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gdp.csv");
        fs::write(
            &path,
            "Country,Year,GDP,Exports\n\
             A,2015,1.0,2.0\n\
             A,2016,1.5,\n\
             A,2017,2.0,3.0\n\
             A,2018,2.5,3.5\n\
             B,2015,0.5,1.0\n\
             B,2016,0.7,1.2\n\
             B,2017,0.9,1.4\n\
             B,2018,1.1,1.6\n",
        )
        .unwrap();

        let prepared = prepare(&single_indicator_config(path)).unwrap();
        // Three lagged rows per country; A 2017 lags the missing 2016 cell.
        assert_eq!(prepared.engineered_rows, 6);
        assert_eq!(prepared.dropped, 1);
        assert_eq!(prepared.table.len(), 5);
        assert_eq!(prepared.encoder.classes(), &["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn metrics_match_hand_computed_values() {
        let actual = array![1.0, 2.0, 3.0, 4.0];
        let predicted = array![1.5, 2.0, 2.0, 4.0];
        let m = RegressionMetrics::compute(actual.view(), predicted.view());

        // Residuals: -0.5, 0, 1, 0. SSres = 1.25, SStot = 5.
        assert_abs_diff_eq!(m.r2, 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(m.rmse, (1.25f64 / 4.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(m.mae, 1.5 / 4.0, epsilon = 1e-12);
        // |r|/|y|: 0.5, 0, 1/3, 0.
        assert_abs_diff_eq!(m.mape, (0.5 + 1.0 / 3.0) / 4.0 * 100.0, epsilon = 1e-9);
        assert_eq!(m.n, 4);
    }

    #[test]
    fn perfect_fit_has_unit_r2() {
        let y = array![-3.0, 0.5, 7.0];
        let m = RegressionMetrics::compute(y.view(), y.view());
        assert_abs_diff_eq!(m.r2, 1.0);
        assert_abs_diff_eq!(m.rmse, 0.0);
        assert_abs_diff_eq!(m.mae, 0.0);
    }

    #[test]
    fn anti_correlated_predictor_has_negative_r2() {
        let actual = array![1.0, 2.0, 3.0];
        let predicted = array![3.0, 2.0, 1.0];
        let m = RegressionMetrics::compute(actual.view(), predicted.view());
        assert!(m.r2 < 0.0);
        assert_abs_diff_eq!(m.r2, -3.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_labels_r2_convention() {
        let actual = array![2.0, 2.0];
        assert_eq!(
            RegressionMetrics::compute(actual.view(), array![2.0, 2.0].view()).r2,
            1.0
        );
        assert_eq!(
            RegressionMetrics::compute(actual.view(), array![2.0, 3.0].view()).r2,
            0.0
        );
    }

    #[test]
    fn zero_labels_do_not_blow_up_mape() {
        let m = RegressionMetrics::compute(array![0.0, 1.0].view(), array![0.0, 1.0].view());
        assert_eq!(m.mape, 0.0);
    }

    #[test]
    fn overfitting_thresholds() {
        assert_eq!(
            OverfittingStatus::from_r2(0.90, 0.85),
            OverfittingStatus::GoodGeneralization
        );
        assert_eq!(
            OverfittingStatus::from_r2(0.90, 0.75),
            OverfittingStatus::SlightOverfitting
        );
        assert_eq!(
            OverfittingStatus::from_r2(0.95, 0.40),
            OverfittingStatus::SignificantOverfitting
        );
        assert_eq!(
            OverfittingStatus::from_r2(0.5, 0.7),
            OverfittingStatus::GoodGeneralization
        );
    }

    #[test]
    fn comparison_report_lists_both_strategies() {
        let metrics = RegressionMetrics {
            r2: 0.5,
            rmse: 1.0,
            mae: 0.75,
            mape: 40.0,
            n: 10,
        };
        let evaluation = |description: &str| SplitEvaluation {
            description: description.to_string(),
            train_rows: 80,
            test_rows: 20,
            train: metrics,
            test: metrics,
            overfitting: OverfittingStatus::GoodGeneralization,
        };
        let report = SplitComparison {
            random: evaluation("random (20% test, seed 42)"),
            temporal: evaluation("temporal (train < 2019 <= test)"),
        }
        .report();

        assert!(report.contains("random (20% test, seed 42)"));
        assert!(report.contains("temporal (train < 2019 <= test)"));
        assert!(report.contains("Test MAPE"));
        assert!(report.contains("40.00%"));
        assert!(report.contains("good generalization"));
    }
}
