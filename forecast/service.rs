//! # Serving Operations
//!
//! `ServingState` holds the three read-only resources a prediction service
//! needs: the dataset (for listing and history), the trained model and the
//! entity encoder. They are loaded once, cross-checked, and never mutated, so
//! a single handle can be shared by any number of concurrent callers.
//!
//! Every operation returns a serde-serializable value; turning them into HTTP
//! responses or CLI output is the caller's concern.

use crate::config::{ConfigError, PipelineConfig};
use crate::data::{DataError, Dataset, load_dataset};
use crate::encoder::{EncoderError, EntityEncoder};
use crate::features::FeatureMode;
use crate::model::{ModelError, TrainedModel};
use crate::predict::{PredictError, predict};
use crate::validate::{RequestSchema, ValidationError, validate};
use itertools::Itertools;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Value of every indicator in the neutral comparison scenario, in percent.
pub const BASELINE_GROWTH_RATE: f64 = 2.0;

const PREDICTION_METHOD: &str = "Random forest regressor";

/// Startup failures. Any of them means the process must not serve.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Data unavailable: {0}")]
    Data(#[from] DataError),
    #[error("Data unavailable: {0}")]
    Model(#[from] ModelError),
    #[error("Data unavailable: {0}")]
    Encoder(#[from] EncoderError),
    #[error("Data unavailable: the model and its companion artifacts do not pair: {0}")]
    Mismatch(String),
}

#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("Invalid input: {0}")]
    Invalid(#[from] ValidationError),
    #[error("Prediction failed: {0}")]
    Predict(#[from] PredictError),
}

#[derive(Error, Debug, PartialEq)]
pub enum LookupError {
    #[error("No data found for entity: {0}")]
    NoHistory(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationInfo {
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub message: &'static str,
    pub status: &'static str,
    pub version: &'static str,
    pub model_loaded: bool,
    pub encoder_loaded: bool,
    pub data_loaded: bool,
    pub dataset_rows: usize,
    pub entity_count: usize,
    pub time_range: Option<(i64, i64)>,
    pub feature_mode: FeatureMode,
    pub feature_names: Vec<String>,
    pub operations: Vec<OperationInfo>,
    pub note: String,
}

/// One chronological point of an entity's history. Missing cells are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub time: i64,
    pub target: Option<f64>,
    /// Indicator values in `HistoryResponse::fields` order.
    pub indicators: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryResponse {
    pub entity: String,
    pub fields: Vec<String>,
    pub records: Vec<HistoryRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResponse {
    /// Prediction rounded to two decimals.
    pub growth: f64,
    pub raw: f64,
    pub entity: String,
    pub method: &'static str,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldValue {
    pub field: String,
    pub value: f64,
}

/// The neutral scenario: every indicator at `BASELINE_GROWTH_RATE`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaselineScenario {
    pub growth_rate: f64,
    pub values: Vec<FieldValue>,
}

pub struct ServingState {
    config: PipelineConfig,
    schema: RequestSchema,
    dataset: Dataset,
    model: TrainedModel,
    encoder: EntityEncoder,
}

impl ServingState {
    /// Loads the dataset, model and encoder named by `config`.
    pub fn load(config: PipelineConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let dataset = load_dataset(&config.dataset_path, &config.dataset_schema())?;
        let model = TrainedModel::load(&config.model_path)?;
        let encoder = EntityEncoder::load(&config.encoder_path)?;
        let state = Self::from_parts(config, dataset, model, encoder)?;
        log::info!(
            "Serving {} entities with a {}-feature model",
            state.encoder.len(),
            state.model.n_features()
        );
        Ok(state)
    }

    /// Assembles a serving state from already loaded parts, checking that the
    /// configuration is valid and that the parts belong together.
    pub fn from_parts(
        config: PipelineConfig,
        dataset: Dataset,
        model: TrainedModel,
        encoder: EntityEncoder,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let expected = config.feature_names();
        if model.feature_names != expected {
            return Err(StartupError::Mismatch(format!(
                "model features [{}] differ from the configured features [{}]",
                model.feature_names.join(", "),
                expected.join(", ")
            )));
        }
        if model.entity_count != encoder.len() {
            return Err(StartupError::Mismatch(format!(
                "model was fitted with {} entity codes but the encoder has {}",
                model.entity_count,
                encoder.len()
            )));
        }
        let listed = dataset.distinct_entities();
        if listed.as_slice() != encoder.classes() {
            let unencoded = listed.iter().filter(|e| !encoder.contains(e)).join(", ");
            let absent = encoder
                .classes()
                .iter()
                .filter(|c| listed.binary_search(c).is_err())
                .join(", ");
            return Err(StartupError::Mismatch(format!(
                "dataset and encoder disagree on the entity set (only in dataset: [{unencoded}], only in encoder: [{absent}])"
            )));
        }
        let schema = config.request_schema();
        Ok(Self {
            config,
            schema,
            dataset,
            model,
            encoder,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn schema(&self) -> &RequestSchema {
        &self.schema
    }

    pub fn model(&self) -> &TrainedModel {
        &self.model
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            message: "GDP Growth Prediction Service",
            status: "running",
            version: env!("CARGO_PKG_VERSION"),
            model_loaded: true,
            encoder_loaded: true,
            data_loaded: !self.dataset.is_empty(),
            dataset_rows: self.dataset.len(),
            entity_count: self.dataset.entity_count(),
            time_range: self.dataset.time_range(),
            feature_mode: self.model.feature_mode,
            feature_names: self.model.feature_names.clone(),
            operations: vec![
                OperationInfo {
                    name: "status",
                    description: "Service information",
                },
                OperationInfo {
                    name: "countries",
                    description: "List all entities",
                },
                OperationInfo {
                    name: "history",
                    description: "Historical data for one entity",
                },
                OperationInfo {
                    name: "predict",
                    description: "Predict the growth rate for one request",
                },
                OperationInfo {
                    name: "baseline",
                    description: "Neutral scenario with every indicator at the baseline rate",
                },
            ],
            note: self.mode_note(),
        }
    }

    /// Sorted entity names from the dataset.
    pub fn list_entities(&self) -> Vec<String> {
        self.dataset.distinct_entities()
    }

    /// Chronological history of one entity.
    pub fn history(&self, entity: &str) -> Result<HistoryResponse, LookupError> {
        let rows = self
            .dataset
            .history(entity)
            .ok_or_else(|| LookupError::NoHistory(entity.to_string()))?;
        let records = rows
            .into_iter()
            .map(|row| HistoryRecord {
                time: row.time,
                target: finite(row.target),
                indicators: row.indicators.iter().map(|&v| finite(v)).collect(),
            })
            .collect();
        Ok(HistoryResponse {
            entity: entity.to_string(),
            fields: self.config.indicator_fields(),
            records,
        })
    }

    /// Validates and scores one request.
    pub fn score(&self, request: &Value) -> Result<PredictionResponse, ScoreError> {
        let validated = validate(request, &self.schema, &self.encoder)?;
        let raw = predict(&validated, &self.model, &self.encoder)?;
        Ok(PredictionResponse {
            growth: round2(raw),
            raw,
            entity: validated.entity().to_string(),
            method: PREDICTION_METHOD,
            note: self.mode_note(),
        })
    }

    pub fn baseline(&self) -> BaselineScenario {
        BaselineScenario {
            growth_rate: BASELINE_GROWTH_RATE,
            values: self
                .schema
                .numeric_fields
                .iter()
                .map(|field| FieldValue {
                    field: field.clone(),
                    value: BASELINE_GROWTH_RATE,
                })
                .collect(),
        }
    }

    /// Scores the baseline scenario for one entity.
    pub fn baseline_for(&self, entity: &str) -> Result<PredictionResponse, ScoreError> {
        let mut request = Map::new();
        request.insert(
            self.schema.entity_field.clone(),
            Value::String(entity.to_string()),
        );
        for value in self.baseline().values {
            request.insert(value.field, Value::from(value.value));
        }
        self.score(&Value::Object(request))
    }

    fn mode_note(&self) -> String {
        match self.model.feature_mode {
            FeatureMode::Lagged => {
                "Prediction based on lagged features (T-1 -> T)".to_string()
            }
            FeatureMode::Concurrent => {
                "Prediction based on same-period features (T -> T)".to_string()
            }
        }
    }
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
