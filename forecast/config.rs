//! # Pipeline Configuration
//!
//! A single `PipelineConfig` value describes a complete training and serving
//! setup: where the dataset and the two artifacts live, which dataset columns
//! play which role, how features are engineered, how rows are split, the
//! forest hyper-parameters and the accepted request range.
//!
//! Every field has a default matching the deployed application, so an empty
//! (or absent) TOML file is a valid configuration. The indicator list is the
//! single source of the frozen feature order: training, the request schema and
//! the persisted model all derive their ordering from it.

use crate::data::DatasetSchema;
use crate::features::{FeatureMode, feature_names};
use crate::forest::{ForestConfig, MaxFeatures};
use crate::split::SplitStrategy;
use crate::validate::{RequestSchema, ValueRange};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Year at which the temporal split starts the held-out set.
pub const DEFAULT_SPLIT_YEAR: i64 = 2019;
/// Held-out fraction for the random split.
pub const DEFAULT_TEST_FRACTION: f64 = 0.2;
/// Seed shared by the random split and the forest.
pub const DEFAULT_SEED: u64 = 42;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One raw indicator: the dataset column it is read from and the request field
/// that carries it at prediction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorColumn {
    pub column: String,
    pub field: String,
}

impl IndicatorColumn {
    fn new(column: &str, field: &str) -> Self {
        Self {
            column: column.to_string(),
            field: field.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnConfig {
    pub entity: String,
    pub time: String,
    pub target: String,
    /// Name of the entity field in prediction requests.
    pub entity_field: String,
    pub indicators: Vec<IndicatorColumn>,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            entity: "Country".to_string(),
            time: "Year".to_string(),
            target: "GDP_Growth_Rate".to_string(),
            entity_field: "Country".to_string(),
            indicators: vec![
                IndicatorColumn::new("Population_Growth_Rate", "Population"),
                IndicatorColumn::new("Exports of goods and services_Growth_Rate", "Exports"),
                IndicatorColumn::new("Imports of goods and services_Growth_Rate", "Imports"),
                IndicatorColumn::new("Gross capital formation_Growth_Rate", "Investment"),
                IndicatorColumn::new("Final consumption expenditure_Growth_Rate", "Consumption"),
                IndicatorColumn::new("Government_Expenditure_Growth_Rate", "Govt_Spend"),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitKind {
    Temporal,
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplitConfig {
    pub kind: SplitKind,
    pub threshold_year: i64,
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            kind: SplitKind::Temporal,
            threshold_year: DEFAULT_SPLIT_YEAR,
            test_fraction: DEFAULT_TEST_FRACTION,
            seed: DEFAULT_SEED,
        }
    }
}

impl SplitConfig {
    pub fn strategy(&self) -> SplitStrategy {
        self.strategy_for(self.kind)
    }

    /// Builds the strategy for `kind` from this configuration's parameters.
    pub fn strategy_for(&self, kind: SplitKind) -> SplitStrategy {
        match kind {
            SplitKind::Temporal => SplitStrategy::Temporal {
                threshold: self.threshold_year,
            },
            SplitKind::Random => SplitStrategy::Random {
                test_fraction: self.test_fraction,
                seed: self.seed,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    pub min: f64,
    pub max: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min: -100.0,
            max: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub dataset_path: PathBuf,
    pub model_path: PathBuf,
    pub encoder_path: PathBuf,
    pub feature_mode: FeatureMode,
    pub columns: ColumnConfig,
    pub split: SplitConfig,
    pub forest: ForestConfig,
    pub validation: ValidationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("dataset.csv"),
            model_path: PathBuf::from("model.toml"),
            encoder_path: PathBuf::from("encoder.toml"),
            feature_mode: FeatureMode::Lagged,
            columns: ColumnConfig::default(),
            split: SplitConfig::default(),
            forest: ForestConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads a configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig = toml::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Checks the cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let columns = &self.columns;
        if columns.indicators.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one indicator column is required".to_string(),
            ));
        }

        let mut seen_columns = HashSet::new();
        for name in [&columns.entity, &columns.time, &columns.target]
            .into_iter()
            .chain(columns.indicators.iter().map(|i| &i.column))
        {
            if name.is_empty() {
                return Err(ConfigError::Invalid("column names must be non-empty".to_string()));
            }
            if !seen_columns.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "column '{name}' is assigned to more than one role"
                )));
            }
        }

        let mut seen_fields = HashSet::new();
        for field in std::iter::once(&columns.entity_field)
            .chain(columns.indicators.iter().map(|i| &i.field))
        {
            if field.is_empty() {
                return Err(ConfigError::Invalid("request field names must be non-empty".to_string()));
            }
            if !seen_fields.insert(field.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "request field '{field}' is used more than once"
                )));
            }
        }

        let fraction = self.split.test_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "split.test_fraction must lie strictly between 0 and 1, got {fraction}"
            )));
        }

        let range = &self.validation;
        if !(range.min.is_finite() && range.max.is_finite() && range.min <= range.max) {
            return Err(ConfigError::Invalid(format!(
                "validation range [{}, {}] is not a finite, ordered interval",
                range.min, range.max
            )));
        }

        let forest = &self.forest;
        if forest.n_trees == 0 {
            return Err(ConfigError::Invalid("forest.n_trees must be at least 1".to_string()));
        }
        if forest.min_samples_leaf == 0 || forest.min_samples_split < 2 {
            return Err(ConfigError::Invalid(
                "forest.min_samples_leaf must be >= 1 and forest.min_samples_split >= 2"
                    .to_string(),
            ));
        }
        if let MaxFeatures::Fraction(f) = forest.max_features {
            if !(f > 0.0 && f <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "forest.max_features fraction must lie in (0, 1], got {f}"
                )));
            }
        }

        Ok(())
    }

    pub fn dataset_schema(&self) -> DatasetSchema {
        DatasetSchema {
            entity_column: self.columns.entity.clone(),
            time_column: self.columns.time.clone(),
            target_column: self.columns.target.clone(),
            indicator_columns: self
                .columns
                .indicators
                .iter()
                .map(|i| i.column.clone())
                .collect(),
        }
    }

    pub fn request_schema(&self) -> RequestSchema {
        RequestSchema {
            entity_field: self.columns.entity_field.clone(),
            numeric_fields: self.indicator_fields(),
            range: ValueRange {
                min: self.validation.min,
                max: self.validation.max,
            },
        }
    }

    pub fn indicator_fields(&self) -> Vec<String> {
        self.columns
            .indicators
            .iter()
            .map(|i| i.field.clone())
            .collect()
    }

    /// The frozen model input order for the configured feature mode.
    pub fn feature_names(&self) -> Vec<String> {
        feature_names(&self.indicator_fields(), self.feature_mode)
    }
}
