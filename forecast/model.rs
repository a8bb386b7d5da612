use crate::artifact::{self, ArtifactError};
use crate::estimate::RegressionMetrics;
use crate::features::{ENTITY_FEATURE_INDEX, ENTITY_FEATURE_NAME, FeatureMode};
use crate::forest::{ForestError, RegressionForest};
use itertools::Itertools;
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable TOML format of the trained model.

/// Held-out evaluation recorded alongside the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    /// Human-readable description of the split that produced the metrics.
    pub split: String,
    pub dropped_rows: usize,
    pub train: RegressionMetrics,
    pub test: RegressionMetrics,
}

/// The self-contained trained model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    /// The canonical input order. Strictly enforced at prediction time.
    pub feature_names: Vec<String>,
    pub entity_feature_index: usize,
    pub feature_mode: FeatureMode,
    /// Number of encoder classes the entity codes were drawn from.
    pub entity_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationSummary>,
    pub forest: RegressionForest,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("Input vector has {found} features, but the model was trained on {expected}.")]
    FeatureShapeMismatch { expected: usize, found: usize },
    #[error("Underlying forest failed: {0}")]
    Forest(#[from] ForestError),
    #[error("Model artifact is inconsistent: {0}")]
    Corrupt(String),
}

impl TrainedModel {
    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    /// Scores one assembled input vector.
    pub fn predict_row(&self, row: ArrayView1<f64>) -> Result<f64, ModelError> {
        if row.len() != self.n_features() {
            return Err(ModelError::FeatureShapeMismatch {
                expected: self.n_features(),
                found: row.len(),
            });
        }
        Ok(self.forest.predict_row(row)?)
    }

    /// Scores a design matrix with shape `[n_samples, n_features]`.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        if x.ncols() != self.n_features() {
            return Err(ModelError::FeatureShapeMismatch {
                expected: self.n_features(),
                found: x.ncols(),
            });
        }
        Ok(self.forest.predict(x)?)
    }

    /// Feature names paired with their importances, most important first.
    pub fn ranked_importances(&self) -> Vec<(String, f64)> {
        self.feature_names
            .iter()
            .cloned()
            .zip(self.forest.feature_importances().iter().copied())
            .sorted_by(|a, b| b.1.total_cmp(&a.1))
            .collect()
    }

    /// Saves the model to a TOML file atomically.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        artifact::save_toml(self, path)?;
        log::info!(
            "Saved model ({} trees, {} features) to {}",
            self.forest.n_trees(),
            self.n_features(),
            path.display()
        );
        Ok(())
    }

    /// Loads a trained model and checks that its parts agree with each other.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let model: TrainedModel = artifact::load_toml(path)?;
        model.check()?;
        Ok(model)
    }

    fn check(&self) -> Result<(), ModelError> {
        if self.entity_feature_index != ENTITY_FEATURE_INDEX {
            return Err(ModelError::Corrupt(format!(
                "entity feature is at position {}, expected {ENTITY_FEATURE_INDEX}",
                self.entity_feature_index
            )));
        }
        if self.feature_names.get(ENTITY_FEATURE_INDEX).map(String::as_str)
            != Some(ENTITY_FEATURE_NAME)
        {
            return Err(ModelError::Corrupt(format!(
                "feature {ENTITY_FEATURE_INDEX} is not '{ENTITY_FEATURE_NAME}'"
            )));
        }
        if self.forest.n_features() != self.n_features() {
            return Err(ModelError::Corrupt(format!(
                "{} feature names but the forest expects {} inputs",
                self.n_features(),
                self.forest.n_features()
            )));
        }
        self.forest.check_structure()?;
        Ok(())
    }
}
