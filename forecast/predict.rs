//! Scoring of validated requests.

use crate::encoder::{EncoderError, EntityEncoder};
use crate::features::assemble_row;
use crate::model::{ModelError, TrainedModel};
use crate::validate::ValidatedRequest;
use ndarray::ArrayView1;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(
        "Assembled input has {found} values but the model expects {expected}. The request schema and the model artifact disagree."
    )]
    FeatureShapeMismatch { expected: usize, found: usize },
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Assembles the model input for `request` and scores it.
///
/// The input vector is `[entity_code, values...]`, laid out by
/// `features::assemble_row` exactly as during training. Its length is checked
/// against the model and is never padded or truncated.
pub fn predict(
    request: &ValidatedRequest,
    model: &TrainedModel,
    encoder: &EntityEncoder,
) -> Result<f64, PredictError> {
    let code = encoder.encode(request.entity())? as f64;
    let row = assemble_row(code, request.values().iter().copied());
    if row.len() != model.n_features() {
        return Err(PredictError::FeatureShapeMismatch {
            expected: model.n_features(),
            found: row.len(),
        });
    }
    let value = model.predict_row(ArrayView1::from(row.as_slice()))?;
    log::debug!("Scored '{}': {value:.4}", request.entity());
    Ok(value)
}
