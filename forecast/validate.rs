//! # Prediction Request Validation
//!
//! Validation is a pure function from an untrusted JSON request to either a
//! `ValidatedRequest` or one of four closed error kinds. Checks run in a fixed
//! order and the first failing check wins:
//!
//! 1. Presence of the entity field and every numeric field.
//! 2. Types: numeric fields must be JSON numbers or numeric strings, the
//!    entity must be a JSON string.
//! 3. Ranges: every numeric value inside the inclusive accepted range.
//! 4. Membership: the trimmed entity name must be known to the encoder.
//!
//! Values are never coerced to defaults; every rejection reaches the caller.

use crate::encoder::EntityEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// An inclusive interval of accepted indicator values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

impl fmt::Display for ValueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// The shape of a prediction request. `numeric_fields` is in model order.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSchema {
    pub entity_field: String,
    pub numeric_fields: Vec<String>,
    pub range: ValueRange,
}

impl RequestSchema {
    /// Every field a request must carry, entity first.
    pub fn required_fields(&self) -> Vec<String> {
        std::iter::once(self.entity_field.clone())
            .chain(self.numeric_fields.iter().cloned())
            .collect()
    }
}

/// A request that passed every check. Only `validate` constructs one.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    entity: String,
    values: Vec<f64>,
}

impl ValidatedRequest {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Numeric values in schema order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required fields: {}", names.join(", "))]
    MissingFields { names: Vec<String> },
    #[error("Invalid {field} value: must be {expected}")]
    TypeError {
        field: String,
        expected: &'static str,
    },
    #[error("{field} value {value} is outside the accepted range {range}")]
    RangeError {
        field: String,
        value: f64,
        range: ValueRange,
    },
    #[error("Entity '{name}' was not found in the training data")]
    UnknownEntity { name: String, available: Vec<String> },
}

/// The structured body a serving boundary returns for a rejected request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub error: &'static str,
    pub kind: &'static str,
    pub message: String,
    /// The offending field(s).
    pub fields: Vec<String>,
    pub required_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<Vec<String>>,
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MissingFields { .. } => "missing_fields",
            ValidationError::TypeError { .. } => "type_error",
            ValidationError::RangeError { .. } => "range_error",
            ValidationError::UnknownEntity { .. } => "unknown_entity",
        }
    }

    pub fn payload(&self, schema: &RequestSchema) -> ErrorPayload {
        let (fields, available) = match self {
            ValidationError::MissingFields { names } => (names.clone(), None),
            ValidationError::TypeError { field, .. } | ValidationError::RangeError { field, .. } => {
                (vec![field.clone()], None)
            }
            ValidationError::UnknownEntity { available, .. } => {
                (vec![schema.entity_field.clone()], Some(available.clone()))
            }
        };
        ErrorPayload {
            error: "Invalid input",
            kind: self.kind(),
            message: self.to_string(),
            fields,
            required_fields: schema.required_fields(),
            available,
        }
    }
}

/// Validates one request against `schema` and the entities `known` to the
/// fitted encoder.
pub fn validate(
    request: &Value,
    schema: &RequestSchema,
    known: &EntityEncoder,
) -> Result<ValidatedRequest, ValidationError> {
    let object = request.as_object();
    let field = |name: &str| object.and_then(|o| o.get(name));

    let missing: Vec<String> = schema
        .required_fields()
        .into_iter()
        .filter(|name| field(name.as_str()).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields { names: missing });
    }

    let entity = match field(schema.entity_field.as_str()) {
        Some(Value::String(s)) => s.trim().to_string(),
        _ => {
            return Err(ValidationError::TypeError {
                field: schema.entity_field.clone(),
                expected: "a string",
            });
        }
    };

    let mut values = Vec::with_capacity(schema.numeric_fields.len());
    for name in &schema.numeric_fields {
        match field(name.as_str()).and_then(as_number) {
            Some(v) => values.push(v),
            None => {
                return Err(ValidationError::TypeError {
                    field: name.clone(),
                    expected: "a number",
                });
            }
        }
    }

    if let Some((name, &value)) = schema
        .numeric_fields
        .iter()
        .zip(&values)
        .find(|(_, v)| !schema.range.contains(**v))
    {
        return Err(ValidationError::RangeError {
            field: name.clone(),
            value,
            range: schema.range,
        });
    }

    if !known.contains(&entity) {
        return Err(ValidationError::UnknownEntity {
            name: entity,
            available: known.classes().to_vec(),
        });
    }

    Ok(ValidatedRequest { entity, values })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
