//! # Feature Engineering
//!
//! Turns the observation table into a supervised learning table, in one of two
//! modes:
//!
//! - `Concurrent`: features are the indicators of the same period as the label.
//! - `Lagged`: features are the indicators of the entity's previous observed
//!   period, the label is the current period's target. The first period of each
//!   entity has no predecessor and produces no row.
//!
//! The model input vector is always `[entity_code, feature_1, ..., feature_k]`.
//! `assemble_row` is the only place that lays a vector out, and it is used both
//! when building the training design matrix and when scoring a request.

use crate::data::Dataset;
use crate::encoder::{EncoderError, EntityEncoder};
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Position of the encoded entity inside every model input vector.
pub const ENTITY_FEATURE_INDEX: usize = 0;
pub const ENTITY_FEATURE_NAME: &str = "entity_code";
pub const LAG_SUFFIX: &str = "_lag1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureMode {
    Concurrent,
    Lagged,
}

impl FeatureMode {
    pub fn describe(self) -> &'static str {
        match self {
            FeatureMode::Concurrent => "concurrent indicators (T predicts T)",
            FeatureMode::Lagged => "lagged indicators (T-1 predicts T)",
        }
    }
}

/// Names of the model inputs, in the frozen order.
pub fn feature_names(indicator_fields: &[String], mode: FeatureMode) -> Vec<String> {
    let suffix = match mode {
        FeatureMode::Concurrent => "",
        FeatureMode::Lagged => LAG_SUFFIX,
    };
    let indicators: Vec<String> = indicator_fields
        .iter()
        .map(|f| format!("{f}{suffix}"))
        .collect();
    assemble_row(ENTITY_FEATURE_NAME.to_string(), indicators)
}

/// Lays out one model input vector with the entity at `ENTITY_FEATURE_INDEX`.
pub fn assemble_row<T>(entity: T, features: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut row: Vec<T> = features.into_iter().collect();
    row.insert(ENTITY_FEATURE_INDEX, entity);
    row
}

/// The supervised learning table. Row `i` of every column describes the same
/// (entity, time) observation.
#[derive(Debug, Clone)]
pub struct EngineeredTable {
    pub entities: Vec<String>,
    pub times: Vec<i64>,
    /// Shape: [n_rows, n_indicators].
    pub features: Array2<f64>,
    pub labels: Array1<f64>,
}

impl EngineeredTable {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// A table holding the given rows, in the given order.
    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            entities: rows.iter().map(|&i| self.entities[i].clone()).collect(),
            times: rows.iter().map(|&i| self.times[i]).collect(),
            features: self.features.select(Axis(0), rows),
            labels: self.labels.select(Axis(0), rows),
        }
    }

    /// The model input matrix `[entity_code | features]`.
    pub fn design_matrix(&self, encoder: &EntityEncoder) -> Result<Array2<f64>, EncoderError> {
        let width = self.features.ncols() + 1;
        let mut matrix = Array2::<f64>::zeros((self.len(), width));
        for (i, mut out) in matrix.axis_iter_mut(Axis(0)).enumerate() {
            let code = encoder.encode(&self.entities[i])? as f64;
            let row = assemble_row(code, self.features.row(i).iter().copied());
            for (slot, value) in out.iter_mut().zip(row) {
                *slot = value;
            }
        }
        Ok(matrix)
    }
}

/// Derives the supervised table from the dataset. Output rows follow the
/// dataset's (entity, time) order.
pub fn engineer(dataset: &Dataset, mode: FeatureMode) -> EngineeredTable {
    let table = match mode {
        FeatureMode::Concurrent => EngineeredTable {
            entities: dataset.entities().to_vec(),
            times: dataset.times().to_vec(),
            features: dataset.indicators().clone(),
            labels: dataset.target().clone(),
        },
        FeatureMode::Lagged => {
            let mut sources = Vec::with_capacity(dataset.len());
            let mut targets = Vec::with_capacity(dataset.len());
            for (_, range) in dataset.groups() {
                for (previous, current) in range.tuple_windows() {
                    sources.push(previous);
                    targets.push(current);
                }
            }
            EngineeredTable {
                entities: targets
                    .iter()
                    .map(|&i| dataset.entities()[i].clone())
                    .collect(),
                times: targets.iter().map(|&i| dataset.times()[i]).collect(),
                features: dataset.indicators().select(Axis(0), &sources),
                labels: dataset.target().select(Axis(0), &targets),
            }
        }
    };

    log::info!(
        "Engineered {} rows from {} observations using {}",
        table.len(),
        dataset.len(),
        mode.describe()
    );
    table
}

/// Removes rows whose features or label are not finite. Returns the kept table
/// and the number of dropped rows.
pub fn drop_incomplete(table: EngineeredTable) -> (EngineeredTable, usize) {
    let keep: Vec<usize> = (0..table.len())
        .filter(|&i| {
            table.labels[i].is_finite() && table.features.row(i).iter().all(|v| v.is_finite())
        })
        .collect();
    let dropped = table.len() - keep.len();
    if dropped == 0 {
        return (table, 0);
    }
    log::info!(
        "Dropped {dropped} rows with missing values, {} remain",
        keep.len()
    );
    (table.select(&keep), dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn dataset() -> Dataset {
        // Rows are deliberately unsorted; Dataset sorts by (entity, time).
        Dataset::from_columns(
            vec![
                "Chile".to_string(),
                "Brazil".to_string(),
                "Chile".to_string(),
                "Peru".to_string(),
                "Brazil".to_string(),
                "Chile".to_string(),
            ],
            vec![2001, 2000, 2000, 2005, 2001, 2003],
            array![
                [11.0, 110.0],
                [20.0, 200.0],
                [10.0, 100.0],
                [90.0, 900.0],
                [21.0, 210.0],
                [13.0, 130.0],
            ],
            vec![1.1, 2.0, 1.0, 9.0, 2.1, 1.3],
            vec!["a".to_string(), "b".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn concurrent_mode_is_identity() {
        let data = dataset();
        let table = engineer(&data, FeatureMode::Concurrent);
        assert_eq!(table.len(), data.len());
        assert_eq!(&table.features, data.indicators());
        assert_eq!(&table.labels, data.target());
        assert_eq!(table.entities, data.entities());
    }

    #[test]
    fn lagged_features_come_from_previous_observation_of_same_entity() {
        let data = dataset();
        let table = engineer(&data, FeatureMode::Lagged);

        // Brazil: 2000 -> 2001. Chile: 2000 -> 2001 -> 2003. Peru: single row.
        assert_eq!(table.len(), 3);
        assert_eq!(table.entities, vec!["Brazil", "Chile", "Chile"]);
        assert_eq!(table.times, vec![2001, 2001, 2003]);
        assert_eq!(table.features, array![[20.0, 200.0], [10.0, 100.0], [11.0, 110.0]]);
        assert_eq!(table.labels, array![2.1, 1.1, 1.3]);
    }

    #[test]
    fn first_period_of_each_entity_never_appears_in_lagged_output() {
        let data = dataset();
        let table = engineer(&data, FeatureMode::Lagged);
        for (entity, range) in data.groups() {
            let first_time = data.times()[range.start];
            assert!(
                !table
                    .entities
                    .iter()
                    .zip(&table.times)
                    .any(|(e, &t)| e == entity && t == first_time),
                "first period of {entity} leaked into lagged output"
            );
        }
    }

    #[test]
    fn single_observation_entity_contributes_nothing() {
        let data = dataset();
        let table = engineer(&data, FeatureMode::Lagged);
        assert!(!table.entities.iter().any(|e| e == "Peru"));
    }

    #[test]
    fn drop_incomplete_removes_only_non_finite_rows() {
        let table = EngineeredTable {
            entities: vec!["A".into(), "A".into(), "B".into(), "B".into()],
            times: vec![1, 2, 1, 2],
            features: array![[1.0, 2.0], [f64::NAN, 2.0], [3.0, 4.0], [5.0, 6.0]],
            labels: array![1.0, 2.0, f64::INFINITY, 4.0],
        };
        let (kept, dropped) = drop_incomplete(table);
        assert_eq!(dropped, 2);
        assert_eq!(kept.times, vec![1, 2]);
        assert_eq!(kept.entities, vec!["A", "B"]);
        assert_eq!(kept.labels, array![1.0, 4.0]);
    }

    #[test]
    fn design_matrix_places_entity_code_first() {
        let data = dataset();
        let encoder = EntityEncoder::fit(data.entities().iter().map(String::as_str));
        let table = engineer(&data, FeatureMode::Lagged);
        let x = table.design_matrix(&encoder).unwrap();
        assert_eq!(x.ncols(), 3);
        assert_eq!(x.row(0).to_vec(), vec![0.0, 20.0, 200.0]);
        assert_eq!(x.row(2).to_vec(), vec![1.0, 11.0, 110.0]);
    }

    #[test]
    fn feature_names_match_mode() {
        let fields = vec!["Exports".to_string(), "Imports".to_string()];
        assert_eq!(
            feature_names(&fields, FeatureMode::Concurrent),
            vec!["entity_code", "Exports", "Imports"]
        );
        assert_eq!(
            feature_names(&fields, FeatureMode::Lagged),
            vec!["entity_code", "Exports_lag1", "Imports_lag1"]
        );
    }
}
