//! # Dataset Loading and Validation Module
//!
//! This module is the only entry point for the observation dataset. It reads a
//! comma-separated file with one row per (entity, time) pair, checks it
//! against the configured schema, and returns a columnar `Dataset` backed by
//! `ndarray` structures.
//!
//! - Canonical order: rows are stored sorted by entity, then time. Every later
//!   stage (lagging, seeded splitting, history lookups) relies on this.
//! - Missing numeric cells are kept as NaN. Whether a row with a missing value
//!   is usable depends on the feature mode, so the decision is deferred to the
//!   feature engineer.
//! - Every `DataError` is fatal: a process that cannot load its dataset must not
//!   start serving or training.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use polars::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The roles of the dataset columns.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSchema {
    pub entity_column: String,
    pub time_column: String,
    pub target_column: String,
    pub indicator_columns: Vec<String>,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("Dataset '{}' could not be opened: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Dataset '{}' contains no data rows.", path.display())]
    Empty { path: PathBuf },
    #[error(
        "The required column '{0}' was not found in the dataset. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in the required key column '{0}'.")]
    MissingValuesFound(String),
    #[error("Dataset columns disagree in shape: {0}")]
    InconsistentColumns(String),
    #[error("Row {row} has an empty entity name.")]
    EmptyEntity { row: usize },
    #[error("Entity '{entity}' has more than one observation for time {time}.")]
    DuplicateObservation { entity: String, time: i64 },
}

/// The loaded observation table, sorted by (entity, time).
#[derive(Debug, Clone)]
pub struct Dataset {
    entities: Vec<String>,
    times: Array1<i64>,
    /// Shape: [n_rows, n_indicators], columns in `indicator_names` order.
    indicators: Array2<f64>,
    target: Array1<f64>,
    indicator_names: Vec<String>,
    groups: BTreeMap<String, Range<usize>>,
}

/// One chronological history point for a single entity.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow<'a> {
    pub time: i64,
    pub target: f64,
    pub indicators: ArrayView1<'a, f64>,
}

impl Dataset {
    /// Builds a dataset from unsorted columns, enforcing the row invariants.
    pub fn from_columns(
        entities: Vec<String>,
        times: Vec<i64>,
        indicators: Array2<f64>,
        target: Vec<f64>,
        indicator_names: Vec<String>,
    ) -> Result<Self, DataError> {
        let n = entities.len();
        if times.len() != n || target.len() != n || indicators.nrows() != n {
            return Err(DataError::InconsistentColumns(format!(
                "entities={n}, times={}, target={}, indicators={}",
                times.len(),
                target.len(),
                indicators.nrows()
            )));
        }
        if indicators.ncols() != indicator_names.len() {
            return Err(DataError::InconsistentColumns(format!(
                "{} names for {} indicator columns",
                indicator_names.len(),
                indicators.ncols()
            )));
        }

        if let Some(row) = entities.iter().position(|e| e.trim().is_empty()) {
            return Err(DataError::EmptyEntity { row: row + 1 });
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            entities[a]
                .cmp(&entities[b])
                .then_with(|| times[a].cmp(&times[b]))
        });

        for pair in order.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if entities[a] == entities[b] && times[a] == times[b] {
                return Err(DataError::DuplicateObservation {
                    entity: entities[a].clone(),
                    time: times[a],
                });
            }
        }

        let sorted_entities: Vec<String> = order.iter().map(|&i| entities[i].clone()).collect();
        let sorted_times: Array1<i64> = order.iter().map(|&i| times[i]).collect();
        let sorted_target: Array1<f64> = order.iter().map(|&i| target[i]).collect();
        let sorted_indicators = indicators.select(Axis(0), &order);

        let mut groups: BTreeMap<String, Range<usize>> = BTreeMap::new();
        let mut start = 0;
        for i in 1..=n {
            if i == n || sorted_entities[i] != sorted_entities[start] {
                groups.insert(sorted_entities[start].clone(), start..i);
                start = i;
            }
        }

        Ok(Self {
            entities: sorted_entities,
            times: sorted_times,
            indicators: sorted_indicators,
            target: sorted_target,
            indicator_names,
            groups,
        })
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn times(&self) -> &Array1<i64> {
        &self.times
    }

    pub fn indicators(&self) -> &Array2<f64> {
        &self.indicators
    }

    pub fn target(&self) -> &Array1<f64> {
        &self.target
    }

    pub fn indicator_names(&self) -> &[String] {
        &self.indicator_names
    }

    /// Sorted distinct entity names.
    pub fn distinct_entities(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn entity_count(&self) -> usize {
        self.groups.len()
    }

    /// Row ranges of each entity, in entity order. Rows inside a range are in
    /// ascending time order.
    pub fn groups(&self) -> impl Iterator<Item = (&str, Range<usize>)> + '_ {
        self.groups.iter().map(|(k, r)| (k.as_str(), r.clone()))
    }

    /// The (earliest, latest) time in the dataset, or `None` when empty.
    pub fn time_range(&self) -> Option<(i64, i64)> {
        let min = self.times.iter().min()?;
        let max = self.times.iter().max()?;
        Some((*min, *max))
    }

    /// Chronological history of one entity, or `None` if it is not present.
    pub fn history(&self, entity: &str) -> Option<Vec<HistoryRow<'_>>> {
        let range = self.groups.get(entity)?.clone();
        Some(
            range
                .map(|i| HistoryRow {
                    time: self.times[i],
                    target: self.target[i],
                    indicators: self.indicators.row(i),
                })
                .collect(),
        )
    }
}

/// Loads and validates the observation dataset.
pub fn load_dataset(path: &Path, schema: &DatasetSchema) -> Result<Dataset, DataError> {
    log::info!("Loading dataset from '{}'", path.display());

    let file = File::open(path).map_err(|source| DataError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let df = CsvReader::new(file)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::Empty {
            path: path.to_path_buf(),
        });
    }

    let columns_set: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let required = [
        &schema.entity_column,
        &schema.time_column,
        &schema.target_column,
    ]
    .into_iter()
    .chain(schema.indicator_columns.iter());
    for name in required {
        if !columns_set.contains(name) {
            return Err(DataError::ColumnNotFound(name.clone()));
        }
    }

    let entities = internal::extract_entity_column(&df, &schema.entity_column)?;
    let times = internal::extract_time_column(&df, &schema.time_column)?;
    let target = internal::extract_numeric_column(&df, &schema.target_column)?;

    let n = df.height();
    let k = schema.indicator_columns.len();
    let mut indicators = Array2::<f64>::zeros((n, k));
    for (j, column_name) in schema.indicator_columns.iter().enumerate() {
        let values = internal::extract_numeric_column(&df, column_name)?;
        indicators
            .column_mut(j)
            .assign(&ArrayView1::from(values.as_slice()));
    }

    let dataset = Dataset::from_columns(
        entities,
        times,
        indicators,
        target,
        schema.indicator_columns.clone(),
    )?;

    match dataset.time_range() {
        Some((first, last)) => log::info!(
            "Loaded {} observations for {} entities spanning {first}-{last}",
            dataset.len(),
            dataset.entity_count()
        ),
        None => log::info!("Loaded an empty dataset"),
    }

    Ok(dataset)
}

/// Internal helpers for turning polars columns into plain vectors.
mod internal {
    use super::*;

    pub(super) fn extract_entity_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<String>, DataError> {
        let column = df.column(column_name)?;
        if column.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = column.cast(&DataType::String)?;
        let values = casted
            .str()?
            .into_iter()
            .map(|v| v.map(|s| s.trim().to_string()).unwrap_or_default())
            .collect();
        Ok(values)
    }

    pub(super) fn extract_time_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<i64>, DataError> {
        let column = df.column(column_name)?;
        if column.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = column
            .cast(&DataType::Int64)
            .map_err(|_| wrong_type(column_name, "i64 (integer time)", column.dtype()))?;
        if casted.null_count() > 0 {
            return Err(wrong_type(column_name, "i64 (integer time)", column.dtype()));
        }
        Ok(casted.i64()?.into_no_null_iter().collect())
    }

    /// Numeric columns may contain missing cells; they come back as NaN. Text
    /// that does not parse as a number is a type error.
    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let column = df.column(column_name)?;
        let nulls_before = column.null_count();
        let casted = column
            .cast(&DataType::Float64)
            .map_err(|_| wrong_type(column_name, "f64 (numeric)", column.dtype()))?;
        if casted.null_count() > nulls_before {
            return Err(wrong_type(column_name, "f64 (numeric)", column.dtype()));
        }
        let values = casted
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        Ok(values)
    }

    fn wrong_type(column_name: &str, expected_type: &'static str, found: &DataType) -> DataError {
        DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type,
            found_type: format!("{found:?}"),
        }
    }
}
