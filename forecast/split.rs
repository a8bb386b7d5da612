//! Train/test partitioning of the engineered table.
//!
//! Both strategies produce disjoint, exhaustive subsets and both keep the
//! original (entity, time) row order inside each subset.

use crate::features::EngineeredTable;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum SplitStrategy {
    /// Rows with `time < threshold` train, the rest test.
    Temporal { threshold: i64 },
    /// A seeded shuffle selects `ceil(test_fraction * n)` test rows.
    Random { test_fraction: f64, seed: u64 },
}

impl SplitStrategy {
    pub fn describe(&self) -> String {
        match self {
            SplitStrategy::Temporal { threshold } => {
                format!("temporal (train < {threshold} <= test)")
            }
            SplitStrategy::Random {
                test_fraction,
                seed,
            } => format!(
                "random ({:.0}% test, seed {seed})",
                test_fraction * 100.0
            ),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SplitError {
    #[error(
        "Not enough data to split: {train_rows} training rows and {test_rows} test rows. Both subsets must be non-empty."
    )]
    InsufficientData { train_rows: usize, test_rows: usize },
    #[error("The test fraction must lie strictly between 0 and 1, got {0}.")]
    InvalidFraction(f64),
}

#[derive(Debug, Clone)]
pub struct Split {
    pub train: EngineeredTable,
    pub test: EngineeredTable,
}

/// Partitions `table` according to `strategy`.
pub fn split(table: &EngineeredTable, strategy: &SplitStrategy) -> Result<Split, SplitError> {
    let is_test: Vec<bool> = match strategy {
        SplitStrategy::Temporal { threshold } => {
            table.times.iter().map(|&t| t >= *threshold).collect()
        }
        SplitStrategy::Random {
            test_fraction,
            seed,
        } => random_membership(table.len(), *test_fraction, *seed)?,
    };

    let (test_rows, train_rows): (Vec<usize>, Vec<usize>) =
        (0..table.len()).partition(|&i| is_test[i]);

    if train_rows.is_empty() || test_rows.is_empty() {
        return Err(SplitError::InsufficientData {
            train_rows: train_rows.len(),
            test_rows: test_rows.len(),
        });
    }

    log::info!(
        "Split {} rows {}: {} train, {} test",
        table.len(),
        strategy.describe(),
        train_rows.len(),
        test_rows.len()
    );

    Ok(Split {
        train: table.select(&train_rows),
        test: table.select(&test_rows),
    })
}

fn random_membership(n: usize, test_fraction: f64, seed: u64) -> Result<Vec<bool>, SplitError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(SplitError::InvalidFraction(test_fraction));
    }
    let n_test = ((test_fraction * n as f64).ceil() as usize).min(n);

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let mut membership = vec![false; n];
    for &i in &indices[..n_test] {
        membership[i] = true;
    }
    Ok(membership)
}
