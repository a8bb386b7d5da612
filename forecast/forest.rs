//! # Random Forest Regressor
//!
//! A bagged ensemble of CART regression trees. Splits maximise the reduction
//! in squared error, leaves predict the mean label of their rows, and the
//! ensemble predicts the mean over trees.
//!
//! Fitting is deterministic for a fixed configuration and input order: tree
//! `t` draws its bootstrap sample and its candidate features from
//! `StdRng::seed_from_u64(seed + t)`, trees are grown in parallel with rayon
//! and collected in index order.
//!
//! Trees are stored as flat parallel arrays (node `i` is described by
//! `feature[i]`, `threshold[i]`, `left[i]`, `right[i]` and `value[i]`) so the
//! serialized artifact stays compact and reloads bit-for-bit. The root is
//! node 0, so a child index of 0 marks a leaf.

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of candidate features examined at each split.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxFeatures {
    #[default]
    All,
    Sqrt,
    /// A fraction of the features in (0, 1], at least one.
    Fraction(f64),
}

impl MaxFeatures {
    fn resolve(self, n_features: usize) -> usize {
        let m = match self {
            MaxFeatures::All => n_features,
            MaxFeatures::Sqrt => (n_features as f64).sqrt() as usize,
            MaxFeatures::Fraction(f) => (f * n_features as f64) as usize,
        };
        m.clamp(1usize.min(n_features), n_features)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForestConfig {
    pub n_trees: usize,
    /// Depth of the deepest allowed node; the root has depth 0.
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 12,
            min_samples_split: 5,
            min_samples_leaf: 2,
            max_features: MaxFeatures::All,
            bootstrap: true,
            seed: 42,
        }
    }
}

#[derive(Error, Debug)]
pub enum ForestError {
    #[error("Cannot fit a forest on an empty training set.")]
    EmptyTrainingSet,
    #[error("Feature matrix has {rows} rows but {labels} labels were given.")]
    ShapeMismatch { rows: usize, labels: usize },
    #[error("Input has {found} feature columns, but the forest was fitted on {expected}.")]
    FeatureCountMismatch { found: usize, expected: usize },
    #[error("Non-finite value found in the training data at row {row}.")]
    NonFiniteInput { row: usize },
    #[error("Forest configuration is invalid: {0}")]
    InvalidConfig(String),
    #[error("Forest structure is corrupt: {0}")]
    Corrupt(String),
}

/// One fitted regression tree in flat-array form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    feature: Vec<usize>,
    threshold: Vec<f64>,
    left: Vec<usize>,
    right: Vec<usize>,
    value: Vec<f64>,
}

impl RegressionTree {
    fn new() -> Self {
        Self {
            feature: Vec::new(),
            threshold: Vec::new(),
            left: Vec::new(),
            right: Vec::new(),
            value: Vec::new(),
        }
    }

    fn push_leaf(&mut self, value: f64) -> usize {
        self.feature.push(0);
        self.threshold.push(0.0);
        self.left.push(0);
        self.right.push(0);
        self.value.push(value);
        self.value.len() - 1
    }

    pub fn node_count(&self) -> usize {
        self.value.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.left.iter().filter(|&&l| l == 0).count()
    }

    /// Longest root-to-leaf path, counted in edges.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            if self.left[node] != 0 {
                stack.push((self.left[node], depth + 1));
                stack.push((self.right[node], depth + 1));
            }
        }
        deepest
    }

    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        let mut node = 0;
        while self.left[node] != 0 {
            node = if row[self.feature[node]] <= self.threshold[node] {
                self.left[node]
            } else {
                self.right[node]
            };
        }
        self.value[node]
    }

    fn check(&self, n_features: usize) -> Result<(), String> {
        let n = self.value.len();
        if n == 0 {
            return Err("tree has no nodes".to_string());
        }
        if [self.feature.len(), self.threshold.len(), self.left.len(), self.right.len()]
            .iter()
            .any(|&len| len != n)
        {
            return Err("node arrays differ in length".to_string());
        }
        for node in 0..n {
            let (l, r) = (self.left[node], self.right[node]);
            if l == 0 && r == 0 {
                continue;
            }
            // Children are always created after their parent, so they have larger indices.
            if l <= node || r <= node || l >= n || r >= n {
                return Err(format!("node {node} has invalid children ({l}, {r})"));
            }
            if self.feature[node] >= n_features {
                return Err(format!(
                    "node {node} splits on feature {} of {n_features}",
                    self.feature[node]
                ));
            }
        }
        Ok(())
    }
}

/// The fitted ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionForest {
    n_features: usize,
    /// Impurity-based importances, normalised to sum to 1 when any tree split.
    importances: Vec<f64>,
    trees: Vec<RegressionTree>,
}

impl RegressionForest {
    /// Fits a forest on `x` (shape `[n_samples, n_features]`) and `y`.
    pub fn fit<'a>(
        x: ArrayView2<'a, f64>,
        y: ArrayView1<'a, f64>,
        config: &'a ForestConfig,
    ) -> Result<Self, ForestError> {
        let (n_samples, n_features) = x.dim();
        if n_samples == 0 {
            return Err(ForestError::EmptyTrainingSet);
        }
        if y.len() != n_samples {
            return Err(ForestError::ShapeMismatch {
                rows: n_samples,
                labels: y.len(),
            });
        }
        if config.n_trees == 0 || config.min_samples_leaf == 0 || config.min_samples_split < 2 {
            return Err(ForestError::InvalidConfig(format!(
                "n_trees={}, min_samples_leaf={}, min_samples_split={}",
                config.n_trees, config.min_samples_leaf, config.min_samples_split
            )));
        }
        if let Some(row) = (0..n_samples)
            .find(|&i| !y[i].is_finite() || x.row(i).iter().any(|v| !v.is_finite()))
        {
            return Err(ForestError::NonFiniteInput { row });
        }

        let max_features = config.max_features.resolve(n_features);
        log::info!(
            "Fitting {} trees on {n_samples} samples x {n_features} features (max_depth={}, max_features={max_features})",
            config.n_trees,
            config.max_depth
        );

        let pb = ProgressBar::new(config.n_trees as u64);
        if let Ok(style) =
            ProgressStyle::with_template(">  - Trees [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
        }

        let fitted: Vec<(RegressionTree, Vec<f64>)> = (0..config.n_trees)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(t as u64));
                let mut rows: Vec<usize> = if config.bootstrap {
                    (0..n_samples).map(|_| rng.gen_range(0..n_samples)).collect()
                } else {
                    (0..n_samples).collect()
                };
                let mut builder = TreeBuilder {
                    x,
                    y,
                    config,
                    max_features,
                    tree: RegressionTree::new(),
                    importances: vec![0.0; n_features],
                    rng,
                };
                builder.grow(&mut rows, 0);
                log::debug!(
                    "Tree {t}: {} nodes, depth {}",
                    builder.tree.node_count(),
                    builder.tree.depth()
                );
                pb.inc(1);
                (builder.tree, builder.importances)
            })
            .collect();
        pb.finish_with_message("Done.");

        let mut importances = vec![0.0; n_features];
        let mut contributing = 0usize;
        let mut trees = Vec::with_capacity(fitted.len());
        for (tree, tree_importances) in fitted {
            let total: f64 = tree_importances.iter().sum();
            if total > 0.0 {
                contributing += 1;
                for (acc, v) in importances.iter_mut().zip(&tree_importances) {
                    *acc += v / total;
                }
            }
            trees.push(tree);
        }
        if contributing > 0 {
            for v in &mut importances {
                *v /= contributing as f64;
            }
        }

        Ok(Self {
            n_features,
            importances,
            trees,
        })
    }

    /// Predicts one value per row of `x`.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ForestError> {
        if x.ncols() != self.n_features {
            return Err(ForestError::FeatureCountMismatch {
                found: x.ncols(),
                expected: self.n_features,
            });
        }
        Ok(x.rows().into_iter().map(|row| self.mean_over_trees(row)).collect())
    }

    /// Predicts a single input vector.
    pub fn predict_row(&self, row: ArrayView1<f64>) -> Result<f64, ForestError> {
        if row.len() != self.n_features {
            return Err(ForestError::FeatureCountMismatch {
                found: row.len(),
                expected: self.n_features,
            });
        }
        Ok(self.mean_over_trees(row))
    }

    fn mean_over_trees(&self, row: ArrayView1<f64>) -> f64 {
        let sum: f64 = self.trees.iter().map(|t| t.predict(row)).sum();
        sum / self.trees.len() as f64
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }

    /// Verifies that a deserialized forest can be evaluated without indexing
    /// out of bounds.
    pub fn check_structure(&self) -> Result<(), ForestError> {
        if self.trees.is_empty() {
            return Err(ForestError::Corrupt("forest has no trees".to_string()));
        }
        if self.importances.len() != self.n_features {
            return Err(ForestError::Corrupt(format!(
                "{} importances for {} features",
                self.importances.len(),
                self.n_features
            )));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.check(self.n_features)
                .map_err(|msg| ForestError::Corrupt(format!("tree {i}: {msg}")))?;
        }
        Ok(())
    }
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    config: &'a ForestConfig,
    max_features: usize,
    tree: RegressionTree,
    importances: Vec<f64>,
    rng: StdRng,
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

impl TreeBuilder<'_> {
    /// Grows the subtree over `rows` and returns its root node index.
    fn grow(&mut self, rows: &mut [usize], depth: usize) -> usize {
        let n = rows.len() as f64;
        let sum: f64 = rows.iter().map(|&i| self.y[i]).sum();
        let sum_sq: f64 = rows.iter().map(|&i| self.y[i] * self.y[i]).sum();
        let node = self.tree.push_leaf(sum / n);

        let sse = sum_sq - sum * sum / n;
        if depth >= self.config.max_depth
            || rows.len() < self.config.min_samples_split
            || rows.len() < 2 * self.config.min_samples_leaf
            || sse <= 0.0
        {
            return node;
        }

        let Some(best) = self.best_split(rows, sse) else {
            return node;
        };

        let mid = partition(rows, |i| self.x[[i, best.feature]] <= best.threshold);
        self.importances[best.feature] += best.gain;

        let (left_rows, right_rows) = rows.split_at_mut(mid);
        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.tree.feature[node] = best.feature;
        self.tree.threshold[node] = best.threshold;
        self.tree.left[node] = left;
        self.tree.right[node] = right;
        node
    }

    fn best_split(&mut self, rows: &[usize], parent_sse: f64) -> Option<SplitCandidate> {
        let n_features = self.x.ncols();
        let candidates: Vec<usize> = if self.max_features < n_features {
            rand::seq::index::sample(&mut self.rng, n_features, self.max_features).into_vec()
        } else {
            (0..n_features).collect()
        };

        let min_leaf = self.config.min_samples_leaf;
        let n = rows.len();
        let total_sum: f64 = rows.iter().map(|&i| self.y[i]).sum();
        let total_sq: f64 = rows.iter().map(|&i| self.y[i] * self.y[i]).sum();

        let mut best: Option<SplitCandidate> = None;
        let mut pairs: Vec<(f64, f64)> = Vec::with_capacity(n);
        for feature in candidates {
            pairs.clear();
            pairs.extend(rows.iter().map(|&i| (self.x[[i, feature]], self.y[i])));
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_sum = 0.0;
            let mut left_sq = 0.0;
            for k in 1..n {
                let (prev_x, prev_y) = pairs[k - 1];
                left_sum += prev_y;
                left_sq += prev_y * prev_y;

                let next_x = pairs[k].0;
                if k < min_leaf || n - k < min_leaf || prev_x == next_x {
                    continue;
                }

                let (nl, nr) = (k as f64, (n - k) as f64);
                let right_sum = total_sum - left_sum;
                let right_sq = total_sq - left_sq;
                let child_sse = (left_sq - left_sum * left_sum / nl)
                    + (right_sq - right_sum * right_sum / nr);
                let gain = parent_sse - child_sse;
                if gain > 0.0 && best.as_ref().is_none_or(|b| gain > b.gain) {
                    let mid = prev_x + (next_x - prev_x) / 2.0;
                    let threshold = if mid < next_x { mid } else { prev_x };
                    best = Some(SplitCandidate {
                        feature,
                        threshold,
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// Reorders `rows` so that rows satisfying `goes_left` come first and returns
/// how many there are.
fn partition(rows: &mut [usize], goes_left: impl Fn(usize) -> bool) -> usize {
    let mut mid = 0;
    for k in 0..rows.len() {
        if goes_left(rows[k]) {
            rows.swap(mid, k);
            mid += 1;
        }
    }
    mid
}
