// ========================================================================================
//
//                         GRADIENT-BOOSTED TREE CLASSIFIER
//
// ========================================================================================
//
// Multiclass gradient boosting over shallow regression trees: one tree per
// class per round, fit to the softmax residual `1[y = k] - p_k`. This is the
// tree-boosted model family and also serves as the stacking meta-learner.
//
// Rounds are inherently sequential; within a round the per-class trees are
// independent and fit in parallel with seeds derived from
// (seed, round, class), so a fixed seed reproduces the model exactly.

use crate::dtree::{DecisionTree, SplitConfig};
use crate::forest::{FitError, encode_labels};
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostConfig {
    pub n_rounds: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Fraction of rows sampled (without replacement) per round.
    pub subsample: f64,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            n_rounds: 100,
            learning_rate: 0.1,
            max_depth: 3,
            min_samples_leaf: 1,
            subsample: 1.0,
        }
    }
}

/// Meta-learner profile used on stacking matrices: fewer, shallower rounds.
pub fn meta_config() -> BoostConfig {
    BoostConfig {
        n_rounds: 50,
        max_depth: 3,
        ..BoostConfig::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostModel {
    pub config: BoostConfig,
    pub classes: Vec<String>,
    pub n_features: usize,
    /// `rounds[r][k]` is the round-`r` regression tree for class `k`.
    pub rounds: Vec<Vec<DecisionTree>>,
    pub importance: Vec<f64>,
}

impl BoostModel {
    pub fn fit(
        config: &BoostConfig,
        x: ArrayView2<f64>,
        labels: &[String],
        seed: u64,
    ) -> Result<Self, FitError> {
        if x.nrows() == 0 {
            return Err(FitError::EmptyTrainingSet);
        }
        if labels.len() != x.nrows() {
            return Err(FitError::LabelMismatch {
                labels: labels.len(),
                rows: x.nrows(),
            });
        }
        let (classes, encoded) = encode_labels(labels);
        if classes.len() < 2 {
            return Err(FitError::SingleClass(classes[0].clone()));
        }
        let n = x.nrows();
        let k = classes.len();
        let split_cfg = SplitConfig {
            max_depth: Some(config.max_depth),
            min_samples_split: 2,
            min_samples_leaf: config.min_samples_leaf,
            max_features: None,
        };

        // Raw scores F[i][k], all zeros at the start (uniform prior).
        let mut scores = Array2::<f64>::zeros((n, k));
        let mut rounds: Vec<Vec<DecisionTree>> = Vec::with_capacity(config.n_rounds);
        let mut raw_importance = vec![0.0; x.ncols()];

        for round in 0..config.n_rounds {
            let probs = softmax_rows(&scores);

            let row_set: Vec<usize> = if config.subsample < 1.0 {
                let take = ((n as f64) * config.subsample).ceil() as usize;
                let take = take.clamp(1, n);
                let mut rng = StdRng::seed_from_u64(round_seed(seed, round, usize::MAX));
                let mut picked = sample(&mut rng, n, take).into_vec();
                picked.sort_unstable();
                picked
            } else {
                (0..n).collect()
            };
            let sub_x = x.select(ndarray::Axis(0), &row_set);

            let fitted: Vec<(DecisionTree, Vec<f64>)> = (0..k)
                .into_par_iter()
                .map(|class| {
                    let residuals: Vec<f64> = row_set
                        .iter()
                        .map(|&i| {
                            let target = if encoded[i] == class { 1.0 } else { 0.0 };
                            target - probs[[i, class]]
                        })
                        .collect();
                    let mut rng = StdRng::seed_from_u64(round_seed(seed, round, class));
                    let mut importance = vec![0.0; x.ncols()];
                    let tree = DecisionTree::fit_regressor(
                        sub_x.view(),
                        &residuals,
                        &split_cfg,
                        &mut rng,
                        &mut importance,
                    );
                    (tree, importance)
                })
                .collect();

            let mut round_trees = Vec::with_capacity(k);
            for (class, (tree, importance)) in fitted.into_iter().enumerate() {
                for i in 0..n {
                    let row = x.row(i).to_vec();
                    let step = tree.predict_row(&row)[0];
                    scores[[i, class]] += config.learning_rate * step;
                }
                for (acc, v) in raw_importance.iter_mut().zip(importance) {
                    *acc += v;
                }
                round_trees.push(tree);
            }
            rounds.push(round_trees);
        }

        let total: f64 = raw_importance.iter().sum();
        let importance = if total > 0.0 {
            raw_importance.iter().map(|v| v / total).collect()
        } else {
            vec![0.0; x.ncols()]
        };

        Ok(Self {
            config: config.clone(),
            classes,
            n_features: x.ncols(),
            rounds,
            importance,
        })
    }

    pub fn predict_proba_row(&self, row: &[f64]) -> Vec<f64> {
        let k = self.classes.len();
        let mut scores = vec![0.0; k];
        for round in &self.rounds {
            for (class, tree) in round.iter().enumerate() {
                scores[class] += self.config.learning_rate * tree.predict_row(row)[0];
            }
        }
        softmax(&scores)
    }
}

fn round_seed(seed: u64, round: usize, class: usize) -> u64 {
    seed.wrapping_mul(0x517c_c1b7_2722_0a95)
        .wrapping_add((round as u64) << 20)
        .wrapping_add(class as u64)
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

fn softmax_rows(scores: &Array2<f64>) -> Array2<f64> {
    let mut out = scores.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
    out
}
