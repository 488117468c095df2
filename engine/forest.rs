// ========================================================================================
//
//                            RANDOM FOREST CLASSIFIER
//
// ========================================================================================
//
// Bootstrap-aggregated CART classifier used for the per-node taxonomy models
// and as an ensemble base learner. Trees are fit in parallel across the rayon
// pool; every tree's RNG is seeded from (seed, tree index) so the result is
// identical regardless of scheduling.
//
// `grow` implements the incremental-growth policy: later sample batches
// append trees fit on the new batch instead of refitting the whole forest,
// trading batch-order determinism for bounded peak memory. Callers version
// batch size and seed together with the artifact.

use crate::dtree::{DecisionTree, SplitConfig};
use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Cannot fit a classifier on an empty training set.")]
    EmptyTrainingSet,
    #[error("Training labels collapse to a single class ('{0}').")]
    SingleClass(String),
    #[error("Label and matrix row counts differ: {labels} labels for {rows} rows.")]
    LabelMismatch { labels: usize, rows: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_trees: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Balanced class weights (`n / (k * count)`) as sample weights.
    pub balanced: bool,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            balanced: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestModel {
    pub config: ForestConfig,
    pub classes: Vec<String>,
    pub n_features: usize,
    pub trees: Vec<DecisionTree>,
    /// Impurity-decrease feature importance, normalized to sum 1.
    pub importance: Vec<f64>,
    /// Raw (unnormalized) importance kept so `grow` can keep accumulating.
    raw_importance: Vec<f64>,
    seed: u64,
}

/// Sorted distinct labels plus each row encoded as an index into them.
pub fn encode_labels(labels: &[String]) -> (Vec<String>, Vec<usize>) {
    let mut classes: Vec<String> = labels.to_vec();
    classes.sort();
    classes.dedup();
    let encoded = labels
        .iter()
        .map(|l| classes.binary_search(l).unwrap_or(0))
        .collect();
    (classes, encoded)
}

/// Balanced per-class weights `n / (k * count(class))`.
pub fn balanced_weights(encoded: &[usize], n_classes: usize) -> Vec<f64> {
    let mut counts = vec![0usize; n_classes];
    for &c in encoded {
        counts[c] += 1;
    }
    let n = encoded.len() as f64;
    let k = n_classes as f64;
    counts
        .iter()
        .map(|&c| if c > 0 { n / (k * c as f64) } else { 0.0 })
        .collect()
}

impl ForestModel {
    pub fn fit(
        config: &ForestConfig,
        x: ArrayView2<f64>,
        labels: &[String],
        seed: u64,
    ) -> Result<Self, FitError> {
        let (classes, _) = encode_labels(labels);
        Self::fit_with_classes(config, x, labels, &classes, seed)
    }

    /// Fits against a fixed, sorted class vocabulary. Unlike [`fit`], the
    /// label slice does not have to contain every class, so batched callers
    /// can hand over a first batch that happens to be single-class as long
    /// as the vocabulary itself distinguishes at least two.
    ///
    /// [`fit`]: ForestModel::fit
    pub fn fit_with_classes(
        config: &ForestConfig,
        x: ArrayView2<f64>,
        labels: &[String],
        classes: &[String],
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
        if classes.len() < 2 {
            return Err(FitError::SingleClass(
                classes.first().cloned().unwrap_or_default(),
            ));
        }
        let encoded: Vec<usize> = labels
            .iter()
            .map(|l| classes.binary_search(l).unwrap_or(0))
            .collect();

        let mut model = Self {
            config: config.clone(),
            classes: classes.to_vec(),
            n_features: x.ncols(),
            trees: Vec::new(),
            importance: vec![0.0; x.ncols()],
            raw_importance: vec![0.0; x.ncols()],
            seed,
        };
        model.append_trees(config.n_trees, x, &encoded)?;
        Ok(model)
    }

    /// Appends `extra` trees fit on a (possibly new) sample batch. Labels
    /// must encode into the classes fixed at the first fit; unseen labels
    /// are ignored for weighting and mapped onto class 0, so callers pass
    /// batches drawn from the same label population.
    pub fn grow(
        &mut self,
        extra: usize,
        x: ArrayView2<f64>,
        labels: &[String],
    ) -> Result<(), FitError> {
        if x.nrows() == 0 {
            return Err(FitError::EmptyTrainingSet);
        }
        let encoded: Vec<usize> = labels
            .iter()
            .map(|l| self.classes.binary_search(l).unwrap_or(0))
            .collect();
        self.append_trees(extra, x, &encoded)
    }

    fn append_trees(
        &mut self,
        count: usize,
        x: ArrayView2<f64>,
        encoded: &[usize],
    ) -> Result<(), FitError> {
        let n_classes = self.classes.len();
        let class_weights = if self.config.balanced {
            balanced_weights(encoded, n_classes)
        } else {
            vec![1.0; n_classes]
        };
        let split_cfg = SplitConfig {
            max_depth: self.config.max_depth,
            min_samples_split: self.config.min_samples_split,
            min_samples_leaf: self.config.min_samples_leaf,
            max_features: Some(sqrt_features(x.ncols())),
        };
        let start = self.trees.len();

        let fitted: Vec<(DecisionTree, Vec<f64>)> = (0..count)
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(tree_seed(self.seed, start + t));
                let indices = bootstrap_indices(x.nrows(), &mut rng);
                let sub_x = x.select(ndarray::Axis(0), &indices);
                let sub_y: Vec<usize> = indices.iter().map(|&i| encoded[i]).collect();
                let sub_w: Vec<f64> = sub_y.iter().map(|&c| class_weights[c]).collect();
                let mut importance = vec![0.0; x.ncols()];
                let tree = DecisionTree::fit_classifier(
                    sub_x.view(),
                    &sub_y,
                    &sub_w,
                    n_classes,
                    &split_cfg,
                    &mut rng,
                    &mut importance,
                );
                (tree, importance)
            })
            .collect();

        for (tree, importance) in fitted {
            self.trees.push(tree);
            for (acc, v) in self.raw_importance.iter_mut().zip(importance) {
                *acc += v;
            }
        }
        let total: f64 = self.raw_importance.iter().sum();
        self.importance = if total > 0.0 {
            self.raw_importance.iter().map(|v| v / total).collect()
        } else {
            vec![0.0; self.n_features]
        };
        Ok(())
    }

    /// Mean of the member trees' leaf distributions.
    pub fn predict_proba_row(&self, row: &[f64]) -> Vec<f64> {
        let mut probs = vec![0.0; self.classes.len()];
        for tree in &self.trees {
            for (p, v) in probs.iter_mut().zip(tree.predict_row(row)) {
                *p += v;
            }
        }
        let n = self.trees.len().max(1) as f64;
        for p in probs.iter_mut() {
            *p /= n;
        }
        probs
    }
}

fn sqrt_features(n: usize) -> usize {
    ((n as f64).sqrt().floor() as usize).max(1)
}

fn tree_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(index as u64)
}

fn bootstrap_indices<R: Rng>(n: usize, rng: &mut R) -> Vec<usize> {
    (0..n).map(|_| rng.gen_range(0..n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn two_blob_data() -> (Array2<f64>, Vec<String>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..20 {
            let jitter = (i % 5) as f64 * 0.1;
            if i % 2 == 0 {
                rows.extend_from_slice(&[10.0 + jitter, 1.0 + jitter]);
                labels.push("R1b".to_string());
            } else {
                rows.extend_from_slice(&[1.0 + jitter, 10.0 + jitter]);
                labels.push("I1".to_string());
            }
        }
        (Array2::from_shape_vec((20, 2), rows).unwrap(), labels)
    }

    #[test]
    fn learns_separable_blobs() {
        let (x, labels) = two_blob_data();
        let cfg = ForestConfig {
            n_trees: 20,
            ..ForestConfig::default()
        };
        let model = ForestModel::fit(&cfg, x.view(), &labels, 11).unwrap();

        let probs = model.predict_proba_row(&[10.0, 1.0]);
        let r1b = model.classes.iter().position(|c| c == "R1b").unwrap();
        assert!(probs[r1b] > 0.8, "got {probs:?}");
    }

    #[test]
    fn single_class_is_rejected() {
        let x = Array2::from_shape_vec((3, 1), vec![1.0, 2.0, 3.0]).unwrap();
        let labels = vec!["R1b".to_string(); 3];
        let err = ForestModel::fit(&ForestConfig::default(), x.view(), &labels, 1).unwrap_err();
        assert!(matches!(err, FitError::SingleClass(_)));
    }

    #[test]
    fn fit_is_deterministic_for_a_seed() {
        let (x, labels) = two_blob_data();
        let cfg = ForestConfig {
            n_trees: 8,
            ..ForestConfig::default()
        };
        let a = ForestModel::fit(&cfg, x.view(), &labels, 5).unwrap();
        let b = ForestModel::fit(&cfg, x.view(), &labels, 5).unwrap();
        assert_eq!(
            a.predict_proba_row(&[5.0, 5.0]),
            b.predict_proba_row(&[5.0, 5.0])
        );
    }

    #[test]
    fn fixed_vocabulary_tolerates_single_class_batch() {
        let x = Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let labels = vec!["R1b".to_string(); 4];
        let classes = vec!["I1".to_string(), "R1b".to_string()];
        let model = ForestModel::fit_with_classes(
            &ForestConfig {
                n_trees: 5,
                ..ForestConfig::default()
            },
            x.view(),
            &labels,
            &classes,
            3,
        )
        .unwrap();

        let probs = model.predict_proba_row(&[2.0]);
        assert_eq!(model.classes, classes);
        assert!(probs[1] > 0.99);
    }

    #[test]
    fn grow_appends_capacity() {
        let (x, labels) = two_blob_data();
        let cfg = ForestConfig {
            n_trees: 5,
            ..ForestConfig::default()
        };
        let mut model = ForestModel::fit(&cfg, x.view(), &labels, 5).unwrap();
        assert_eq!(model.trees.len(), 5);
        model.grow(10, x.view(), &labels).unwrap();
        assert_eq!(model.trees.len(), 15);
    }

    #[test]
    fn importance_is_normalized() {
        let (x, labels) = two_blob_data();
        let model =
            ForestModel::fit(&ForestConfig::default(), x.view(), &labels, 5).unwrap();
        let sum: f64 = model.importance.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
