// ========================================================================================
//
//                               DECISION TREE CORE
//
// ========================================================================================
//
// A single CART implementation shared by the forest learner (gini criterion,
// class-distribution leaves) and the gradient-boosting learner (variance
// criterion, scalar leaves). Trees are stored as a flat node arena so a
// trained tree is trivially serializable and prediction is a tight loop over
// indices, never a pointer chase.
//
// Determinism: for a fixed seed the same tree is produced on every fit. The
// feature subsample per split is drawn from the caller's RNG and sorted, and
// ties between equal-gain splits always resolve to the first candidate in
// feature order.

use ndarray::ArrayView2;
use rand::Rng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features considered per split; `None` means all.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_features: Option<usize>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        /// Class distribution (classification) or a single mean (regression).
        value: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
    /// Width of leaf values: `n_classes` for classifiers, 1 for regressors.
    pub n_values: usize,
}

impl DecisionTree {
    /// Fits a classification tree on encoded labels with per-sample weights.
    /// `importance` accumulates impurity-decrease per feature across calls.
    pub fn fit_classifier<'a, R: Rng>(
        x: ArrayView2<'a, f64>,
        y: &'a [usize],
        weights: &'a [f64],
        n_classes: usize,
        cfg: &'a SplitConfig,
        rng: &mut R,
        importance: &'a mut [f64],
    ) -> Self {
        let indices: Vec<usize> = (0..x.nrows()).collect();
        let mut builder = TreeBuilder {
            x,
            targets: Targets::Classes {
                y,
                weights,
                n_classes,
            },
            cfg,
            nodes: Vec::new(),
            importance,
        };
        builder.build(indices, 0, rng);
        DecisionTree {
            nodes: builder.nodes,
            n_values: n_classes,
        }
    }

    /// Fits a regression tree on continuous targets (used for boosting
    /// residuals). Samples are implicitly unit-weighted.
    pub fn fit_regressor<'a, R: Rng>(
        x: ArrayView2<'a, f64>,
        targets: &'a [f64],
        cfg: &'a SplitConfig,
        rng: &mut R,
        importance: &'a mut [f64],
    ) -> Self {
        let indices: Vec<usize> = (0..x.nrows()).collect();
        let mut builder = TreeBuilder {
            x,
            targets: Targets::Values { t: targets },
            cfg,
            nodes: Vec::new(),
            importance,
        };
        builder.build(indices, 0, rng);
        DecisionTree {
            nodes: builder.nodes,
            n_values: 1,
        }
    }

    /// Leaf value for one row: the class distribution or `[mean]`.
    pub fn predict_row(&self, row: &[f64]) -> &[f64] {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                TreeNode::Leaf { value } => return value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

enum Targets<'a> {
    Classes {
        y: &'a [usize],
        weights: &'a [f64],
        n_classes: usize,
    },
    Values {
        t: &'a [f64],
    },
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f64>,
    targets: Targets<'a>,
    cfg: &'a SplitConfig,
    nodes: Vec<TreeNode>,
    importance: &'a mut [f64],
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

impl<'a> TreeBuilder<'a> {
    fn build<R: Rng>(&mut self, indices: Vec<usize>, depth: usize, rng: &mut R) -> usize {
        let depth_reached = self
            .cfg
            .max_depth
            .is_some_and(|limit| depth >= limit);
        if depth_reached || indices.len() < self.cfg.min_samples_split || self.is_pure(&indices) {
            return self.push_leaf(&indices);
        }

        match self.best_split(&indices, rng) {
            Some(split) => {
                self.importance[split.feature] += split.gain;
                let feature = split.feature;
                let threshold = split.threshold;
                let at = self.nodes.len();
                self.nodes.push(TreeNode::Split {
                    feature,
                    threshold,
                    left: 0,
                    right: 0,
                });
                let left = self.build(split.left, depth + 1, rng);
                let right = self.build(split.right, depth + 1, rng);
                self.nodes[at] = TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                };
                at
            }
            None => self.push_leaf(&indices),
        }
    }

    fn is_pure(&self, indices: &[usize]) -> bool {
        match &self.targets {
            Targets::Classes { y, .. } => {
                let first = y[indices[0]];
                indices.iter().all(|&i| y[i] == first)
            }
            Targets::Values { t } => {
                let first = t[indices[0]];
                indices.iter().all(|&i| t[i] == first)
            }
        }
    }

    fn push_leaf(&mut self, indices: &[usize]) -> usize {
        let value = match &self.targets {
            Targets::Classes {
                y,
                weights,
                n_classes,
            } => {
                let mut counts = vec![0.0; *n_classes];
                let mut total = 0.0;
                for &i in indices {
                    counts[y[i]] += weights[i];
                    total += weights[i];
                }
                if total > 0.0 {
                    for c in counts.iter_mut() {
                        *c /= total;
                    }
                }
                counts
            }
            Targets::Values { t } => {
                let mean = indices.iter().map(|&i| t[i]).sum::<f64>() / indices.len() as f64;
                vec![mean]
            }
        };
        self.nodes.push(TreeNode::Leaf { value });
        self.nodes.len() - 1
    }

    fn candidate_features<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        let n_features = self.x.ncols();
        match self.cfg.max_features {
            Some(k) if k < n_features => {
                let mut picked: Vec<usize> = sample(rng, n_features, k).into_vec();
                picked.sort_unstable();
                picked
            }
            _ => (0..n_features).collect(),
        }
    }

    fn best_split<R: Rng>(&self, indices: &[usize], rng: &mut R) -> Option<BestSplit> {
        let mut best: Option<BestSplit> = None;
        for feature in self.candidate_features(rng) {
            let mut order = indices.to_vec();
            order.sort_by(|&a, &b| {
                self.x[[a, feature]]
                    .partial_cmp(&self.x[[b, feature]])
                    .unwrap_or(Ordering::Equal)
            });
            if let Some((threshold, gain, split_at)) = self.scan_feature(&order, feature)
                && best.as_ref().is_none_or(|b| gain > b.gain)
            {
                let (left, right) = order.split_at(split_at);
                best = Some(BestSplit {
                    feature,
                    threshold,
                    gain,
                    left: left.to_vec(),
                    right: right.to_vec(),
                });
            }
        }
        best
    }

    /// Scans one sorted feature for the impurity-minimizing threshold.
    /// Returns `(threshold, gain, split_position)`.
    fn scan_feature(&self, order: &[usize], feature: usize) -> Option<(f64, f64, usize)> {
        match &self.targets {
            Targets::Classes {
                y,
                weights,
                n_classes,
            } => self.scan_gini(order, feature, y, weights, *n_classes),
            Targets::Values { t } => self.scan_variance(order, feature, t),
        }
    }

    fn scan_gini(
        &self,
        order: &[usize],
        feature: usize,
        y: &[usize],
        weights: &[f64],
        n_classes: usize,
    ) -> Option<(f64, f64, usize)> {
        let mut total_counts = vec![0.0; n_classes];
        let mut total_w = 0.0;
        for &i in order {
            total_counts[y[i]] += weights[i];
            total_w += weights[i];
        }
        if total_w <= 0.0 {
            return None;
        }
        let parent = weighted_gini(&total_counts, total_w) * total_w;

        let mut left_counts = vec![0.0; n_classes];
        let mut left_w = 0.0;
        let mut best: Option<(f64, f64, usize)> = None;
        for pos in 1..order.len() {
            let prev = order[pos - 1];
            left_counts[y[prev]] += weights[prev];
            left_w += weights[prev];

            let prev_value = self.x[[prev, feature]];
            let this_value = self.x[[order[pos], feature]];
            if prev_value == this_value {
                continue;
            }
            if pos < self.cfg.min_samples_leaf || order.len() - pos < self.cfg.min_samples_leaf {
                continue;
            }
            let right_w = total_w - left_w;
            if left_w <= 0.0 || right_w <= 0.0 {
                continue;
            }
            let right_counts: Vec<f64> = total_counts
                .iter()
                .zip(left_counts.iter())
                .map(|(t, l)| t - l)
                .collect();
            let children = weighted_gini(&left_counts, left_w) * left_w
                + weighted_gini(&right_counts, right_w) * right_w;
            let gain = parent - children;
            if gain > 0.0 && best.as_ref().is_none_or(|(_, g, _)| gain > *g) {
                best = Some(((prev_value + this_value) / 2.0, gain, pos));
            }
        }
        best
    }

    fn scan_variance(&self, order: &[usize], feature: usize, t: &[f64]) -> Option<(f64, f64, usize)> {
        let n = order.len() as f64;
        let total_sum: f64 = order.iter().map(|&i| t[i]).sum();
        let total_sq: f64 = order.iter().map(|&i| t[i] * t[i]).sum();
        let parent = total_sq - total_sum * total_sum / n;

        let mut left_sum = 0.0;
        let mut left_sq = 0.0;
        let mut best: Option<(f64, f64, usize)> = None;
        for pos in 1..order.len() {
            let prev = order[pos - 1];
            left_sum += t[prev];
            left_sq += t[prev] * t[prev];

            let prev_value = self.x[[prev, feature]];
            let this_value = self.x[[order[pos], feature]];
            if prev_value == this_value {
                continue;
            }
            if pos < self.cfg.min_samples_leaf || order.len() - pos < self.cfg.min_samples_leaf {
                continue;
            }
            let left_n = pos as f64;
            let right_n = n - left_n;
            let right_sum = total_sum - left_sum;
            let right_sq = total_sq - left_sq;
            let children = (left_sq - left_sum * left_sum / left_n)
                + (right_sq - right_sum * right_sum / right_n);
            let gain = parent - children;
            if gain > 1e-12 && best.as_ref().is_none_or(|(_, g, _)| gain > *g) {
                best = Some(((prev_value + this_value) / 2.0, gain, pos));
            }
        }
        best
    }
}

fn weighted_gini(counts: &[f64], total: f64) -> f64 {
    let mut sum_sq = 0.0;
    for c in counts {
        let p = c / total;
        sum_sq += p * p;
    }
    1.0 - sum_sq
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn separable_classes_split_on_the_obvious_threshold() {
        let x = array![[1.0], [2.0], [10.0], [11.0]];
        let y = vec![0, 0, 1, 1];
        let w = vec![1.0; 4];
        let mut rng = StdRng::seed_from_u64(7);
        let mut imp = vec![0.0; 1];
        let tree = DecisionTree::fit_classifier(
            x.view(),
            &y,
            &w,
            2,
            &SplitConfig::default(),
            &mut rng,
            &mut imp,
        );

        assert_eq!(tree.predict_row(&[1.5]), &[1.0, 0.0]);
        assert_eq!(tree.predict_row(&[10.5]), &[0.0, 1.0]);
        assert!(imp[0] > 0.0);
    }

    #[test]
    fn pure_node_is_a_single_leaf() {
        let x = array![[1.0], [2.0], [3.0]];
        let y = vec![1, 1, 1];
        let w = vec![1.0; 3];
        let mut rng = StdRng::seed_from_u64(7);
        let mut imp = vec![0.0; 1];
        let tree = DecisionTree::fit_classifier(
            x.view(),
            &y,
            &w,
            2,
            &SplitConfig::default(),
            &mut rng,
            &mut imp,
        );
        assert_eq!(tree.nodes.len(), 1);
    }

    #[test]
    fn regressor_fits_a_step_function() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let t = vec![-1.0, -1.0, 1.0, 1.0];
        let mut rng = StdRng::seed_from_u64(7);
        let mut imp = vec![0.0; 1];
        let tree =
            DecisionTree::fit_regressor(x.view(), &t, &SplitConfig::default(), &mut rng, &mut imp);
        assert_eq!(tree.predict_row(&[0.5]), &[-1.0]);
        assert_eq!(tree.predict_row(&[2.5]), &[1.0]);
    }

    #[test]
    fn same_seed_same_tree() {
        let x = array![
            [1.0, 5.0],
            [2.0, 3.0],
            [9.0, 1.0],
            [8.0, 2.0],
            [1.5, 4.0],
            [8.5, 1.5]
        ];
        let y = vec![0, 0, 1, 1, 0, 1];
        let w = vec![1.0; 6];
        let cfg = SplitConfig {
            max_features: Some(1),
            ..SplitConfig::default()
        };
        let mut imp_a = vec![0.0; 2];
        let mut imp_b = vec![0.0; 2];
        let a = DecisionTree::fit_classifier(
            x.view(),
            &y,
            &w,
            2,
            &cfg,
            &mut StdRng::seed_from_u64(3),
            &mut imp_a,
        );
        let b = DecisionTree::fit_classifier(
            x.view(),
            &y,
            &w,
            2,
            &cfg,
            &mut StdRng::seed_from_u64(3),
            &mut imp_b,
        );
        assert_eq!(
            toml::to_string(&a).unwrap(),
            toml::to_string(&b).unwrap()
        );
    }
}
