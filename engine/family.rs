//! # Model Families
//!
//! The closed set of learners the engine knows how to train. Model selection
//! is a compile-time variant, not a runtime string: adding a family means
//! adding a variant here and giving it the uniform `fit` / `predict_proba`
//! capability, after which every consumer (node trainer, stacking ensemble,
//! combiner) picks it up through the same two enums.

use crate::boost::{BoostConfig, BoostModel};
use crate::forest::{FitError, ForestConfig, ForestModel};
use crate::neural::{NeuralConfig, NeuralModel};
use crate::types::Candidate;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a model family inside a combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FamilyId {
    /// Random forest (bagged CART).
    Forest,
    /// Gradient-boosted trees.
    Boosted,
    /// Attention-gated neural network.
    Neural,
    /// The stacking meta-model over the other families.
    Stacked,
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FamilyId::Forest => "forest",
            FamilyId::Boosted => "boosted",
            FamilyId::Neural => "neural",
            FamilyId::Stacked => "stacked",
        };
        f.write_str(name)
    }
}

/// An untrained learner: configuration plus the family tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LearnerSpec {
    Forest(ForestConfig),
    Boosted(BoostConfig),
    Neural(NeuralConfig),
}

impl LearnerSpec {
    pub fn fit(
        &self,
        x: ArrayView2<f64>,
        labels: &[String],
        seed: u64,
    ) -> Result<TrainedLearner, FitError> {
        match self {
            LearnerSpec::Forest(cfg) => {
                ForestModel::fit(cfg, x, labels, seed).map(TrainedLearner::Forest)
            }
            LearnerSpec::Boosted(cfg) => {
                BoostModel::fit(cfg, x, labels, seed).map(TrainedLearner::Boosted)
            }
            LearnerSpec::Neural(cfg) => {
                NeuralModel::fit(cfg, x, labels, seed).map(TrainedLearner::Neural)
            }
        }
    }
}

/// A trained learner of any family, with the uniform prediction capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrainedLearner {
    Forest(ForestModel),
    Boosted(BoostModel),
    Neural(NeuralModel),
}

impl TrainedLearner {
    pub fn classes(&self) -> &[String] {
        match self {
            TrainedLearner::Forest(m) => &m.classes,
            TrainedLearner::Boosted(m) => &m.classes,
            TrainedLearner::Neural(m) => &m.classes,
        }
    }

    pub fn n_features(&self) -> usize {
        match self {
            TrainedLearner::Forest(m) => m.n_features,
            TrainedLearner::Boosted(m) => m.n_features,
            TrainedLearner::Neural(m) => m.n_features,
        }
    }

    pub fn predict_proba_row(&self, row: &[f64]) -> Vec<f64> {
        match self {
            TrainedLearner::Forest(m) => m.predict_proba_row(row),
            TrainedLearner::Boosted(m) => m.predict_proba_row(row),
            TrainedLearner::Neural(m) => m.predict_proba_row(row),
        }
    }

    /// Impurity-based feature importance, where the family defines one.
    pub fn feature_importance(&self) -> Option<&[f64]> {
        match self {
            TrainedLearner::Forest(m) => Some(&m.importance),
            TrainedLearner::Boosted(m) => Some(&m.importance),
            TrainedLearner::Neural(_) => None,
        }
    }

    /// Ranked `(label, probability)` candidates for one row, ties broken by
    /// label so repeated calls rank identically.
    pub fn top_k_row(&self, row: &[f64], k: usize) -> Vec<Candidate> {
        let probs = self.predict_proba_row(row);
        rank_candidates(self.classes(), &probs, k)
    }
}

/// Sorts `(label, probability)` pairs descending by probability with a
/// deterministic label tie-break and keeps the first `k`.
pub fn rank_candidates(classes: &[String], probs: &[f64], k: usize) -> Vec<Candidate> {
    let mut ranked: Vec<Candidate> = classes
        .iter()
        .zip(probs.iter())
        .map(|(label, &probability)| Candidate {
            label: label.clone(),
            probability,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.label.cmp(&b.label))
    });
    ranked.truncate(k);
    ranked
}
