// ========================================================================================
//
//                            STACKING ENSEMBLE
//
// ========================================================================================
//
// Heterogeneous stacking for one flat classification level. K base learners
// are cross-validated with stratified folds; the out-of-fold probability
// vectors — never in-fold ones — are concatenated in fixed member order into
// the stacking matrix the meta-learner fits on. At inference the members,
// refit on the full training set, fill the same layout with live
// probabilities.
//
// Every probability that leaves this module is calibrated. Each base member
// is wrapped in per-class calibration (fitted on its own held-out folds), so
// the stacking matrix, the live stacking features, and the per-family
// outputs handed to the combiner are likelihoods rather than raw scores; the
// meta-learner gets the same wrapping on top of the stacking matrix.
//
// Probability blocks are always `n_classes` wide per member, with a member
// model's own class list remapped onto the level's global class order, so a
// fold that never saw a rare class still produces a block of the right
// shape.

use crate::boost;
use crate::ensemble::calibration::{CalibratedClassifier, CalibrationMethod};
use crate::ensemble::folds::{stratified_folds, training_rows};
use crate::ensemble::metrics::{LevelMetrics, brier_score, f1_scores};
use crate::family::{FamilyId, LearnerSpec, TrainedLearner, rank_candidates};
use crate::forest::{FitError, ForestConfig, balanced_weights, encode_labels};
use crate::neural::NeuralConfig;
use crate::preprocess::FittedScaler;
use crate::types::Candidate;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("A stacking ensemble needs at least one base member.")]
    NoMembers,
    #[error(transparent)]
    Fit(#[from] FitError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackingConfig {
    /// Base learners in their fixed stacking order.
    pub members: Vec<(FamilyId, LearnerSpec)>,
    pub meta: LearnerSpec,
    /// Per-class calibration wrapped around every base member's output.
    pub base_calibration: CalibrationMethod,
    /// When set, the meta-learner's probabilities are calibrated with its
    /// own held-out folds over the stacking matrix.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub calibration: Option<CalibrationMethod>,
    pub folds: usize,
    pub seed: u64,
}

impl StackingConfig {
    /// The default family roster: forest, boosted trees, and the attention
    /// neural net, each sigmoid-calibrated, stacked under an isotonically
    /// calibrated boosted meta-learner.
    pub fn standard(folds: usize, seed: u64) -> Self {
        Self {
            members: vec![
                (FamilyId::Forest, LearnerSpec::Forest(ForestConfig::default())),
                (
                    FamilyId::Boosted,
                    LearnerSpec::Boosted(boost::BoostConfig::default()),
                ),
                (
                    FamilyId::Neural,
                    LearnerSpec::Neural(NeuralConfig::default()),
                ),
            ],
            meta: LearnerSpec::Boosted(boost::meta_config()),
            base_calibration: CalibrationMethod::Sigmoid,
            calibration: Some(CalibrationMethod::Isotonic),
            folds,
            seed,
        }
    }
}

/// The stacking meta-model: either a bare learner or one wrapped with
/// per-class probability calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetaModel {
    Plain(TrainedLearner),
    Calibrated(CalibratedClassifier),
}

impl MetaModel {
    pub fn classes(&self) -> &[String] {
        match self {
            MetaModel::Plain(m) => m.classes(),
            MetaModel::Calibrated(m) => &m.classes,
        }
    }

    pub fn predict_proba_row(&self, features: &[f64]) -> Vec<f64> {
        match self {
            MetaModel::Plain(m) => m.predict_proba_row(features),
            MetaModel::Calibrated(m) => m.predict_proba_row(features),
        }
    }
}

/// One trained base learner inside the stack, wrapped with its calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackedMember {
    pub family: FamilyId,
    pub model: CalibratedClassifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackingModel {
    pub classes: Vec<String>,
    pub scaler: FittedScaler,
    pub members: Vec<StackedMember>,
    pub meta: MetaModel,
    pub metrics: LevelMetrics,
    /// Balanced class weights recorded for the metadata artifact.
    pub class_weights: BTreeMap<String, f64>,
}

impl StackingModel {
    /// Trains the full stack on an imputed, reconciled (but unscaled)
    /// matrix. Fails only on structural problems; per-fold peculiarities
    /// (folds missing rare classes) are absorbed by remapping.
    pub fn train(
        cfg: &StackingConfig,
        x: ArrayView2<f64>,
        labels: &[String],
    ) -> Result<Self, EnsembleError> {
        if cfg.members.is_empty() {
            return Err(EnsembleError::NoMembers);
        }
        if labels.is_empty() {
            return Err(EnsembleError::Fit(FitError::EmptyTrainingSet));
        }
        let (classes, encoded) = encode_labels(labels);
        if classes.len() < 2 {
            return Err(EnsembleError::Fit(FitError::SingleClass(classes[0].clone())));
        }

        let scaler = FittedScaler::fit(x);
        let scaled = scaler.transform_matrix(x);
        let folds = stratified_folds(&encoded, classes.len(), cfg.folds, cfg.seed);

        log::info!(
            "Stacking {} members over {} classes ({} folds)",
            cfg.members.len(),
            classes.len(),
            folds.len()
        );

        let (stack, _) = oof_matrix(cfg, scaled.view(), labels, &classes, &folds)?;

        // Full refit of every member, calibrated, for serving and live
        // stacking.
        let members: Vec<StackedMember> = cfg
            .members
            .par_iter()
            .enumerate()
            .map(|(m, (family, spec))| {
                let model = CalibratedClassifier::fit(
                    spec,
                    scaled.view(),
                    labels,
                    cfg.base_calibration,
                    cfg.folds,
                    member_seed(cfg.seed, m, usize::MAX),
                )?;
                Ok(StackedMember {
                    family: *family,
                    model,
                })
            })
            .collect::<Result<_, FitError>>()?;

        let meta_seed = cfg.seed.wrapping_add(0x5eed);
        let meta = match cfg.calibration {
            Some(method) => MetaModel::Calibrated(CalibratedClassifier::fit(
                &cfg.meta,
                stack.view(),
                labels,
                method,
                cfg.folds,
                meta_seed,
            )?),
            None => MetaModel::Plain(cfg.meta.fit(stack.view(), labels, meta_seed)?),
        };

        // Quality on the training set through the live path.
        let mut predicted = Vec::with_capacity(labels.len());
        let mut top_probs = Vec::with_capacity(labels.len());
        let mut correct = Vec::with_capacity(labels.len());
        for (i, row) in scaled.rows().into_iter().enumerate() {
            let row_vec = row.to_vec();
            let features = stack_features(&members, &classes, &row_vec);
            let probs = remap(meta.classes(), &classes, &meta.predict_proba_row(&features));
            let (best, best_p) = argmax(&probs);
            predicted.push(best);
            top_probs.push(best_p);
            correct.push(best == encoded[i]);
        }
        let (macro_f1, weighted_f1) = f1_scores(&encoded, &predicted, classes.len());
        let metrics = LevelMetrics {
            macro_f1,
            weighted_f1,
            brier: brier_score(&top_probs, &correct),
        };
        log::info!(
            "Stacking metrics: macro_f1={:.4} weighted_f1={:.4} brier={:.4}",
            metrics.macro_f1,
            metrics.weighted_f1,
            metrics.brier
        );

        let weights = balanced_weights(&encoded, classes.len());
        let class_weights = classes
            .iter()
            .cloned()
            .zip(weights.iter().copied())
            .collect();

        Ok(Self {
            classes,
            scaler,
            members,
            meta,
            metrics,
            class_weights,
        })
    }

    /// Meta-classifier probabilities for one raw (unscaled) row, in
    /// `self.classes` order.
    pub fn predict_proba_row(&self, raw: &[f64]) -> Vec<f64> {
        let mut row = raw.to_vec();
        self.scaler.transform_in_place(&mut row);
        let features = stack_features(&self.members, &self.classes, &row);
        remap(
            self.meta.classes(),
            &self.classes,
            &self.meta.predict_proba_row(&features),
        )
    }

    pub fn top_k_row(&self, raw: &[f64], k: usize) -> Vec<Candidate> {
        rank_candidates(&self.classes, &self.predict_proba_row(raw), k)
    }

    /// Ranked top-k per model family: each base member under its own id
    /// plus the meta-model as [`FamilyId::Stacked`].
    pub fn family_top_k(&self, raw: &[f64], k: usize) -> BTreeMap<FamilyId, Vec<Candidate>> {
        let mut row = raw.to_vec();
        self.scaler.transform_in_place(&mut row);

        let mut out = BTreeMap::new();
        for member in &self.members {
            let probs = remap(
                &member.model.classes,
                &self.classes,
                &member.model.predict_proba_row(&row),
            );
            out.insert(member.family, rank_candidates(&self.classes, &probs, k));
        }
        let features = stack_features(&self.members, &self.classes, &row);
        let probs = remap(
            self.meta.classes(),
            &self.classes,
            &self.meta.predict_proba_row(&features),
        );
        out.insert(FamilyId::Stacked, rank_candidates(&self.classes, &probs, k));
        out
    }

    /// Gate activations of the neural member, when one is present.
    pub fn attention_row(&self, raw: &[f64]) -> Option<Vec<f64>> {
        let mut row = raw.to_vec();
        self.scaler.transform_in_place(&mut row);
        self.members.iter().find_map(|m| match &m.model.base {
            TrainedLearner::Neural(n) => Some(n.attention_row(&row)),
            _ => None,
        })
    }
}

/// Builds the out-of-fold stacking matrix: `samples × (members × classes)`.
/// Every row of a member's block is produced by the fold model that did NOT
/// see that row during fitting. Also returns each row's fold assignment so
/// tests can audit the no-leakage property.
pub fn oof_matrix(
    cfg: &StackingConfig,
    scaled: ArrayView2<f64>,
    labels: &[String],
    classes: &[String],
    folds: &[Vec<usize>],
) -> Result<(Array2<f64>, Vec<usize>), EnsembleError> {
    let n = scaled.nrows();
    let k = classes.len();
    let mut stack = Array2::<f64>::zeros((n, cfg.members.len() * k));

    let mut fold_of_row = vec![0usize; n];
    for (f, fold) in folds.iter().enumerate() {
        for &row in fold {
            fold_of_row[row] = f;
        }
    }

    for (m, (family, spec)) in cfg.members.iter().enumerate() {
        log::debug!("Out-of-fold pass for member {family}");
        let blocks: Vec<(usize, Vec<(usize, Vec<f64>)>)> = folds
            .par_iter()
            .enumerate()
            .map(|(f, fold)| {
                let train = training_rows(folds, f, n);
                let train_x = scaled.select(Axis(0), &train);
                let train_labels: Vec<String> =
                    train.iter().map(|&i| labels[i].clone()).collect();
                // The fold model carries the same calibration the serving
                // members get, so the meta trains on calibrated features.
                let model = CalibratedClassifier::fit(
                    spec,
                    train_x.view(),
                    &train_labels,
                    cfg.base_calibration,
                    cfg.folds,
                    member_seed(cfg.seed, m, f),
                )?;
                let rows = fold
                    .iter()
                    .map(|&i| {
                        let probs = remap(
                            &model.classes,
                            classes,
                            &model.predict_proba_row(&scaled.row(i).to_vec()),
                        );
                        (i, probs)
                    })
                    .collect();
                Ok((f, rows))
            })
            .collect::<Result<_, FitError>>()?;

        for (_, rows) in blocks {
            for (i, probs) in rows {
                for (c, p) in probs.iter().enumerate() {
                    stack[[i, m * k + c]] = *p;
                }
            }
        }
    }
    Ok((stack, fold_of_row))
}

/// Concatenates the members' live calibrated probability blocks in fixed
/// order.
fn stack_features(members: &[StackedMember], classes: &[String], row: &[f64]) -> Vec<f64> {
    let mut features = Vec::with_capacity(members.len() * classes.len());
    for member in members {
        let probs = remap(
            &member.model.classes,
            classes,
            &member.model.predict_proba_row(row),
        );
        features.extend(probs);
    }
    features
}

/// Projects a model's probabilities (in its own class order) onto the
/// global class order; classes the model never saw contribute zero.
fn remap(model_classes: &[String], classes: &[String], probs: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; classes.len()];
    for (name, &p) in model_classes.iter().zip(probs.iter()) {
        if let Ok(at) = classes.binary_search(name) {
            out[at] = p;
        }
    }
    out
}

fn argmax(probs: &[f64]) -> (usize, f64) {
    let mut best = 0;
    let mut best_p = f64::NEG_INFINITY;
    for (i, &p) in probs.iter().enumerate() {
        if p > best_p {
            best = i;
            best_p = p;
        }
    }
    (best, best_p)
}

fn member_seed(seed: u64, member: usize, fold: usize) -> u64 {
    seed.wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add((member as u64) << 32)
        .wrapping_add(fold as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boost::BoostConfig;
    use ndarray::Array2;

    fn balanced_three_class() -> (Array2<f64>, Vec<String>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        let centers = [("R1b", 0.0), ("I1", 6.0), ("J2", 12.0)];
        for i in 0..30 {
            let (name, center) = centers[i % 3];
            let jitter = (i / 3) as f64 * 0.08;
            rows.extend_from_slice(&[center + jitter, center - jitter]);
            labels.push(name.to_string());
        }
        (Array2::from_shape_vec((30, 2), rows).unwrap(), labels)
    }

    fn small_config() -> StackingConfig {
        StackingConfig {
            members: vec![
                (
                    FamilyId::Forest,
                    LearnerSpec::Forest(ForestConfig {
                        n_trees: 12,
                        ..ForestConfig::default()
                    }),
                ),
                (
                    FamilyId::Boosted,
                    LearnerSpec::Boosted(BoostConfig {
                        n_rounds: 12,
                        ..BoostConfig::default()
                    }),
                ),
            ],
            meta: LearnerSpec::Boosted(BoostConfig {
                n_rounds: 10,
                ..BoostConfig::default()
            }),
            base_calibration: CalibrationMethod::Sigmoid,
            calibration: None,
            folds: 5,
            seed: 13,
        }
    }

    #[test]
    fn stack_learns_the_level() {
        let (x, labels) = balanced_three_class();
        let model = StackingModel::train(&small_config(), x.view(), &labels).unwrap();
        let top = model.top_k_row(&[0.0, 0.0], 3);
        assert_eq!(top[0].label, "R1b");
        assert!(model.metrics.macro_f1 > 0.9);
    }

    #[test]
    fn oof_rows_come_from_the_excluding_fold_model() {
        let (x, labels) = balanced_three_class();
        let cfg = small_config();
        let (classes, encoded) = encode_labels(&labels);
        let scaler = FittedScaler::fit(x.view());
        let scaled = scaler.transform_matrix(x.view());
        let folds = stratified_folds(&encoded, classes.len(), cfg.folds, cfg.seed);
        let (stack, fold_of_row) =
            oof_matrix(&cfg, scaled.view(), &labels, &classes, &folds).unwrap();

        // Every row belongs to exactly one fold.
        let mut coverage: Vec<usize> = folds.iter().flatten().copied().collect();
        coverage.sort_unstable();
        assert_eq!(coverage, (0..labels.len()).collect::<Vec<_>>());

        // Refit member 0's calibrated model for fold 0 and confirm the
        // recorded block equals predictions from the model that excluded
        // those rows.
        let train = training_rows(&folds, 0, labels.len());
        let train_x = scaled.select(Axis(0), &train);
        let train_labels: Vec<String> = train.iter().map(|&i| labels[i].clone()).collect();
        let model = CalibratedClassifier::fit(
            &cfg.members[0].1,
            train_x.view(),
            &train_labels,
            cfg.base_calibration,
            cfg.folds,
            member_seed(cfg.seed, 0, 0),
        )
        .unwrap();
        for &row in &folds[0] {
            assert_eq!(fold_of_row[row], 0);
            let expected = remap(
                &model.classes,
                &classes,
                &model.predict_proba_row(&scaled.row(row).to_vec()),
            );
            let recorded: Vec<f64> = (0..classes.len()).map(|c| stack[[row, c]]).collect();
            assert_eq!(recorded, expected);
        }
    }

    #[test]
    fn family_top_k_includes_every_member_and_the_meta() {
        let (x, labels) = balanced_three_class();
        let model = StackingModel::train(&small_config(), x.view(), &labels).unwrap();
        let families = model.family_top_k(&[6.0, 6.0], 3);
        assert!(families.contains_key(&FamilyId::Forest));
        assert!(families.contains_key(&FamilyId::Boosted));
        assert!(families.contains_key(&FamilyId::Stacked));
    }
}
