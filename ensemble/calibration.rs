//! # Probability Calibration
//!
//! Wraps a learner so its reported probabilities behave like likelihoods
//! rather than raw scores. Per-class calibrators are fitted one-vs-rest on
//! out-of-fold predictions (the base model is then refit on the full set),
//! so the mapping is learned from probabilities the model produced for
//! samples it had not seen.
//!
//! Two mappings are supported, mirroring the original service's choices:
//! sigmoid (Platt scaling, a two-parameter logistic fit by deterministic
//! gradient descent) and isotonic (pool-adjacent-violators, a monotone step
//! function). A calibration-curve utility bins held-out predictions and
//! reports observed against predicted frequency per bin.

use crate::family::{LearnerSpec, TrainedLearner};
use crate::forest::{FitError, encode_labels};
use crate::ensemble::folds::{stratified_folds, training_rows};
use ndarray::{ArrayView2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationMethod {
    Sigmoid,
    Isotonic,
}

/// A fitted one-vs-rest mapping for a single class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClassCalibrator {
    Sigmoid {
        a: f64,
        b: f64,
    },
    /// Monotone step function: `values[i]` applies from `thresholds[i]` up
    /// to the next threshold.
    Isotonic {
        thresholds: Vec<f64>,
        values: Vec<f64>,
    },
}

impl ClassCalibrator {
    pub fn apply(&self, p: f64) -> f64 {
        match self {
            ClassCalibrator::Sigmoid { a, b } => 1.0 / (1.0 + (-(a * p + b)).exp()),
            ClassCalibrator::Isotonic { thresholds, values } => {
                if values.is_empty() {
                    return p;
                }
                // Last block whose start is <= p.
                let mut at = 0;
                for (i, t) in thresholds.iter().enumerate() {
                    if *t <= p {
                        at = i;
                    } else {
                        break;
                    }
                }
                values[at]
            }
        }
    }
}

/// A base learner wrapped with per-class calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibratedClassifier {
    pub base: TrainedLearner,
    pub classes: Vec<String>,
    pub method: CalibrationMethod,
    pub per_class: Vec<ClassCalibrator>,
}

impl CalibratedClassifier {
    /// Fits calibrators on out-of-fold probabilities, then refits the base
    /// learner on the full training set.
    pub fn fit(
        spec: &LearnerSpec,
        x: ArrayView2<f64>,
        labels: &[String],
        method: CalibrationMethod,
        folds: usize,
        seed: u64,
    ) -> Result<Self, FitError> {
        if x.nrows() == 0 {
            return Err(FitError::EmptyTrainingSet);
        }
        let (classes, encoded) = encode_labels(labels);
        if classes.len() < 2 {
            return Err(FitError::SingleClass(classes[0].clone()));
        }
        let n = x.nrows();
        let k = classes.len();
        let fold_sets = stratified_folds(&encoded, k, folds, seed);

        // Out-of-fold probabilities, remapped onto the global class order.
        let mut oof = vec![vec![0.0; k]; n];
        for (f, fold) in fold_sets.iter().enumerate() {
            let train = training_rows(&fold_sets, f, n);
            let train_x = x.select(Axis(0), &train);
            let train_labels: Vec<String> = train.iter().map(|&i| labels[i].clone()).collect();
            let model = spec.fit(train_x.view(), &train_labels, seed.wrapping_add(f as u64))?;
            for &i in fold {
                let probs = model.predict_proba_row(&x.row(i).to_vec());
                for (name, &p) in model.classes().iter().zip(probs.iter()) {
                    if let Ok(at) = classes.binary_search(name) {
                        oof[i][at] = p;
                    }
                }
            }
        }

        let per_class = (0..k)
            .map(|class| {
                let scores: Vec<f64> = oof.iter().map(|row| row[class]).collect();
                let outcomes: Vec<bool> = encoded.iter().map(|&c| c == class).collect();
                match method {
                    CalibrationMethod::Sigmoid => fit_sigmoid(&scores, &outcomes),
                    CalibrationMethod::Isotonic => fit_isotonic(&scores, &outcomes),
                }
            })
            .collect();

        let base = spec.fit(x, labels, seed)?;
        Ok(Self {
            base,
            classes,
            method,
            per_class,
        })
    }

    /// Calibrated probabilities, renormalized to sum to one.
    pub fn predict_proba_row(&self, row: &[f64]) -> Vec<f64> {
        let raw = self.base.predict_proba_row(row);
        let mut out = vec![0.0; self.classes.len()];
        for (name, &p) in self.base.classes().iter().zip(raw.iter()) {
            if let Ok(at) = self.classes.binary_search(name) {
                out[at] = self.per_class[at].apply(p);
            }
        }
        let total: f64 = out.iter().sum();
        if total > 0.0 {
            for p in out.iter_mut() {
                *p /= total;
            }
        } else {
            let uniform = 1.0 / out.len() as f64;
            out.iter_mut().for_each(|p| *p = uniform);
        }
        out
    }
}

/// Platt scaling: fits `sigma(a*p + b)` against binary outcomes with
/// full-batch gradient descent. Deterministic, no randomness involved.
fn fit_sigmoid(scores: &[f64], outcomes: &[bool]) -> ClassCalibrator {
    let n = scores.len().max(1) as f64;
    let mut a = 1.0;
    let mut b = 0.0;
    let lr = 0.5;
    for _ in 0..300 {
        let mut grad_a = 0.0;
        let mut grad_b = 0.0;
        for (&s, &y) in scores.iter().zip(outcomes.iter()) {
            let p = 1.0 / (1.0 + (-(a * s + b)).exp());
            let err = p - if y { 1.0 } else { 0.0 };
            grad_a += err * s;
            grad_b += err;
        }
        a -= lr * grad_a / n;
        b -= lr * grad_b / n;
    }
    ClassCalibrator::Sigmoid { a, b }
}

/// Pool-adjacent-violators: isotonic regression of outcomes on scores.
fn fit_isotonic(scores: &[f64], outcomes: &[bool]) -> ClassCalibrator {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&i, &j| {
        scores[i]
            .partial_cmp(&scores[j])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Blocks of (score_start, value_sum, count), merged while decreasing.
    let mut starts: Vec<f64> = Vec::new();
    let mut sums: Vec<f64> = Vec::new();
    let mut counts: Vec<f64> = Vec::new();
    for &i in &order {
        starts.push(scores[i]);
        sums.push(if outcomes[i] { 1.0 } else { 0.0 });
        counts.push(1.0);
        while starts.len() > 1 {
            let last = starts.len() - 1;
            if sums[last - 1] / counts[last - 1] <= sums[last] / counts[last] {
                break;
            }
            sums[last - 1] += sums[last];
            counts[last - 1] += counts[last];
            sums.pop();
            counts.pop();
            starts.pop();
        }
    }
    let values: Vec<f64> = sums
        .iter()
        .zip(counts.iter())
        .map(|(s, c)| s / c)
        .collect();
    ClassCalibrator::Isotonic {
        thresholds: starts,
        values,
    }
}

/// One bin of a reliability diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveBin {
    pub lower: f64,
    pub upper: f64,
    pub mean_predicted: f64,
    pub fraction_positive: f64,
    pub count: usize,
}

/// Bins predictions into equal-width intervals over [0, 1] and reports the
/// observed positive rate against the mean predicted probability per bin.
/// Empty bins are omitted.
pub fn calibration_curve(predicted: &[f64], outcomes: &[bool], bins: usize) -> Vec<CurveBin> {
    let bins = bins.max(1);
    let width = 1.0 / bins as f64;
    let mut sums = vec![0.0; bins];
    let mut positives = vec![0usize; bins];
    let mut counts = vec![0usize; bins];
    for (&p, &y) in predicted.iter().zip(outcomes.iter()) {
        let at = ((p / width) as usize).min(bins - 1);
        sums[at] += p;
        counts[at] += 1;
        if y {
            positives[at] += 1;
        }
    }
    (0..bins)
        .filter(|&b| counts[b] > 0)
        .map(|b| CurveBin {
            lower: b as f64 * width,
            upper: (b + 1) as f64 * width,
            mean_predicted: sums[b] / counts[b] as f64,
            fraction_positive: positives[b] as f64 / counts[b] as f64,
            count: counts[b],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::ForestConfig;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn isotonic_fit_is_monotone() {
        let scores = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
        let outcomes = vec![false, false, true, false, true, true, true, true];
        let cal = fit_isotonic(&scores, &outcomes);

        let mut last = 0.0;
        for p in [0.0, 0.2, 0.4, 0.6, 0.8, 1.0] {
            let v = cal.apply(p);
            assert!(v >= last - 1e-12, "not monotone at {p}");
            last = v;
        }
    }

    #[test]
    fn sigmoid_fit_tracks_a_clean_signal() {
        let scores: Vec<f64> = (0..100).map(|i| i as f64 / 100.0).collect();
        let outcomes: Vec<bool> = scores.iter().map(|&s| s > 0.5).collect();
        let cal = fit_sigmoid(&scores, &outcomes);
        assert!(cal.apply(0.9) > 0.7);
        assert!(cal.apply(0.1) < 0.3);
    }

    #[test]
    fn calibrated_probabilities_sum_to_one() {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..24 {
            let jitter = (i % 6) as f64 * 0.05;
            if i % 2 == 0 {
                rows.extend_from_slice(&[5.0 + jitter, 0.0]);
                labels.push("R1b".to_string());
            } else {
                rows.extend_from_slice(&[0.0, 5.0 + jitter]);
                labels.push("I1".to_string());
            }
        }
        let x = Array2::from_shape_vec((24, 2), rows).unwrap();
        let spec = LearnerSpec::Forest(ForestConfig {
            n_trees: 10,
            ..ForestConfig::default()
        });
        let model =
            CalibratedClassifier::fit(&spec, x.view(), &labels, CalibrationMethod::Isotonic, 4, 3)
                .unwrap();
        let probs = model.predict_proba_row(&[5.0, 0.0]);
        let sum: f64 = probs.iter().sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn curve_bins_report_observed_frequency() {
        let predicted = vec![0.05, 0.05, 0.95, 0.95, 0.95, 0.95];
        let outcomes = vec![false, false, true, true, true, false];
        let curve = calibration_curve(&predicted, &outcomes, 10);
        assert_eq!(curve.len(), 2);
        assert_eq!(curve[0].count, 2);
        assert_abs_diff_eq!(curve[0].fraction_positive, 0.0);
        assert_abs_diff_eq!(curve[1].fraction_positive, 0.75);
        assert_abs_diff_eq!(curve[1].mean_predicted, 0.95);
    }
}
