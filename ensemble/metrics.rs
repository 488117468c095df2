//! Classification quality metrics reported after ensemble training.
//!
//! F1 is computed per class from the confusion counts and aggregated two
//! ways: `macro` (unweighted mean over classes that occur in the truth) and
//! `weighted` (mean weighted by true-class support). The Brier score here is
//! the mean squared error of the top predicted probability against realized
//! correctness, matching how the original service scored its calibrated
//! ensembles.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelMetrics {
    pub macro_f1: f64,
    pub weighted_f1: f64,
    pub brier: f64,
}

/// Per-class F1 aggregated as `(macro_f1, weighted_f1)`.
pub fn f1_scores(truth: &[usize], predicted: &[usize], n_classes: usize) -> (f64, f64) {
    let mut tp = vec![0usize; n_classes];
    let mut fp = vec![0usize; n_classes];
    let mut fn_ = vec![0usize; n_classes];
    for (&t, &p) in truth.iter().zip(predicted.iter()) {
        if t == p {
            tp[t] += 1;
        } else {
            fp[p] += 1;
            fn_[t] += 1;
        }
    }

    let mut macro_sum = 0.0;
    let mut weighted_sum = 0.0;
    let mut present = 0usize;
    for class in 0..n_classes {
        let support = tp[class] + fn_[class];
        if support == 0 {
            continue;
        }
        present += 1;
        let denominator = 2 * tp[class] + fp[class] + fn_[class];
        let f1 = if denominator == 0 {
            0.0
        } else {
            2.0 * tp[class] as f64 / denominator as f64
        };
        macro_sum += f1;
        weighted_sum += f1 * support as f64;
    }
    if present == 0 {
        return (0.0, 0.0);
    }
    (macro_sum / present as f64, weighted_sum / truth.len() as f64)
}

/// Mean squared error of the maximum predicted probability against whether
/// the top prediction was actually correct.
pub fn brier_score(top_probabilities: &[f64], correct: &[bool]) -> f64 {
    if top_probabilities.is_empty() {
        return 0.0;
    }
    top_probabilities
        .iter()
        .zip(correct.iter())
        .map(|(&p, &c)| {
            let outcome = if c { 1.0 } else { 0.0 };
            (p - outcome) * (p - outcome)
        })
        .sum::<f64>()
        / top_probabilities.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn perfect_predictions_score_one() {
        let truth = vec![0, 1, 2, 0, 1, 2];
        let (macro_f1, weighted_f1) = f1_scores(&truth, &truth, 3);
        assert_abs_diff_eq!(macro_f1, 1.0);
        assert_abs_diff_eq!(weighted_f1, 1.0);
    }

    #[test]
    fn known_confusion_matches_hand_computation() {
        // Class 0: tp=1 fp=1 fn=1 -> f1 = 0.5; class 1: tp=1 fp=1 fn=1 -> 0.5.
        let truth = vec![0, 0, 1, 1];
        let predicted = vec![0, 1, 1, 0];
        let (macro_f1, weighted_f1) = f1_scores(&truth, &predicted, 2);
        assert_abs_diff_eq!(macro_f1, 0.5);
        assert_abs_diff_eq!(weighted_f1, 0.5);
    }

    #[test]
    fn absent_classes_do_not_dilute_macro_f1() {
        let truth = vec![0, 0];
        let predicted = vec![0, 0];
        let (macro_f1, _) = f1_scores(&truth, &predicted, 5);
        assert_abs_diff_eq!(macro_f1, 1.0);
    }

    #[test]
    fn brier_rewards_confident_correctness() {
        let good = brier_score(&[0.9, 0.8], &[true, true]);
        let bad = brier_score(&[0.9, 0.8], &[false, false]);
        assert!(good < 0.05);
        assert!(bad > 0.6);
    }
}
