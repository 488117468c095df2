//! Stratified K-fold splitting for out-of-fold stacking and calibration.
//!
//! Indices are grouped by class, shuffled with a seeded RNG, and dealt
//! round-robin so every fold sees close to the class's overall frequency.
//! Classes with fewer samples than folds still get distributed — some folds
//! simply lack that class, which downstream probability remapping accepts.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Returns `k` disjoint validation index sets covering `0..encoded.len()`.
pub fn stratified_folds(encoded: &[usize], n_classes: usize, k: usize, seed: u64) -> Vec<Vec<usize>> {
    let k = k.max(2);
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); n_classes];
    for (i, &c) in encoded.iter().enumerate() {
        by_class[c].push(i);
    }

    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); k];
    let mut cursor = 0usize;
    for (class, mut members) in by_class.into_iter().enumerate() {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(class as u64));
        members.shuffle(&mut rng);
        for index in members {
            folds[cursor % k].push(index);
            cursor += 1;
        }
    }
    for fold in folds.iter_mut() {
        fold.sort_unstable();
    }
    folds
}

/// The complement of one fold: every index not held out by it.
pub fn training_rows(folds: &[Vec<usize>], fold: usize, n: usize) -> Vec<usize> {
    let held: std::collections::HashSet<usize> = folds[fold].iter().copied().collect();
    (0..n).filter(|i| !held.contains(i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_are_disjoint_and_complete() {
        let encoded = vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2];
        let folds = stratified_folds(&encoded, 3, 5, 42);
        assert_eq!(folds.len(), 5);

        let mut all: Vec<usize> = folds.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..15).collect::<Vec<_>>());
    }

    #[test]
    fn stratification_balances_classes() {
        // 10 of class 0, 10 of class 1: every fold of 5 gets 2 + 2.
        let encoded: Vec<usize> = (0..20).map(|i| i % 2).collect();
        let folds = stratified_folds(&encoded, 2, 5, 7);
        for fold in &folds {
            let zeros = fold.iter().filter(|&&i| encoded[i] == 0).count();
            let ones = fold.len() - zeros;
            assert_eq!(zeros, 2);
            assert_eq!(ones, 2);
        }
    }

    #[test]
    fn splitting_is_seeded() {
        let encoded: Vec<usize> = (0..30).map(|i| i % 3).collect();
        assert_eq!(
            stratified_folds(&encoded, 3, 5, 1),
            stratified_folds(&encoded, 3, 5, 1)
        );
        assert_ne!(
            stratified_folds(&encoded, 3, 5, 1),
            stratified_folds(&encoded, 3, 5, 2)
        );
    }

    #[test]
    fn complement_excludes_the_fold() {
        let encoded = vec![0, 0, 1, 1, 0, 1];
        let folds = stratified_folds(&encoded, 2, 3, 9);
        let train = training_rows(&folds, 0, 6);
        for i in &folds[0] {
            assert!(!train.contains(i));
        }
        assert_eq!(train.len(), 6 - folds[0].len());
    }
}
