//! End-to-end prediction scenarios over a trained taxonomy: the 37-marker
//! descent case and determinism of the frozen tree.

use haplocall::lookup::build_taxonomy_offline;
use haplocall::predictor::predict_path;
use haplocall::preprocess::ImputerStats;
use haplocall::trainer::train_tree;
use haplocall::types::{FeatureSchema, TrainingConfig};
use ndarray::Array2;

const N_MARKERS: usize = 37;

fn marker_schema() -> FeatureSchema {
    FeatureSchema::new((1..=N_MARKERS).map(|i| format!("DYS{i:03}")).collect())
}

/// Training set over 37 markers where R1b samples sit near 15 on every
/// marker and I1 samples near 10, so the root classifier favours R1b for an
/// all-15 vector. Both labels are separator-free and therefore leaves.
fn trained_leaf_tree() -> haplocall::taxonomy::TaxonomyArena {
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for i in 0..20 {
        let jitter = (i % 5) as f64 * 0.1;
        let center = if i % 2 == 0 { 15.0 } else { 10.0 };
        for m in 0..N_MARKERS {
            rows.push(center + jitter + (m % 3) as f64 * 0.01);
        }
        labels.push(if i % 2 == 0 { "R1b" } else { "I1" }.to_string());
    }
    let x = Array2::from_shape_vec((20, N_MARKERS), rows).unwrap();

    let mut arena = build_taxonomy_offline(&labels);
    let cfg = TrainingConfig {
        forest_trees: 30,
        ..TrainingConfig::default()
    };
    train_tree(&mut arena, x.view(), &labels, &cfg);
    arena
}

#[test]
fn all_fifteen_vector_descends_to_r1b_leaf() {
    let arena = trained_leaf_tree();
    let vector = vec![15.0; N_MARKERS];
    let path = predict_path(&arena, &vector);

    // Level 0 must rank R1b first; R1b is a leaf, so descent ends there.
    assert_eq!(path.depth(), 1);
    assert_eq!(path.levels[0].level, 0);
    assert_eq!(path.levels[0].candidates[0].label, "R1b");
}

#[test]
fn frozen_tree_and_vector_give_identical_paths() {
    let arena = trained_leaf_tree();
    let vector = vec![12.5; N_MARKERS];
    let first = predict_path(&arena, &vector);
    for _ in 0..5 {
        assert_eq!(predict_path(&arena, &vector), first);
    }
}

#[test]
fn sentinel_only_query_is_imputed_deterministically() {
    let mut rows = Vec::new();
    for i in 0..6 {
        for _ in 0..N_MARKERS {
            rows.push(10.0 + i as f64);
        }
    }
    let x = Array2::from_shape_vec((6, N_MARKERS), rows).unwrap();
    let imputer = ImputerStats::fit(x.view());

    let schema = marker_schema();
    let raw = vec![-1.0; N_MARKERS];
    let first = haplocall::preprocess::preprocess(&raw, &schema, &schema, Some(&imputer), None)
        .unwrap();
    let second = haplocall::preprocess::preprocess(&raw, &schema, &schema, Some(&imputer), None)
        .unwrap();
    assert_eq!(first, vec![12.5; N_MARKERS]);
    assert_eq!(first, second);
}
