// ========================================================================================
//
//                            RECURSIVE PREDICTOR
//
// ========================================================================================
//
// Greedy top-down descent through the trained taxonomy. At each trained node
// the local classifier ranks its direct-child candidates; the descent
// follows the top-1 label only when it names an existing child, and stops at
// the first untrained node or unmatched prediction. Both stops are normal
// terminations — the returned path is simply shorter than the tree's depth.
//
// The predictor never backtracks: a wrong branch at level L conditions every
// deeper level on that branch. This greedy design is deliberate; it is not a
// global best-path search.

use crate::taxonomy::TaxonomyArena;
use crate::types::{Candidate, PathLevel, PredictionPath, TOP_K};

/// Descends the tree for one preprocessed (reconciled and imputed, but
/// unscaled) marker vector. Each node applies its own fitted scaler before
/// consulting its classifier.
pub fn predict_path(arena: &TaxonomyArena, vector: &[f64]) -> PredictionPath {
    let mut path = PredictionPath::default();
    let mut current = arena.root();

    loop {
        let node = arena.get(current);
        let Some(classifier) = &node.classifier else {
            // Untrained node: no deeper prediction available.
            break;
        };

        let mut scaled = vector.to_vec();
        if let Some(scaler) = &node.scaler {
            scaler.transform_in_place(&mut scaled);
        }

        let candidates = classifier.top_k_row(&scaled, TOP_K);
        let best = match candidates.first() {
            Some(c) => c.label.clone(),
            None => break,
        };
        path.levels.push(PathLevel {
            level: path.levels.len(),
            candidates,
        });

        match node.children.get(&best) {
            Some(&child) => current = child,
            // Top prediction names no child (the sample belongs exactly
            // here, or the label is novel): stop without error.
            None => break,
        }
    }

    path
}

/// Candidate list restricted to one level of a path, or an empty slice when
/// descent never reached that level.
pub fn level_candidates(path: &PredictionPath, level: usize) -> &[Candidate] {
    path.levels
        .iter()
        .find(|l| l.level == level)
        .map(|l| l.candidates.as_slice())
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::build_taxonomy_offline;
    use crate::trainer::train_tree;
    use crate::types::TrainingConfig;
    use ndarray::Array2;

    fn trained_fixture() -> (TaxonomyArena, Array2<f64>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..12 {
            let jitter = (i % 4) as f64 * 0.05;
            match i % 3 {
                0 => {
                    rows.extend_from_slice(&[10.0 + jitter, 0.0]);
                    labels.push("R1b-M269".to_string());
                }
                1 => {
                    rows.extend_from_slice(&[12.0 + jitter, 4.0]);
                    labels.push("R1b-U106".to_string());
                }
                _ => {
                    rows.extend_from_slice(&[0.0, 10.0 + jitter]);
                    labels.push("I1-M253".to_string());
                }
            }
        }
        let x = Array2::from_shape_vec((12, 2), rows).unwrap();
        let mut arena = build_taxonomy_offline(&labels);
        let cfg = TrainingConfig {
            forest_trees: 25,
            ..TrainingConfig::default()
        };
        train_tree(&mut arena, x.view(), &labels, &cfg);
        (arena, x)
    }

    #[test]
    fn descends_to_the_matching_subclade() {
        let (arena, _) = trained_fixture();
        let path = predict_path(&arena, &[10.0, 0.0]);

        assert!(path.depth() >= 2);
        assert_eq!(level_candidates(&path, 0)[0].label, "R1b");
        assert_eq!(path.terminal_label(), Some("R1b-M269"));
    }

    #[test]
    fn untrained_root_yields_an_empty_path() {
        let arena = build_taxonomy_offline(&["R1b-M269".to_string()]);
        let path = predict_path(&arena, &[1.0, 2.0]);
        assert_eq!(path.depth(), 0);
    }

    #[test]
    fn repeated_calls_are_identical() {
        let (arena, _) = trained_fixture();
        let vector = vec![11.0, 2.0];
        let first = predict_path(&arena, &vector);
        let second = predict_path(&arena, &vector);
        assert_eq!(first, second);
    }

    #[test]
    fn descent_stops_below_untrained_branch() {
        let (arena, _) = trained_fixture();
        // An I1 sample reaches the I1 node, which is untrained (single
        // child target), so the path holds exactly the root level.
        let path = predict_path(&arena, &[0.0, 10.0]);
        assert_eq!(path.depth(), 1);
        assert_eq!(level_candidates(&path, 0)[0].label, "I1");
    }
}
