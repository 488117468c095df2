// ========================================================================================
//
//                              NODE TRAINER
//
// ========================================================================================
//
// Fits a local classifier at every internal taxonomy node that has enough
// distinguishable children. Work is planned in a sequential pre-order pass
// over the immutable arena, executed across the rayon pool (per-node tasks
// touch disjoint sample subsets), and written back sequentially — so a
// failure in one node never blocks or corrupts its siblings.
//
// A node trains iff its subtree holds at least two rows and the derived
// direct-child target has at least two distinct values. Anything else is a
// normal terminal state, not an error. Genuine training failures are caught,
// logged, and leave the node untrained; the recursion continues.

use crate::family::TrainedLearner;
use crate::forest::{FitError, ForestConfig, ForestModel};
use crate::preprocess::FittedScaler;
use crate::taxonomy::{NodeId, TaxonomyArena};
use crate::types::TrainingConfig;
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use ndarray::{ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    /// Normal terminal state: the node simply stays untrained.
    #[error("insufficient data: {rows} subtree rows, {distinct} distinct child targets")]
    InsufficientData { rows: usize, distinct: usize },
    /// A real failure inside a learner; caught and logged per node.
    #[error("training failed: {0}")]
    Training(#[from] FitError),
}

/// Counts reported after a full tree-training pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainSummary {
    pub trained: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct NodeTask {
    node: NodeId,
    rows: Vec<usize>,
    targets: Vec<String>,
}

/// Trains every internal node of the arena in pre-order against the marker
/// matrix and its per-row labels. The matrix is the reconciled, imputed,
/// unscaled training matrix; each node fits and applies its own scaler.
pub fn train_tree(
    arena: &mut TaxonomyArena,
    x: ArrayView2<f64>,
    labels: &[String],
    cfg: &TrainingConfig,
) -> TrainSummary {
    // Rows mapped to the terminal node of their label's path. Labels whose
    // path was never inserted cannot be placed and are left out.
    let terminals: Vec<Option<NodeId>> = labels.iter().map(|l| arena.label_node(l)).collect();
    let unplaced = terminals.iter().filter(|t| t.is_none()).count();
    if unplaced > 0 {
        log::warn!("{unplaced} of {} rows have no taxonomy path and are excluded", labels.len());
    }

    let mut summary = TrainSummary::default();
    let mut tasks: Vec<NodeTask> = Vec::new();
    for node in arena.preorder() {
        if arena.get(node).is_leaf() {
            continue;
        }
        match plan_node(arena, node, &terminals) {
            Ok(task) => tasks.push(task),
            Err(TrainError::InsufficientData { rows, distinct }) => {
                log::debug!(
                    "Skipping {} ({rows} rows, {distinct} child targets)",
                    arena.get(node).name
                );
                summary.skipped += 1;
            }
            Err(err) => {
                log::error!("Planning failed for {}: {err}", arena.get(node).name);
                summary.failed += 1;
            }
        }
    }

    log::info!("Training {} taxonomy nodes", tasks.len());
    let bar = ProgressBar::new(tasks.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message("nodes");

    let fitted: Vec<(NodeId, Result<(FittedScaler, TrainedLearner), TrainError>)> = tasks
        .par_iter()
        .map(|task| {
            let result = fit_node(task, x, cfg);
            bar.inc(1);
            (task.node, result)
        })
        .collect();
    bar.finish_and_clear();

    for (node, result) in fitted {
        match result {
            Ok((scaler, model)) => {
                log::info!(
                    "Trained {} on {} classes",
                    arena.get(node).name,
                    model.classes().len()
                );
                let entry = arena.get_mut(node);
                entry.scaler = Some(scaler);
                entry.classifier = Some(model);
                summary.trained += 1;
            }
            Err(TrainError::InsufficientData { .. }) => summary.skipped += 1,
            Err(err) => {
                log::error!("Error training node {}: {err}", arena.get(node).name);
                summary.failed += 1;
            }
        }
    }
    log::info!(
        "Tree training finished: {} trained, {} skipped, {} failed",
        summary.trained,
        summary.skipped,
        summary.failed
    );
    summary
}

/// Collects a node's subtree rows and their direct-child targets, applying
/// the trainability rules.
fn plan_node(
    arena: &TaxonomyArena,
    node: NodeId,
    terminals: &[Option<NodeId>],
) -> Result<NodeTask, TrainError> {
    let mut rows = Vec::new();
    let mut targets = Vec::new();
    for (row, terminal) in terminals.iter().enumerate() {
        let Some(terminal) = terminal else { continue };
        if !arena.is_ancestor_or_self(node, *terminal) {
            continue;
        }
        // The sample's target is the direct child whose subtree holds it,
        // or the node's own name when it belongs exactly here.
        let target = match arena.child_toward(node, *terminal) {
            Some(child) => arena.get(child).name.clone(),
            None => arena.get(node).name.clone(),
        };
        rows.push(row);
        targets.push(target);
    }

    let distinct = targets.iter().unique().count();
    if rows.len() < 2 || distinct < 2 {
        return Err(TrainError::InsufficientData {
            rows: rows.len(),
            distinct,
        });
    }
    Ok(NodeTask {
        node,
        rows,
        targets,
    })
}

/// Fits one node: scaler over the subtree subset, then the forest in sample
/// batches with append-only capacity growth.
///
/// Training files are commonly grouped by haplogroup, which would hand the
/// first batch a single class. Two guards make batching insensitive to row
/// order: rows are shuffled with the node's seed before batching, and the
/// forest's class vocabulary is fixed from the full target set so a
/// single-class batch still fits.
fn fit_node(
    task: &NodeTask,
    x: ArrayView2<f64>,
    cfg: &TrainingConfig,
) -> Result<(FittedScaler, TrainedLearner), TrainError> {
    let sub_x = x.select(Axis(0), &task.rows);
    let scaler = FittedScaler::fit(sub_x.view());
    let scaled = scaler.transform_matrix(sub_x.view());

    let seed = node_seed(cfg.seed, task.node);
    let mut order: Vec<usize> = (0..scaled.nrows()).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let scaled = scaled.select(Axis(0), &order);
    let targets: Vec<String> = order.iter().map(|&i| task.targets[i].clone()).collect();

    let mut classes = task.targets.clone();
    classes.sort();
    classes.dedup();

    let forest_cfg = ForestConfig {
        n_trees: cfg.forest_trees,
        ..ForestConfig::default()
    };
    let batch = cfg.batch_size.max(2);

    let first_end = batch.min(scaled.nrows());
    let mut model = ForestModel::fit_with_classes(
        &forest_cfg,
        scaled.slice(ndarray::s![..first_end, ..]),
        &targets[..first_end],
        &classes,
        seed,
    )?;

    let mut start = first_end;
    let mut batch_idx = 1usize;
    while start < scaled.nrows() {
        let end = (start + batch).min(scaled.nrows());
        log::debug!(
            "Growing node model by {} trees on batch {batch_idx} ({start}..{end})",
            cfg.forest_growth
        );
        model.grow(
            cfg.forest_growth,
            scaled.slice(ndarray::s![start..end, ..]),
            &targets[start..end],
        )?;
        start = end;
        batch_idx += 1;
    }

    Ok((scaler, TrainedLearner::Forest(model)))
}

fn node_seed(seed: u64, node: NodeId) -> u64 {
    seed.wrapping_mul(0x2545_f491_4f6c_dd1d)
        .wrapping_add(node as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::build_taxonomy_offline;
    use ndarray::Array2;

    /// Two R1b subclades and an I1 branch, linearly separable.
    fn fixture() -> (TaxonomyArena, Array2<f64>, Vec<String>) {
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
        let arena = build_taxonomy_offline(&labels);
        (arena, x, labels)
    }

    #[test]
    fn trains_root_and_branching_nodes() {
        let (mut arena, x, labels) = fixture();
        let cfg = TrainingConfig {
            forest_trees: 15,
            ..TrainingConfig::default()
        };
        let summary = train_tree(&mut arena, x.view(), &labels, &cfg);

        // Root (R1b vs I1) and R1b (M269 vs U106) are trainable; the I1
        // node has a single child target and stays untrained.
        assert_eq!(summary.trained, 2);
        assert!(summary.skipped >= 1);
        assert_eq!(summary.failed, 0);
        assert!(arena.get(arena.root()).is_trained());
    }

    #[test]
    fn single_label_tree_trains_nothing() {
        let labels = vec!["R1b-M269".to_string(); 4];
        let x = Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut arena = build_taxonomy_offline(&labels);
        let summary = train_tree(&mut arena, x.view(), &labels, &TrainingConfig::default());
        assert_eq!(summary.trained, 0);
        assert_eq!(arena.trained_count(), 0);
    }

    #[test]
    fn label_grouped_input_survives_small_batches() {
        // Rows grouped by haplogroup, as exported Y-STR tables usually are:
        // with batch 4, the first naive batch would be single-class.
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..6 {
            rows.extend_from_slice(&[0.0, 10.0 + (i % 3) as f64 * 0.1]);
            labels.push("I1-M253".to_string());
        }
        for i in 0..6 {
            rows.extend_from_slice(&[10.0 + (i % 3) as f64 * 0.1, 0.0]);
            labels.push("R1b-M269".to_string());
        }
        let x = Array2::from_shape_vec((12, 2), rows).unwrap();
        let mut arena = build_taxonomy_offline(&labels);
        let cfg = TrainingConfig {
            forest_trees: 10,
            forest_growth: 4,
            batch_size: 4,
            ..TrainingConfig::default()
        };
        let summary = train_tree(&mut arena, x.view(), &labels, &cfg);

        assert_eq!(summary.failed, 0);
        assert!(arena.get(arena.root()).is_trained());
    }

    #[test]
    fn batched_training_grows_capacity() {
        let (mut arena, x, labels) = fixture();
        let cfg = TrainingConfig {
            forest_trees: 5,
            forest_growth: 3,
            batch_size: 5,
            ..TrainingConfig::default()
        };
        train_tree(&mut arena, x.view(), &labels, &cfg);

        let root = arena.get(arena.root());
        let Some(TrainedLearner::Forest(model)) = &root.classifier else {
            panic!("root should carry a forest");
        };
        // 12 rows in batches of 5: initial 5 trees plus 2 growth batches.
        assert_eq!(model.trees.len(), 5 + 2 * 3);
    }
}
