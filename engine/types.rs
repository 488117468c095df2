//! Shared vocabulary types for the prediction engine.
//!
//! Everything here is plain data: serializable, cheaply clonable, and free of
//! behavior beyond small accessors. The heavier machinery (learners, the
//! taxonomy arena, the stacking ensemble) lives in its own modules and speaks
//! in these types.

use serde::{Deserialize, Serialize};

/// Sentinel value marking a marker that was not measured for a sample.
pub const MISSING_SENTINEL: f64 = -1.0;

/// Number of ranked candidates reported per descent level and per family.
pub const TOP_K: usize = 3;

/// The ordered list of feature (marker) names a matrix or vector is keyed by.
///
/// Column order is significant everywhere: scalers and imputers are indexed by
/// position, not name, so a vector must be reconciled to the training schema
/// before any fitted transform is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub names: Vec<String>,
}

impl FeatureSchema {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position of a feature by name, if present.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Versioned training configuration.
///
/// Seed and batch size are deliberately part of this record: the node
/// trainer's incremental-growth policy makes output depend on both, so they
/// are persisted with the snapshot rather than inferred at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Master seed; all per-node and per-member seeds are derived from it.
    pub seed: u64,
    /// Sample-batch size for incremental node training.
    pub batch_size: usize,
    /// Folds used for out-of-fold stacking and calibration.
    pub stacking_folds: usize,
    /// Trees grown for the first batch of a node forest.
    pub forest_trees: usize,
    /// Trees appended per subsequent batch.
    pub forest_growth: usize,
    /// Base URL of the external nomenclature service.
    pub lookup_base_url: String,
    /// Maximum simultaneous lookups in flight.
    pub lookup_window: usize,
    /// Pause between lookup batches, in milliseconds.
    pub lookup_pause_ms: u64,
    /// Whether combination weights are renormalized when a family is absent.
    pub renormalize_absent: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            batch_size: 1000,
            stacking_folds: 5,
            forest_trees: 100,
            forest_growth: 10,
            lookup_base_url: "http://localhost:9003/api".to_string(),
            lookup_window: 50,
            lookup_pause_ms: 100,
            renormalize_absent: false,
        }
    }
}

/// One ranked label with its probability (or combined score).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub label: String,
    pub probability: f64,
}

/// Ranked candidates produced at one depth of the recursive descent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathLevel {
    pub level: usize,
    pub candidates: Vec<Candidate>,
}

/// The output of the recursive predictor: one `PathLevel` per tree level
/// actually descended. Shorter than the full taxonomy depth whenever descent
/// stopped at an untrained node or at a top prediction that names no child.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PredictionPath {
    pub levels: Vec<PathLevel>,
}

impl PredictionPath {
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Top-ranked label of the deepest level reached, if any.
    pub fn terminal_label(&self) -> Option<&str> {
        self.levels
            .last()
            .and_then(|l| l.candidates.first())
            .map(|c| c.label.as_str())
    }
}

/// Provenance attached to a combined answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub families_used: Vec<String>,
    pub ensemble_used: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attention_weights: Option<Vec<f64>>,
}

/// The engine-level answer record handed to the external serving API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleReport {
    pub prediction: String,
    pub confidence: f64,
    pub alternatives: Vec<Candidate>,
    pub processing_time_ms: f64,
    pub features_used: usize,
    pub model_info: ModelInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_position_is_by_name() {
        let schema = FeatureSchema::new(vec!["DYS393".into(), "DYS390".into()]);
        assert_eq!(schema.position("DYS390"), Some(1));
        assert_eq!(schema.position("DYS391"), None);
        assert_eq!(schema.len(), 2);
    }

    #[test]
    fn terminal_label_reads_deepest_level() {
        let path = PredictionPath {
            levels: vec![
                PathLevel {
                    level: 0,
                    candidates: vec![Candidate {
                        label: "R".into(),
                        probability: 0.9,
                    }],
                },
                PathLevel {
                    level: 1,
                    candidates: vec![Candidate {
                        label: "R1b".into(),
                        probability: 0.7,
                    }],
                },
            ],
        };
        assert_eq!(path.terminal_label(), Some("R1b"));
        assert_eq!(path.depth(), 2);
    }
}
