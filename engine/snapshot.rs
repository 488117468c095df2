// ========================================================================================
//
//                         MODEL SNAPSHOT & ARTIFACTS
//
// ========================================================================================
//
// The immutable trained state handed to the serving path: taxonomy arena
// with its per-node classifiers, per-level stacking ensembles, and the
// metadata that makes artifacts self-describing (feature schema, imputer
// medians, class-weight tables, the versioned training configuration).
//
// A snapshot is constructed once per training run and never mutated;
// swapping model versions means swapping the snapshot reference. On disk it
// is a directory of TOML artifacts:
//
//     snapshot/metadata.toml          schema + imputer + config + weights
//     snapshot/tree.toml              arena structure (no classifiers)
//     snapshot/nodes/<id>.toml        one per trained node: classifier + scaler
//     snapshot/levels/<level>.toml    one per stacking level

use crate::ensemble::combine::{CombineError, CombineOptions, combine};
use crate::ensemble::stacking::StackingModel;
use crate::family::{FamilyId, TrainedLearner};
use crate::predictor::predict_path;
use crate::preprocess::{ImputerStats, SchemaError, preprocess};
use crate::taxonomy::TaxonomyArena;
use crate::types::{
    Candidate, EnsembleReport, FeatureSchema, ModelInfo, PredictionPath, TOP_K, TrainingConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to read or write a snapshot artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse a TOML artifact: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize an artifact to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Snapshot artifact {0} does not match the tree structure: {1}")]
    Corrupt(PathBuf, String),
}

#[derive(Error, Debug)]
pub enum ServeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("No ensemble was trained for level '{0}'")]
    UnknownLevel(String),
    #[error(transparent)]
    Combine(#[from] CombineError),
}

/// The single metadata artifact recorded with every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub schema: FeatureSchema,
    pub imputer: ImputerStats,
    pub config: TrainingConfig,
    /// Balanced class weights per stacking level.
    pub class_weights: BTreeMap<String, BTreeMap<String, f64>>,
}

/// One trained taxonomy node's persisted form.
#[derive(Debug, Serialize, Deserialize)]
struct NodeArtifact {
    id: usize,
    name: String,
    classifier: TrainedLearner,
    scaler: crate::preprocess::FittedScaler,
}

#[derive(Debug)]
pub struct ModelSnapshot {
    pub metadata: SnapshotMetadata,
    pub arena: TaxonomyArena,
    pub levels: BTreeMap<String, StackingModel>,
}

impl ModelSnapshot {
    // ------------------------------------------------------------------
    //                          PERSISTENCE
    // ------------------------------------------------------------------

    pub fn save(&self, dir: &Path) -> Result<(), SnapshotError> {
        fs::create_dir_all(dir.join("nodes"))?;
        fs::create_dir_all(dir.join("levels"))?;

        write_toml(&dir.join("metadata.toml"), &self.metadata)?;
        write_toml(&dir.join("tree.toml"), &self.arena)?;

        for (id, node) in self.arena.nodes.iter().enumerate() {
            let (Some(classifier), Some(scaler)) = (&node.classifier, &node.scaler) else {
                continue;
            };
            let artifact = NodeArtifact {
                id,
                name: node.name.clone(),
                classifier: classifier.clone(),
                scaler: scaler.clone(),
            };
            write_toml(&dir.join("nodes").join(format!("{id}.toml")), &artifact)?;
        }

        for (name, level) in &self.levels {
            write_toml(&dir.join("levels").join(format!("{name}.toml")), level)?;
        }

        log::info!(
            "Saved snapshot to {}: {} nodes ({} trained), {} levels",
            dir.display(),
            self.arena.len(),
            self.arena.trained_count(),
            self.levels.len()
        );
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, SnapshotError> {
        let metadata: SnapshotMetadata = read_toml(&dir.join("metadata.toml"))?;
        let mut arena: TaxonomyArena = read_toml(&dir.join("tree.toml"))?;

        let nodes_dir = dir.join("nodes");
        if nodes_dir.is_dir() {
            for entry in fs::read_dir(&nodes_dir)? {
                let path = entry?.path();
                if path.extension().is_none_or(|e| e != "toml") {
                    continue;
                }
                let artifact: NodeArtifact = read_toml(&path)?;
                if artifact.id >= arena.len() {
                    return Err(SnapshotError::Corrupt(
                        path,
                        format!("node id {} out of range", artifact.id),
                    ));
                }
                if arena.get(artifact.id).name != artifact.name {
                    return Err(SnapshotError::Corrupt(
                        path,
                        format!(
                            "artifact names '{}' but the tree has '{}'",
                            artifact.name,
                            arena.get(artifact.id).name
                        ),
                    ));
                }
                let node = arena.get_mut(artifact.id);
                node.classifier = Some(artifact.classifier);
                node.scaler = Some(artifact.scaler);
            }
        }

        let mut levels = BTreeMap::new();
        let levels_dir = dir.join("levels");
        if levels_dir.is_dir() {
            for entry in fs::read_dir(&levels_dir)? {
                let path = entry?.path();
                if path.extension().is_none_or(|e| e != "toml") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let level: StackingModel = read_toml(&path)?;
                levels.insert(stem.to_string(), level);
            }
        }

        Ok(Self {
            metadata,
            arena,
            levels,
        })
    }

    // ------------------------------------------------------------------
    //                            SERVING
    // ------------------------------------------------------------------

    /// Reconciles and imputes a raw vector against the snapshot's schema.
    /// Per-node and per-level scalers are applied downstream, so no global
    /// scaling happens here.
    pub fn prepare_vector(
        &self,
        raw: &[f64],
        declared: &FeatureSchema,
    ) -> Result<Vec<f64>, SchemaError> {
        preprocess(
            raw,
            declared,
            &self.metadata.schema,
            Some(&self.metadata.imputer),
            None,
        )
    }

    /// Greedy tree descent for one raw marker vector.
    pub fn predict_tree(
        &self,
        raw: &[f64],
        declared: &FeatureSchema,
    ) -> Result<PredictionPath, SchemaError> {
        let vector = self.prepare_vector(raw, declared)?;
        Ok(predict_path(&self.arena, &vector))
    }

    /// The full serving answer for one flat level: per-family top-k,
    /// weighted combination, calib-scale confidence, and provenance.
    pub fn predict_report(
        &self,
        level: &str,
        raw: &[f64],
        declared: &FeatureSchema,
        options: &CombineOptions,
        use_ensemble: bool,
    ) -> Result<EnsembleReport, ServeError> {
        let start = Instant::now();
        let vector = self.prepare_vector(raw, declared)?;
        let stacking = self
            .levels
            .get(level)
            .ok_or_else(|| ServeError::UnknownLevel(level.to_string()))?;

        let mut families: BTreeMap<FamilyId, Vec<Candidate>> =
            stacking.family_top_k(&vector, TOP_K.max(5));
        if !use_ensemble {
            // Single-model path: the neural family when present, otherwise
            // the first configured family that produced output.
            let keep = if families.contains_key(&FamilyId::Neural) {
                Some(FamilyId::Neural)
            } else {
                options
                    .weights
                    .iter()
                    .map(|(f, _)| *f)
                    .find(|f| families.contains_key(f))
            };
            families.retain(|f, _| Some(*f) == keep);
        }

        let combined = combine(&families, options)?;
        let attention = stacking.attention_row(&vector);
        let ensemble_used = use_ensemble && combined.families_used.len() > 1;

        Ok(EnsembleReport {
            prediction: combined.label,
            confidence: combined.confidence,
            alternatives: combined.alternatives,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            features_used: raw.len(),
            model_info: ModelInfo {
                families_used: combined
                    .families_used
                    .iter()
                    .map(|f| f.to_string())
                    .collect(),
                ensemble_used,
                attention_weights: attention,
            },
        })
    }

    /// Top-20 markers by impurity importance, read from the root
    /// classifier when one was trained.
    pub fn root_feature_importance(&self) -> Vec<(String, f64)> {
        let root = self.arena.get(self.arena.root());
        let Some(importance) = root
            .classifier
            .as_ref()
            .and_then(|c| c.feature_importance())
        else {
            return Vec::new();
        };
        let mut ranked: Vec<(String, f64)> = self
            .metadata
            .schema
            .names
            .iter()
            .cloned()
            .zip(importance.iter().copied())
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(20);
        ranked
    }
}

fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    let rendered = toml::to_string_pretty(value)?;
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(rendered.as_bytes())?;
    writer.flush()?;
    Ok(())
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, SnapshotError> {
    let raw = fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}
