//! # Nomenclature Lookup Client
//!
//! Resolves haplogroup labels to ancestor paths against the external
//! nomenclature service (`GET {base}/search/{label}`) and assembles the
//! taxonomy arena from the results.
//!
//! The fan-out is bounded: labels are processed in windows of at most
//! `window` simultaneous requests with a pause between windows, respecting
//! the service's rate limits. Individual lookup failures are recoverable by
//! design — the label degrades to its synthetic 2-level fallback path and
//! the batch continues. Cancelling the build stops issuing new windows; the
//! arena keeps whatever paths were inserted, and such a partial tree is
//! valid, just shallower.
//!
//! Known non-determinism: which labels take the fallback branch depends on
//! external-service timing. The tree shape for *resolved* labels is
//! order-invariant (convergent insertion), but fallback branches can differ
//! across runs unless the service itself is deterministic.

use crate::taxonomy::{TaxonomyArena, fallback_path, merge_paths};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Nomenclature service returned status {0}")]
    Status(u16),
}

/// Wire format of the search endpoint: ancestor paths from the two
/// independent nomenclature systems.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    ftdna_path: Vec<String>,
    #[serde(default)]
    yfull_path: Vec<String>,
}

/// Cooperative cancellation handle shared between the build driver and its
/// caller. Checked between lookup windows, never mid-request.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct NomenclatureClient {
    http: reqwest::Client,
    base_url: String,
    window: usize,
    pause: Duration,
}

impl NomenclatureClient {
    pub fn new(base_url: &str, window: usize, pause_ms: u64) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            window: window.max(1),
            pause: Duration::from_millis(pause_ms),
        })
    }

    /// Fetches and merges the two nomenclature paths for one label.
    pub async fn fetch_path(&self, label: &str) -> Result<Vec<String>, LookupError> {
        let url = format!("{}/search/{}", self.base_url, label);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(LookupError::Status(response.status().as_u16()));
        }
        let body: SearchResponse = response.json().await?;
        Ok(merge_paths(&body.ftdna_path, &body.yfull_path))
    }

    /// Builds the taxonomy for a set of distinct labels. Resolution happens
    /// in bounded concurrent windows; each window's results are inserted
    /// before the next window is issued, so cancellation leaves a valid
    /// partial tree.
    pub async fn build_taxonomy(&self, labels: &[String], cancel: &CancelFlag) -> TaxonomyArena {
        let mut arena = TaxonomyArena::new();
        let mut distinct: Vec<&String> = labels.iter().collect();
        distinct.sort();
        distinct.dedup();

        log::info!(
            "Building taxonomy for {} distinct labels ({} per window)",
            distinct.len(),
            self.window
        );

        let mut resolved = 0usize;
        let mut fallbacks = 0usize;
        for (batch_idx, batch) in distinct.chunks(self.window).enumerate() {
            if cancel.is_cancelled() {
                log::warn!(
                    "Taxonomy build cancelled after {} of {} labels; keeping the partial tree",
                    batch_idx * self.window,
                    distinct.len()
                );
                break;
            }
            if batch_idx > 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }

            let fetches = batch.iter().map(|label| self.fetch_path(label));
            let results = futures::future::join_all(fetches).await;

            for (label, result) in batch.iter().zip(results) {
                match result {
                    Ok(path) if !path.is_empty() => {
                        log::debug!("Resolved {label}: {path:?}");
                        arena.insert_path(label, &path);
                        resolved += 1;
                    }
                    Ok(_) => {
                        log::debug!("Empty path for {label}; using fallback");
                        arena.insert_path(label, &fallback_path(label));
                        fallbacks += 1;
                    }
                    Err(err) => {
                        log::warn!("Lookup failed for {label}: {err}; using fallback");
                        arena.insert_path(label, &fallback_path(label));
                        fallbacks += 1;
                    }
                }
            }
        }

        log::info!(
            "Taxonomy built: {} nodes, {} resolved, {} fallback paths",
            arena.len(),
            resolved,
            fallbacks
        );
        arena
    }
}

/// Builds the taxonomy without consulting any external service: every label
/// takes its synthetic fallback path. Used for offline training and tests.
pub fn build_taxonomy_offline(labels: &[String]) -> TaxonomyArena {
    let mut arena = TaxonomyArena::new();
    let mut distinct: Vec<&String> = labels.iter().collect();
    distinct.sort();
    distinct.dedup();
    for label in distinct {
        arena.insert_path(label, &fallback_path(label));
    }
    arena
}
