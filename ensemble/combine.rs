// ========================================================================================
//
//                         MULTI-FAMILY COMBINER
//
// ========================================================================================
//
// Merges the ranked top-k outputs of independently trained model families
// into one answer using fixed blending weights. A label's combined score is
// the weight-probability sum over the families that ranked it; labels a
// family left out of its top-k contribute zero for that family.
//
// Policy decision, stated explicitly because it changes the absolute
// confidence scale: when a configured family is absent at serving time its
// weight is dropped and the remaining weights are NOT renormalized, unless
// `renormalize_absent` opts in. With exactly one family present the
// combination degenerates to that family's own top-1 with its native,
// unweighted probability.

use crate::family::FamilyId;
use crate::types::Candidate;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CombineError {
    /// The one hard inference-time failure: every configured family failed
    /// to produce output.
    #[error("no valid predictions from any configured model family")]
    NoValidPredictions,
}

#[derive(Debug, Clone)]
pub struct CombineOptions {
    /// Configured families with their fixed blending weights.
    pub weights: Vec<(FamilyId, f64)>,
    pub renormalize_absent: bool,
    /// Caller-supplied minimum confidence; alternatives below half of it
    /// are filtered out.
    pub min_confidence: f64,
}

impl Default for CombineOptions {
    fn default() -> Self {
        Self {
            weights: vec![
                (FamilyId::Neural, 0.6),
                (FamilyId::Boosted, 0.25),
                (FamilyId::Stacked, 0.15),
            ],
            renormalize_absent: false,
            min_confidence: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Combined {
    pub label: String,
    pub confidence: f64,
    pub alternatives: Vec<Candidate>,
    pub families_used: Vec<FamilyId>,
}

/// Combines per-family ranked candidates under the configured weights.
pub fn combine(
    family_top_k: &BTreeMap<FamilyId, Vec<Candidate>>,
    options: &CombineOptions,
) -> Result<Combined, CombineError> {
    let present: Vec<(FamilyId, f64)> = options
        .weights
        .iter()
        .filter(|(family, _)| {
            family_top_k
                .get(family)
                .is_some_and(|candidates| !candidates.is_empty())
        })
        .copied()
        .collect();
    if present.is_empty() {
        return Err(CombineError::NoValidPredictions);
    }

    if present.len() == 1 {
        // Single present family: its own answer, unweighted.
        let (family, _) = present[0];
        let candidates = &family_top_k[&family];
        let top = &candidates[0];
        return Ok(Combined {
            label: top.label.clone(),
            confidence: top.probability,
            alternatives: filter_alternatives(&candidates[1..], options.min_confidence),
            families_used: vec![family],
        });
    }

    let weight_sum: f64 = present.iter().map(|(_, w)| w).sum();
    let scale = if options.renormalize_absent && weight_sum > 0.0 {
        1.0 / weight_sum
    } else {
        1.0
    };

    let mut scores: BTreeMap<&str, f64> = BTreeMap::new();
    for (family, weight) in &present {
        for candidate in &family_top_k[family] {
            *scores.entry(candidate.label.as_str()).or_insert(0.0) +=
                weight * scale * candidate.probability;
        }
    }

    let mut ranked: Vec<Candidate> = scores
        .into_iter()
        .map(|(label, probability)| Candidate {
            label: label.to_string(),
            probability,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.label.cmp(&b.label))
    });

    let top = ranked.remove(0);
    Ok(Combined {
        label: top.label,
        confidence: top.probability,
        alternatives: filter_alternatives(&ranked, options.min_confidence),
        families_used: present.iter().map(|(f, _)| *f).collect(),
    })
}

fn filter_alternatives(candidates: &[Candidate], min_confidence: f64) -> Vec<Candidate> {
    candidates
        .iter()
        .filter(|c| c.probability >= min_confidence * 0.5)
        .cloned()
        .collect()
}
