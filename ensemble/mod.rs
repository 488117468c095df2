//! # Flat-Level Ensemble Machinery
//!
//! Everything that operates on a single flat classification level rather
//! than the taxonomy tree: stratified out-of-fold stacking, probability
//! calibration, quality metrics, and the multi-family combiner that merges
//! independently trained families into one ranked answer.
//!
//! A "level" is a derived label granularity: `root` (the substring before
//! the first separator), `major` (the first two dash-separated segments),
//! or `terminal` (the full haplogroup code). One stacking ensemble is
//! trained per level.

use serde::{Deserialize, Serialize};

pub mod calibration;
pub mod combine;
pub mod folds;
pub mod metrics;
pub mod stacking;

/// The flat label granularities the engine trains ensembles for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Root,
    Major,
    Terminal,
}

pub const ALL_LEVELS: [Level; 3] = [Level::Root, Level::Major, Level::Terminal];

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Root => "root",
            Level::Major => "major",
            Level::Terminal => "terminal",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "root" => Some(Level::Root),
            "major" => Some(Level::Major),
            "terminal" => Some(Level::Terminal),
            _ => None,
        }
    }

    /// Projects a full haplogroup code onto this granularity.
    pub fn target(&self, label: &str) -> String {
        match self {
            Level::Root => label
                .split('-')
                .next()
                .unwrap_or(label)
                .to_string(),
            Level::Major => {
                let mut parts = label.splitn(3, '-');
                match (parts.next(), parts.next()) {
                    (Some(a), Some(b)) => format!("{a}-{b}"),
                    _ => label.to_string(),
                }
            }
            Level::Terminal => label.to_string(),
        }
    }

    /// Derived per-level target vector for a full label column.
    pub fn targets(&self, labels: &[String]) -> Vec<String> {
        labels.iter().map(|l| self.target(l)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_targets_project_the_label() {
        assert_eq!(Level::Root.target("R1b-M269-U106"), "R1b");
        assert_eq!(Level::Major.target("R1b-M269-U106"), "R1b-M269");
        assert_eq!(Level::Terminal.target("R1b-M269-U106"), "R1b-M269-U106");
        assert_eq!(Level::Major.target("I1"), "I1");
    }

    #[test]
    fn level_names_round_trip() {
        for level in ALL_LEVELS {
            assert_eq!(Level::parse(level.as_str()), Some(level));
        }
        assert_eq!(Level::parse("sub"), None);
    }
}
