//! # Marker Preprocessing
//!
//! Pure transformations between a raw marker vector and the normalized form
//! the classifiers were trained on: schema reconciliation, sentinel
//! imputation against training medians, and fitted standardization.
//!
//! `preprocess` is a pure function of its inputs; nothing here mutates
//! shared state. The only failure mode is a structural mismatch between a
//! fitted transform and the schema it is applied under — transforms are
//! keyed by position, so a width disagreement cannot be reconciled by name.

use crate::types::{FeatureSchema, MISSING_SENTINEL};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Scaler was fitted for {scaler} features but the schema has {schema}.")]
    ScalerWidth { scaler: usize, schema: usize },
    #[error("Imputer holds {imputer} medians but the schema has {schema} features.")]
    ImputerWidth { imputer: usize, schema: usize },
}

/// Per-feature training-set medians used to impute unmeasured markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputerStats {
    pub medians: Vec<f64>,
}

impl ImputerStats {
    /// Computes per-column medians over measured (non-sentinel) values.
    /// A column with no measured values gets median `0`.
    pub fn fit(x: ArrayView2<f64>) -> Self {
        let medians = x
            .columns()
            .into_iter()
            .map(|col| {
                let mut measured: Vec<f64> = col
                    .iter()
                    .copied()
                    .filter(|v| *v != MISSING_SENTINEL)
                    .collect();
                if measured.is_empty() {
                    return 0.0;
                }
                measured.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = measured.len() / 2;
                if measured.len() % 2 == 0 {
                    (measured[mid - 1] + measured[mid]) / 2.0
                } else {
                    measured[mid]
                }
            })
            .collect();
        Self { medians }
    }

    pub fn len(&self) -> usize {
        self.medians.len()
    }

    pub fn is_empty(&self) -> bool {
        self.medians.is_empty()
    }
}

/// A fitted standardization: zero mean, unit variance per feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedScaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl FittedScaler {
    pub fn fit(x: ArrayView2<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let mut means = Vec::with_capacity(x.ncols());
        let mut stds = Vec::with_capacity(x.ncols());
        for col in x.columns() {
            let mean = col.sum() / n;
            let var = col.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
            let std = var.sqrt();
            means.push(mean);
            // A constant column would otherwise divide by zero.
            stds.push(if std > 0.0 { std } else { 1.0 });
        }
        Self { means, stds }
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn transform_in_place(&self, v: &mut [f64]) {
        for (i, value) in v.iter_mut().enumerate() {
            *value = (*value - self.means[i]) / self.stds[i];
        }
    }

    /// Standardizes a whole matrix, returning a new one.
    pub fn transform_matrix(&self, x: ArrayView2<f64>) -> ndarray::Array2<f64> {
        let mut out = x.to_owned();
        for mut row in out.rows_mut() {
            for (i, value) in row.iter_mut().enumerate() {
                *value = (*value - self.means[i]) / self.stds[i];
            }
        }
        out
    }
}

/// Reconciles a raw vector declared under `declared` to the `training`
/// schema: features missing from the declaration are inserted as `0`,
/// extras are dropped, and the output order matches `training` exactly.
pub fn reconcile(raw: &[f64], declared: &FeatureSchema, training: &FeatureSchema) -> Vec<f64> {
    training
        .names
        .iter()
        .map(|name| {
            declared
                .position(name)
                .and_then(|pos| raw.get(pos).copied())
                .unwrap_or(0.0)
        })
        .collect()
}

/// The full preprocessing contract: reconcile to the training schema,
/// impute sentinels against training medians (pass-through when no stats
/// are available), then apply the fitted standardization (pass-through when
/// no scaler was fitted).
pub fn preprocess(
    raw: &[f64],
    declared: &FeatureSchema,
    training: &FeatureSchema,
    imputer: Option<&ImputerStats>,
    scaler: Option<&FittedScaler>,
) -> Result<Vec<f64>, SchemaError> {
    if let Some(imp) = imputer
        && imp.len() != training.len()
    {
        return Err(SchemaError::ImputerWidth {
            imputer: imp.len(),
            schema: training.len(),
        });
    }
    if let Some(sc) = scaler
        && sc.len() != training.len()
    {
        return Err(SchemaError::ScalerWidth {
            scaler: sc.len(),
            schema: training.len(),
        });
    }

    let mut v = if declared == training {
        raw.to_vec()
    } else {
        reconcile(raw, declared, training)
    };

    if let Some(imp) = imputer {
        for (i, value) in v.iter_mut().enumerate() {
            if *value == MISSING_SENTINEL {
                *value = imp.medians[i];
            }
        }
    }

    if let Some(sc) = scaler {
        sc.transform_in_place(&mut v);
    }

    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn schema(names: &[&str]) -> FeatureSchema {
        FeatureSchema::new(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn medians_ignore_sentinels() {
        let x = array![[13.0, -1.0], [15.0, 24.0], [-1.0, 26.0]];
        let stats = ImputerStats::fit(x.view());
        assert_abs_diff_eq!(stats.medians[0], 14.0);
        assert_abs_diff_eq!(stats.medians[1], 25.0);
    }

    #[test]
    fn all_sentinel_vector_becomes_median_vector() {
        let x = array![[13.0, 22.0], [15.0, 24.0], [14.0, 26.0]];
        let stats = ImputerStats::fit(x.view());
        let s = schema(&["a", "b"]);
        let raw = vec![MISSING_SENTINEL, MISSING_SENTINEL];

        let first = preprocess(&raw, &s, &s, Some(&stats), None).unwrap();
        let second = preprocess(&raw, &s, &s, Some(&stats), None).unwrap();
        assert_eq!(first, vec![14.0, 24.0]);
        assert_eq!(first, second);
    }

    #[test]
    fn sentinels_pass_through_without_imputer() {
        let s = schema(&["a"]);
        let out = preprocess(&[MISSING_SENTINEL], &s, &s, None, None).unwrap();
        assert_eq!(out, vec![MISSING_SENTINEL]);
    }

    #[test]
    fn reconciliation_inserts_zero_and_drops_extras() {
        let declared = schema(&["b", "c", "a"]);
        let training = schema(&["a", "b"]);
        let out = reconcile(&[2.0, 9.0, 1.0], &declared, &training);
        assert_eq!(out, vec![1.0, 2.0]);

        let declared = schema(&["a"]);
        let out = reconcile(&[1.0], &declared, &training);
        assert_eq!(out, vec![1.0, 0.0]);
    }

    #[test]
    fn scaler_standardizes_and_guards_constant_columns() {
        let x = array![[1.0, 5.0], [3.0, 5.0]];
        let sc = FittedScaler::fit(x.view());
        let mut v = vec![2.0, 5.0];
        sc.transform_in_place(&mut v);
        assert_abs_diff_eq!(v[0], 0.0);
        assert_abs_diff_eq!(v[1], 0.0);
    }

    #[test]
    fn width_mismatch_is_a_schema_error() {
        let s = schema(&["a", "b"]);
        let sc = FittedScaler {
            means: vec![0.0],
            stds: vec![1.0],
        };
        let err = preprocess(&[1.0, 2.0], &s, &s, None, Some(&sc)).unwrap_err();
        assert!(matches!(err, SchemaError::ScalerWidth { .. }));
    }
}
