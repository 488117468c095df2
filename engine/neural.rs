// ========================================================================================
//
//                       ATTENTION-GATED NEURAL CLASSIFIER
//
// ========================================================================================
//
// The neural model family: a single-hidden-layer perceptron with a learned
// per-feature attention gate in front of it. The gate `a = sigmoid(Wg x + bg)`
// rescales the input elementwise before the dense layers, and its activations
// are surfaced as the attention weights reported alongside predictions.
//
// Training is full-batch gradient descent on weighted cross-entropy with L2
// decay. All parameters are initialized from a seeded RNG; a fixed seed
// reproduces the model bit for bit.

use crate::forest::{FitError, balanced_weights, encode_labels};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuralConfig {
    pub hidden: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub l2: f64,
    pub balanced: bool,
}

impl Default for NeuralConfig {
    fn default() -> Self {
        Self {
            hidden: 64,
            epochs: 200,
            learning_rate: 0.05,
            l2: 1e-4,
            balanced: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuralModel {
    pub config: NeuralConfig,
    pub classes: Vec<String>,
    pub n_features: usize,
    w_gate: Array2<f64>,
    b_gate: Array1<f64>,
    w1: Array2<f64>,
    b1: Array1<f64>,
    w2: Array2<f64>,
    b2: Array1<f64>,
}

impl NeuralModel {
    pub fn fit(
        config: &NeuralConfig,
        x: ArrayView2<f64>,
        labels: &[String],
        seed: u64,
    ) -> Result<Self, FitError> {
        if x.nrows() == 0 {
            return Err(FitError::EmptyTrainingSet);
        }
        if labels.len() != x.nrows() {
            return Err(FitError::LabelMismatch {
                labels: labels.len(),
                rows: x.nrows(),
            });
        }
        let (classes, encoded) = encode_labels(labels);
        if classes.len() < 2 {
            return Err(FitError::SingleClass(classes[0].clone()));
        }

        let n = x.nrows();
        let f = x.ncols();
        let h = config.hidden;
        let k = classes.len();
        let mut rng = StdRng::seed_from_u64(seed);

        let mut w_gate = glorot(&mut rng, f, f);
        let mut b_gate = Array1::<f64>::zeros(f);
        let mut w1 = glorot(&mut rng, f, h);
        let mut b1 = Array1::<f64>::zeros(h);
        let mut w2 = glorot(&mut rng, h, k);
        let mut b2 = Array1::<f64>::zeros(k);

        // Per-sample weights, normalized so the loss scale is batch-invariant.
        let class_weights = if config.balanced {
            balanced_weights(&encoded, k)
        } else {
            vec![1.0; k]
        };
        let sample_w: Vec<f64> = encoded.iter().map(|&c| class_weights[c]).collect();
        let w_total: f64 = sample_w.iter().sum();

        let xo = x.to_owned();
        let lr = config.learning_rate;
        for _epoch in 0..config.epochs {
            // Forward.
            let gate = sigmoid(&(xo.dot(&w_gate) + &b_gate));
            let xg = &xo * &gate;
            let pre1 = xg.dot(&w1) + &b1;
            let hidden = pre1.mapv(|v| v.max(0.0));
            let logits = hidden.dot(&w2) + &b2;
            let probs = softmax_rows(&logits);

            // Backward: dZ = (P - Y) * w_i / W.
            let mut dz = probs;
            for i in 0..n {
                dz[[i, encoded[i]]] -= 1.0;
            }
            for (i, mut row) in dz.rows_mut().into_iter().enumerate() {
                let scale = sample_w[i] / w_total;
                row.mapv_inplace(|v| v * scale);
            }

            let dw2 = hidden.t().dot(&dz) + &(w2.mapv(|v| v * config.l2));
            let db2 = dz.sum_axis(Axis(0));
            let mut dh = dz.dot(&w2.t());
            dh.zip_mut_with(&pre1, |g, &p| {
                if p <= 0.0 {
                    *g = 0.0;
                }
            });
            let dw1 = xg.t().dot(&dh) + &(w1.mapv(|v| v * config.l2));
            let db1 = dh.sum_axis(Axis(0));
            let dxg = dh.dot(&w1.t());
            let dpre_gate = &dxg * &xo * &gate * &gate.mapv(|a| 1.0 - a);
            let dw_gate = xo.t().dot(&dpre_gate) + &(w_gate.mapv(|v| v * config.l2));
            let db_gate = dpre_gate.sum_axis(Axis(0));

            w2 -= &dw2.mapv(|v| v * lr);
            b2 -= &db2.mapv(|v| v * lr);
            w1 -= &dw1.mapv(|v| v * lr);
            b1 -= &db1.mapv(|v| v * lr);
            w_gate -= &dw_gate.mapv(|v| v * lr);
            b_gate -= &db_gate.mapv(|v| v * lr);
        }

        Ok(Self {
            config: config.clone(),
            classes,
            n_features: f,
            w_gate,
            b_gate,
            w1,
            b1,
            w2,
            b2,
        })
    }

    pub fn predict_proba_row(&self, row: &[f64]) -> Vec<f64> {
        let x = Array2::from_shape_vec((1, row.len()), row.to_vec())
            .unwrap_or_else(|_| Array2::zeros((1, self.n_features)));
        let gate = sigmoid(&(x.dot(&self.w_gate) + &self.b_gate));
        let xg = &x * &gate;
        let hidden = (xg.dot(&self.w1) + &self.b1).mapv(|v| v.max(0.0));
        let logits = hidden.dot(&self.w2) + &self.b2;
        softmax_rows(&logits).row(0).to_vec()
    }

    /// Gate activations for one row: how strongly each marker is attended.
    pub fn attention_row(&self, row: &[f64]) -> Vec<f64> {
        let x = Array2::from_shape_vec((1, row.len()), row.to_vec())
            .unwrap_or_else(|_| Array2::zeros((1, self.n_features)));
        sigmoid(&(x.dot(&self.w_gate) + &self.b_gate)).row(0).to_vec()
    }
}

fn glorot<R: Rng>(rng: &mut R, rows: usize, cols: usize) -> Array2<f64> {
    let bound = (6.0 / (rows + cols) as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..bound))
}

fn sigmoid(z: &Array2<f64>) -> Array2<f64> {
    z.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

fn softmax_rows(z: &Array2<f64>) -> Array2<f64> {
    let mut out = z.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand_distr::{Distribution, Normal};

    fn blobs() -> (Array2<f64>, Vec<String>) {
        let mut rng = StdRng::seed_from_u64(99);
        let noise = Normal::new(0.0, 0.1).unwrap();
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..40 {
            let (cx, cy, name) = if i % 2 == 0 {
                (1.0, -1.0, "R1b")
            } else {
                (-1.0, 1.0, "I1")
            };
            rows.push(cx + noise.sample(&mut rng));
            rows.push(cy + noise.sample(&mut rng));
            labels.push(name.to_string());
        }
        (Array2::from_shape_vec((40, 2), rows).unwrap(), labels)
    }

    #[test]
    fn learns_linearly_separable_blobs() {
        let (x, labels) = blobs();
        let cfg = NeuralConfig {
            hidden: 8,
            epochs: 300,
            ..NeuralConfig::default()
        };
        let model = NeuralModel::fit(&cfg, x.view(), &labels, 3).unwrap();
        let probs = model.predict_proba_row(&[1.0, -1.0]);
        let r1b = model.classes.iter().position(|c| c == "R1b").unwrap();
        assert!(probs[r1b] > 0.8, "got {probs:?}");
    }

    #[test]
    fn attention_matches_feature_count() {
        let (x, labels) = blobs();
        let cfg = NeuralConfig {
            hidden: 4,
            epochs: 20,
            ..NeuralConfig::default()
        };
        let model = NeuralModel::fit(&cfg, x.view(), &labels, 3).unwrap();
        let gate = model.attention_row(&[0.5, 0.5]);
        assert_eq!(gate.len(), 2);
        assert!(gate.iter().all(|g| (0.0..=1.0).contains(g)));
    }

    #[test]
    fn seeded_fit_is_reproducible() {
        let (x, labels) = blobs();
        let cfg = NeuralConfig {
            hidden: 4,
            epochs: 50,
            ..NeuralConfig::default()
        };
        let a = NeuralModel::fit(&cfg, x.view(), &labels, 21).unwrap();
        let b = NeuralModel::fit(&cfg, x.view(), &labels, 21).unwrap();
        assert_eq!(
            a.predict_proba_row(&[0.2, 0.1]),
            b.predict_proba_row(&[0.2, 0.1])
        );
    }
}
