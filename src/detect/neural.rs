//! Neural anomaly detection via a small autoencoder.
//!
//! A feed-forward network (5 → hidden → 5) with sigmoid activations is
//! trained by stochastic backpropagation to reconstruct min–max-normalised
//! feature vectors `{duration, memory, cpu, response_size, query_count}`.
//! The reconstruction error of a new sample is its anomaly signal: traffic
//! that looks like the training window reconstructs well, traffic that does
//! not reconstructs poorly.
//!
//! Training happens off the request path. [`NeuralDetector::train`] builds a
//! complete replacement network and swaps it in atomically; inference only
//! ever sees a fully-trained or fully-untrained state.

use parking_lot::RwLock;
use rand::Rng;

use crate::store::MetricSample;

/// Input/output dimensionality: the five sample features.
const INPUT_DIM: usize = 5;

/// Hidden layer width.
const HIDDEN_DIM: usize = 8;

/// Minimum samples before training produces a usable network.
const MIN_TRAINING_SAMPLES: usize = 10;

/// Default reconstruction-error threshold for flagging an anomaly.
pub const DEFAULT_THRESHOLD: f64 = 0.3;

/// Default SGD learning rate.
pub const DEFAULT_LEARNING_RATE: f64 = 0.3;

/// Result of scoring one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeuralDetection {
    /// True when the reconstruction error exceeds the threshold.
    pub is_anomaly: bool,
    /// `min(error / threshold, 1)` — how certain the detector is.
    pub confidence: f64,
    /// Raw mean reconstruction error over the normalised features.
    pub score: f64,
}

impl NeuralDetection {
    fn untrained() -> Self {
        Self {
            is_anomaly: false,
            confidence: 0.0,
            score: 0.0,
        }
    }
}

/// Per-feature min–max normalisation bounds captured at training time.
#[derive(Debug, Clone, Copy)]
struct FeatureNorm {
    mins: [f64; INPUT_DIM],
    maxs: [f64; INPUT_DIM],
}

impl FeatureNorm {
    fn fit(vectors: &[[f64; INPUT_DIM]]) -> Self {
        let mut mins = [f64::INFINITY; INPUT_DIM];
        let mut maxs = [f64::NEG_INFINITY; INPUT_DIM];
        for v in vectors {
            for i in 0..INPUT_DIM {
                mins[i] = mins[i].min(v[i]);
                maxs[i] = maxs[i].max(v[i]);
            }
        }
        Self { mins, maxs }
    }

    /// Normalise into `[0, 1]`, clamping out-of-range values. A feature with
    /// zero observed range maps to 0.5 so it carries no signal.
    fn apply(&self, v: &[f64; INPUT_DIM]) -> [f64; INPUT_DIM] {
        let mut out = [0.0; INPUT_DIM];
        for i in 0..INPUT_DIM {
            let range = self.maxs[i] - self.mins[i];
            out[i] = if range <= f64::EPSILON {
                0.5
            } else {
                ((v[i] - self.mins[i]) / range).clamp(0.0, 1.0)
            };
        }
        out
    }
}

/// The learned network. Built whole by `train`, read-only afterwards.
#[derive(Debug, Clone)]
struct NeuralState {
    /// `[HIDDEN_DIM][INPUT_DIM]`
    w_input_hidden: Vec<Vec<f64>>,
    /// `[INPUT_DIM][HIDDEN_DIM]`
    w_hidden_output: Vec<Vec<f64>>,
    bias_hidden: Vec<f64>,
    bias_output: Vec<f64>,
    norm: FeatureNorm,
    trained: bool,
}

impl NeuralState {
    fn untrained() -> Self {
        Self {
            w_input_hidden: vec![vec![0.0; INPUT_DIM]; HIDDEN_DIM],
            w_hidden_output: vec![vec![0.0; HIDDEN_DIM]; INPUT_DIM],
            bias_hidden: vec![0.0; HIDDEN_DIM],
            bias_output: vec![0.0; INPUT_DIM],
            norm: FeatureNorm {
                mins: [0.0; INPUT_DIM],
                maxs: [0.0; INPUT_DIM],
            },
            trained: false,
        }
    }

    fn random(norm: FeatureNorm) -> Self {
        let mut rng = rand::thread_rng();
        let mut weight = || rng.gen_range(-0.5..0.5);
        Self {
            w_input_hidden: (0..HIDDEN_DIM)
                .map(|_| (0..INPUT_DIM).map(|_| weight()).collect())
                .collect(),
            w_hidden_output: (0..INPUT_DIM)
                .map(|_| (0..HIDDEN_DIM).map(|_| weight()).collect())
                .collect(),
            bias_hidden: vec![0.0; HIDDEN_DIM],
            bias_output: vec![0.0; INPUT_DIM],
            norm,
            trained: false,
        }
    }

    /// Forward pass over a normalised input; returns (hidden, output).
    fn forward(&self, x: &[f64; INPUT_DIM]) -> (Vec<f64>, Vec<f64>) {
        let hidden: Vec<f64> = (0..HIDDEN_DIM)
            .map(|h| {
                let sum: f64 = (0..INPUT_DIM).map(|i| self.w_input_hidden[h][i] * x[i]).sum();
                sigmoid(sum + self.bias_hidden[h])
            })
            .collect();
        let output: Vec<f64> = (0..INPUT_DIM)
            .map(|o| {
                let sum: f64 = (0..HIDDEN_DIM)
                    .map(|h| self.w_hidden_output[o][h] * hidden[h])
                    .sum();
                sigmoid(sum + self.bias_output[o])
            })
            .collect();
        (hidden, output)
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Autoencoder-based anomaly detector.
#[derive(Debug)]
pub struct NeuralDetector {
    state: RwLock<NeuralState>,
    learning_rate: f64,
    threshold: f64,
}

impl NeuralDetector {
    /// Create an untrained detector with the given hyperparameters.
    pub fn new(learning_rate: f64, threshold: f64) -> Self {
        Self {
            state: RwLock::new(NeuralState::untrained()),
            learning_rate,
            threshold,
        }
    }

    /// Detector with the documented default hyperparameters.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_LEARNING_RATE, DEFAULT_THRESHOLD)
    }

    /// True once a training cycle has produced a usable network.
    pub fn is_trained(&self) -> bool {
        self.state.read().trained
    }

    /// Train a replacement network on a sample snapshot and swap it in.
    ///
    /// Runs `epochs` stochastic passes over the min–max-normalised feature
    /// vectors, reconstructing the full input vector. Returns the mean loss
    /// of each epoch (empty when there were too few samples to train, in
    /// which case the current network is left untouched).
    pub fn train(&self, data: &[MetricSample], epochs: usize) -> Vec<f64> {
        if data.len() < MIN_TRAINING_SAMPLES || epochs == 0 {
            return Vec::new();
        }

        let raw: Vec<[f64; INPUT_DIM]> = data.iter().map(features).collect();
        let norm = FeatureNorm::fit(&raw);
        let inputs: Vec<[f64; INPUT_DIM]> = raw.iter().map(|v| norm.apply(v)).collect();

        let mut net = NeuralState::random(norm);
        let lr = self.learning_rate;
        let mut epoch_losses = Vec::with_capacity(epochs);

        for epoch in 0..epochs {
            let mut loss = 0.0;
            for x in &inputs {
                let (hidden, output) = net.forward(x);

                // Reconstruction target is the full input vector.
                let mut delta_out = [0.0; INPUT_DIM];
                for o in 0..INPUT_DIM {
                    let err = output[o] - x[o];
                    loss += err * err;
                    delta_out[o] = err * output[o] * (1.0 - output[o]);
                }

                let mut delta_hidden = vec![0.0; HIDDEN_DIM];
                for h in 0..HIDDEN_DIM {
                    let back: f64 = (0..INPUT_DIM)
                        .map(|o| delta_out[o] * net.w_hidden_output[o][h])
                        .sum();
                    delta_hidden[h] = back * hidden[h] * (1.0 - hidden[h]);
                }

                for o in 0..INPUT_DIM {
                    for h in 0..HIDDEN_DIM {
                        net.w_hidden_output[o][h] -= lr * delta_out[o] * hidden[h];
                    }
                    net.bias_output[o] -= lr * delta_out[o];
                }
                for h in 0..HIDDEN_DIM {
                    for i in 0..INPUT_DIM {
                        net.w_input_hidden[h][i] -= lr * delta_hidden[h] * x[i];
                    }
                    net.bias_hidden[h] -= lr * delta_hidden[h];
                }
            }

            let mean_loss = loss / (inputs.len() * INPUT_DIM) as f64;
            tracing::debug!(epoch, loss = mean_loss, "autoencoder epoch complete");
            epoch_losses.push(mean_loss);
        }

        net.trained = true;
        *self.state.write() = net;
        epoch_losses
    }

    /// Score one sample against the current network.
    ///
    /// Untrained detectors always return `{is_anomaly: false, confidence: 0,
    /// score: 0}`.
    pub fn detect(&self, sample: &MetricSample) -> NeuralDetection {
        let state = self.state.read();
        if !state.trained {
            return NeuralDetection::untrained();
        }

        let x = state.norm.apply(&features(sample));
        let (_, output) = state.forward(&x);
        let score = (0..INPUT_DIM)
            .map(|i| (output[i] - x[i]).abs())
            .sum::<f64>()
            / INPUT_DIM as f64;

        NeuralDetection {
            is_anomaly: score > self.threshold,
            confidence: (score / self.threshold).min(1.0),
            score,
        }
    }
}

fn features(sample: &MetricSample) -> [f64; INPUT_DIM] {
    [
        sample.duration_ms,
        sample.memory_delta_bytes as f64,
        sample.cpu_micros as f64,
        sample.response_size_bytes as f64,
        sample.query_count as f64,
    ]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::HttpMethod;
    use std::time::Instant;

    fn sample(duration_ms: f64, memory: u64, size: u64) -> MetricSample {
        MetricSample {
            recorded_at: Instant::now(),
            method: HttpMethod::Get,
            path: "/a".to_string(),
            duration_ms,
            status: 200,
            memory_delta_bytes: memory,
            cpu_micros: (duration_ms * 1000.0) as u64,
            response_size_bytes: size,
            query_count: 1,
            cache_hit: false,
        }
    }

    fn training_data(n: usize) -> Vec<MetricSample> {
        (0..n)
            .map(|i| {
                let jitter = (i % 10) as f64;
                sample(20.0 + jitter, 1_000 + (i % 7) as u64 * 100, 256)
            })
            .collect()
    }

    #[test]
    fn test_untrained_detector_returns_zeroes() {
        let detector = NeuralDetector::with_defaults();
        let detection = detector.detect(&sample(9_999.0, 1, 1));
        assert_eq!(detection, NeuralDetection::untrained());
        assert!(!detector.is_trained());
    }

    #[test]
    fn test_too_few_samples_leaves_detector_untrained() {
        let detector = NeuralDetector::with_defaults();
        let losses = detector.train(&training_data(5), 10);
        assert!(losses.is_empty());
        assert!(!detector.is_trained());
    }

    #[test]
    fn test_training_reports_one_loss_per_epoch() {
        let detector = NeuralDetector::with_defaults();
        let losses = detector.train(&training_data(50), 15);
        assert_eq!(losses.len(), 15);
        assert!(losses.iter().all(|l| l.is_finite() && *l >= 0.0));
        assert!(detector.is_trained());
    }

    #[test]
    fn test_loss_does_not_diverge() {
        let detector = NeuralDetector::with_defaults();
        let losses = detector.train(&training_data(80), 40);
        let first = losses[0];
        let last = losses[losses.len() - 1];
        assert!(last <= first * 1.05, "loss diverged: {first} -> {last}");
    }

    #[test]
    fn test_in_distribution_sample_is_not_anomalous() {
        let detector = NeuralDetector::with_defaults();
        detector.train(&training_data(100), 50);
        let detection = detector.detect(&sample(25.0, 1_300, 256));
        assert!(detection.score.is_finite());
        assert!(
            !detection.is_anomaly,
            "typical sample flagged with score {}",
            detection.score
        );
    }

    #[test]
    fn test_confidence_is_clamped_unit_interval() {
        let detector = NeuralDetector::with_defaults();
        detector.train(&training_data(100), 30);
        for input in [
            sample(25.0, 1_300, 256),
            sample(100_000.0, u64::MAX / 2, 1 << 40),
        ] {
            let detection = detector.detect(&input);
            assert!((0.0..=1.0).contains(&detection.confidence));
            assert!(detection.score >= 0.0);
        }
    }

    #[test]
    fn test_constant_features_normalise_without_nan() {
        let detector = NeuralDetector::with_defaults();
        let constant: Vec<_> = (0..30).map(|_| sample(20.0, 1_000, 256)).collect();
        detector.train(&constant, 10);
        let detection = detector.detect(&sample(20.0, 1_000, 256));
        assert!(detection.score.is_finite());
        assert!(!detection.is_anomaly);
    }
}
