//! Statistical anomaly detection over per-endpoint latency baselines.
//!
//! ## Responsibility
//! Maintain a rolling mean/stddev/percentile baseline per endpoint and flag
//! samples whose latency Z-score, memory delta, or error burst exceed the
//! configured thresholds.
//!
//! ## Guarantees
//! - A zero-variance baseline never causes a failure: the Z-score is treated
//!   as 0 and no latency anomaly is possible
//! - Missing history is treated as "not anomalous", never an error
//! - Baselines are fully recomputed per detection cycle, not merged
//!   incrementally; they are stale between cycles by design

use std::collections::HashMap;

use dashmap::DashMap;

use crate::detect::{unix_now, AnomalyAlert, AnomalyKind, Severity};
use crate::store::MetricSample;

/// Per-endpoint latency baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    /// Mean duration in milliseconds.
    pub mean: f64,
    /// Standard deviation of duration.
    pub stddev: f64,
    /// 95th percentile duration.
    pub p95: f64,
    /// 99th percentile duration.
    pub p99: f64,
    /// Number of samples the baseline was computed from.
    pub samples: usize,
}

/// Detection thresholds.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Z-score above which a [`Severity::High`] latency alert fires.
    pub z_high: f64,
    /// Z-score above which the latency alert escalates to critical.
    pub z_critical: f64,
    /// Per-request memory delta (bytes) above which a memory alert fires.
    pub memory_cap_bytes: u64,
    /// Server errors per endpoint within the trailing minute before a
    /// critical error-rate alert fires.
    pub error_burst: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            z_high: 3.0,
            z_critical: 5.0,
            memory_cap_bytes: 512 * 1024 * 1024,
            error_burst: 10,
        }
    }
}

/// Rolling-baseline statistical detector.
#[derive(Debug)]
pub struct StatisticalDetector {
    thresholds: Thresholds,
    baselines: DashMap<String, Baseline>,
}

impl StatisticalDetector {
    /// Create a detector with the given thresholds.
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            baselines: DashMap::new(),
        }
    }

    /// Compute a baseline from a slice of durations. Returns `None` for an
    /// empty slice.
    pub fn compute_baseline(durations: &[f64]) -> Option<Baseline> {
        if durations.is_empty() {
            return None;
        }
        let n = durations.len() as f64;
        let mean = durations.iter().sum::<f64>() / n;
        let variance = durations.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        let mut sorted = durations.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let pick = |p: f64| {
            let idx = ((p * sorted.len() as f64).ceil() as usize)
                .saturating_sub(1)
                .min(sorted.len() - 1);
            sorted[idx]
        };

        Some(Baseline {
            mean,
            stddev,
            p95: pick(0.95),
            p99: pick(0.99),
            samples: durations.len(),
        })
    }

    /// Recompute every endpoint baseline from a sample snapshot. Called by
    /// the training scheduler; replaces baselines wholesale.
    pub fn retrain(&self, samples: &[MetricSample]) {
        let mut by_endpoint: HashMap<String, Vec<f64>> = HashMap::new();
        for sample in samples {
            by_endpoint
                .entry(sample.endpoint_key())
                .or_default()
                .push(sample.duration_ms);
        }
        for (endpoint, durations) in by_endpoint {
            if let Some(baseline) = Self::compute_baseline(&durations) {
                self.baselines.insert(endpoint, baseline);
            }
        }
    }

    /// Run all statistical checks against one completed request.
    ///
    /// `history` is the recent sample window (all endpoints; filtering
    /// happens here) and `recent_server_errors` is the count of 5xx
    /// responses for this endpoint in the trailing minute.
    pub fn detect(
        &self,
        sample: &MetricSample,
        history: &[MetricSample],
        recent_server_errors: usize,
    ) -> Vec<AnomalyAlert> {
        let mut alerts = Vec::new();
        let endpoint = sample.endpoint_key();

        let durations: Vec<f64> = history
            .iter()
            .filter(|s| s.endpoint_key() == endpoint)
            .map(|s| s.duration_ms)
            .collect();

        if let Some(baseline) = Self::compute_baseline(&durations) {
            self.baselines.insert(endpoint.clone(), baseline);

            // stddev == 0 means every historical sample was identical; no
            // deviation is measurable, so no latency anomaly is possible.
            if baseline.stddev > f64::EPSILON {
                let z = (sample.duration_ms - baseline.mean).abs() / baseline.stddev;
                if z > self.thresholds.z_high {
                    let severity = if z > self.thresholds.z_critical {
                        Severity::Critical
                    } else {
                        Severity::High
                    };
                    alerts.push(AnomalyAlert {
                        severity,
                        kind: AnomalyKind::Latency,
                        message: format!(
                            "{endpoint}: {:.1}ms is {z:.1} stddevs from baseline mean {:.1}ms",
                            sample.duration_ms, baseline.mean
                        ),
                        metrics: HashMap::from([
                            ("z_score".to_string(), z),
                            ("duration_ms".to_string(), sample.duration_ms),
                            ("baseline_mean".to_string(), baseline.mean),
                            ("baseline_stddev".to_string(), baseline.stddev),
                        ]),
                        suggestion:
                            "inspect recent deploys or upstream dependencies for this endpoint; \
                             consider enabling caching or throttling until latency recovers"
                                .to_string(),
                        detected_at_secs: unix_now(),
                    });
                }
            }
        }

        if sample.memory_delta_bytes > self.thresholds.memory_cap_bytes {
            alerts.push(AnomalyAlert {
                severity: Severity::High,
                kind: AnomalyKind::Memory,
                message: format!(
                    "{endpoint}: request allocated {} bytes, above the {} byte cap",
                    sample.memory_delta_bytes, self.thresholds.memory_cap_bytes
                ),
                metrics: HashMap::from([
                    (
                        "memory_delta_bytes".to_string(),
                        sample.memory_delta_bytes as f64,
                    ),
                    (
                        "memory_cap_bytes".to_string(),
                        self.thresholds.memory_cap_bytes as f64,
                    ),
                ]),
                suggestion: "profile this handler for large allocations or response buffering"
                    .to_string(),
                detected_at_secs: unix_now(),
            });
        }

        if recent_server_errors > self.thresholds.error_burst {
            alerts.push(AnomalyAlert {
                severity: Severity::Critical,
                kind: AnomalyKind::ErrorRate,
                message: format!(
                    "{endpoint}: {recent_server_errors} server errors in the last 60s"
                ),
                metrics: HashMap::from([(
                    "server_errors_60s".to_string(),
                    recent_server_errors as f64,
                )]),
                suggestion: "check downstream dependencies and roll back the latest change \
                             for this endpoint"
                    .to_string(),
                detected_at_secs: unix_now(),
            });
        }

        alerts
    }

    /// Normalised anomaly score in `[0, 1]` for a sample, based on the most
    /// recently computed baseline for its endpoint. Unknown endpoints and
    /// zero-variance baselines score 0.
    pub fn score(&self, sample: &MetricSample) -> f64 {
        let Some(baseline) = self.baselines.get(&sample.endpoint_key()) else {
            return 0.0;
        };
        if baseline.stddev <= f64::EPSILON {
            return 0.0;
        }
        let z = (sample.duration_ms - baseline.mean).abs() / baseline.stddev;
        (z / self.thresholds.z_critical).clamp(0.0, 1.0)
    }

    /// Most recent baseline for an endpoint, if one has been computed.
    pub fn baseline(&self, endpoint: &str) -> Option<Baseline> {
        self.baselines.get(endpoint).map(|b| *b)
    }
}

impl Default for StatisticalDetector {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}
