//! Anomaly detection: shared alert types plus the statistical and neural
//! detectors.
//!
//! Alerts are emitted events, not authoritative state — the engine logs them
//! via `tracing` and counts them in telemetry; acting on them is left to an
//! external alerting collaborator.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod neural;
pub mod statistical;

pub use neural::{NeuralDetection, NeuralDetector};
pub use statistical::{Baseline, StatisticalDetector, Thresholds};

/// Severity classification for a detected anomaly.
///
/// Ordered from least to most severe so `Ord` comparisons are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Notable deviation, worth monitoring.
    High,
    /// Severe deviation, recommend intervention.
    Critical,
}

/// What kind of anomaly was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyKind {
    /// Latency far outside the endpoint's statistical baseline.
    Latency,
    /// Per-request memory delta above the configured cap.
    Memory,
    /// Server-error burst on one endpoint.
    ErrorRate,
    /// Reconstruction error from the neural detector.
    Reconstruction,
}

/// A single detected anomaly event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAlert {
    /// Severity classification.
    pub severity: Severity,
    /// Which detector signal fired.
    pub kind: AnomalyKind,
    /// Human-readable description of what was observed.
    pub message: String,
    /// Named numeric evidence (z-score, observed value, baseline mean, ...).
    pub metrics: HashMap<String, f64>,
    /// A human-readable remediation suggestion.
    pub suggestion: String,
    /// Unix timestamp (seconds) when the anomaly was detected.
    pub detected_at_secs: u64,
}

/// Current unix time in whole seconds, saturating at 0 before the epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
