//! Endpoint health scoring for adaptive load decisions.
//!
//! Keeps an exponential moving average of response time and a running
//! success count per endpoint. The combined health score weighs success
//! rate at 70% and responsiveness at 30%; endpoints that have never been
//! seen score a neutral 0.5.

use dashmap::DashMap;

/// EMA smoothing factor for response time.
const ALPHA: f64 = 0.2;

/// Score for endpoints with no recorded traffic.
const NEUTRAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone)]
struct EndpointHealth {
    avg_response_ms: f64,
    total: u64,
    successes: u64,
}

/// Per-endpoint health tracker.
#[derive(Debug, Default)]
pub struct HealthScorer {
    endpoints: DashMap<String, EndpointHealth>,
}

impl HealthScorer {
    /// Create an empty scorer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request for `endpoint`.
    pub fn update(&self, endpoint: &str, response_time_ms: f64, success: bool) {
        let mut entry = self
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointHealth {
                avg_response_ms: response_time_ms,
                total: 0,
                successes: 0,
            });
        entry.avg_response_ms = ALPHA * response_time_ms + (1.0 - ALPHA) * entry.avg_response_ms;
        entry.total += 1;
        if success {
            entry.successes += 1;
        }
    }

    /// Health score in `[0, 1]`:
    /// `0.7·success_rate + 0.3·max(0, 1 − avg_response_ms/1000)`.
    pub fn score(&self, endpoint: &str) -> f64 {
        let Some(health) = self.endpoints.get(endpoint) else {
            return NEUTRAL_SCORE;
        };
        if health.total == 0 {
            return NEUTRAL_SCORE;
        }
        let success_rate = health.successes as f64 / health.total as f64;
        let responsiveness = (1.0 - health.avg_response_ms / 1000.0).max(0.0);
        0.7 * success_rate + 0.3 * responsiveness
    }

    /// Average response time EMA for `endpoint`, if seen.
    pub fn avg_response_ms(&self, endpoint: &str) -> Option<f64> {
        self.endpoints.get(endpoint).map(|h| h.avg_response_ms)
    }
}
