//! Request pattern table: one aggregate record per (method, path).
//!
//! Tracks how often each endpoint is hit and an exponentially-averaged
//! duration. The adaptive cache derives TTLs from the hourly request rate
//! recorded here, and the trainer prunes endpoints not seen for the
//! inactivity horizon.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Smoothing factor for the per-endpoint duration EMA.
const DURATION_ALPHA: f64 = 0.2;

/// Endpoints unseen for this long are dropped by [`PatternTable::prune`].
const INACTIVITY_HORIZON: Duration = Duration::from_secs(6 * 3600);

/// Aggregate behaviour of a single endpoint.
#[derive(Debug, Clone)]
pub struct RequestPattern {
    /// Total requests observed since the record was created.
    pub frequency: u64,
    /// Exponential moving average of request duration in milliseconds.
    pub avg_duration_ms: f64,
    /// When the record was created. Used to derive an hourly rate.
    pub first_seen: Instant,
    /// When the endpoint was last hit.
    pub last_seen: Instant,
}

impl RequestPattern {
    /// Observed request rate in requests per hour.
    ///
    /// Uses at least one minute of elapsed time so that a burst of traffic
    /// on a brand-new endpoint does not produce an absurd rate.
    pub fn hourly_rate(&self) -> f64 {
        let elapsed_hours = (self.first_seen.elapsed().as_secs_f64() / 3600.0).max(1.0 / 60.0);
        self.frequency as f64 / elapsed_hours
    }
}

/// Concurrent per-endpoint pattern table.
#[derive(Debug, Default)]
pub struct PatternTable {
    patterns: DashMap<String, RequestPattern>,
}

impl PatternTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request for `endpoint`.
    pub fn observe(&self, endpoint: &str, duration_ms: f64) {
        let now = Instant::now();
        let mut entry = self
            .patterns
            .entry(endpoint.to_string())
            .or_insert_with(|| RequestPattern {
                frequency: 0,
                avg_duration_ms: duration_ms,
                first_seen: now,
                last_seen: now,
            });
        entry.frequency += 1;
        entry.avg_duration_ms =
            DURATION_ALPHA * duration_ms + (1.0 - DURATION_ALPHA) * entry.avg_duration_ms;
        entry.last_seen = now;
    }

    /// Snapshot of the pattern for `endpoint`, if it has been seen.
    pub fn get(&self, endpoint: &str) -> Option<RequestPattern> {
        self.patterns.get(endpoint).map(|p| p.clone())
    }

    /// Drop endpoints that have been inactive past the horizon.
    pub fn prune(&self) {
        self.patterns
            .retain(|_, p| p.last_seen.elapsed() < INACTIVITY_HORIZON);
    }

    /// Number of tracked endpoints.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// True if no endpoint has been observed.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_observe_increments_frequency() {
        let table = PatternTable::new();
        table.observe("GET /a", 10.0);
        table.observe("GET /a", 20.0);
        let pattern = table.get("GET /a").unwrap();
        assert_eq!(pattern.frequency, 2);
    }

    #[test]
    fn test_ema_moves_toward_recent_durations() {
        let table = PatternTable::new();
        table.observe("GET /a", 100.0);
        for _ in 0..50 {
            table.observe("GET /a", 10.0);
        }
        let pattern = table.get("GET /a").unwrap();
        assert!(pattern.avg_duration_ms < 20.0, "{}", pattern.avg_duration_ms);
    }

    #[test]
    fn test_unknown_endpoint_is_none() {
        let table = PatternTable::new();
        assert!(table.get("GET /missing").is_none());
    }

    #[test]
    fn test_hourly_rate_is_positive_after_burst() {
        let table = PatternTable::new();
        for _ in 0..120 {
            table.observe("GET /hot", 5.0);
        }
        let pattern = table.get("GET /hot").unwrap();
        // 120 requests inside the 1-minute rate floor → >= 120/hr... clamped
        // elapsed means the rate can be at most frequency * 60.
        assert!(pattern.hourly_rate() > 0.0);
        assert!(pattern.hourly_rate() <= 120.0 * 60.0);
    }

    #[test]
    fn test_prune_keeps_active_endpoints() {
        let table = PatternTable::new();
        table.observe("GET /a", 10.0);
        table.prune();
        assert_eq!(table.len(), 1);
    }
}
