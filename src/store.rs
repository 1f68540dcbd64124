//! Bounded-retention time-series store for per-request metric samples.
//!
//! ## Responsibility
//! Append-only log of completed-request samples and error events, with
//! "recent N" and "current load" queries. Retention is bounded both by age
//! (configurable horizon) and by a hard sample cap, so memory never grows
//! without bound regardless of traffic.
//!
//! ## Guarantees
//! - Thread-safe: all operations take a single short-held lock
//! - `recent(0)` returns an empty vector, never errors
//! - Samples are returned most recent last (completion order)
//!
//! ## NOT Responsible For
//! - Interpreting samples (detectors and the predictor do that)
//! - Scheduling pruning (the training scheduler calls [`MetricsStore::prune`])

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::HttpMethod;

/// Hard cap on retained samples, independent of the age horizon.
const MAX_SAMPLES: usize = 50_000;

/// Hard cap on retained error events.
const MAX_ERRORS: usize = 10_000;

/// Window used by [`MetricsStore::current_load`].
const LOAD_WINDOW: Duration = Duration::from_secs(60);

/// One completed request, as observed by the engine. Immutable once recorded.
#[derive(Debug, Clone)]
pub struct MetricSample {
    /// When the request completed.
    pub recorded_at: Instant,
    /// Request method.
    pub method: HttpMethod,
    /// Request path (no query string).
    pub path: String,
    /// End-to-end duration in milliseconds. Always finite and >= 0.
    pub duration_ms: f64,
    /// Response status code.
    pub status: u16,
    /// Estimated memory delta attributable to the request, in bytes.
    pub memory_delta_bytes: u64,
    /// Estimated CPU time, in microseconds.
    pub cpu_micros: u64,
    /// Response body size in bytes.
    pub response_size_bytes: u64,
    /// Number of backend queries issued (0 when unknown).
    pub query_count: u32,
    /// Whether the response was served from the adaptive cache.
    pub cache_hit: bool,
}

impl MetricSample {
    /// Aggregation key: method + path.
    pub fn endpoint_key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// A recorded downstream error, used by the error-rate anomaly check.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// When the error was observed.
    pub recorded_at: Instant,
    /// Endpoint key (method + path) the error belongs to.
    pub endpoint: String,
    /// Status code, 500 when the downstream failed without producing one.
    pub status: u16,
}

#[derive(Debug, Default)]
struct StoreInner {
    samples: VecDeque<MetricSample>,
    errors: VecDeque<ErrorEvent>,
}

/// Thread-safe bounded metrics store.
#[derive(Debug)]
pub struct MetricsStore {
    inner: RwLock<StoreInner>,
    retention: Duration,
}

impl MetricsStore {
    /// Create a store retaining samples for `retention_hours`.
    pub fn new(retention_hours: u64) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            retention: Duration::from_secs(retention_hours * 3600),
        }
    }

    /// Append a sample. Enforces the hard cap immediately; age-based pruning
    /// happens in [`MetricsStore::prune`].
    pub fn record(&self, sample: MetricSample) {
        debug_assert!(sample.duration_ms >= 0.0);
        let mut inner = self.inner.write();
        inner.samples.push_back(sample);
        if inner.samples.len() > MAX_SAMPLES {
            inner.samples.pop_front();
        }
    }

    /// Append an error event.
    pub fn record_error(&self, endpoint: impl Into<String>, status: u16) {
        let mut inner = self.inner.write();
        inner.errors.push_back(ErrorEvent {
            recorded_at: Instant::now(),
            endpoint: endpoint.into(),
            status,
        });
        if inner.errors.len() > MAX_ERRORS {
            inner.errors.pop_front();
        }
    }

    /// The most recent `n` samples, oldest first / most recent last.
    ///
    /// `n = 0` returns an empty vector.
    pub fn recent(&self, n: usize) -> Vec<MetricSample> {
        if n == 0 {
            return Vec::new();
        }
        let inner = self.inner.read();
        let skip = inner.samples.len().saturating_sub(n);
        inner.samples.iter().skip(skip).cloned().collect()
    }

    /// Number of requests completed within the last 60 seconds.
    pub fn current_load(&self) -> usize {
        let cutoff = Instant::now()
            .checked_sub(LOAD_WINDOW)
            .unwrap_or_else(Instant::now);
        let inner = self.inner.read();
        inner
            .samples
            .iter()
            .rev()
            .take_while(|s| s.recorded_at >= cutoff)
            .count()
    }

    /// Number of server errors (status >= 500) recorded for `endpoint`
    /// within the trailing `window`.
    pub fn server_errors_within(&self, endpoint: &str, window: Duration) -> usize {
        let cutoff = Instant::now().checked_sub(window).unwrap_or_else(Instant::now);
        let inner = self.inner.read();
        inner
            .errors
            .iter()
            .rev()
            .take_while(|e| e.recorded_at >= cutoff)
            .filter(|e| e.status >= 500 && e.endpoint == endpoint)
            .count()
    }

    /// Drop samples and errors older than the retention horizon.
    pub fn prune(&self) {
        let cutoff = match Instant::now().checked_sub(self.retention) {
            Some(c) => c,
            // Process younger than the horizon: nothing can be stale yet.
            None => return,
        };
        let mut inner = self.inner.write();
        while inner
            .samples
            .front()
            .is_some_and(|s| s.recorded_at < cutoff)
        {
            inner.samples.pop_front();
        }
        while inner.errors.front().is_some_and(|e| e.recorded_at < cutoff) {
            inner.errors.pop_front();
        }
    }

    /// Total retained samples.
    pub fn len(&self) -> usize {
        self.inner.read().samples.len()
    }

    /// True if no samples are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    pub(crate) fn sample(path: &str, duration_ms: f64) -> MetricSample {
        MetricSample {
            recorded_at: Instant::now(),
            method: HttpMethod::Get,
            path: path.to_string(),
            duration_ms,
            status: 200,
            memory_delta_bytes: 1024,
            cpu_micros: (duration_ms * 1000.0) as u64,
            response_size_bytes: 256,
            query_count: 1,
            cache_hit: false,
        }
    }

    #[test]
    fn test_recent_returns_most_recent_last() {
        let store = MetricsStore::new(24);
        for i in 0..5 {
            store.record(sample("/a", i as f64));
        }
        let recent = store.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].duration_ms, 2.0);
        assert_eq!(recent[2].duration_ms, 4.0);
    }

    #[test]
    fn test_recent_zero_is_empty() {
        let store = MetricsStore::new(24);
        store.record(sample("/a", 1.0));
        assert!(store.recent(0).is_empty());
    }

    #[test]
    fn test_recent_larger_than_len_returns_all() {
        let store = MetricsStore::new(24);
        store.record(sample("/a", 1.0));
        assert_eq!(store.recent(100).len(), 1);
    }

    #[test]
    fn test_current_load_counts_fresh_samples() {
        let store = MetricsStore::new(24);
        for _ in 0..7 {
            store.record(sample("/a", 10.0));
        }
        assert_eq!(store.current_load(), 7);
    }

    #[test]
    fn test_current_load_ignores_old_samples() {
        let store = MetricsStore::new(24);
        let mut old = sample("/a", 10.0);
        old.recorded_at = Instant::now() - Duration::from_secs(120);
        store.record(old);
        store.record(sample("/a", 10.0));
        assert_eq!(store.current_load(), 1);
    }

    #[test]
    fn test_hard_cap_bounds_sample_count() {
        let store = MetricsStore::new(24);
        for i in 0..(MAX_SAMPLES + 10) {
            store.record(sample("/a", i as f64));
        }
        assert_eq!(store.len(), MAX_SAMPLES);
        // Oldest were evicted.
        assert_eq!(store.recent(1)[0].duration_ms, (MAX_SAMPLES + 9) as f64);
    }

    #[test]
    fn test_server_errors_within_filters_endpoint_and_class() {
        let store = MetricsStore::new(24);
        store.record_error("GET /a", 500);
        store.record_error("GET /a", 503);
        store.record_error("GET /a", 404); // client error, not counted
        store.record_error("GET /b", 500); // other endpoint
        assert_eq!(
            store.server_errors_within("GET /a", Duration::from_secs(60)),
            2
        );
    }

    #[test]
    fn test_prune_drops_stale_samples() {
        let store = MetricsStore::new(1);
        let mut old = sample("/a", 1.0);
        old.recorded_at = Instant::now() - Duration::from_secs(7200);
        store.record(old);
        store.record(sample("/a", 2.0));
        store.prune();
        assert_eq!(store.len(), 1);
        assert_eq!(store.recent(1)[0].duration_ms, 2.0);
    }
}
