//! Exponential-smoothing latency forecaster.
//!
//! ## Responsibility
//! Forecast per-endpoint latency from historical samples and recommend an
//! [`OptimizationAction`]. With fewer than ten samples for an endpoint the
//! predictor degrades to a fixed low-confidence default rather than guessing.
//!
//! ## Guarantees
//! - Confidence is always in `[0, 1]`; thin history caps it at 0.3
//! - `train` builds complete replacement series and swaps them in; `predict`
//!   never observes a half-updated endpoint series

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::store::MetricSample;
use crate::OptimizationAction;

/// Exponential smoothing factor.
const ALPHA: f64 = 0.3;

/// Minimum per-endpoint samples before a real forecast is attempted.
const MIN_SAMPLES: usize = 10;

/// Endpoints with at least this many samples are "well-observed" and become
/// candidates for the `Optimize` recommendation.
const OPTIMIZE_SAMPLE_FLOOR: usize = 50;

/// Confidence reported when history is too thin to forecast.
const LOW_CONFIDENCE: f64 = 0.3;

/// A latency forecast for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Forecast end-to-end duration in milliseconds.
    pub expected_duration_ms: f64,
    /// Forecast confidence in `[0, 1]`.
    pub confidence: f64,
    /// The action the engine should favour for this endpoint.
    pub recommended_action: OptimizationAction,
    /// Rough memory estimate for serving the request, in bytes.
    pub resource_estimate_bytes: u64,
}

impl Prediction {
    /// The conservative default used when history is insufficient.
    fn low_confidence_default() -> Self {
        Self {
            expected_duration_ms: 50.0,
            confidence: LOW_CONFIDENCE,
            recommended_action: OptimizationAction::Cache,
            resource_estimate_bytes: 64 * 1024,
        }
    }
}

/// Inputs the recommendation rules need beyond the forecast itself.
#[derive(Debug, Clone, Copy)]
pub struct PredictionContext {
    /// Fraction of this endpoint's recent responses served from cache.
    pub cache_hit_rate: f64,
    /// Local hour of day (0–23), used for the business-hours prefetch rule.
    pub hour_of_day: u8,
    /// Whether prefetch recommendations are enabled at all.
    pub prefetching_enabled: bool,
}

/// Per-endpoint duration series, rebuilt on every training cycle.
#[derive(Debug, Default)]
struct Series {
    durations: Vec<f64>,
    cache_hits: usize,
}

/// Exponential-smoothing forecaster with swap-on-train series.
#[derive(Debug, Default)]
pub struct LatencyPredictor {
    series: RwLock<HashMap<String, Series>>,
}

impl LatencyPredictor {
    /// Create an empty predictor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild every endpoint series from a sample snapshot and swap the new
    /// table in atomically.
    pub fn train(&self, data: &[MetricSample]) {
        let mut table: HashMap<String, Series> = HashMap::new();
        for sample in data {
            let series = table.entry(sample.endpoint_key()).or_default();
            series.durations.push(sample.duration_ms);
            if sample.cache_hit {
                series.cache_hits += 1;
            }
        }
        *self.series.write() = table;
    }

    /// Forecast latency for `endpoint` using the trained series plus any
    /// additional recent history the caller has on hand.
    ///
    /// `history` is filtered to the endpoint; samples from other endpoints
    /// are ignored.
    pub fn predict(
        &self,
        endpoint: &str,
        history: &[MetricSample],
        ctx: PredictionContext,
    ) -> Prediction {
        let table = self.series.read();
        let trained = table.get(endpoint);

        let mut durations: Vec<f64> = trained.map(|s| s.durations.clone()).unwrap_or_default();
        let mut cache_hits = trained.map_or(0, |s| s.cache_hits);
        drop(table);

        for sample in history {
            if sample.endpoint_key() == endpoint {
                durations.push(sample.duration_ms);
                if sample.cache_hit {
                    cache_hits += 1;
                }
            }
        }

        if durations.len() < MIN_SAMPLES {
            return Prediction::low_confidence_default();
        }

        // Exponentially smoothed forecast over the series, oldest first.
        let mut forecast = durations[0];
        for d in &durations[1..] {
            forecast = ALPHA * d + (1.0 - ALPHA) * forecast;
        }

        let n = durations.len() as f64;
        let mean = durations.iter().sum::<f64>() / n;
        let variance = durations.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
        let confidence = (1.0 - variance / 1000.0).clamp(0.0, 1.0);

        let cache_hit_rate = (cache_hits as f64 / n).max(ctx.cache_hit_rate);

        let recommended_action = recommend(
            forecast,
            mean,
            durations.len(),
            cache_hit_rate,
            ctx.hour_of_day,
            ctx.prefetching_enabled,
        );

        // Memory scales roughly with time spent holding buffers.
        let resource_estimate_bytes = (forecast * 1024.0) as u64;

        Prediction {
            expected_duration_ms: forecast,
            confidence,
            recommended_action,
            resource_estimate_bytes,
        }
    }

    /// Number of endpoints with a trained series.
    pub fn trained_endpoints(&self) -> usize {
        self.series.read().len()
    }
}

/// Rule-based action choice, checked in priority order.
fn recommend(
    forecast: f64,
    mean: f64,
    samples: usize,
    cache_hit_rate: f64,
    hour_of_day: u8,
    prefetching_enabled: bool,
) -> OptimizationAction {
    if forecast > 2.0 * mean {
        return OptimizationAction::Throttle;
    }
    if forecast > 100.0 && cache_hit_rate < 0.5 {
        return OptimizationAction::Cache;
    }
    if prefetching_enabled && (9..17).contains(&hour_of_day) {
        return OptimizationAction::Prefetch;
    }
    if samples >= OPTIMIZE_SAMPLE_FLOOR && forecast > 50.0 {
        return OptimizationAction::Optimize;
    }
    OptimizationAction::Batch
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::HttpMethod;
    use std::time::Instant;

    fn sample(path: &str, duration_ms: f64, cache_hit: bool) -> MetricSample {
        MetricSample {
            recorded_at: Instant::now(),
            method: HttpMethod::Get,
            path: path.to_string(),
            duration_ms,
            status: 200,
            memory_delta_bytes: 0,
            cpu_micros: 0,
            response_size_bytes: 0,
            query_count: 0,
            cache_hit,
        }
    }

    fn off_hours() -> PredictionContext {
        PredictionContext {
            cache_hit_rate: 1.0,
            hour_of_day: 3,
            prefetching_enabled: false,
        }
    }

    #[test]
    fn test_thin_history_returns_low_confidence_default() {
        let predictor = LatencyPredictor::new();
        let history: Vec<_> = (0..9).map(|_| sample("/a", 10.0, false)).collect();
        let prediction = predictor.predict("GET /a", &history, off_hours());
        assert!(prediction.confidence <= 0.3);
        assert_eq!(prediction.recommended_action, OptimizationAction::Cache);
    }

    #[test]
    fn test_identical_durations_give_full_confidence_and_exact_forecast() {
        let predictor = LatencyPredictor::new();
        let history: Vec<_> = (0..50).map(|_| sample("/a", 42.0, false)).collect();
        let prediction = predictor.predict("GET /a", &history, off_hours());
        assert!((prediction.expected_duration_ms - 42.0).abs() < 1e-9);
        assert!((prediction.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_high_variance_drops_confidence_to_zero() {
        let predictor = LatencyPredictor::new();
        let history: Vec<_> = (0..40)
            .map(|i| sample("/a", if i % 2 == 0 { 5.0 } else { 500.0 }, false))
            .collect();
        let prediction = predictor.predict("GET /a", &history, off_hours());
        assert_eq!(prediction.confidence, 0.0);
    }

    #[test]
    fn test_history_from_other_endpoints_is_ignored() {
        let predictor = LatencyPredictor::new();
        let history: Vec<_> = (0..50).map(|_| sample("/other", 10.0, false)).collect();
        let prediction = predictor.predict("GET /a", &history, off_hours());
        // Nothing relevant → default.
        assert!(prediction.confidence <= 0.3);
    }

    #[test]
    fn test_slow_uncached_endpoint_recommends_cache() {
        let predictor = LatencyPredictor::new();
        let history: Vec<_> = (0..30).map(|_| sample("/slow", 150.0, false)).collect();
        let ctx = PredictionContext {
            cache_hit_rate: 0.0,
            hour_of_day: 3,
            prefetching_enabled: false,
        };
        let prediction = predictor.predict("GET /slow", &history, ctx);
        assert_eq!(prediction.recommended_action, OptimizationAction::Cache);
    }

    #[test]
    fn test_business_hours_recommends_prefetch() {
        let predictor = LatencyPredictor::new();
        let history: Vec<_> = (0..30).map(|_| sample("/a", 10.0, true)).collect();
        let ctx = PredictionContext {
            cache_hit_rate: 1.0,
            hour_of_day: 10,
            prefetching_enabled: true,
        };
        let prediction = predictor.predict("GET /a", &history, ctx);
        assert_eq!(prediction.recommended_action, OptimizationAction::Prefetch);
    }

    #[test]
    fn test_well_observed_moderate_endpoint_recommends_optimize() {
        let predictor = LatencyPredictor::new();
        let history: Vec<_> = (0..60).map(|_| sample("/a", 60.0, true)).collect();
        let prediction = predictor.predict("GET /a", &history, off_hours());
        assert_eq!(prediction.recommended_action, OptimizationAction::Optimize);
    }

    #[test]
    fn test_quiet_endpoint_defaults_to_batch() {
        let predictor = LatencyPredictor::new();
        let history: Vec<_> = (0..20).map(|_| sample("/a", 10.0, true)).collect();
        let prediction = predictor.predict("GET /a", &history, off_hours());
        assert_eq!(prediction.recommended_action, OptimizationAction::Batch);
    }

    #[test]
    fn test_recent_spike_recommends_throttle() {
        let predictor = LatencyPredictor::new();
        let mut history: Vec<_> = (0..30).map(|_| sample("/a", 10.0, true)).collect();
        history.extend((0..10).map(|_| sample("/a", 1_000.0, true)));
        let prediction = predictor.predict("GET /a", &history, off_hours());
        assert_eq!(prediction.recommended_action, OptimizationAction::Throttle);
    }

    #[test]
    fn test_train_then_predict_uses_swapped_series() {
        let predictor = LatencyPredictor::new();
        let data: Vec<_> = (0..50).map(|_| sample("/a", 30.0, false)).collect();
        predictor.train(&data);
        assert_eq!(predictor.trained_endpoints(), 1);
        let prediction = predictor.predict("GET /a", &[], off_hours());
        assert!((prediction.expected_duration_ms - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_retrain_replaces_rather_than_merges() {
        let predictor = LatencyPredictor::new();
        predictor.train(&(0..50).map(|_| sample("/a", 30.0, false)).collect::<Vec<_>>());
        predictor.train(&(0..50).map(|_| sample("/b", 70.0, false)).collect::<Vec<_>>());
        assert_eq!(predictor.trained_endpoints(), 1);
        // "/a" series is gone; with no other history, prediction degrades.
        let prediction = predictor.predict("GET /a", &[], off_hours());
        assert!(prediction.confidence <= 0.3);
    }
}
