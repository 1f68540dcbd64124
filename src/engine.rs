//! The optimization engine: the single entry point host frameworks wire in.
//!
//! ## Responsibility
//! Own every subsystem (store, detectors, predictor, allocator, cache,
//! batcher, pattern table, route filter) and run one request through the
//! full pipeline via [`OptimizationEngine::wrap`]:
//!
//! ```text
//! cache lookup → coalescing → route-filter gate → downstream (once)
//!     → record metrics → anomaly checks → pattern / health / cache updates
//!     → allocator reward → response headers
//! ```
//!
//! ## Guarantees
//! - Downstream errors are re-thrown unchanged in their original type; the
//!   engine never wraps, retries, or replaces them
//! - With every feature flag disabled the engine is a transparent
//!   pass-through: the only change to the downstream result is a set of
//!   neutral diagnostic headers
//! - The downstream closure is invoked at most once per `wrap` call
//!
//! ## NOT Responsible For
//! - Transport concerns (TLS, compression, connection pooling)
//! - Acting on anomaly alerts (they are logged and counted only)

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::allocator::{Allocation, AvailableResources, Priority, ResourceAllocator};
use crate::batcher::{BatchRole, RequestBatcher};
use crate::bloom::RouteFilter;
use crate::cache::AdaptiveCache;
use crate::config::EngineConfig;
use crate::detect::{NeuralDetector, StatisticalDetector, Thresholds};
use crate::health::HealthScorer;
use crate::patterns::PatternTable;
use crate::predictor::{LatencyPredictor, Prediction, PredictionContext};
use crate::store::{MetricSample, MetricsStore};
use crate::{config::ConfigError, telemetry, EngineResponse, HttpMethod, RequestContext};

/// Sample window handed to the predictor and detectors per request.
const HISTORY_WINDOW: usize = 500;

/// Sample window handed to the trainers per cycle.
const TRAINING_WINDOW: usize = 5_000;

/// Autoencoder passes per training cycle.
const TRAINING_EPOCHS: usize = 30;

/// Requests per minute treated as full load when bucketing allocator state.
const LOAD_CAPACITY: f64 = 1_000.0;

/// Error-rate lookback for the burst check.
const ERROR_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced: AtomicU64,
    filtered: AtomicU64,
    downstream_errors: AtomicU64,
    anomalies: AtomicU64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStats {
    /// Requests that completed through `wrap`, any outcome.
    pub requests_total: u64,
    /// Responses served from the adaptive cache.
    pub cache_hits: u64,
    /// Cache lookups that missed (caching enabled, GET only).
    pub cache_misses: u64,
    /// Requests that received a coalesced response instead of executing.
    pub coalesced_requests: u64,
    /// Requests rejected by the route filter.
    pub filtered_requests: u64,
    /// Downstream calls that returned an error.
    pub downstream_errors: u64,
    /// Anomaly alerts raised across both detectors.
    pub anomalies_detected: u64,
    /// `cache_hits / (cache_hits + cache_misses)`, 0 with no lookups.
    pub cache_hit_rate: f64,
}

/// The adaptive request-path optimization engine.
///
/// Construct one per service with [`OptimizationEngine::new`], share it via
/// `Arc`, and route every request through [`OptimizationEngine::wrap`]. Pair
/// it with a [`crate::trainer::TrainingScheduler`] so the models keep up
/// with traffic.
#[derive(Debug)]
pub struct OptimizationEngine {
    config: EngineConfig,
    store: MetricsStore,
    patterns: PatternTable,
    routes: RwLock<RouteFilter>,
    statistical: StatisticalDetector,
    neural: NeuralDetector,
    predictor: LatencyPredictor,
    allocator: ResourceAllocator,
    health: HealthScorer,
    cache: AdaptiveCache,
    batcher: RequestBatcher,
    counters: Counters,
}

impl OptimizationEngine {
    /// Build an engine from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the configuration violates any
    /// semantic constraint.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let thresholds = Thresholds {
            memory_cap_bytes: config.performance.max_memory_mb * 1024 * 1024,
            ..Thresholds::default()
        };

        Ok(Self {
            store: MetricsStore::new(config.performance.metrics_retention_hours),
            patterns: PatternTable::new(),
            routes: RwLock::new(RouteFilter::with_defaults()),
            statistical: StatisticalDetector::new(thresholds),
            neural: NeuralDetector::with_defaults(),
            predictor: LatencyPredictor::new(),
            allocator: ResourceAllocator::with_defaults(),
            health: HealthScorer::new(),
            cache: AdaptiveCache::new(),
            batcher: RequestBatcher::new(Duration::from_millis(
                config.performance.batch_window_ms,
            )),
            counters: Counters::default(),
            config,
        })
    }

    /// Register a known route path with the probabilistic route filter.
    ///
    /// Once at least one route is registered, requests to paths the filter
    /// rejects are answered with a 404 without reaching the downstream
    /// handler. An engine with no registered routes gates nothing.
    pub fn register_route(&self, path: &str) {
        self.routes.write().add(path);
    }

    /// Run one request through the optimization pipeline.
    ///
    /// `downstream` is the rest of the request chain; it is invoked at most
    /// once, and only when neither the cache nor a coalescing leader can
    /// supply the response.
    ///
    /// # Errors
    ///
    /// Propagates the downstream error unchanged. The engine records the
    /// failure in its metrics before re-throwing.
    pub async fn wrap<F, Fut, E>(&self, ctx: RequestContext, downstream: F) -> Result<EngineResponse, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<EngineResponse, E>>,
    {
        // With every feature off the engine forwards the downstream result
        // with nothing but neutral diagnostic headers added.
        if self.is_passthrough() {
            let mut response = downstream().await?;
            self.stamp_headers(&mut response, "MISS", None, 0.0);
            return Ok(response);
        }

        let started = Instant::now();
        let endpoint = ctx.endpoint_key();
        let cache_key = ctx.cache_key();
        let cacheable = self.config.enable_caching && ctx.method == HttpMethod::Get;

        // ── Cache ─────────────────────────────────────────────────────
        if cacheable {
            if let Some(mut hit) = self.cache.get(&cache_key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.counters.requests.fetch_add(1, Ordering::Relaxed);
                telemetry::inc_cache_hit();
                telemetry::inc_request("ok");

                let duration_ms = elapsed_ms(started);
                self.record_sample(&ctx, &hit, duration_ms, true);
                self.patterns.observe(&endpoint, duration_ms);
                self.health.update(&endpoint, duration_ms, true);

                let prediction = self.predict(&endpoint);
                self.stamp_headers(&mut hit, "HIT", prediction.as_ref(), 0.0);
                debug!(%endpoint, "served from cache");
                return Ok(hit);
            }
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
            telemetry::inc_cache_miss();
        }

        // ── Coalescing ────────────────────────────────────────────────
        let mut lead_token = None;
        if self.config.enable_batching && ctx.method == HttpMethod::Get {
            match self.batcher.join(&cache_key) {
                BatchRole::Leader(token) => {
                    telemetry::inc_batch_join("leader");
                    lead_token = Some(token);
                }
                BatchRole::Follower(rx) => {
                    telemetry::inc_batch_join("follower");
                    if let Some(mut shared) = RequestBatcher::wait(rx).await {
                        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                        self.counters.requests.fetch_add(1, Ordering::Relaxed);
                        telemetry::inc_request("coalesced");

                        let duration_ms = elapsed_ms(started);
                        let success = shared.status < 500;
                        if !success {
                            self.store.record_error(&endpoint, shared.status);
                        }
                        self.record_sample(&ctx, &shared, duration_ms, false);
                        self.patterns.observe(&endpoint, duration_ms);
                        self.health.update(&endpoint, duration_ms, success);

                        shared
                            .headers
                            .insert("x-optimization-applied".to_string(), "batch".to_string());
                        debug!(%endpoint, "coalesced onto in-flight request");
                        return Ok(shared);
                    }
                    // Leader failed; execute downstream ourselves, without
                    // opening a group of our own.
                    debug!(%endpoint, "coalescing leader failed, executing directly");
                }
            }
        }

        // ── Route-filter gate ─────────────────────────────────────────
        {
            let routes = self.routes.read();
            if routes.inserted() > 0 && !routes.test(&ctx.path) {
                drop(routes);
                self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                self.counters.requests.fetch_add(1, Ordering::Relaxed);
                telemetry::inc_request("filtered");
                if let Some(token) = lead_token {
                    self.batcher.complete(token, None);
                }
                debug!(path = %ctx.path, "route filter rejected unknown path");
                return Ok(EngineResponse::status(404));
            }
        }

        // ── Forecast and allocation ───────────────────────────────────
        let prediction = self.predict(&endpoint);
        let allocation = self.allocate();

        // ── Downstream, exactly once ──────────────────────────────────
        let mut cancel_guard = CancelGuard {
            engine: self,
            ctx: &ctx,
            started,
            armed: true,
        };
        let result = downstream().await;
        cancel_guard.armed = false;
        let duration_ms = elapsed_ms(started);

        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                self.counters.downstream_errors.fetch_add(1, Ordering::Relaxed);
                self.counters.requests.fetch_add(1, Ordering::Relaxed);
                telemetry::inc_request("error");

                self.store.record_error(&endpoint, 500);
                self.record_failure(&ctx, duration_ms);
                self.health.update(&endpoint, duration_ms, false);
                if let Some(alloc) = allocation {
                    self.allocator.update_q_value(
                        alloc.state,
                        alloc.action,
                        ResourceAllocator::reward_for(duration_ms, self.target_ms(), false),
                    );
                }
                if let Some(token) = lead_token {
                    self.batcher.complete(token, None);
                }
                return Err(e);
            }
        };

        // ── Observation ───────────────────────────────────────────────
        let success = response.status < 500;
        if !success {
            self.store.record_error(&endpoint, response.status);
        }
        let sample = self.record_sample(&ctx, &response, duration_ms, false);
        self.patterns.observe(&endpoint, duration_ms);
        self.health.update(&endpoint, duration_ms, success);

        let anomaly_score = self.detect(&sample);

        if let Some(alloc) = allocation {
            self.allocator.update_q_value(
                alloc.state,
                alloc.action,
                ResourceAllocator::reward_for(duration_ms, self.target_ms(), success),
            );
        }

        // ── Cache fill ────────────────────────────────────────────────
        if cacheable && (response.status == 200 || response.status == 304) {
            let rate = self
                .patterns
                .get(&endpoint)
                .map_or(0.0, |p| p.hourly_rate());
            self.cache.store(&cache_key, response.clone(), rate);
        }

        // ── Headers and hand-back ─────────────────────────────────────
        self.stamp_headers(&mut response, "MISS", prediction.as_ref(), anomaly_score);

        if let Some(token) = lead_token {
            self.batcher.complete(token, Some(response.clone()));
        }

        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        telemetry::inc_request("ok");
        telemetry::observe_request_duration(ctx.method.as_str(), started.elapsed());

        Ok(response)
    }

    /// One background training cycle: retrain every model from a metrics
    /// snapshot, then prune stale state. Invoked by the training scheduler;
    /// callable directly in tests or embedded setups.
    pub fn train_tick(&self) {
        let snapshot = self.store.recent(TRAINING_WINDOW);

        if self.config.ml.enabled && !snapshot.is_empty() {
            self.predictor.train(&snapshot);
            self.statistical.retrain(&snapshot);
            let losses = self.neural.train(&snapshot, TRAINING_EPOCHS);
            info!(
                samples = snapshot.len(),
                endpoints = self.predictor.trained_endpoints(),
                final_loss = losses.last().copied().unwrap_or(0.0),
                "training cycle complete"
            );
        }

        self.store.prune();
        self.patterns.prune();
        self.cache.sweep();
        telemetry::inc_training_run();
    }

    /// Snapshot of the engine's counters.
    pub fn stats(&self) -> EngineStats {
        let hits = self.counters.cache_hits.load(Ordering::Relaxed);
        let misses = self.counters.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        EngineStats {
            requests_total: self.counters.requests.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            coalesced_requests: self.counters.coalesced.load(Ordering::Relaxed),
            filtered_requests: self.counters.filtered.load(Ordering::Relaxed),
            downstream_errors: self.counters.downstream_errors.load(Ordering::Relaxed),
            anomalies_detected: self.counters.anomalies.load(Ordering::Relaxed),
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// The engine's configuration (immutable after construction).
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Health score in `[0, 1]` for an endpoint key (`"GET /path"`).
    pub fn endpoint_health(&self, endpoint: &str) -> f64 {
        self.health.score(endpoint)
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn is_passthrough(&self) -> bool {
        !self.config.enable_caching
            && !self.config.enable_batching
            && !self.config.enable_prefetching
            && !self.config.ml.enabled
    }

    fn target_ms(&self) -> f64 {
        self.config.performance.target_latency_ms as f64
    }

    fn predict(&self, endpoint: &str) -> Option<Prediction> {
        if !self.config.ml.enabled {
            return None;
        }
        let stats = self.stats();
        let ctx = PredictionContext {
            cache_hit_rate: stats.cache_hit_rate,
            hour_of_day: utc_hour(),
            prefetching_enabled: self.config.enable_prefetching,
        };
        Some(
            self.predictor
                .predict(endpoint, &self.store.recent(HISTORY_WINDOW), ctx),
        )
    }

    fn allocate(&self) -> Option<Allocation> {
        if !self.config.ml.enabled {
            return None;
        }
        let load_ratio = (self.store.current_load() as f64 / LOAD_CAPACITY).min(1.0);
        let available = AvailableResources {
            memory_bytes: self.config.performance.max_memory_mb * 1024 * 1024,
            cpu_millis: 4_000,
            workers: 16,
        };
        Some(self.allocator.allocate(
            load_ratio,
            1.0 - load_ratio,
            available,
            Priority::Normal,
        ))
    }

    fn record_sample(
        &self,
        ctx: &RequestContext,
        response: &EngineResponse,
        duration_ms: f64,
        cache_hit: bool,
    ) -> MetricSample {
        let sample = MetricSample {
            recorded_at: Instant::now(),
            method: ctx.method,
            path: ctx.path.clone(),
            duration_ms,
            status: response.status,
            // Body size stands in for the request's memory footprint; the
            // host process does not expose per-request allocation counters.
            memory_delta_bytes: response.body.len() as u64,
            cpu_micros: (duration_ms * 1_000.0) as u64,
            response_size_bytes: response.body.len() as u64,
            query_count: 0,
            cache_hit,
        };
        self.store.record(sample.clone());
        sample
    }

    fn record_failure(&self, ctx: &RequestContext, duration_ms: f64) {
        self.store.record(MetricSample {
            recorded_at: Instant::now(),
            method: ctx.method,
            path: ctx.path.clone(),
            duration_ms,
            status: 500,
            memory_delta_bytes: 0,
            cpu_micros: (duration_ms * 1_000.0) as u64,
            response_size_bytes: 0,
            query_count: 0,
            cache_hit: false,
        });
    }

    /// Run both detectors over a freshly recorded sample; returns the
    /// combined anomaly score for the response header.
    fn detect(&self, sample: &MetricSample) -> f64 {
        if !self.config.ml.enabled {
            return 0.0;
        }

        let history = self.store.recent(HISTORY_WINDOW);
        let errors = self
            .store
            .server_errors_within(&sample.endpoint_key(), ERROR_WINDOW);

        let alerts = self.statistical.detect(sample, &history, errors);
        for alert in &alerts {
            warn!(
                severity = ?alert.severity,
                kind = ?alert.kind,
                message = %alert.message,
                suggestion = %alert.suggestion,
                "anomaly detected"
            );
            telemetry::inc_anomaly(
                &format!("{:?}", alert.severity).to_lowercase(),
                &format!("{:?}", alert.kind).to_lowercase(),
            );
        }
        self.counters
            .anomalies
            .fetch_add(alerts.len() as u64, Ordering::Relaxed);

        let neural = self.neural.detect(sample);
        if neural.is_anomaly {
            warn!(
                score = neural.score,
                confidence = neural.confidence,
                endpoint = %sample.endpoint_key(),
                "reconstruction anomaly detected"
            );
            telemetry::inc_anomaly("high", "reconstruction");
            self.counters.anomalies.fetch_add(1, Ordering::Relaxed);
        }

        self.statistical.score(sample).max(neural.score.min(1.0))
    }

    fn stamp_headers(
        &self,
        response: &mut EngineResponse,
        cache: &str,
        prediction: Option<&Prediction>,
        anomaly_score: f64,
    ) {
        let headers = &mut response.headers;
        if self.config.enable_caching {
            headers.insert("x-cache".to_string(), cache.to_string());
        }
        let (confidence, action) = prediction.map_or((0, "none"), |p| {
            (
                (p.confidence * 100.0).round() as u64,
                p.recommended_action.as_str(),
            )
        });
        headers.insert(
            "x-ml-prediction-confidence".to_string(),
            confidence.to_string(),
        );
        headers.insert("x-optimization-applied".to_string(), action.to_string());
        headers.insert(
            "x-anomaly-score".to_string(),
            format!("{anomaly_score:.3}"),
        );
    }
}

/// Records a best-effort failure sample if the request future is dropped
/// while the downstream call is in flight (client disconnect). Disarmed as
/// soon as the call returns.
struct CancelGuard<'a> {
    engine: &'a OptimizationEngine,
    ctx: &'a RequestContext,
    started: Instant,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let duration_ms = elapsed_ms(self.started);
        self.engine
            .store
            .record_error(self.ctx.endpoint_key(), 500);
        self.engine.record_failure(self.ctx, duration_ms);
        debug!(path = %self.ctx.path, "request dropped mid-downstream");
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}

/// UTC hour of day, 0–23.
fn utc_hour() -> u8 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ((secs / 3_600) % 24) as u8
}
