//! Prometheus metrics for the optimization engine.
//!
//! ## Usage
//!
//! Call [`init_telemetry`] once at process startup **before** wiring the
//! engine into the request path. The helper functions (`inc_cache_hit`,
//! `observe_request_duration`, …) are no-ops if `init_telemetry` was never
//! called, so the engine is always safe to run — observability simply
//! degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `optimizer_requests_total` | Counter | `outcome` |
//! | `optimizer_cache_events_total` | Counter | `event` |
//! | `optimizer_batch_joins_total` | Counter | `role` |
//! | `optimizer_anomalies_total` | Counter | `severity`, `kind` |
//! | `optimizer_training_runs_total` | Counter | — |
//! | `optimizer_request_duration_seconds` | Histogram | `method` |

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

use crate::EngineError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the engine, bundled so they can live in a
/// single [`OnceLock`] and initialise atomically.
pub struct Telemetry {
    /// Registry that owns all metric descriptors.
    pub registry: Registry,
    /// Requests handled, labelled by terminal outcome
    /// (`ok`, `error`, `coalesced`, `filtered`).
    pub requests_total: CounterVec,
    /// Cache lookups, labelled `hit` or `miss`.
    pub cache_events: CounterVec,
    /// Coalescing group membership, labelled `leader` or `follower`.
    pub batch_joins: CounterVec,
    /// Anomaly alerts raised, by severity and kind.
    pub anomalies_total: CounterVec,
    /// Completed training cycles.
    pub training_runs: Counter,
    /// End-to-end request latency by HTTP method.
    pub request_duration: HistogramVec,
}

static TELEMETRY: OnceLock<Telemetry> = OnceLock::new();

fn build_bundle(prefix: &str) -> Result<Telemetry, EngineError> {
    let err = |e: prometheus::Error| EngineError::Other(format!("telemetry init failed: {e}"));

    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new(
            format!("{prefix}requests_total"),
            "Requests handled by terminal outcome",
        ),
        &["outcome"],
    )
    .map_err(err)?;
    registry
        .register(Box::new(requests_total.clone()))
        .map_err(err)?;

    let cache_events = CounterVec::new(
        Opts::new(format!("{prefix}cache_events_total"), "Cache hits and misses"),
        &["event"],
    )
    .map_err(err)?;
    registry
        .register(Box::new(cache_events.clone()))
        .map_err(err)?;

    let batch_joins = CounterVec::new(
        Opts::new(
            format!("{prefix}batch_joins_total"),
            "Coalescing group membership by role",
        ),
        &["role"],
    )
    .map_err(err)?;
    registry
        .register(Box::new(batch_joins.clone()))
        .map_err(err)?;

    let anomalies_total = CounterVec::new(
        Opts::new(
            format!("{prefix}anomalies_total"),
            "Anomaly alerts by severity and kind",
        ),
        &["severity", "kind"],
    )
    .map_err(err)?;
    registry
        .register(Box::new(anomalies_total.clone()))
        .map_err(err)?;

    let training_runs = Counter::new(
        format!("{prefix}training_runs_total"),
        "Completed model training cycles",
    )
    .map_err(err)?;
    registry
        .register(Box::new(training_runs.clone()))
        .map_err(err)?;

    let request_duration = HistogramVec::new(
        HistogramOpts::new(
            format!("{prefix}request_duration_seconds"),
            "End-to-end request latency",
        ),
        &["method"],
    )
    .map_err(err)?;
    registry
        .register(Box::new(request_duration.clone()))
        .map_err(err)?;

    Ok(Telemetry {
        registry,
        requests_total,
        cache_events,
        batch_joins,
        anomalies_total,
        training_runs,
        request_duration,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics against a private registry.
///
/// Call once at process startup. Calling it a second time is a no-op.
///
/// # Errors
///
/// Returns [`EngineError::Other`] if metric construction or registration
/// fails (e.g., duplicate descriptor names).
pub fn init_telemetry() -> Result<(), EngineError> {
    if TELEMETRY.get().is_some() {
        return Ok(());
    }
    let bundle = build_bundle("optimizer_")?;
    // If another thread raced us the first one wins; both bundles carry
    // identical descriptors.
    let _ = TELEMETRY.set(bundle);
    Ok(())
}

fn telemetry() -> Option<&'static Telemetry> {
    TELEMETRY.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a handled request by terminal outcome.
///
/// No-op if telemetry has not been initialised.
pub fn inc_request(outcome: &str) {
    if let Some(t) = telemetry() {
        if let Ok(c) = t.requests_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count a cache hit.
///
/// No-op if telemetry has not been initialised.
pub fn inc_cache_hit() {
    inc_cache_event("hit");
}

/// Count a cache miss.
///
/// No-op if telemetry has not been initialised.
pub fn inc_cache_miss() {
    inc_cache_event("miss");
}

fn inc_cache_event(event: &str) {
    if let Some(t) = telemetry() {
        if let Ok(c) = t.cache_events.get_metric_with_label_values(&[event]) {
            c.inc();
        }
    }
}

/// Count a coalescing group membership (`leader` or `follower`).
///
/// No-op if telemetry has not been initialised.
pub fn inc_batch_join(role: &str) {
    if let Some(t) = telemetry() {
        if let Ok(c) = t.batch_joins.get_metric_with_label_values(&[role]) {
            c.inc();
        }
    }
}

/// Count an anomaly alert.
///
/// No-op if telemetry has not been initialised.
pub fn inc_anomaly(severity: &str, kind: &str) {
    if let Some(t) = telemetry() {
        if let Ok(c) = t
            .anomalies_total
            .get_metric_with_label_values(&[severity, kind])
        {
            c.inc();
        }
    }
}

/// Count one completed training cycle.
///
/// No-op if telemetry has not been initialised.
pub fn inc_training_run() {
    if let Some(t) = telemetry() {
        t.training_runs.inc();
    }
}

/// Record end-to-end request latency for an HTTP method.
///
/// No-op if telemetry has not been initialised.
pub fn observe_request_duration(method: &str, d: Duration) {
    if let Some(t) = telemetry() {
        if let Ok(h) = t.request_duration.get_metric_with_label_values(&[method]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if telemetry has not been initialised or if
/// encoding fails.
pub fn gather_metrics() -> String {
    let Some(t) = telemetry() else {
        return String::new();
    };
    let families = t.registry.gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
