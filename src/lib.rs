//! # tokio-request-optimizer
//!
//! An adaptive request-path optimization engine that installs as a single
//! middleware stage in a Tokio-based web server.
//!
//! The engine observes request/response behaviour online, forecasts
//! per-endpoint latency, detects anomalies statistically and with a small
//! trainable network, and applies adaptive actions (caching, coalescing,
//! throttling hints, resource reallocation). It retrains itself periodically
//! from its own metrics store and reduces to a transparent pass-through when
//! every feature flag is disabled.
//!
//! ## Request lifecycle
//!
//! ```text
//! cache lookup → batching check → bloom-filter gate → downstream (once)
//!     → record metrics → statistical + neural anomaly checks
//!     → pattern / health / cache updates → response headers
//! ```
//!
//! The [`trainer::TrainingScheduler`] runs independently on a timer, reading
//! a snapshot of the metrics store and atomically swapping the predictor's
//! series, the detector baselines, and the network weights.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_request_optimizer::{
//!     EngineConfig, EngineResponse, HttpMethod, OptimizationEngine, RequestContext,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(OptimizationEngine::new(EngineConfig::default())?);
//! engine.register_route("/api/users");
//!
//! let ctx = RequestContext::new(HttpMethod::Get, "/api/users");
//! let response = engine
//!     .wrap(ctx, || async {
//!         Ok::<_, std::io::Error>(EngineResponse::ok(b"[]".to_vec()))
//!     })
//!     .await?;
//! assert_eq!(response.status, 200);
//! # Ok(()) }
//! ```

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(missing_docs)]

use std::collections::HashMap;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod allocator;
pub mod batcher;
pub mod bloom;
pub mod cache;
pub mod config;
pub mod detect;
pub mod engine;
pub mod health;
pub mod patterns;
pub mod predictor;
pub mod store;
pub mod telemetry;
pub mod trainer;

// Re-exports for convenience
pub use config::{ConfigError, EngineConfig};
pub use engine::{EngineStats, OptimizationEngine};
pub use store::MetricSample;
pub use trainer::TrainingScheduler;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`EngineError::Other`] if the global subscriber has already been
/// set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), EngineError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| EngineError::Other(format!("tracing init failed: {e}")))
}

/// Top-level engine errors.
///
/// Downstream handler errors are deliberately *not* represented here: the
/// engine re-throws them unchanged in their original type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration was rejected at construction time.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// HTTP request method, limited to the verbs the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET — the only method eligible for caching and coalescing.
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// PATCH
    Patch,
    /// HEAD
    Head,
    /// OPTIONS
    Options,
}

impl HttpMethod {
    /// Canonical upper-case name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The narrow view of an inbound request the engine needs from the host
/// framework.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request method.
    pub method: HttpMethod,
    /// Request path, without query string (e.g. `/api/users`).
    pub path: String,
    /// Raw query string, empty if absent.
    pub query: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
}

impl RequestContext {
    /// Create a context with no query string or headers.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: String::new(),
            headers: HashMap::new(),
        }
    }

    /// Attach a query string.
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    /// Cache / coalescing key: method + path + query string.
    pub fn cache_key(&self) -> String {
        if self.query.is_empty() {
            format!("{}:{}", self.method, self.path)
        } else {
            format!("{}:{}?{}", self.method, self.path, self.query)
        }
    }

    /// Aggregation key for per-endpoint state: method + path, ignoring the
    /// query string so that `/api/users?page=2` rolls up with `/api/users`.
    pub fn endpoint_key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// The response contract expected from (and returned to) the host framework.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers. The engine adds its `x-*` headers here.
    pub headers: HashMap<String, String>,
    /// Response body bytes.
    pub body: Vec<u8>,
}

impl EngineResponse {
    /// Build a 200 response with the given body.
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body,
        }
    }

    /// Build an empty response with the given status.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }
}

/// Adaptive actions the engine can recommend or apply for a request.
///
/// A closed enum rather than strings so that action handling is
/// exhaustively checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizationAction {
    /// Serve (or start serving) this endpoint from the adaptive cache.
    Cache,
    /// Coalesce concurrent identical requests into one execution.
    Batch,
    /// Warm likely-next resources during business hours.
    Prefetch,
    /// Endpoint is hot and moderately slow; a tuning candidate.
    Optimize,
    /// Forecast latency well above baseline; shed or delay load.
    Throttle,
}

impl OptimizationAction {
    /// Header value for `x-optimization-applied`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Batch => "batch",
            Self::Prefetch => "prefetch",
            Self::Optimize => "optimize",
            Self::Throttle => "throttle",
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_cache_key_includes_query() {
        let ctx = RequestContext::new(HttpMethod::Get, "/api/users").with_query("page=2");
        assert_eq!(ctx.cache_key(), "GET:/api/users?page=2");
    }

    #[test]
    fn test_cache_key_without_query_has_no_separator() {
        let ctx = RequestContext::new(HttpMethod::Get, "/api/users");
        assert_eq!(ctx.cache_key(), "GET:/api/users");
    }

    #[test]
    fn test_endpoint_key_ignores_query() {
        let a = RequestContext::new(HttpMethod::Get, "/api/users").with_query("page=2");
        let b = RequestContext::new(HttpMethod::Get, "/api/users");
        assert_eq!(a.endpoint_key(), b.endpoint_key());
    }

    #[test]
    fn test_method_display_matches_as_str() {
        assert_eq!(HttpMethod::Patch.to_string(), "PATCH");
        assert_eq!(HttpMethod::Get.as_str(), "GET");
    }

    #[test]
    fn test_action_header_values_are_lowercase() {
        for action in [
            OptimizationAction::Cache,
            OptimizationAction::Batch,
            OptimizationAction::Prefetch,
            OptimizationAction::Optimize,
            OptimizationAction::Throttle,
        ] {
            assert_eq!(action.as_str(), action.as_str().to_lowercase());
        }
    }

    #[test]
    fn test_engine_error_display_includes_message() {
        let err = EngineError::Other("boom".to_string());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        // Second call must not panic — it should return Err.
        assert!(init_tracing().is_err());
    }
}
