//! Engine configuration: schema, TOML loading, and validation.
//!
//! ## Responsibility
//! Parse and validate the engine's configuration once, at construction time.
//! Per-request code never sees a configuration error.
//!
//! ## Guarantees
//! - Deterministic: the same TOML input always produces the same config
//! - Validation collects *all* violations before returning (no short-circuit)
//! - Every field has a documented default; an empty TOML file is valid
//!
//! ## NOT Responsible For
//! - Hot-reloading (engines are constructed with a fixed config)
//! - Per-request tuning decisions (that belongs to `engine` and `predictor`)

use std::path::Path;

use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_training_interval_minutes() -> u64 {
    5
}

fn default_target_latency_ms() -> u64 {
    100
}

fn default_max_memory_mb() -> u64 {
    512
}

fn default_retention_hours() -> u64 {
    24
}

fn default_batch_window_ms() -> u64 {
    10
}

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("parse error in {file}: {source}")]
    Parse {
        /// Source name of the content that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed. The message lists every
    /// violation found.
    #[error("validation failed: {0}")]
    Validation(String),

    /// File I/O error.
    #[error("io error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Root configuration for one engine instance.
///
/// All optimization features default to enabled; `EngineConfig::default()`
/// gives a fully adaptive engine. Disabling every flag reduces the engine to
/// a transparent pass-through whose only effect is stamping neutral
/// diagnostic headers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Coalesce concurrent identical requests into one downstream call.
    pub enable_batching: bool,
    /// Serve repeat GETs from the adaptive cache.
    pub enable_caching: bool,
    /// Allow the predictor to recommend prefetching during business hours.
    pub enable_prefetching: bool,
    /// Advisory flag forwarded in engine stats; the engine itself never
    /// compresses bodies (transport is an external collaborator).
    pub enable_compression: bool,
    /// Machine-learning subsystem settings.
    pub ml: MlSection,
    /// Latency / memory targets.
    pub performance: PerformanceSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_batching: true,
            enable_caching: true,
            enable_prefetching: true,
            enable_compression: false,
            ml: MlSection::default(),
            performance: PerformanceSection::default(),
        }
    }
}

/// Machine-learning subsystem settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MlSection {
    /// Master switch for the predictor, neural detector, and allocator.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between background training cycles, in minutes.
    #[serde(default = "default_training_interval_minutes")]
    pub training_interval_minutes: u64,
}

impl Default for MlSection {
    fn default() -> Self {
        Self {
            enabled: true,
            training_interval_minutes: default_training_interval_minutes(),
        }
    }
}

/// Latency and memory targets used by the allocator reward signal and the
/// memory anomaly check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceSection {
    /// Target end-to-end latency in milliseconds. Observed latency is scored
    /// against this value when updating the allocator.
    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: u64,
    /// Memory budget in megabytes. Per-request memory deltas above this cap
    /// raise a high-severity anomaly alert.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// How long metric samples are retained before pruning, in hours.
    #[serde(default = "default_retention_hours")]
    pub metrics_retention_hours: u64,
    /// Coalescing window for the request batcher, in milliseconds.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
}

impl Default for PerformanceSection {
    fn default() -> Self {
        Self {
            target_latency_ms: default_target_latency_ms(),
            max_memory_mb: default_max_memory_mb(),
            metrics_retention_hours: default_retention_hours(),
            batch_window_ms: default_batch_window_ms(),
        }
    }
}

impl EngineConfig {
    /// Load a config from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Io`] if the file cannot be read.
    /// - [`ConfigError::Parse`] if the TOML is malformed.
    /// - [`ConfigError::Validation`] if semantic constraints are violated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            file: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load a config from a TOML string and validate it.
    ///
    /// `source_name` is used in error messages only.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Parse`] if the TOML is malformed.
    /// - [`ConfigError::Validation`] if semantic constraints are violated.
    pub fn from_toml_str(content: &str, source_name: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            file: source_name.to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every semantic constraint, collecting all violations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] listing every failed rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.ml.training_interval_minutes == 0 {
            errors.push("ml.training_interval_minutes must be >= 1".to_string());
        }
        if self.performance.target_latency_ms == 0 {
            errors.push("performance.target_latency_ms must be >= 1".to_string());
        }
        if self.performance.max_memory_mb == 0 {
            errors.push("performance.max_memory_mb must be >= 1".to_string());
        }
        if self.performance.metrics_retention_hours == 0 {
            errors.push("performance.metrics_retention_hours must be >= 1".to_string());
        }
        if self.performance.batch_window_ms == 0 && self.enable_batching {
            errors.push(
                "performance.batch_window_ms must be >= 1 when enable_batching is set".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }

    /// Config with every optimization feature disabled: transparent
    /// pass-through mode.
    pub fn passthrough() -> Self {
        Self {
            enable_batching: false,
            enable_caching: false,
            enable_prefetching: false,
            enable_compression: false,
            ml: MlSection {
                enabled: false,
                ..MlSection::default()
            },
            performance: PerformanceSection::default(),
        }
    }
}
