//! Adaptive response cache with frequency-derived TTLs.
//!
//! ## Responsibility
//! Cache successful GET responses keyed by method+path+query, with a TTL
//! chosen from a staircase over the endpoint's hourly request rate: busier
//! endpoints are cached longer. Expired entries read as misses and are
//! removed by the periodic sweep.
//!
//! ## Guarantees
//! - TTL is monotone non-decreasing in request frequency
//! - Only entries the engine explicitly stores appear here; the engine only
//!   stores 200/304 GET responses, never failures or partial bodies

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::EngineResponse;

/// A cached response plus its expiry bookkeeping.
#[derive(Debug, Clone)]
struct CacheEntry {
    response: EngineResponse,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// TTL staircase over hourly request rate.
///
/// | rate (req/hr) | TTL        |
/// |---------------|------------|
/// | >= 100        | 1 hour     |
/// | >= 50         | 30 minutes |
/// | >= 10         | 5 minutes  |
/// | otherwise     | 1 minute   |
pub fn ttl_for_rate(hourly_rate: f64) -> Duration {
    if hourly_rate >= 100.0 {
        Duration::from_secs(3600)
    } else if hourly_rate >= 50.0 {
        Duration::from_secs(1800)
    } else if hourly_rate >= 10.0 {
        Duration::from_secs(300)
    } else {
        Duration::from_secs(60)
    }
}

/// Frequency-adaptive TTL cache.
#[derive(Debug, Default)]
pub struct AdaptiveCache {
    entries: DashMap<String, CacheEntry>,
}

impl AdaptiveCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a response. Expired entries are misses.
    pub fn get(&self, key: &str) -> Option<EngineResponse> {
        let entry = self.entries.get(key)?;
        if entry.expired() {
            return None;
        }
        Some(entry.response.clone())
    }

    /// Store a response with a TTL derived from the endpoint's hourly rate.
    pub fn store(&self, key: &str, response: EngineResponse, hourly_rate: f64) {
        self.store_with_ttl(key, response, ttl_for_rate(hourly_rate));
    }

    /// Store a response with an explicit TTL.
    pub fn store_with_ttl(&self, key: &str, response: EngineResponse, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                response,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Remove every expired entry.
    pub fn sweep(&self) {
        self.entries.retain(|_, entry| !entry.expired());
    }

    /// Number of entries, including any not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
