//! Response cache over the store's cache tables, fronted by the circuit
//! breaker.
//!
//! Keys are built from an explicit ordered tuple of every input, hashed to
//! a fixed width, so two equal requests always collide regardless of how
//! the caller assembled its arguments. A cache outage is invisible to
//! clients: both operations degrade to a miss and the database path
//! answers.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::warn;

use super::circuit::CircuitBreaker;
use crate::store::Store;

/// Per-kind TTLs, aligned with how often the underlying data moves.
#[derive(Debug, Clone, Copy)]
pub enum CacheTtl {
    Prediction,
    Fares,
    RouteStats,
    PopularRoutes,
}

impl CacheTtl {
    pub fn duration(self) -> Duration {
        match self {
            CacheTtl::Prediction => Duration::from_secs(3600),
            CacheTtl::Fares => Duration::from_secs(86_400),
            CacheTtl::RouteStats => Duration::from_secs(21_600),
            CacheTtl::PopularRoutes => Duration::from_secs(1800),
        }
    }
}

/// Canonical cache key: prefix plus the ordered (name, value) tuple of
/// every input, hashed. Argument-passing style cannot change the key.
pub fn cache_key(prefix: &str, parts: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    for (name, value) in parts {
        hasher.update(b"|");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
    format!("{prefix}:{hex}")
}

pub struct ResponseCache {
    store: Store,
    breaker: CircuitBreaker,
}

impl ResponseCache {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::default(),
        }
    }

    pub fn breaker_state(&self) -> &'static str {
        self.breaker.state().as_str()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if !self.breaker.allow() {
            return None;
        }
        match self.store.cache_get(key).await {
            Ok(hit) => {
                self.breaker.record_success();
                hit
            }
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, bypassing");
                self.breaker.record_failure();
                None
            }
        }
    }

    /// Best effort; a failed write only affects latency of the next request.
    pub async fn put(&self, key: &str, payload: &str, ttl: CacheTtl) {
        if !self.breaker.allow() {
            return;
        }
        match self.store.cache_put(key, payload, ttl.duration()).await {
            Ok(()) => self.breaker.record_success(),
            Err(e) => {
                warn!(key, error = %e, "Cache write failed");
                self.breaker.record_failure();
            }
        }
    }

    pub async fn prune(&self) -> u64 {
        self.store.cache_prune().await.unwrap_or(0)
    }
}
