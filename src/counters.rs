//! Per-user rolling activity counters over fixed windows.
//!
//! The cache is the hot path: a hit means "previous rolling count + 1" and a
//! TTL refresh, which keeps active users pinned without a write-through
//! path. A miss falls back to counting the user's raw event history in the
//! store. The resulting count is approximate around TTL expiry; the counter
//! is a best-effort signal, not an exact ledger.

use crate::cache::{CacheStore, Clock};
use crate::metrics::PipelineMetrics;
use crate::store::FeatureStore;
use std::sync::Arc;

const EVENT_FREQ_TTL_SECONDS: i64 = 86_400;

pub struct ActivityCounters {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn FeatureStore>,
    metrics: Arc<PipelineMetrics>,
    clock: Clock,
}

impl ActivityCounters {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn FeatureStore>,
        metrics: Arc<PipelineMetrics>,
        clock: Clock,
    ) -> Self {
        Self {
            cache,
            store,
            metrics,
            clock,
        }
    }

    /// New rolling count for the user in the given window.
    ///
    /// Cache hit: previous count + 1. Cache miss: historical count from the
    /// store + 1, treating a store failure as zero history. Either way the
    /// cache is refreshed with the feature's TTL.
    pub async fn bump_window(&self, user_id: &str, window_seconds: i64, ttl_seconds: i64) -> i64 {
        let key = format!("activity:{}:{}", user_id, window_seconds);

        let cached = match self.cache.get(&key) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("cache read failed for {}: {}", key, e);
                None
            }
        };

        let count = match cached.and_then(|s| s.parse::<i64>().ok()) {
            Some(current) => {
                self.metrics.inc_cache_hit();
                current + 1
            }
            None => {
                self.metrics.inc_cache_miss();
                let now = (self.clock)().timestamp();
                let historical = match self
                    .store
                    .count_recent_events(user_id, window_seconds, now)
                    .await
                {
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!(
                            "historical count failed for user {}: {}, assuming 0",
                            user_id,
                            e
                        );
                        0
                    }
                };
                historical + 1
            }
        };

        if let Err(e) = self.cache.set_ex(&key, &count.to_string(), ttl_seconds) {
            log::warn!("cache write failed for {}: {}", key, e);
        }

        count
    }

    /// Post-increment 24h frequency for (user, event type), TTL refreshed on
    /// every bump.
    pub fn bump_event_type_freq(&self, user_id: &str, event_type: &str) -> i64 {
        let key = format!("event_freq:{}:{}:24h", user_id, event_type);

        let count = match self.cache.incr(&key) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("cache incr failed for {}: {}", key, e);
                1
            }
        };

        if let Err(e) = self.cache.expire(&key, EVENT_FREQ_TTL_SECONDS) {
            log::warn!("cache expire failed for {}: {}", key, e);
        }

        count
    }

    /// Read-only view of the 24h frequency; absent or unavailable reads as 0.
    pub fn read_event_type_freq(&self, user_id: &str, event_type: &str) -> i64 {
        let key = format!("event_freq:{}:{}:24h", user_id, event_type);
        match self.cache.get(&key) {
            Ok(Some(value)) => value.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                log::warn!("cache read failed for {}: {}", key, e);
                0
            }
        }
    }
}
