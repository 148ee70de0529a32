//! Admission counter storage behind the [`CounterStore`] capability.
//!
//! The rate-limit engine never touches counter state directly; it asks the
//! store for an atomic check-and-record per `(dimension, key)`. The shipped
//! [`MemoryCounterStore`] keeps state in sharded maps where the per-key entry
//! lock makes the evict/count/record sequence atomic with respect to other
//! callers of the same key. An external store (e.g. a Redis script) plugs in
//! behind the same trait; store failures surface as [`StoreError`] and the
//! engine fails open.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Result of one atomic admission check.
#[derive(Debug, Clone, Copy)]
pub struct CounterVerdict {
    pub allowed: bool,
    /// Events currently inside the window, including this one when allowed.
    pub count: u64,
    pub remaining: u64,
    /// Epoch seconds at which capacity becomes available again.
    pub reset_epoch_secs: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Shared counter capability for the rate-limit engine.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically: evict entries older than `now - window`, count the rest,
    /// deny at `limit`, else record the arrival.
    async fn check_sliding_window(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> Result<CounterVerdict, StoreError>;

    /// Lazily refill the bucket, deny when below one token, else take one.
    async fn check_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
    ) -> Result<CounterVerdict, StoreError>;

    /// Plain integer counter reset at each window boundary.
    async fn check_fixed_window(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> Result<CounterVerdict, StoreError>;
}

#[derive(Debug)]
struct WindowEntry {
    timestamps: VecDeque<Instant>,
    /// Entries idle past this point are reclaimable (2x window).
    expires_at: Instant,
}

#[derive(Debug)]
struct BucketEntry {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
struct FixedEntry {
    count: u64,
    window_start: Instant,
    expires_at: Instant,
}

/// In-process counter store with time-based cleanup.
///
/// State is held in sharded maps keyed by the engine's `(dimension, key)`
/// string. Expired entries are reclaimed opportunistically so dynamic keys
/// (one per client IP) do not grow without bound.
pub struct MemoryCounterStore {
    windows: DashMap<String, WindowEntry>,
    buckets: DashMap<String, BucketEntry>,
    counters: DashMap<String, FixedEntry>,
    last_cleanup: RwLock<Instant>,
}

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            buckets: DashMap::new(),
            counters: DashMap::new(),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Reclaims expired entries, at most once per cleanup interval.
    fn maybe_cleanup(&self, now: Instant) {
        {
            let last = self.last_cleanup.read().expect("cleanup lock poisoned");
            if now.duration_since(*last) < CLEANUP_INTERVAL {
                return;
            }
        }

        let mut last = self.last_cleanup.write().expect("cleanup lock poisoned");
        if now.duration_since(*last) < CLEANUP_INTERVAL {
            return;
        }
        *last = now;

        self.windows.retain(|_, entry| entry.expires_at > now);
        self.counters.retain(|_, entry| entry.expires_at > now);
        // Buckets refill lazily and hold two small fields; keep any touched
        // within the last cleanup interval.
        self.buckets
            .retain(|_, entry| now.duration_since(entry.last_refill) < CLEANUP_INTERVAL);

        log::debug!(
            "counter store cleanup: {} windows, {} buckets, {} fixed counters retained",
            self.windows.len(),
            self.buckets.len(),
            self.counters.len()
        );
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn check_sliding_window(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> Result<CounterVerdict, StoreError> {
        let now = Instant::now();
        self.maybe_cleanup(now);

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                timestamps: VecDeque::new(),
                expires_at: now + window * 2,
            });

        // Step 1: evict everything at or before now - W.
        while let Some(oldest) = entry.timestamps.front() {
            if now.duration_since(*oldest) >= window {
                entry.timestamps.pop_front();
            } else {
                break;
            }
        }

        // Step 2: count survivors.
        let count = entry.timestamps.len() as u64;

        // Step 3: deny at the limit, else record this arrival.
        if count >= limit {
            let reset = entry
                .timestamps
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            return Ok(CounterVerdict {
                allowed: false,
                count,
                remaining: 0,
                reset_epoch_secs: Utc::now().timestamp() + reset.as_secs() as i64,
            });
        }

        entry.timestamps.push_back(now);
        entry.expires_at = now + window * 2;

        Ok(CounterVerdict {
            allowed: true,
            count: count + 1,
            remaining: limit - count - 1,
            reset_epoch_secs: Utc::now().timestamp() + window.as_secs() as i64,
        })
    }

    async fn check_token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
    ) -> Result<CounterVerdict, StoreError> {
        let now = Instant::now();
        self.maybe_cleanup(now);

        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketEntry {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.duration_since(entry.last_refill).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * refill_per_sec).min(capacity);
        entry.last_refill = now;

        if entry.tokens < 1.0 {
            let wait_secs = if refill_per_sec > 0.0 {
                ((1.0 - entry.tokens) / refill_per_sec).ceil() as i64
            } else {
                i64::MAX / 2
            };
            return Ok(CounterVerdict {
                allowed: false,
                count: 0,
                remaining: 0,
                reset_epoch_secs: Utc::now().timestamp().saturating_add(wait_secs),
            });
        }

        entry.tokens -= 1.0;

        Ok(CounterVerdict {
            allowed: true,
            count: 1,
            remaining: entry.tokens.floor() as u64,
            reset_epoch_secs: Utc::now().timestamp(),
        })
    }

    async fn check_fixed_window(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> Result<CounterVerdict, StoreError> {
        let now = Instant::now();
        self.maybe_cleanup(now);

        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| FixedEntry {
                count: 0,
                window_start: now,
                expires_at: now + window * 2,
            });

        if now.duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.expires_at = now + window * 2;

        let reset = window.saturating_sub(now.duration_since(entry.window_start));
        let reset_epoch_secs = Utc::now().timestamp() + reset.as_secs() as i64;

        if entry.count >= limit {
            return Ok(CounterVerdict {
                allowed: false,
                count: entry.count,
                remaining: 0,
                reset_epoch_secs,
            });
        }

        entry.count += 1;

        Ok(CounterVerdict {
            allowed: true,
            count: entry.count,
            remaining: limit - entry.count,
            reset_epoch_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sliding_window_denies_at_limit() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_secs(60);

        for i in 0..3 {
            let verdict = store
                .check_sliding_window("ip:203.0.113.7", window, 3)
                .await
                .unwrap();
            assert!(verdict.allowed, "request {} should be admitted", i);
        }

        let verdict = store
            .check_sliding_window("ip:203.0.113.7", window, 3)
            .await
            .unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.remaining, 0);
    }

    #[tokio::test]
    async fn sliding_window_keys_are_independent() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_secs(60);

        let v = store
            .check_sliding_window("ip:10.0.0.1", window, 1)
            .await
            .unwrap();
        assert!(v.allowed);
        let v = store
            .check_sliding_window("ip:10.0.0.2", window, 1)
            .await
            .unwrap();
        assert!(v.allowed);
        let v = store
            .check_sliding_window("ip:10.0.0.1", window, 1)
            .await
            .unwrap();
        assert!(!v.allowed);
    }

    #[tokio::test]
    async fn token_bucket_with_zero_capacity_denies_all() {
        let store = MemoryCounterStore::new();
        let verdict = store.check_token_bucket("b", 0.0, 0.0).await.unwrap();
        assert!(!verdict.allowed);
    }

    #[tokio::test]
    async fn token_bucket_spends_down_to_empty() {
        let store = MemoryCounterStore::new();
        for _ in 0..5 {
            assert!(store.check_token_bucket("b", 5.0, 0.0).await.unwrap().allowed);
        }
        assert!(!store.check_token_bucket("b", 5.0, 0.0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn fixed_window_resets_after_boundary() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_millis(50);

        assert!(store.check_fixed_window("k", window, 1).await.unwrap().allowed);
        assert!(!store.check_fixed_window("k", window, 1).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.check_fixed_window("k", window, 1).await.unwrap().allowed);
    }
}
