use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::{JobStore, Result as StorageResult};

/// Durable token bucket row for one resource key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateBucket {
    pub key: String,
    pub capacity: f64,
    /// Tokens added per second, continuously.
    pub refill_per_sec: f64,
    pub tokens: f64,
    pub last_refill_at: DateTime<Utc>,
}

impl RateBucket {
    /// Tokens available at `now`: lazy refill since the stored instant,
    /// capped at capacity. Fractional tokens accrue; a request needs a full
    /// one.
    pub fn refilled_tokens(&self, now: DateTime<Utc>) -> f64 {
        let elapsed_secs = (now - self.last_refill_at).num_milliseconds().max(0) as f64 / 1000.0;
        (self.tokens + elapsed_secs * self.refill_per_sec).min(self.capacity)
    }
}

const TAKE_RETRIES: usize = 4;

/// Per-key token bucket limiter backing dispatch admission.
///
/// Buckets live in the store so every orchestrator instance draws from the
/// same budget; a conditional write moves the bucket, and other instances
/// losing that write re-read and retry. The in-process mutex per key only
/// stops same-instance tasks from burning retries against each other.
pub struct RateLimiter {
    store: Arc<dyn JobStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take one token from `key`'s bucket. Keys without a bucket row are
    /// unlimited. Denial leaves the row untouched; accrual is carried by the
    /// stored refill instant.
    pub async fn allow(&self, key: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        for _ in 0..TAKE_RETRIES {
            let Some(bucket) = self.store.get_rate_bucket(key).await? else {
                return Ok(true);
            };

            let available = bucket.refilled_tokens(now);
            if available < 1.0 {
                debug!(key, tokens = available, "rate limit exhausted");
                return Ok(false);
            }

            let won = self
                .store
                .update_rate_bucket_if(
                    key,
                    bucket.tokens,
                    bucket.last_refill_at,
                    available - 1.0,
                    now,
                )
                .await?;
            if won {
                return Ok(true);
            }
            // Another instance moved the bucket between read and write.
        }

        debug!(key, "rate bucket contended, denying this pass");
        Ok(false)
    }

    /// Create or reset the bucket for `key`, starting full.
    pub async fn set_limit(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.store
            .put_rate_bucket(&RateBucket {
                key: key.to_string(),
                capacity,
                refill_per_sec,
                tokens: capacity,
                last_refill_at: now,
            })
            .await
    }

    /// Drop the bucket; the key becomes unlimited again.
    pub async fn remove_limit(&self, key: &str) -> StorageResult<()> {
        self.locks.remove(key);
        self.store.delete_rate_bucket(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteJobStore;
    use chrono::Duration as ChronoDuration;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .expect("test timestamp")
    }

    #[test]
    fn refill_accrues_and_caps() {
        let t0 = ts("2026-01-10T08:00:00Z");
        let bucket = RateBucket {
            key: "k".to_string(),
            capacity: 5.0,
            refill_per_sec: 1.0,
            tokens: 0.0,
            last_refill_at: t0,
        };

        assert_eq!(bucket.refilled_tokens(t0), 0.0);
        assert_eq!(bucket.refilled_tokens(t0 + ChronoDuration::milliseconds(500)), 0.5);
        assert_eq!(bucket.refilled_tokens(t0 + ChronoDuration::seconds(3)), 3.0);
        // Capped at capacity no matter how long it sat idle.
        assert_eq!(bucket.refilled_tokens(t0 + ChronoDuration::seconds(3600)), 5.0);
        // A clock reading before the stored instant adds nothing.
        assert_eq!(bucket.refilled_tokens(t0 - ChronoDuration::seconds(10)), 0.0);
    }

    #[tokio::test]
    async fn unknown_key_is_unlimited() {
        let store = Arc::new(SqliteJobStore::in_memory().await.expect("store"));
        let limiter = RateLimiter::new(store);
        let now = ts("2026-01-10T08:00:00Z");

        for _ in 0..100 {
            assert!(limiter.allow("anything", now).await.expect("allow"));
        }
    }

    #[tokio::test]
    async fn burst_drains_then_refills_one_per_second() {
        let store = Arc::new(SqliteJobStore::in_memory().await.expect("store"));
        let limiter = RateLimiter::new(store);
        let t0 = ts("2026-01-10T08:00:00Z");

        limiter.set_limit("api", 5.0, 1.0, t0).await.expect("set");

        for i in 0..5 {
            assert!(limiter.allow("api", t0).await.expect("allow"), "take {i}");
        }
        assert!(!limiter.allow("api", t0).await.expect("allow"));

        // Half a token is not a token.
        let half = t0 + ChronoDuration::milliseconds(500);
        assert!(!limiter.allow("api", half).await.expect("allow"));

        let one = t0 + ChronoDuration::seconds(1);
        assert!(limiter.allow("api", one).await.expect("allow"));
        assert!(!limiter.allow("api", one).await.expect("allow"));
    }

    #[tokio::test]
    async fn set_limit_resets_to_full() {
        let store = Arc::new(SqliteJobStore::in_memory().await.expect("store"));
        let limiter = RateLimiter::new(store);
        let t0 = ts("2026-01-10T08:00:00Z");

        limiter.set_limit("api", 2.0, 0.1, t0).await.expect("set");
        assert!(limiter.allow("api", t0).await.expect("allow"));
        assert!(limiter.allow("api", t0).await.expect("allow"));
        assert!(!limiter.allow("api", t0).await.expect("allow"));

        limiter.set_limit("api", 2.0, 0.1, t0).await.expect("reset");
        assert!(limiter.allow("api", t0).await.expect("allow"));
    }

    #[tokio::test]
    async fn removed_limit_goes_back_to_unlimited() {
        let store = Arc::new(SqliteJobStore::in_memory().await.expect("store"));
        let limiter = RateLimiter::new(store);
        let t0 = ts("2026-01-10T08:00:00Z");

        limiter.set_limit("api", 1.0, 0.01, t0).await.expect("set");
        assert!(limiter.allow("api", t0).await.expect("allow"));
        assert!(!limiter.allow("api", t0).await.expect("allow"));

        limiter.remove_limit("api").await.expect("remove");
        assert!(limiter.allow("api", t0).await.expect("allow"));
    }
}
