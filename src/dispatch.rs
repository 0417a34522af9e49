use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::job::Job;
use crate::rate_limit::RateLimiter;
use crate::storage::{JobStore, Result as StorageResult};

/// Picks the job a worker should try to claim next.
///
/// Selection is pure: nothing is written here, so several dispatchers can
/// hand out the same candidate and the claim settles who gets it. Admission
/// through the rate limiter does consume a token; a candidate that then loses
/// the claim race has burned one, which is bounded by how often claims
/// actually collide.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    batch: u32,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, batch: u32) -> Self {
        Self {
            store,
            batch: batch.max(1),
        }
    }

    /// Highest-priority eligible job (oldest-first within a priority) whose
    /// rate key, if any, has budget right now. Rate-limited candidates are
    /// skipped in place; they stay eligible for later passes. Pages past a
    /// run of skipped candidates so a blocked key at the head of the queue
    /// cannot hide admissible work behind it.
    pub async fn next_ready(
        &self,
        queue: Option<&str>,
        now: DateTime<Utc>,
        limiter: &RateLimiter,
    ) -> StorageResult<Option<Job>> {
        let mut exhausted: HashSet<String> = HashSet::new();
        let mut offset = 0u32;

        loop {
            let candidates = self
                .store
                .eligible_jobs(queue, now, self.batch, offset)
                .await?;
            let page_len = candidates.len() as u32;

            for job in candidates {
                let Some(key) = &job.rate_key else {
                    return Ok(Some(job));
                };
                if exhausted.contains(key) {
                    continue;
                }
                if limiter.allow(key, now).await? {
                    return Ok(Some(job));
                }
                debug!(job_id = %job.id, key, "skipping rate-limited job");
                exhausted.insert(key.clone());
            }

            if page_len < self.batch {
                return Ok(None);
            }
            offset += self.batch;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use crate::storage::SqliteJobStore;
    use chrono::Duration as ChronoDuration;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .expect("test timestamp")
    }

    #[tokio::test]
    async fn rate_limited_candidates_are_skipped_not_dropped() {
        let store = Arc::new(SqliteJobStore::in_memory().await.expect("store"));
        let limiter = RateLimiter::new(store.clone());
        let dispatcher = Dispatcher::new(store.clone(), 32);
        let now = ts("2026-01-10T08:00:00Z");

        limiter.set_limit("slow", 1.0, 1.0, now).await.expect("set");
        // Drain the only token so the key starts with no budget.
        assert!(limiter.allow("slow", now).await.expect("allow"));

        let mut limited = Job::new("t", vec![]).with_priority(9).with_rate_key("slow");
        limited.created_at = now;
        let mut free = Job::new("t", vec![]);
        free.created_at = now + ChronoDuration::seconds(1);
        store.insert_job(&limited).await.expect("insert");
        store.insert_job(&free).await.expect("insert");

        // The limited job outranks the free one but has no budget; dispatch
        // moves past it.
        let picked = dispatcher
            .next_ready(None, now, &limiter)
            .await
            .expect("dispatch")
            .expect("candidate");
        assert_eq!(picked.id, free.id);

        // A second into the refill the limited job is back on top.
        let later = now + ChronoDuration::seconds(1);
        let picked = dispatcher
            .next_ready(None, later, &limiter)
            .await
            .expect("dispatch")
            .expect("candidate");
        assert_eq!(picked.id, limited.id);
    }

    #[tokio::test]
    async fn empty_when_everything_is_limited() {
        let store = Arc::new(SqliteJobStore::in_memory().await.expect("store"));
        let limiter = RateLimiter::new(store.clone());
        let dispatcher = Dispatcher::new(store.clone(), 32);
        let now = ts("2026-01-10T08:00:00Z");

        limiter.set_limit("db", 0.0, 0.1, now).await.expect("set");
        for _ in 0..3 {
            let job = Job::new("t", vec![]).with_rate_key("db");
            store.insert_job(&job).await.expect("insert");
        }

        assert!(dispatcher
            .next_ready(None, now, &limiter)
            .await
            .expect("dispatch")
            .is_none());
    }

    #[tokio::test]
    async fn pages_past_a_blocked_head_of_queue() {
        let store = Arc::new(SqliteJobStore::in_memory().await.expect("store"));
        let limiter = RateLimiter::new(store.clone());
        // Batch of 2 forces paging before the admissible job is visible.
        let dispatcher = Dispatcher::new(store.clone(), 2);
        let now = ts("2026-01-10T08:00:00Z");

        limiter.set_limit("hot", 0.0, 0.1, now).await.expect("set");

        let mut blocked_ids: Vec<JobId> = Vec::new();
        for i in 0..4 {
            let mut job = Job::new("t", vec![]).with_priority(5).with_rate_key("hot");
            job.created_at = now + ChronoDuration::seconds(i);
            blocked_ids.push(job.id.clone());
            store.insert_job(&job).await.expect("insert");
        }
        let mut reachable = Job::new("t", vec![]).with_priority(0);
        reachable.created_at = now + ChronoDuration::seconds(10);
        store.insert_job(&reachable).await.expect("insert");

        let picked = dispatcher
            .next_ready(None, now + ChronoDuration::seconds(20), &limiter)
            .await
            .expect("dispatch")
            .expect("candidate");
        assert_eq!(picked.id, reachable.id);
        assert!(!blocked_ids.contains(&picked.id));
    }

    #[tokio::test]
    async fn respects_queue_filter() {
        let store = Arc::new(SqliteJobStore::in_memory().await.expect("store"));
        let limiter = RateLimiter::new(store.clone());
        let dispatcher = Dispatcher::new(store.clone(), 32);
        let now = ts("2026-01-10T08:00:00Z");

        let mail = Job::new("t", vec![]).with_queue("mail");
        let billing = Job::new("t", vec![]).with_queue("billing");
        store.insert_job(&mail).await.expect("insert");
        store.insert_job(&billing).await.expect("insert");

        let picked = dispatcher
            .next_ready(Some("billing"), now, &limiter)
            .await
            .expect("dispatch")
            .expect("candidate");
        assert_eq!(picked.id, billing.id);
        assert!(dispatcher
            .next_ready(Some("empty"), now, &limiter)
            .await
            .expect("dispatch")
            .is_none());
    }
}
