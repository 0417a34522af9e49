use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::job::{BackoffConfig, Job, JobState};
use crate::storage::{JobPatch, JobPredicate, JobStore, Result as StorageResult};

/// Upper bound for the delay before retry `attempt` (1-indexed):
/// `min(max_delay, base_delay * 2^(attempt - 1))`.
pub fn backoff_ceiling(attempt: u32, config: &BackoffConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let base_ms = config.base_delay.as_millis() as f64;
    let max_ms = config.max_delay.as_millis() as f64;
    let exp = 2_f64.powi((attempt - 1).min(63) as i32);
    Duration::from_millis((base_ms * exp).min(max_ms) as u64)
}

/// Full-jitter backoff: uniform over `[0, ceiling]` so synchronized failures
/// spread out instead of retrying in lockstep.
pub fn backoff_delay(attempt: u32, config: &BackoffConfig) -> Duration {
    let ceiling = backoff_ceiling(attempt, config);
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Applies the failure transition for one attempt: back to the queue with a
/// jittered delay, or to the dead letter state once attempts are used up.
///
/// Worker reports and the reaper both funnel through [`fail_job`], so an
/// expired lease and an explicit failure are indistinguishable afterwards.
///
/// [`fail_job`]: RetryEngine::fail_job
pub struct RetryEngine {
    store: Arc<dyn JobStore>,
}

impl RetryEngine {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// One guarded write against the job's current lease. `guard` carries the
    /// caller's ownership predicate (owner and token for a worker report,
    /// token and observed expiry for the reaper); the leased-state check is
    /// added here. Returns the updated row, or `None` when the guard lost to
    /// a concurrent transition.
    pub async fn fail_job(
        &self,
        job: &Job,
        error: &str,
        guard: JobPredicate,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Job>> {
        let mut pred = guard;
        pred.state_in = Some(vec![JobState::Leased]);

        let failed_attempt = job.attempt_count + 1;
        let patch = if failed_attempt >= job.max_attempts {
            JobPatch {
                state: Some(JobState::DeadLettered),
                attempt_add: 1,
                lease_owner: Some(None),
                lease_expires_at: Some(None),
                last_error: Some(Some(error.to_string())),
                ..Default::default()
            }
        } else {
            let delay = backoff_delay(failed_attempt, &job.backoff);
            let not_before = now + ChronoDuration::milliseconds(delay.as_millis() as i64);
            JobPatch {
                state: Some(JobState::Retrying),
                not_before: Some(Some(not_before)),
                attempt_add: 1,
                lease_owner: Some(None),
                lease_expires_at: Some(None),
                last_error: Some(Some(error.to_string())),
                ..Default::default()
            }
        };

        // A cancellation flag raised while the job was leased wins over both
        // outcomes; checking it inside the write keeps the decision atomic.
        let mut no_cancel = pred.clone();
        no_cancel.cancel_requested = Some(false);
        if let Some(updated) = self
            .store
            .update_job_if(&job.id, &no_cancel, &patch, now)
            .await?
        {
            match updated.state {
                JobState::DeadLettered => {
                    warn!(job_id = %updated.id, attempts = updated.attempt_count, error, "job dead-lettered");
                }
                _ => {
                    debug!(
                        job_id = %updated.id,
                        attempt = updated.attempt_count,
                        retry_at = ?updated.not_before,
                        error,
                        "job scheduled for retry"
                    );
                }
            }
            return Ok(Some(updated));
        }

        let mut cancelled = pred;
        cancelled.cancel_requested = Some(true);
        let cancel_patch = JobPatch {
            state: Some(JobState::Cancelled),
            attempt_add: 1,
            lease_owner: Some(None),
            lease_expires_at: Some(None),
            last_error: Some(Some(error.to_string())),
            ..Default::default()
        };
        let updated = self
            .store
            .update_job_if(&job.id, &cancelled, &cancel_patch, now)
            .await?;
        if let Some(job) = &updated {
            debug!(job_id = %job.id, "cancellation honored on failed attempt");
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
        )
    }

    #[test]
    fn ceiling_doubles_until_capped() {
        let cfg = config(500, 60_000);
        assert_eq!(backoff_ceiling(1, &cfg), Duration::from_millis(500));
        assert_eq!(backoff_ceiling(2, &cfg), Duration::from_millis(1_000));
        assert_eq!(backoff_ceiling(3, &cfg), Duration::from_millis(2_000));
        assert_eq!(backoff_ceiling(8, &cfg), Duration::from_millis(60_000));
        // Far past the cap, still the cap; no overflow.
        assert_eq!(backoff_ceiling(200, &cfg), Duration::from_millis(60_000));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let cfg = config(1_000, 8_000);
        for attempt in 1..=10 {
            let ceiling = backoff_ceiling(attempt, &cfg);
            for _ in 0..50 {
                let delay = backoff_delay(attempt, &cfg);
                assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
            }
        }
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        let cfg = config(500, 60_000);
        assert_eq!(backoff_ceiling(0, &cfg), Duration::ZERO);
        assert_eq!(backoff_delay(0, &cfg), Duration::ZERO);
    }
}
