use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::job::{Job, JobId, JobState};
use crate::retry::RetryEngine;
use crate::storage::{JobPatch, JobPredicate, JobStore, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Somebody else claimed the job first; pick another candidate.
    #[error("Job {0} was claimed by another worker")]
    Conflict(JobId),
    /// The caller no longer holds the lease: the fencing token (or owner, or
    /// state) moved on without it. The worker must stop immediately; whatever
    /// it reports is discarded.
    #[error("Lease on job {0} is no longer held")]
    Stale(JobId),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type LeaseResult<T> = std::result::Result<T, LeaseError>;

/// A granted lease: a snapshot of the job plus the fencing token that every
/// heartbeat and report on this execution must present.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    pub token: i64,
    pub expires_at: DateTime<Utc>,
}

/// Heartbeat acknowledgment.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    pub expires_at: DateTime<Utc>,
    /// Cooperative cancellation: when set, the worker should stop and report;
    /// the result will be discarded.
    pub cancel_requested: bool,
}

/// Execution result reported by a worker.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success,
    Failure(String),
}

/// Grants and settles leases. Every operation is one conditional write; the
/// store decides races, never in-process state.
pub struct LeaseManager {
    store: Arc<dyn JobStore>,
    retry: RetryEngine,
    lease_duration: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn JobStore>, lease_duration: Duration) -> Self {
        let retry = RetryEngine::new(store.clone());
        Self {
            store,
            retry,
            lease_duration,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::milliseconds(self.lease_duration.as_millis() as i64)
    }

    /// Take the lease on a claimable job. Exactly one concurrent caller wins;
    /// the rest get [`LeaseError::Conflict`] and should move to another
    /// candidate.
    pub async fn claim(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> LeaseResult<Lease> {
        let expires_at = self.expiry_from(now);
        let pred = JobPredicate {
            state_in: Some(vec![JobState::Pending, JobState::Retrying]),
            ready_at: Some(now),
            ..Default::default()
        };
        let patch = JobPatch {
            state: Some(JobState::Leased),
            lease_owner: Some(Some(worker_id.to_string())),
            lease_expires_at: Some(Some(expires_at)),
            bump_fencing: true,
            ..Default::default()
        };

        match self.store.update_job_if(job_id, &pred, &patch, now).await? {
            Some(job) => {
                debug!(
                    job_id = %job.id,
                    worker_id,
                    token = job.fencing_token,
                    %expires_at,
                    "lease granted"
                );
                Ok(Lease {
                    token: job.fencing_token,
                    expires_at,
                    job,
                })
            }
            None => Err(LeaseError::Conflict(job_id.clone())),
        }
    }

    /// Renew the lease to `now + lease_duration`. Succeeds only while the
    /// caller still holds the lease; a lease that expired but was not reaped
    /// yet is still held, so the renewal wins that race.
    pub async fn heartbeat(
        &self,
        job_id: &JobId,
        worker_id: &str,
        token: i64,
        now: DateTime<Utc>,
    ) -> LeaseResult<Heartbeat> {
        let expires_at = self.expiry_from(now);
        let pred = JobPredicate {
            state_in: Some(vec![JobState::Leased]),
            lease_owner: Some(worker_id.to_string()),
            fencing_token: Some(token),
            ..Default::default()
        };
        let patch = JobPatch {
            lease_expires_at: Some(Some(expires_at)),
            ..Default::default()
        };

        match self.store.update_job_if(job_id, &pred, &patch, now).await? {
            Some(job) => Ok(Heartbeat {
                expires_at,
                cancel_requested: job.cancel_requested,
            }),
            None => Err(LeaseError::Stale(job_id.clone())),
        }
    }

    /// Settle an execution. Success lands on `Completed`; failure goes
    /// through the retry engine to `Retrying` or `DeadLettered`. Either way a
    /// cancellation flag raised during the lease redirects to `Cancelled` and
    /// the reported result is discarded. The attempt count goes up exactly
    /// once per settled lease.
    pub async fn complete(
        &self,
        job_id: &JobId,
        worker_id: &str,
        token: i64,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> LeaseResult<Job> {
        let guard = JobPredicate {
            lease_owner: Some(worker_id.to_string()),
            fencing_token: Some(token),
            ..Default::default()
        };

        match outcome {
            JobOutcome::Success => {
                let mut pred = guard.clone();
                pred.state_in = Some(vec![JobState::Leased]);
                pred.cancel_requested = Some(false);
                let patch = JobPatch {
                    state: Some(JobState::Completed),
                    attempt_add: 1,
                    lease_owner: Some(None),
                    lease_expires_at: Some(None),
                    last_error: Some(None),
                    ..Default::default()
                };
                if let Some(job) = self.store.update_job_if(job_id, &pred, &patch, now).await? {
                    info!(job_id = %job.id, attempts = job.attempt_count, "job completed");
                    return Ok(job);
                }

                let mut pred = guard;
                pred.state_in = Some(vec![JobState::Leased]);
                pred.cancel_requested = Some(true);
                let patch = JobPatch {
                    state: Some(JobState::Cancelled),
                    attempt_add: 1,
                    lease_owner: Some(None),
                    lease_expires_at: Some(None),
                    ..Default::default()
                };
                match self.store.update_job_if(job_id, &pred, &patch, now).await? {
                    Some(job) => {
                        info!(job_id = %job.id, "cancellation honored, result discarded");
                        Ok(job)
                    }
                    None => Err(LeaseError::Stale(job_id.clone())),
                }
            }
            JobOutcome::Failure(error) => {
                let Some(job) = self.store.get_job(job_id).await? else {
                    return Err(LeaseError::Stale(job_id.clone()));
                };
                match self.retry.fail_job(&job, &error, guard, now).await? {
                    Some(job) => Ok(job),
                    None => Err(LeaseError::Stale(job_id.clone())),
                }
            }
        }
    }
}
