use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::job::JobState;
use crate::metrics::Metrics;
use crate::retry::RetryEngine;
use crate::storage::{JobPredicate, JobStore, Result as StorageResult};

const REAP_BATCH: u32 = 100;

/// Reclaims jobs whose worker stopped heartbeating.
///
/// An expired lease is settled exactly like a failed attempt, through the
/// same guarded transition worker reports use, so a crashed worker and a
/// worker that reported failure leave the job in the same place.
pub struct Reaper {
    store: Arc<dyn JobStore>,
    retry: RetryEngine,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, metrics: Arc<Metrics>, interval: Duration) -> Self {
        let retry = RetryEngine::new(store.clone());
        Self {
            store,
            retry,
            metrics,
            interval,
        }
    }

    /// One pass over leases that expired before `now`. Each write is guarded
    /// on the fencing token observed in the scan and on the expiry still
    /// holding, so a concurrent heartbeat or a fresh claim turns that reap
    /// into a no-op. Returns how many leases were actually reclaimed.
    pub async fn reap(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let mut reaped = 0usize;

        loop {
            let expired = self.store.expired_leases(now, REAP_BATCH).await?;
            if expired.is_empty() {
                break;
            }
            let full_batch = expired.len() as u32 == REAP_BATCH;

            for job in expired {
                let guard = JobPredicate {
                    fencing_token: Some(job.fencing_token),
                    lease_expired_at: Some(now),
                    ..Default::default()
                };
                let Some(updated) = self
                    .retry
                    .fail_job(&job, "lease expired", guard, now)
                    .await?
                else {
                    // The lease moved on between scan and write.
                    continue;
                };

                reaped += 1;
                self.metrics.record_reaped();
                match updated.state {
                    JobState::Retrying => self.metrics.record_failed_attempt(),
                    JobState::DeadLettered => {
                        self.metrics.record_failed_attempt();
                        self.metrics.record_dead_lettered();
                    }
                    _ => {}
                }
                info!(
                    job_id = %updated.id,
                    owner = job.lease_owner.as_deref().unwrap_or(""),
                    state = %updated.state,
                    "reclaimed expired lease"
                );
            }

            if !full_batch {
                break;
            }
        }

        Ok(reaped)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "reaper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reaper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    match self.reap(Utc::now()).await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "reap pass finished"),
                        Err(error) => error!(%error, "reap pass failed"),
                    }
                }
            }
        }
    }
}
