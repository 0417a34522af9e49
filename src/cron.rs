use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job::CronDefinition;
use crate::storage::{JobStore, Result as StorageResult, StorageError};

/// Cap on how many missed firings are counted for the collapse log line.
const MISSED_COUNT_CAP: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("Invalid cron schedule {expr:?}: {reason}")]
    InvalidSchedule { expr: String, reason: String },
    #[error("Failed to serialize cron payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn parse_schedule(expr: &str) -> Result<Schedule, CronError> {
    Schedule::from_str(expr).map_err(|e| CronError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Reject bad expressions at definition time, not at fire time.
pub fn validate_schedule(expr: &str) -> Result<(), CronError> {
    parse_schedule(expr).map(|_| ())
}

/// First fire time strictly after `after`, or `None` for a schedule with no
/// future occurrences.
pub fn next_fire_after(
    expr: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, CronError> {
    let schedule = parse_schedule(expr)?;
    Ok(schedule.after(&after).next())
}

/// Turns due cron definitions into concrete jobs.
///
/// Firing and advancing `next_fire_at` happen in one store transaction
/// guarded on the expected fire time, so N orchestrator instances produce
/// exactly one job per tick between them.
pub struct CronScheduler {
    store: Arc<dyn JobStore>,
    interval: Duration,
}

impl CronScheduler {
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Fire every definition due at `now`. Returns the number of jobs this
    /// instance materialized; ticks lost to another instance's guard count
    /// zero here.
    pub async fn tick(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let due = self.store.due_cron(now).await?;
        let mut fired = 0usize;

        for def in due {
            match self.fire(&def, now).await {
                Ok(count) => fired += count,
                Err(CronError::Storage(e)) => return Err(e),
                Err(error) => {
                    // Expressions are validated at registration, so this row
                    // was corrupted after the fact. Disable it rather than
                    // failing the tick forever.
                    error!(cron_id = %def.id, %error, "unusable cron definition, disabling");
                    self.disable(&def, now).await?;
                }
            }
        }

        Ok(fired)
    }

    async fn fire(&self, def: &CronDefinition, now: DateTime<Utc>) -> Result<usize, CronError> {
        let schedule = parse_schedule(&def.schedule)?;

        if def.backfill {
            return self.fire_backfill(def, &schedule, now).await;
        }

        // Collapse: one catch-up job for everything due, then fast-forward
        // strictly past `now`.
        let Some(next) = schedule.after(&now).next() else {
            warn!(cron_id = %def.id, "schedule has no future occurrences, disabling");
            self.disable(def, now).await?;
            return Ok(0);
        };

        let missed = schedule
            .after(&def.next_fire_at)
            .take_while(|t| *t <= now)
            .take(MISSED_COUNT_CAP)
            .count();

        let job = def.build_job(now);
        if self
            .store
            .advance_cron(&def.id, def.next_fire_at, &job, next)
            .await?
        {
            if missed > 0 {
                warn!(
                    cron_id = %def.id,
                    skipped = missed,
                    "collapsed missed firings into one catch-up job"
                );
            }
            debug!(cron_id = %def.id, job_id = %job.id, %next, "cron tick fired");
            Ok(1)
        } else {
            debug!(cron_id = %def.id, "tick already fired by another instance");
            Ok(0)
        }
    }

    /// One job per missed firing, each in its own guarded transaction, so
    /// instances interleave safely and a crash mid-walk loses nothing.
    async fn fire_backfill(
        &self,
        def: &CronDefinition,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<usize, CronError> {
        let mut fired = 0usize;
        let mut expected = def.next_fire_at;

        while expected <= now {
            let Some(next) = schedule.after(&expected).next() else {
                warn!(cron_id = %def.id, "schedule has no future occurrences, disabling");
                self.disable(def, now).await?;
                break;
            };

            let job = def.build_job(now);
            if !self
                .store
                .advance_cron(&def.id, expected, &job, next)
                .await?
            {
                // Another instance owns this walk now.
                debug!(cron_id = %def.id, "backfill taken over by another instance");
                break;
            }
            fired += 1;
            expected = next;
        }

        if fired > 1 {
            info!(cron_id = %def.id, count = fired, "backfilled missed firings");
        }
        Ok(fired)
    }

    async fn disable(&self, def: &CronDefinition, now: DateTime<Utc>) -> StorageResult<()> {
        let mut disabled = def.clone();
        disabled.enabled = false;
        disabled.updated_at = now;
        self.store.upsert_cron(&disabled).await
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "cron scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("cron scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    match self.tick(Utc::now()).await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "cron tick materialized jobs"),
                        Err(error) => error!(%error, "cron tick failed"),
                    }
                }
            }
        }
    }
}
