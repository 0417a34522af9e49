pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{CronDefinition, Job, JobId, JobState, QueueStats, Run, WorkerInfo};
use crate::rate_limit::RateBucket;

pub use sqlite::SqliteJobStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Preconditions of a conditional job update, evaluated inside the store's
/// single guarded statement. An empty predicate matches any live row.
#[derive(Debug, Clone, Default)]
pub struct JobPredicate {
    /// Row state must be one of these.
    pub state_in: Option<Vec<JobState>>,
    /// Row fencing token must equal this exactly.
    pub fencing_token: Option<i64>,
    /// Row lease owner must equal this worker.
    pub lease_owner: Option<String>,
    /// `not_before` must be absent or at/before this instant.
    pub ready_at: Option<DateTime<Utc>>,
    /// `lease_expires_at` must be strictly before this instant.
    pub lease_expired_at: Option<DateTime<Utc>>,
    /// `cancel_requested` must equal this.
    pub cancel_requested: Option<bool>,
}

/// Field changes applied when the predicate holds. `None` leaves a column
/// untouched; the inner `Option` writes NULL.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub not_before: Option<Option<DateTime<Utc>>>,
    /// Added to the stored attempt count.
    pub attempt_add: u32,
    pub lease_owner: Option<Option<String>>,
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
    /// Increment the fencing token by one as part of this write.
    pub bump_fencing: bool,
    pub cancel_requested: Option<bool>,
    pub last_error: Option<Option<String>>,
}

/// Filter for job listings.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub queue: Option<String>,
    pub job_type: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            state: None,
            queue: None,
            job_type: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Durable store underneath the orchestrator.
///
/// The store is the only coordination point between orchestrator instances:
/// every lease and state transition goes through [`update_job_if`], a single
/// compare-and-set statement. Nothing in the crate reads a row and writes it
/// back without a guard.
///
/// [`update_job_if`]: JobStore::update_job_if
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Apply `patch` to the job iff `pred` still holds, in one atomic
    /// statement. Returns the updated row, or `None` when the predicate no
    /// longer matched (somebody else won the race).
    async fn update_job_if(
        &self,
        id: &JobId,
        pred: &JobPredicate,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Jobs claimable right now, ordered priority-descending then
    /// oldest-first. Selection only; claiming re-verifies atomically.
    /// `offset` pages deeper into the same ordering.
    async fn eligible_jobs(
        &self,
        queue: Option<&str>,
        now: DateTime<Utc>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>>;

    /// Leased jobs whose lease expired strictly before `now`.
    async fn expired_leases(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn queue_stats(&self, queue: Option<&str>) -> Result<QueueStats>;

    async fn upsert_cron(&self, def: &CronDefinition) -> Result<()>;

    async fn get_cron(&self, id: &str) -> Result<Option<CronDefinition>>;

    async fn delete_cron(&self, id: &str) -> Result<()>;

    /// Enabled definitions with `next_fire_at` at or before `now`.
    async fn due_cron(&self, now: DateTime<Utc>) -> Result<Vec<CronDefinition>>;

    /// Fire one cron tick: insert `job` and advance `next_fire_at` to
    /// `next_fire` in a single transaction, guarded on the stored
    /// `next_fire_at` still being `expected_fire`. Returns false without
    /// side effects when another instance fired this tick first.
    async fn advance_cron(
        &self,
        id: &str,
        expected_fire: DateTime<Utc>,
        job: &Job,
        next_fire: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_rate_bucket(&self, key: &str) -> Result<Option<RateBucket>>;

    async fn put_rate_bucket(&self, bucket: &RateBucket) -> Result<()>;

    /// Move a bucket from its observed (tokens, refill instant) pair to new
    /// values; false when the stored pair changed underneath the caller.
    async fn update_rate_bucket_if(
        &self,
        key: &str,
        expected_tokens: f64,
        expected_refill_at: DateTime<Utc>,
        tokens: f64,
        refill_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn delete_rate_bucket(&self, key: &str) -> Result<()>;

    /// Record the start of one execution attempt; returns the run id.
    async fn insert_run(
        &self,
        job_id: &JobId,
        worker_id: &str,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<i64>;

    async fn finish_run(
        &self,
        run_id: i64,
        finished_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()>;

    async fn runs_for_job(&self, job_id: &JobId) -> Result<Vec<Run>>;

    async fn upsert_worker(&self, info: &WorkerInfo) -> Result<()>;

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>>;
}
