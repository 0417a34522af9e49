use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cron::{next_fire_after, CronError, CronScheduler};
use crate::dispatch::Dispatcher;
use crate::job::{BackoffConfig, CronDefinition, Job, JobId, JobState, QueueStats, Run, WorkerInfo};
use crate::lease::LeaseManager;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::rate_limit::RateLimiter;
use crate::reaper::Reaper;
use crate::registry::{HandlerRegistry, JobDefinition};
use crate::storage::{JobFilter, JobPatch, JobPredicate, JobStore, SqliteJobStore, StorageError};
use crate::worker::Worker;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Failed to serialize job payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What a cancel request actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job went to Cancelled (it was waiting, or already was Cancelled).
    Cancelled,
    /// The job is mid-execution; the flag is set and will be honored at the
    /// next heartbeat or report.
    Flagged,
    /// Completed or DeadLettered already; terminal states stay put.
    AlreadyFinished,
    NotFound,
}

/// Per-submission overrides on top of a job definition's defaults.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Option<i32>,
    pub queue: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    pub rate_key: Option<String>,
    pub backoff: Option<BackoffConfig>,
}

/// Overrides for a cron registration.
#[derive(Debug, Clone, Default)]
pub struct CronOptions {
    /// Materialize one job per missed firing instead of collapsing a gap
    /// into a single catch-up job.
    pub backfill: bool,
    pub priority: Option<i32>,
    pub queue: Option<String>,
    pub max_attempts: Option<u32>,
    pub rate_key: Option<String>,
    pub backoff: Option<BackoffConfig>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a claim holds a job before the reaper may take it back.
    pub lease_duration: Duration,
    /// Worker sleep between empty polls.
    pub poll_interval: Duration,
    pub reaper_interval: Duration,
    pub cron_interval: Duration,
    /// How many candidates the dispatcher fetches per page.
    pub dispatch_batch: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            reaper_interval: Duration::from_secs(1),
            cron_interval: Duration::from_secs(1),
            dispatch_batch: 32,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_lease_duration(mut self, d: Duration) -> Self {
        self.lease_duration = d;
        self
    }

    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn with_reaper_interval(mut self, d: Duration) -> Self {
        self.reaper_interval = d;
        self
    }

    pub fn with_cron_interval(mut self, d: Duration) -> Self {
        self.cron_interval = d;
        self
    }

    pub fn with_dispatch_batch(mut self, batch: u32) -> Self {
        self.dispatch_batch = batch;
        self
    }
}

/// Main entry point: owns the store, the handler registry, and the background
/// loops, and exposes the admin surface.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    leases: Arc<LeaseManager>,
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    config: OrchestratorConfig,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
    cron_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Open (or create) the store at `connection_string` with default config.
    ///
    /// Workers and background loops are not started until you call `start()`.
    /// Register your handlers with `register()` before starting.
    ///
    /// # Example
    /// ```ignore
    /// let mut orch = Orchestrator::new("sqlite://jobs.db").await?;
    ///
    /// let send_email = JobDefinition::new("send_email", send_email_handler)
    ///     .with_max_attempts(5);
    /// orch.register(&send_email);
    ///
    /// orch.start(2).await;
    /// let id = orch.submit(&send_email, EmailArgs { to: "x@y.z".into() }).await?;
    /// ```
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_config(connection_string, OrchestratorConfig::default()).await
    }

    pub async fn with_config(
        connection_string: &str,
        config: OrchestratorConfig,
    ) -> Result<Self, StorageError> {
        let store = Arc::new(SqliteJobStore::new(connection_string).await?);
        Ok(Self::from_store(store, config))
    }

    /// Build on an already-opened store. Tests use this with the in-memory
    /// store.
    pub fn from_store(store: Arc<dyn JobStore>, config: OrchestratorConfig) -> Self {
        let metrics = Arc::new(Metrics::default());
        let leases = Arc::new(LeaseManager::new(store.clone(), config.lease_duration));
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), config.dispatch_batch));
        let limiter = Arc::new(RateLimiter::new(store.clone()));

        Self {
            store,
            handlers: Arc::new(HandlerRegistry::new()),
            leases,
            dispatcher,
            limiter,
            metrics,
            config,
            shutdown: CancellationToken::new(),
            worker_handles: Vec::new(),
            reaper_handle: Mutex::new(None),
            cron_handle: Mutex::new(None),
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.handlers)
    }

    /// Register a job definition's handler for execution.
    pub fn register<T>(&self, def: &JobDefinition<T>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.handlers.register(def);
    }

    /// Create and register a job definition in one step.
    pub fn register_handler<T, F, Fut>(&self, name: &'static str, handler: F) -> JobDefinition<T>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let def = JobDefinition::new(name, handler);
        self.handlers.register(&def);
        def
    }

    /// Submit a job with the definition's defaults.
    pub async fn submit<T>(&self, def: &JobDefinition<T>, args: T) -> Result<JobId, SubmitError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.submit_with(def, args, SubmitOptions::default()).await
    }

    /// Submit a job, overriding definition defaults per call.
    pub async fn submit_with<T>(
        &self,
        def: &JobDefinition<T>,
        args: T,
        opts: SubmitOptions,
    ) -> Result<JobId, SubmitError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let payload = serde_json::to_vec(&args)?;
        let mut job = Job::new(def.name(), payload)
            .with_queue(opts.queue.as_deref().unwrap_or(def.queue()))
            .with_priority(opts.priority.unwrap_or(def.priority()))
            .with_max_attempts(opts.max_attempts.unwrap_or(def.max_attempts()))
            .with_backoff(opts.backoff.unwrap_or(def.backoff()));
        if let Some(key) = opts.rate_key.or_else(|| def.rate_key().map(str::to_string)) {
            job = job.with_rate_key(key);
        }
        if let Some(at) = opts.not_before {
            job = job.not_before(at);
        }

        let id = job.id.clone();
        self.store.insert_job(&job).await?;
        info!(job_id = %id, job_type = def.name(), queue = %job.queue, "Job submitted");
        Ok(id)
    }

    /// Cancel a job.
    ///
    /// Waiting jobs go straight to Cancelled. A leased job only gets its
    /// cancel flag raised; the running worker observes it at the next
    /// heartbeat, and whatever the attempt reports afterwards settles as
    /// Cancelled. Terminal jobs are left untouched.
    pub async fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome, StorageError> {
        loop {
            let direct = self
                .store
                .update_job_if(
                    job_id,
                    &JobPredicate {
                        state_in: Some(vec![JobState::Pending, JobState::Retrying]),
                        ..Default::default()
                    },
                    &JobPatch {
                        state: Some(JobState::Cancelled),
                        ..Default::default()
                    },
                    Utc::now(),
                )
                .await?;
            if direct.is_some() {
                info!(job_id = %job_id, "Job cancelled");
                return Ok(CancelOutcome::Cancelled);
            }

            let flagged = self
                .store
                .update_job_if(
                    job_id,
                    &JobPredicate {
                        state_in: Some(vec![JobState::Leased]),
                        ..Default::default()
                    },
                    &JobPatch {
                        cancel_requested: Some(true),
                        ..Default::default()
                    },
                    Utc::now(),
                )
                .await?;
            if flagged.is_some() {
                info!(job_id = %job_id, "Cancellation requested for leased job");
                return Ok(CancelOutcome::Flagged);
            }

            match self.store.get_job(job_id).await? {
                None => return Ok(CancelOutcome::NotFound),
                Some(job) => match job.state {
                    JobState::Cancelled => return Ok(CancelOutcome::Cancelled),
                    JobState::Completed | JobState::DeadLettered => {
                        return Ok(CancelOutcome::AlreadyFinished)
                    }
                    // The job changed hands between the two writes; go
                    // around again.
                    _ => debug!(job_id = %job_id, state = %job.state, "cancel raced, retrying"),
                },
            }
        }
    }

    /// Current snapshot of one job.
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StorageError> {
        self.store.get_job(job_id).await
    }

    /// List jobs by state/queue/type with limit+offset paging.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        self.store.list_jobs(filter).await
    }

    /// Per-state counts, over one queue or all of them.
    pub async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, StorageError> {
        self.store.queue_stats(queue).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Execution history for a job, newest attempt last.
    pub async fn runs_for_job(&self, job_id: &JobId) -> Result<Vec<Run>, StorageError> {
        self.store.runs_for_job(job_id).await
    }

    /// Workers seen recently, with their last heartbeat.
    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, StorageError> {
        self.store.list_workers().await
    }

    /// Register a recurring job. The schedule is validated here; a bad
    /// expression never reaches the store.
    pub async fn register_cron<T>(
        &self,
        id: &str,
        schedule: &str,
        def: &JobDefinition<T>,
        args: T,
    ) -> Result<(), CronError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.register_cron_with(id, schedule, def, args, CronOptions::default())
            .await
    }

    pub async fn register_cron_with<T>(
        &self,
        id: &str,
        schedule: &str,
        def: &JobDefinition<T>,
        args: T,
        opts: CronOptions,
    ) -> Result<(), CronError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let payload = serde_json::to_vec(&args)?;
        let now = Utc::now();
        let next = next_fire_after(schedule, now)?.ok_or_else(|| CronError::InvalidSchedule {
            expr: schedule.to_string(),
            reason: "schedule has no upcoming fire time".to_string(),
        })?;

        let mut cron_def = CronDefinition::new(id, schedule, def.name(), payload)
            .with_queue(opts.queue.as_deref().unwrap_or(def.queue()))
            .with_priority(opts.priority.unwrap_or(def.priority()))
            .with_max_attempts(opts.max_attempts.unwrap_or(def.max_attempts()))
            .with_backoff(opts.backoff.unwrap_or(def.backoff()))
            .with_backfill(opts.backfill);
        if let Some(key) = opts.rate_key.or_else(|| def.rate_key().map(str::to_string)) {
            cron_def = cron_def.with_rate_key(key);
        }
        cron_def.next_fire_at = next;
        cron_def.updated_at = now;

        self.store.upsert_cron(&cron_def).await?;
        info!(cron_id = id, schedule, next_fire = %next, "Registered cron definition");
        Ok(())
    }

    pub async fn remove_cron(&self, id: &str) -> Result<(), StorageError> {
        self.store.delete_cron(id).await
    }

    /// Create or reset the token bucket for `key`, starting full.
    pub async fn set_rate_limit(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
    ) -> Result<(), StorageError> {
        self.limiter
            .set_limit(key, capacity, refill_per_sec, Utc::now())
            .await
    }

    /// Remove the bucket; jobs with this key stop being limited.
    pub async fn remove_rate_limit(&self, key: &str) -> Result<(), StorageError> {
        self.limiter.remove_limit(key).await
    }

    /// Start workers plus the reaper and cron loops.
    pub async fn start(&mut self, worker_count: usize) {
        self.start_workers(worker_count);
        self.start_reaper().await;
        self.start_cron().await;
    }

    /// Start workers that pull from every queue.
    pub fn start_workers(&mut self, count: usize) {
        for _ in 0..count {
            self.spawn_worker(None);
        }
    }

    /// Start one worker bound to a single queue.
    pub fn start_worker_for(&mut self, queue: &str) {
        self.spawn_worker(Some(queue));
    }

    pub fn start_workers_for(&mut self, queue: &str, count: usize) {
        for _ in 0..count {
            self.spawn_worker(Some(queue));
        }
    }

    fn spawn_worker(&mut self, queue: Option<&str>) {
        let mut worker = Worker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.leases),
            Arc::clone(&self.limiter),
            Arc::clone(&self.handlers),
            Arc::clone(&self.metrics),
        )
        .with_poll_interval(self.config.poll_interval);
        if let Some(queue) = queue {
            worker = worker.with_queue(queue);
        }

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            worker.run(shutdown).await;
        });

        self.worker_handles.push(handle);
        info!(queue = queue.unwrap_or("*"), "Started worker");
    }

    /// Start the lease reaper loop. Idempotent.
    pub async fn start_reaper(&self) {
        let mut handle_guard = self.reaper_handle.lock().await;
        if handle_guard.is_some() {
            return;
        }

        let reaper = Reaper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            self.config.reaper_interval,
        );
        let shutdown = self.shutdown.clone();
        *handle_guard = Some(tokio::spawn(async move {
            reaper.run(shutdown).await;
        }));
        info!("Started reaper");
    }

    /// Start the cron materializer loop. Idempotent.
    pub async fn start_cron(&self) {
        let mut handle_guard = self.cron_handle.lock().await;
        if handle_guard.is_some() {
            return;
        }

        let scheduler = CronScheduler::new(Arc::clone(&self.store), self.config.cron_interval);
        let shutdown = self.shutdown.clone();
        *handle_guard = Some(tokio::spawn(async move {
            scheduler.run(shutdown).await;
        }));
        info!("Started cron scheduler");
    }

    /// Get the shutdown token for external shutdown control
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Trigger graceful shutdown and wait for every loop to stop.
    pub async fn shutdown(&mut self) {
        info!("Initiating shutdown");
        self.shutdown.cancel();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }

        let reaper_handle = { self.reaper_handle.lock().await.take() };
        if let Some(handle) = reaper_handle {
            let _ = handle.await;
        }

        let cron_handle = { self.cron_handle.lock().await.take() };
        if let Some(handle) = cron_handle {
            let _ = handle.await;
        }

        info!("Shutdown complete");
    }

    /// Wait for shutdown signal (e.g., Ctrl+C)
    pub async fn wait_for_shutdown(&mut self) {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");

        self.shutdown().await;
    }
}
