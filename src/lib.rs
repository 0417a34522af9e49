pub mod cron;
pub mod dispatch;
pub mod job;
pub mod lease;
pub mod metrics;
pub mod rate_limit;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod server;
pub mod storage;
pub mod worker;

pub use cron::{CronError, CronScheduler};
pub use dispatch::Dispatcher;
pub use job::{BackoffConfig, CronDefinition, Job, JobId, JobState, QueueStats, Run, WorkerInfo};
pub use lease::{Heartbeat, JobOutcome, Lease, LeaseError, LeaseManager};
pub use metrics::{Metrics, MetricsSnapshot};
pub use rate_limit::{RateBucket, RateLimiter};
pub use reaper::Reaper;
pub use registry::{HandlerRegistry, JobDefinition, JobError};
pub use server::{
    CancelOutcome, CronOptions, Orchestrator, OrchestratorConfig, SubmitError, SubmitOptions,
};
pub use storage::sqlite::SqliteJobStore;
pub use storage::{JobFilter, JobPatch, JobPredicate, JobStore, StorageError};
pub use worker::Worker;
