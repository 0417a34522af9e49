use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Current state of a job.
///
/// `Pending` and `Retrying` are the claimable states; `Leased` means some
/// worker holds the job right now; the rest are terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Leased,
    Retrying,
    Completed,
    DeadLettered,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Retrying => "retrying",
            JobState::Completed => "completed",
            JobState::DeadLettered => "dead_lettered",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn from_db(state: &str) -> Option<Self> {
        match state {
            "pending" => Some(JobState::Pending),
            "leased" => Some(JobState::Leased),
            "retrying" => Some(JobState::Retrying),
            "completed" => Some(JobState::Completed),
            "dead_lettered" => Some(JobState::DeadLettered),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never change again; rows are kept for audit.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::DeadLettered | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }
}

/// A unit of work pulled and executed by exactly one worker at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub payload: Vec<u8>,
    /// Higher runs sooner; ties break oldest-first.
    pub priority: i32,
    pub state: JobState,
    /// Not eligible for dispatch before this instant. `None` means now.
    pub not_before: Option<DateTime<Utc>>,
    /// Number of executions started so far; bumped on every exit from Leased.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Resource key checked against the rate limiter. `None` = unlimited.
    pub rate_key: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Bumped on every lease grant, never reused. Reports carrying an older
    /// token than the row are rejected.
    pub fencing_token: i64,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new<S: Into<String>>(job_type: S, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue: "default".to_string(),
            job_type: job_type.into(),
            payload,
            priority: 0,
            state: JobState::Pending,
            not_before: None,
            attempt_count: 0,
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            rate_key: None,
            lease_owner: None,
            lease_expires_at: None,
            fencing_token: 0,
            cancel_requested: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rate_key<S: Into<String>>(mut self, rate_key: S) -> Self {
        self.rate_key = Some(rate_key.into());
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Eligible for dispatch: claimable state and past any deferral.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Pending | JobState::Retrying)
            && self.not_before.map_or(true, |at| at <= now)
    }
}

/// A recurring schedule that materializes jobs from a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronDefinition {
    pub id: String,
    /// Cron expression, validated when the definition is registered.
    pub schedule: String,
    pub job_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub priority: i32,
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    pub rate_key: Option<String>,
    pub next_fire_at: DateTime<Utc>,
    pub enabled: bool,
    /// When true, each missed firing becomes its own job instead of
    /// collapsing into a single catch-up job.
    pub backfill: bool,
    pub updated_at: DateTime<Utc>,
}

impl CronDefinition {
    pub fn new<S1, S2, S3>(id: S1, schedule: S2, job_type: S3, payload: Vec<u8>) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self {
            id: id.into(),
            schedule: schedule.into(),
            job_type: job_type.into(),
            payload,
            queue: "default".to_string(),
            priority: 0,
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            rate_key: None,
            next_fire_at: Utc::now(),
            enabled: true,
            backfill: false,
            updated_at: Utc::now(),
        }
    }

    pub fn with_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rate_key<S: Into<String>>(mut self, rate_key: S) -> Self {
        self.rate_key = Some(rate_key.into());
        self
    }

    pub fn with_backfill(mut self, backfill: bool) -> Self {
        self.backfill = backfill;
        self
    }

    /// Build the concrete job for one firing of this definition.
    pub fn build_job(&self, now: DateTime<Utc>) -> Job {
        let mut job = Job::new(self.job_type.clone(), self.payload.clone())
            .with_queue(self.queue.clone())
            .with_priority(self.priority)
            .with_max_attempts(self.max_attempts)
            .with_backoff(self.backoff);
        if let Some(key) = &self.rate_key {
            job = job.with_rate_key(key.clone());
        }
        job.created_at = now;
        job.updated_at = now;
        job
    }
}

/// One execution attempt of a job, for audit.
///
/// `finished_at` stays NULL when the worker vanished and the reaper took the
/// job back; the next attempt gets its own row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub job_id: JobId,
    pub worker_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A worker known to the orchestrator, refreshed on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub host: String,
    pub pid: u32,
    pub last_heartbeat: DateTime<Utc>,
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub retrying: u64,
    pub completed: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
}

impl QueueStats {
    /// Jobs still waiting to run.
    pub fn depth(&self) -> u64 {
        self.pending + self.retrying
    }
}
