use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::job::{BackoffConfig, CronDefinition, Job, JobId, JobState, QueueStats, Run, WorkerInfo};
use crate::rate_limit::RateBucket;

use super::{JobFilter, JobPatch, JobPredicate, JobStore, Result, StorageError};

/// All timestamps are stored as fixed-width RFC 3339 UTC text (microsecond
/// precision, `Z` suffix) so that SQL string comparison is chronological
/// comparison.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

/// Bind argument for dynamically assembled statements, pushed in placeholder
/// order.
enum Arg {
    Text(String),
    OptText(Option<String>),
    Int(i64),
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>;

fn bind_all(mut q: SqliteQuery<'_>, args: Vec<Arg>) -> SqliteQuery<'_> {
    for arg in args {
        q = match arg {
            Arg::Text(s) => q.bind(s),
            Arg::OptText(s) => q.bind(s),
            Arg::Int(i) => q.bind(i),
        };
    }
    q
}

const INSERT_JOB_SQL: &str = r#"
    INSERT INTO jobs (
        id, queue, job_type, payload, priority, state, not_before,
        attempt_count, max_attempts, base_delay_ms, max_delay_ms, rate_key,
        lease_owner, lease_expires_at, fencing_token, cancel_requested,
        last_error, created_at, updated_at
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

fn bind_job_insert<'q>(q: SqliteQuery<'q>, job: &'q Job) -> SqliteQuery<'q> {
    q.bind(&job.id.0)
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.state.as_str())
        .bind(job.not_before.map(fmt_ts))
        .bind(job.attempt_count as i64)
        .bind(job.max_attempts as i64)
        .bind(job.backoff.base_delay.as_millis() as i64)
        .bind(job.backoff.max_delay.as_millis() as i64)
        .bind(&job.rate_key)
        .bind(&job.lease_owner)
        .bind(job.lease_expires_at.map(fmt_ts))
        .bind(job.fencing_token)
        .bind(job.cancel_requested)
        .bind(&job.last_error)
        .bind(fmt_ts(job.created_at))
        .bind(fmt_ts(job.updated_at))
}

pub struct SqliteJobStore {
    pub pool: SqlitePool,
}

impl SqliteJobStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.configure().await?;
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store on a single-connection pool, for tests. One
    /// connection is required because every pooled connection would
    /// otherwise get its own private `:memory:` database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.configure().await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn configure(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                job_type TEXT NOT NULL,
                payload BLOB NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                not_before TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                base_delay_ms INTEGER NOT NULL DEFAULT 500,
                max_delay_ms INTEGER NOT NULL DEFAULT 60000,
                rate_key TEXT,
                lease_owner TEXT,
                lease_expires_at TEXT,
                fencing_token INTEGER NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_ready
            ON jobs(state, not_before, priority, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_lease
            ON jobs(state, lease_expires_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_queue_state ON jobs(queue, state)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cron_jobs (
                id TEXT PRIMARY KEY,
                schedule TEXT NOT NULL,
                job_type TEXT NOT NULL,
                payload BLOB NOT NULL,
                queue TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                base_delay_ms INTEGER NOT NULL DEFAULT 500,
                max_delay_ms INTEGER NOT NULL DEFAULT 60000,
                rate_key TEXT,
                next_fire_at TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                backfill INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_buckets (
                key TEXT PRIMARY KEY,
                capacity REAL NOT NULL,
                refill_per_sec REAL NOT NULL,
                tokens REAL NOT NULL,
                last_refill_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error TEXT,
                FOREIGN KEY (job_id) REFERENCES jobs(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_runs_job_id ON runs(job_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                worker_id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                pid INTEGER NOT NULL,
                last_heartbeat TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(&self, row: SqliteRow) -> Result<Job> {
        let id: String = row.get("id");
        let queue: String = row.get("queue");
        let job_type: String = row.get("job_type");
        let payload: Vec<u8> = row.get("payload");
        let priority: i32 = row.get("priority");
        let state_str: String = row.get("state");
        let not_before: Option<String> = row.get("not_before");
        let attempt_count: i64 = row.get("attempt_count");
        let max_attempts: i64 = row.get("max_attempts");
        let base_delay_ms: i64 = row.get("base_delay_ms");
        let max_delay_ms: i64 = row.get("max_delay_ms");
        let rate_key: Option<String> = row.get("rate_key");
        let lease_owner: Option<String> = row.get("lease_owner");
        let lease_expires_at: Option<String> = row.get("lease_expires_at");
        let fencing_token: i64 = row.get("fencing_token");
        let cancel_requested: bool = row.get("cancel_requested");
        let last_error: Option<String> = row.get("last_error");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        let state = JobState::from_db(&state_str)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown job state {state_str:?}")))?;

        Ok(Job {
            id: JobId(id),
            queue,
            job_type,
            payload,
            priority,
            state,
            not_before: parse_ts_opt(not_before)?,
            attempt_count: attempt_count as u32,
            max_attempts: max_attempts as u32,
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(base_delay_ms as u64),
                max_delay: Duration::from_millis(max_delay_ms as u64),
            },
            rate_key,
            lease_owner,
            lease_expires_at: parse_ts_opt(lease_expires_at)?,
            fencing_token,
            cancel_requested,
            last_error,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn row_to_cron(&self, row: SqliteRow) -> Result<CronDefinition> {
        let id: String = row.get("id");
        let schedule: String = row.get("schedule");
        let job_type: String = row.get("job_type");
        let payload: Vec<u8> = row.get("payload");
        let queue: String = row.get("queue");
        let priority: i32 = row.get("priority");
        let max_attempts: i64 = row.get("max_attempts");
        let base_delay_ms: i64 = row.get("base_delay_ms");
        let max_delay_ms: i64 = row.get("max_delay_ms");
        let rate_key: Option<String> = row.get("rate_key");
        let next_fire_at: String = row.get("next_fire_at");
        let enabled: bool = row.get("enabled");
        let backfill: bool = row.get("backfill");
        let updated_at: String = row.get("updated_at");

        Ok(CronDefinition {
            id,
            schedule,
            job_type,
            payload,
            queue,
            priority,
            max_attempts: max_attempts as u32,
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(base_delay_ms as u64),
                max_delay: Duration::from_millis(max_delay_ms as u64),
            },
            rate_key,
            next_fire_at: parse_ts(&next_fire_at)?,
            enabled,
            backfill,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn row_to_run(&self, row: SqliteRow) -> Result<Run> {
        let id: i64 = row.get("id");
        let job_id: String = row.get("job_id");
        let worker_id: String = row.get("worker_id");
        let attempt: i64 = row.get("attempt");
        let started_at: String = row.get("started_at");
        let finished_at: Option<String> = row.get("finished_at");
        let error: Option<String> = row.get("error");

        Ok(Run {
            id,
            job_id: JobId(job_id),
            worker_id,
            attempt: attempt as u32,
            started_at: parse_ts(&started_at)?,
            finished_at: parse_ts_opt(finished_at)?,
            error,
        })
    }

    fn row_to_bucket(&self, row: SqliteRow) -> Result<RateBucket> {
        let key: String = row.get("key");
        let capacity: f64 = row.get("capacity");
        let refill_per_sec: f64 = row.get("refill_per_sec");
        let tokens: f64 = row.get("tokens");
        let last_refill_at: String = row.get("last_refill_at");

        Ok(RateBucket {
            key,
            capacity,
            refill_per_sec,
            tokens,
            last_refill_at: parse_ts(&last_refill_at)?,
        })
    }

    fn row_to_worker(&self, row: SqliteRow) -> Result<WorkerInfo> {
        let worker_id: String = row.get("worker_id");
        let host: String = row.get("host");
        let pid: i64 = row.get("pid");
        let last_heartbeat: String = row.get("last_heartbeat");

        Ok(WorkerInfo {
            worker_id,
            host,
            pid: pid as u32,
            last_heartbeat: parse_ts(&last_heartbeat)?,
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        bind_job_insert(sqlx::query(INSERT_JOB_SQL), job)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_job(row)?)),
            None => Ok(None),
        }
    }

    async fn update_job_if(
        &self,
        id: &JobId,
        pred: &JobPredicate,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        // Assemble one conditional UPDATE so the predicate check and the
        // field changes happen in the same statement.
        let mut sets: Vec<String> = vec!["updated_at = ?".to_string()];
        let mut args: Vec<Arg> = vec![Arg::Text(fmt_ts(now))];

        if let Some(state) = patch.state {
            sets.push("state = ?".to_string());
            args.push(Arg::Text(state.as_str().to_string()));
        }
        if let Some(not_before) = &patch.not_before {
            sets.push("not_before = ?".to_string());
            args.push(Arg::OptText(not_before.map(fmt_ts)));
        }
        if patch.attempt_add > 0 {
            sets.push("attempt_count = attempt_count + ?".to_string());
            args.push(Arg::Int(patch.attempt_add as i64));
        }
        if let Some(owner) = &patch.lease_owner {
            sets.push("lease_owner = ?".to_string());
            args.push(Arg::OptText(owner.clone()));
        }
        if let Some(expires) = &patch.lease_expires_at {
            sets.push("lease_expires_at = ?".to_string());
            args.push(Arg::OptText(expires.map(fmt_ts)));
        }
        if patch.bump_fencing {
            sets.push("fencing_token = fencing_token + 1".to_string());
        }
        if let Some(flag) = patch.cancel_requested {
            sets.push("cancel_requested = ?".to_string());
            args.push(Arg::Int(flag as i64));
        }
        if let Some(error) = &patch.last_error {
            sets.push("last_error = ?".to_string());
            args.push(Arg::OptText(error.clone()));
        }

        let mut wheres: Vec<String> = vec!["id = ?".to_string()];
        args.push(Arg::Text(id.0.clone()));

        if let Some(states) = &pred.state_in {
            let placeholders = vec!["?"; states.len()].join(", ");
            wheres.push(format!("state IN ({placeholders})"));
            for state in states {
                args.push(Arg::Text(state.as_str().to_string()));
            }
        }
        if let Some(token) = pred.fencing_token {
            wheres.push("fencing_token = ?".to_string());
            args.push(Arg::Int(token));
        }
        if let Some(owner) = &pred.lease_owner {
            wheres.push("lease_owner = ?".to_string());
            args.push(Arg::Text(owner.clone()));
        }
        if let Some(at) = pred.ready_at {
            wheres.push("(not_before IS NULL OR not_before <= ?)".to_string());
            args.push(Arg::Text(fmt_ts(at)));
        }
        if let Some(at) = pred.lease_expired_at {
            wheres.push("lease_expires_at < ?".to_string());
            args.push(Arg::Text(fmt_ts(at)));
        }
        if let Some(flag) = pred.cancel_requested {
            wheres.push("cancel_requested = ?".to_string());
            args.push(Arg::Int(flag as i64));
        }

        let sql = format!(
            "UPDATE jobs SET {} WHERE {} RETURNING *",
            sets.join(", "),
            wheres.join(" AND "),
        );

        let row = bind_all(sqlx::query(&sql), args)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_job(row)?)),
            None => Ok(None),
        }
    }

    async fn eligible_jobs(
        &self,
        queue: Option<&str>,
        now: DateTime<Utc>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>> {
        let rows = match queue {
            Some(queue) => {
                sqlx::query(
                    r#"
                    SELECT * FROM jobs
                    WHERE state IN ('pending', 'retrying')
                      AND (not_before IS NULL OR not_before <= ?)
                      AND queue = ?
                    ORDER BY priority DESC, created_at ASC, id ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(fmt_ts(now))
                .bind(queue)
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM jobs
                    WHERE state IN ('pending', 'retrying')
                      AND (not_before IS NULL OR not_before <= ?)
                    ORDER BY priority DESC, created_at ASC, id ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(fmt_ts(now))
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(|row| self.row_to_job(row)).collect()
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE state = 'leased' AND lease_expires_at < ?
            ORDER BY lease_expires_at ASC
            LIMIT ?
            "#,
        )
        .bind(fmt_ts(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_job(row)).collect()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut wheres: Vec<&str> = Vec::new();
        let mut args: Vec<Arg> = Vec::new();

        if let Some(state) = filter.state {
            wheres.push("state = ?");
            args.push(Arg::Text(state.as_str().to_string()));
        }
        if let Some(queue) = &filter.queue {
            wheres.push("queue = ?");
            args.push(Arg::Text(queue.clone()));
        }
        if let Some(job_type) = &filter.job_type {
            wheres.push("job_type = ?");
            args.push(Arg::Text(job_type.clone()));
        }

        let clause = if wheres.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", wheres.join(" AND "))
        };
        let sql = format!(
            "SELECT * FROM jobs {clause} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        );
        args.push(Arg::Int(filter.limit as i64));
        args.push(Arg::Int(filter.offset as i64));

        let rows = bind_all(sqlx::query(&sql), args)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|row| self.row_to_job(row)).collect()
    }

    async fn queue_stats(&self, queue: Option<&str>) -> Result<QueueStats> {
        let rows = match queue {
            Some(queue) => {
                sqlx::query("SELECT state, COUNT(*) AS n FROM jobs WHERE queue = ? GROUP BY state")
                    .bind(queue)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            match JobState::from_db(&state) {
                Some(JobState::Pending) => stats.pending = n as u64,
                Some(JobState::Leased) => stats.leased = n as u64,
                Some(JobState::Retrying) => stats.retrying = n as u64,
                Some(JobState::Completed) => stats.completed = n as u64,
                Some(JobState::DeadLettered) => stats.dead_lettered = n as u64,
                Some(JobState::Cancelled) => stats.cancelled = n as u64,
                None => {}
            }
        }

        Ok(stats)
    }

    async fn upsert_cron(&self, def: &CronDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cron_jobs (
                id, schedule, job_type, payload, queue, priority, max_attempts,
                base_delay_ms, max_delay_ms, rate_key, next_fire_at, enabled,
                backfill, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                schedule = excluded.schedule,
                job_type = excluded.job_type,
                payload = excluded.payload,
                queue = excluded.queue,
                priority = excluded.priority,
                max_attempts = excluded.max_attempts,
                base_delay_ms = excluded.base_delay_ms,
                max_delay_ms = excluded.max_delay_ms,
                rate_key = excluded.rate_key,
                next_fire_at = excluded.next_fire_at,
                enabled = excluded.enabled,
                backfill = excluded.backfill,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&def.id)
        .bind(&def.schedule)
        .bind(&def.job_type)
        .bind(&def.payload)
        .bind(&def.queue)
        .bind(def.priority)
        .bind(def.max_attempts as i64)
        .bind(def.backoff.base_delay.as_millis() as i64)
        .bind(def.backoff.max_delay.as_millis() as i64)
        .bind(&def.rate_key)
        .bind(fmt_ts(def.next_fire_at))
        .bind(def.enabled)
        .bind(def.backfill)
        .bind(fmt_ts(def.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_cron(&self, id: &str) -> Result<Option<CronDefinition>> {
        let row = sqlx::query("SELECT * FROM cron_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_cron(row)?)),
            None => Ok(None),
        }
    }

    async fn delete_cron(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cron_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn due_cron(&self, now: DateTime<Utc>) -> Result<Vec<CronDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM cron_jobs
            WHERE enabled = 1 AND next_fire_at <= ?
            ORDER BY next_fire_at ASC
            "#,
        )
        .bind(fmt_ts(now))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_cron(row)).collect()
    }

    async fn advance_cron(
        &self,
        id: &str,
        expected_fire: DateTime<Utc>,
        job: &Job,
        next_fire: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let advanced = sqlx::query(
            r#"
            UPDATE cron_jobs
            SET next_fire_at = ?, updated_at = ?
            WHERE id = ? AND next_fire_at = ?
            "#,
        )
        .bind(fmt_ts(next_fire))
        .bind(fmt_ts(job.updated_at))
        .bind(id)
        .bind(fmt_ts(expected_fire))
        .execute(&mut *tx)
        .await?;

        if advanced.rows_affected() == 0 {
            // Another instance fired this tick first.
            return Ok(false);
        }

        bind_job_insert(sqlx::query(INSERT_JOB_SQL), job)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_rate_bucket(&self, key: &str) -> Result<Option<RateBucket>> {
        let row = sqlx::query("SELECT * FROM rate_buckets WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_bucket(row)?)),
            None => Ok(None),
        }
    }

    async fn put_rate_bucket(&self, bucket: &RateBucket) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_buckets (key, capacity, refill_per_sec, tokens, last_refill_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                capacity = excluded.capacity,
                refill_per_sec = excluded.refill_per_sec,
                tokens = excluded.tokens,
                last_refill_at = excluded.last_refill_at
            "#,
        )
        .bind(&bucket.key)
        .bind(bucket.capacity)
        .bind(bucket.refill_per_sec)
        .bind(bucket.tokens)
        .bind(fmt_ts(bucket.last_refill_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_rate_bucket_if(
        &self,
        key: &str,
        expected_tokens: f64,
        expected_refill_at: DateTime<Utc>,
        tokens: f64,
        refill_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE rate_buckets
            SET tokens = ?, last_refill_at = ?
            WHERE key = ? AND tokens = ? AND last_refill_at = ?
            "#,
        )
        .bind(tokens)
        .bind(fmt_ts(refill_at))
        .bind(key)
        .bind(expected_tokens)
        .bind(fmt_ts(expected_refill_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_rate_bucket(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM rate_buckets WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_run(
        &self,
        job_id: &JobId,
        worker_id: &str,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (job_id, worker_id, attempt, started_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&job_id.0)
        .bind(worker_id)
        .bind(attempt as i64)
        .bind(fmt_ts(started_at))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn finish_run(
        &self,
        run_id: i64,
        finished_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET finished_at = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(fmt_ts(finished_at))
        .bind(error)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn runs_for_job(&self, job_id: &JobId) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE job_id = ?
            ORDER BY started_at ASC, id ASC
            "#,
        )
        .bind(&job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_run(row)).collect()
    }

    async fn upsert_worker(&self, info: &WorkerInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (worker_id, host, pid, last_heartbeat)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(worker_id) DO UPDATE SET
                host = excluded.host,
                pid = excluded.pid,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(&info.worker_id)
        .bind(&info.host)
        .bind(info.pid as i64)
        .bind(fmt_ts(info.last_heartbeat))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        let rows = sqlx::query("SELECT * FROM workers ORDER BY worker_id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|row| self.row_to_worker(row)).collect()
    }
}
