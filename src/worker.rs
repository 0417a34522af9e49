use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::job::{JobState, WorkerInfo};
use crate::lease::{JobOutcome, Lease, LeaseError, LeaseManager};
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::registry::HandlerRegistry;
use crate::storage::JobStore;

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Pulls jobs through the dispatcher, claims them, executes the handler
/// under a heartbeated lease, and reports the outcome.
pub struct Worker {
    id: String,
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    leases: Arc<LeaseManager>,
    limiter: Arc<RateLimiter>,
    handlers: Arc<HandlerRegistry>,
    metrics: Arc<Metrics>,
    queue: Option<String>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<Dispatcher>,
        leases: Arc<LeaseManager>,
        limiter: Arc<RateLimiter>,
        handlers: Arc<HandlerRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id: format!("worker-{}", uuid::Uuid::new_v4()),
            store,
            dispatcher,
            leases,
            limiter,
            handlers,
            metrics,
            queue: None,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Bind this worker to one queue; unbound workers pull from all queues.
    pub fn with_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the worker until shutdown is signaled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, queue = self.queue.as_deref().unwrap_or("*"), "Worker started");
        self.register_worker().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker_id = %self.id, "Worker shutting down");
                    break;
                }
                _ = self.poll_and_process(&shutdown) => {}
            }
        }
    }

    async fn register_worker(&self) {
        let info = WorkerInfo {
            worker_id: self.id.clone(),
            host: hostname(),
            pid: std::process::id(),
            last_heartbeat: Utc::now(),
        };
        if let Err(error) = self.store.upsert_worker(&info).await {
            warn!(worker_id = %self.id, %error, "failed to register worker");
        }
    }

    /// Poll for the next claimable job and process it
    async fn poll_and_process(&self, shutdown: &CancellationToken) {
        self.register_worker().await;

        let candidate = self
            .dispatcher
            .next_ready(self.queue.as_deref(), Utc::now(), &self.limiter)
            .await;

        let job = match candidate {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::time::sleep(self.poll_interval).await;
                return;
            }
            Err(error) => {
                error!(worker_id = %self.id, %error, "failed to poll for jobs");
                tokio::time::sleep(self.poll_interval).await;
                return;
            }
        };

        let lease = match self.leases.claim(&job.id, &self.id, Utc::now()).await {
            Ok(lease) => lease,
            Err(LeaseError::Conflict(id)) => {
                // Another worker got there first; go straight back to polling.
                debug!(worker_id = %self.id, job_id = %id, "lost claim race");
                return;
            }
            Err(error) => {
                error!(worker_id = %self.id, job_id = %job.id, %error, "claim failed");
                tokio::time::sleep(self.poll_interval).await;
                return;
            }
        };

        self.process_leased(lease, shutdown).await;
    }

    async fn process_leased(&self, lease: Lease, shutdown: &CancellationToken) {
        let job = lease.job.clone();
        debug!(
            worker_id = %self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt_count + 1,
            token = lease.token,
            "Processing job"
        );

        let run_id = match self
            .store
            .insert_run(&job.id, &self.id, job.attempt_count + 1, Utc::now())
            .await
        {
            Ok(id) => Some(id),
            Err(error) => {
                warn!(job_id = %job.id, %error, "failed to record run start");
                None
            }
        };

        // Heartbeat in the background for as long as the handler runs. The
        // task also carries cancellation back: a raised flag or a lost lease
        // stops the execution. It watches the shutdown token itself so a
        // worker torn down mid-execution does not keep renewing the lease.
        let stop_execution = CancellationToken::new();
        let heartbeat_handle = {
            let leases = self.leases.clone();
            let store = self.store.clone();
            let stop = stop_execution.clone();
            let shutdown = shutdown.clone();
            let job_id = job.id.clone();
            let worker_id = self.id.clone();
            let token = lease.token;
            let interval = self.leases.lease_duration() / 3;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match leases.heartbeat(&job_id, &worker_id, token, Utc::now()).await {
                        Ok(beat) => {
                            let info = WorkerInfo {
                                worker_id: worker_id.clone(),
                                host: hostname(),
                                pid: std::process::id(),
                                last_heartbeat: Utc::now(),
                            };
                            if let Err(error) = store.upsert_worker(&info).await {
                                warn!(worker_id = %worker_id, %error, "worker heartbeat upsert failed");
                            }
                            if beat.cancel_requested {
                                info!(job_id = %job_id, "cancellation requested, stopping execution");
                                stop.cancel();
                                break;
                            }
                        }
                        Err(LeaseError::Stale(_)) => {
                            warn!(job_id = %job_id, "lease no longer held, stopping execution");
                            stop.cancel();
                            break;
                        }
                        Err(error) => {
                            // Transient; the lease survives a missed beat or
                            // two before the reaper takes interest.
                            warn!(job_id = %job_id, %error, "heartbeat failed");
                        }
                    }
                }
            })
        };

        let outcome = tokio::select! {
            _ = stop_execution.cancelled() => None,
            result = self.handlers.execute(&job) => Some(result),
        };
        heartbeat_handle.abort();

        let now = Utc::now();
        match outcome {
            Some(Ok(())) => {
                match self
                    .leases
                    .complete(&job.id, &self.id, lease.token, JobOutcome::Success, now)
                    .await
                {
                    Ok(settled) => {
                        if settled.state == JobState::Completed {
                            self.metrics.record_completed();
                        }
                        self.finish_run(run_id, None).await;
                    }
                    Err(LeaseError::Stale(_)) => {
                        warn!(job_id = %job.id, "result discarded, lease was lost");
                        self.finish_run(run_id, Some("lease lost before completion")).await;
                    }
                    Err(error) => {
                        error!(job_id = %job.id, %error, "failed to report success");
                        self.finish_run(run_id, Some("failed to report success")).await;
                    }
                }
            }
            Some(Err(job_error)) => {
                let message = job_error.to_string();
                warn!(job_id = %job.id, job_type = %job.job_type, error = %message, "Job failed");
                match self
                    .leases
                    .complete(
                        &job.id,
                        &self.id,
                        lease.token,
                        JobOutcome::Failure(message.clone()),
                        now,
                    )
                    .await
                {
                    Ok(settled) => {
                        match settled.state {
                            JobState::Retrying => self.metrics.record_failed_attempt(),
                            JobState::DeadLettered => {
                                self.metrics.record_failed_attempt();
                                self.metrics.record_dead_lettered();
                            }
                            _ => {}
                        }
                        self.finish_run(run_id, Some(&message)).await;
                    }
                    Err(LeaseError::Stale(_)) => {
                        debug!(job_id = %job.id, "failure report discarded, lease was lost");
                        self.finish_run(run_id, Some(&message)).await;
                    }
                    Err(error) => {
                        error!(job_id = %job.id, %error, "failed to report failure");
                        self.finish_run(run_id, Some(&message)).await;
                    }
                }
            }
            None => {
                // Execution was stopped: either the cancel flag was raised or
                // the lease moved on. Report so a raised flag settles now; a
                // lost lease makes this a stale no-op.
                match self
                    .leases
                    .complete(
                        &job.id,
                        &self.id,
                        lease.token,
                        JobOutcome::Failure("execution stopped".to_string()),
                        now,
                    )
                    .await
                {
                    Ok(settled) => {
                        if settled.state == JobState::Cancelled {
                            info!(job_id = %job.id, "job cancelled mid-execution");
                        }
                        self.finish_run(run_id, Some("execution stopped")).await;
                    }
                    Err(LeaseError::Stale(_)) => {
                        debug!(job_id = %job.id, "lease already settled elsewhere");
                        self.finish_run(run_id, Some("lease lost during execution")).await;
                    }
                    Err(error) => {
                        error!(job_id = %job.id, %error, "failed to settle stopped execution");
                        self.finish_run(run_id, Some("execution stopped")).await;
                    }
                }
            }
        }
    }

    async fn finish_run(&self, run_id: Option<i64>, error: Option<&str>) {
        let Some(run_id) = run_id else { return };
        if let Err(e) = self.store.finish_run(run_id, Utc::now(), error).await {
            warn!(run_id, error = %e, "failed to record run finish");
        }
    }
}
