use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskmill::{
    BackoffConfig, Job, JobDefinition, JobId, JobState, Orchestrator, OrchestratorConfig,
    SqliteJobStore,
};

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_reaper_interval(Duration::from_millis(50))
        .with_dispatch_batch(8)
}

async fn orchestrator(config: OrchestratorConfig) -> Orchestrator {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let store = Arc::new(SqliteJobStore::in_memory().await.expect("in-memory store"));
    Orchestrator::from_store(store, config)
}

/// Jobs settle asynchronously; poll until the state shows up.
async fn wait_for_state(orch: &Orchestrator, id: &JobId, want: JobState) -> Job {
    for _ in 0..500 {
        if let Some(job) = orch.get_job(id).await.expect("get_job") {
            if job.state == want {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job did not reach {want} within timeout");
}

#[tokio::test]
async fn submitted_job_runs_to_completion() {
    let mut orch = orchestrator(fast_config()).await;

    let calls = Arc::new(AtomicU32::new(0));
    let calls_in = Arc::clone(&calls);
    let def = orch.register_handler("greet", move |name: String| {
        let calls = Arc::clone(&calls_in);
        async move {
            if name.is_empty() {
                return Err("empty name".to_string());
            }
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    orch.start(2).await;
    let id = orch.submit(&def, "ada".to_string()).await.expect("submit");

    let job = wait_for_state(&orch, &id, JobState::Completed).await;
    assert_eq!(job.attempt_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let runs = orch.runs_for_job(&id).await.expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].attempt, 1);
    assert!(runs[0].finished_at.is_some());
    assert!(runs[0].error.is_none());

    assert_eq!(orch.metrics().completed, 1);
    assert_eq!(orch.stats(None).await.expect("stats").completed, 1);
    assert!(!orch.workers().await.expect("workers").is_empty());

    orch.shutdown().await;
}

#[tokio::test]
async fn failing_job_retries_then_dead_letters() {
    let mut orch = orchestrator(fast_config()).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in = Arc::clone(&attempts);
    let def = JobDefinition::new("flaky", move |_: ()| {
        let attempts = Arc::clone(&attempts_in);
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("downstream unavailable".to_string())
        }
    })
    .with_max_attempts(3)
    .with_backoff(BackoffConfig::new(
        Duration::from_millis(5),
        Duration::from_millis(20),
    ));
    orch.register(&def);

    orch.start(1).await;
    let id = orch.submit(&def, ()).await.expect("submit");

    let job = wait_for_state(&orch, &id, JobState::DeadLettered).await;
    assert_eq!(job.attempt_count, 3);
    assert!(job
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("downstream unavailable")));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let runs = orch.runs_for_job(&id).await.expect("runs");
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.error.is_some()));

    let snapshot = orch.metrics();
    assert_eq!(snapshot.failed_attempts, 3);
    assert_eq!(snapshot.dead_lettered, 1);
    assert_eq!(snapshot.completed, 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_running_job_stops_it_cooperatively() {
    // Short lease so the cancel flag reaches the heartbeat quickly.
    let mut orch = orchestrator(
        fast_config().with_lease_duration(Duration::from_millis(300)),
    )
    .await;

    let started = Arc::new(AtomicU32::new(0));
    let finished = Arc::new(AtomicU32::new(0));
    let started_in = Arc::clone(&started);
    let finished_in = Arc::clone(&finished);
    let def = orch.register_handler("long_haul", move |_: ()| {
        let started = Arc::clone(&started_in);
        let finished = Arc::clone(&finished_in);
        async move {
            started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    orch.start(1).await;
    let id = orch.submit(&def, ()).await.expect("submit");

    wait_for_state(&orch, &id, JobState::Leased).await;
    let outcome = orch.cancel(&id).await.expect("cancel");
    assert_eq!(outcome, taskmill::CancelOutcome::Flagged);

    let job = wait_for_state(&orch, &id, JobState::Cancelled).await;
    assert_eq!(job.attempt_count, 1);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    let runs = orch.runs_for_job(&id).await.expect("runs");
    assert_eq!(runs.len(), 1);
    assert!(runs[0].error.is_some());

    orch.shutdown().await;
}

#[tokio::test]
async fn queue_bound_workers_ignore_other_queues() {
    let mut orch = orchestrator(fast_config()).await;

    let def = orch.register_handler("task", |_: ()| async { Ok(()) });

    // Only a worker for "reports" is running.
    orch.start_worker_for("reports");
    orch.start_reaper().await;

    let routed = orch
        .submit_with(
            &def,
            (),
            taskmill::SubmitOptions {
                queue: Some("reports".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("submit routed");
    let stranded = orch.submit(&def, ()).await.expect("submit stranded");

    wait_for_state(&orch, &routed, JobState::Completed).await;

    // The default-queue job has nobody pulling it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let untouched = orch
        .get_job(&stranded)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(untouched.state, JobState::Pending);

    orch.shutdown().await;
}
