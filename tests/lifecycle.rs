use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use taskmill::{
    BackoffConfig, CancelOutcome, Dispatcher, Job, JobId, JobOutcome, JobState, JobStore,
    LeaseError, LeaseManager, Orchestrator, OrchestratorConfig, RateLimiter, SqliteJobStore,
    SubmitOptions,
};

async fn store() -> Arc<SqliteJobStore> {
    Arc::new(SqliteJobStore::in_memory().await.expect("in-memory store"))
}

fn t0() -> DateTime<Utc> {
    "2026-01-10T08:00:00Z".parse().expect("timestamp")
}

#[tokio::test]
async fn dispatch_order_is_priority_then_submission_age() {
    let store = store().await;
    let dispatcher = Dispatcher::new(store.clone(), 32);
    let limiter = RateLimiter::new(store.clone());
    let leases = LeaseManager::new(store.clone(), Duration::from_secs(30));

    let mut a = Job::new("work", vec![]).with_priority(5);
    a.created_at = t0();
    let mut b = Job::new("work", vec![]).with_priority(5);
    b.created_at = t0() + ChronoDuration::seconds(1);
    let mut c = Job::new("work", vec![]).with_priority(10);
    c.created_at = t0() + ChronoDuration::seconds(2);

    // Insert out of order so storage order can't accidentally match.
    for job in [&b, &c, &a] {
        store.insert_job(job).await.expect("insert");
    }

    let now = t0() + ChronoDuration::seconds(10);
    let mut picked = Vec::new();
    for _ in 0..3 {
        let job = dispatcher
            .next_ready(None, now, &limiter)
            .await
            .expect("next_ready")
            .expect("candidate available");
        leases.claim(&job.id, "w1", now).await.expect("claim");
        picked.push(job.id);
    }

    assert_eq!(picked, vec![c.id, a.id, b.id]);
    assert!(dispatcher
        .next_ready(None, now, &limiter)
        .await
        .expect("next_ready")
        .is_none());
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let store = store().await;
    let leases = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(30)));

    let job = Job::new("work", vec![]);
    store.insert_job(&job).await.expect("insert");

    let now = t0();
    let mut handles = Vec::new();
    for i in 0..8 {
        let leases = Arc::clone(&leases);
        let job_id = job.id.clone();
        handles.push(tokio::spawn(async move {
            leases.claim(&job_id, &format!("w{i}"), now).await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(lease) => {
                winners += 1;
                assert_eq!(lease.token, 1);
            }
            Err(LeaseError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected claim error: {other}"),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);
}

#[tokio::test]
async fn fencing_tokens_increase_and_stale_reports_are_rejected() {
    let store = store().await;
    let leases = LeaseManager::new(store.clone(), Duration::from_secs(30));

    let job = Job::new("work", vec![]).with_max_attempts(5);
    store.insert_job(&job).await.expect("insert");

    let first = leases.claim(&job.id, "w1", t0()).await.expect("claim 1");
    leases
        .complete(
            &job.id,
            "w1",
            first.token,
            JobOutcome::Failure("boom".to_string()),
            t0(),
        )
        .await
        .expect("fail attempt 1");

    // Past the backoff window for sure.
    let later = t0() + ChronoDuration::hours(1);
    let second = leases.claim(&job.id, "w2", later).await.expect("claim 2");
    assert!(second.token > first.token);

    // The first worker's token is dead for every verb.
    let hb = leases.heartbeat(&job.id, "w1", first.token, later).await;
    assert!(matches!(hb, Err(LeaseError::Stale(_))));
    let done = leases
        .complete(&job.id, "w1", first.token, JobOutcome::Success, later)
        .await;
    assert!(matches!(done, Err(LeaseError::Stale(_))));

    // The current holder is unaffected.
    let beat = leases
        .heartbeat(&job.id, "w2", second.token, later)
        .await
        .expect("current token heartbeats");
    assert_eq!(beat.expires_at, later + ChronoDuration::seconds(30));
}

#[tokio::test]
async fn third_failure_dead_letters_and_second_does_not() {
    let store = store().await;
    let leases = LeaseManager::new(store.clone(), Duration::from_secs(30));

    let job = Job::new("work", vec![])
        .with_max_attempts(3)
        .with_backoff(BackoffConfig::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
        ));
    store.insert_job(&job).await.expect("insert");

    let mut now = t0();
    for attempt in 1..=2u32 {
        let lease = leases.claim(&job.id, "w1", now).await.expect("claim");
        let settled = leases
            .complete(
                &job.id,
                "w1",
                lease.token,
                JobOutcome::Failure(format!("failure {attempt}")),
                now,
            )
            .await
            .expect("complete");
        assert_eq!(settled.state, JobState::Retrying, "attempt {attempt}");
        assert_eq!(settled.attempt_count, attempt);
        let not_before = settled.not_before.expect("backoff set");
        assert!(not_before >= now);
        assert!(not_before <= now + ChronoDuration::seconds(1));
        now += ChronoDuration::hours(1);
    }

    let lease = leases.claim(&job.id, "w1", now).await.expect("claim 3");
    let settled = leases
        .complete(
            &job.id,
            "w1",
            lease.token,
            JobOutcome::Failure("failure 3".to_string()),
            now,
        )
        .await
        .expect("complete 3");
    assert_eq!(settled.state, JobState::DeadLettered);
    assert_eq!(settled.attempt_count, 3);
    assert_eq!(settled.last_error.as_deref(), Some("failure 3"));

    // Terminal: nobody can claim it again.
    let again = leases
        .claim(&job.id, "w1", now + ChronoDuration::hours(1))
        .await;
    assert!(matches!(again, Err(LeaseError::Conflict(_))));
}

#[tokio::test]
async fn heartbeat_pushes_expiry_from_renewal_time() {
    let store = store().await;
    let leases = LeaseManager::new(store.clone(), Duration::from_secs(30));

    let job = Job::new("work", vec![]);
    store.insert_job(&job).await.expect("insert");

    let lease = leases.claim(&job.id, "w1", t0()).await.expect("claim");
    assert_eq!(lease.expires_at, t0() + ChronoDuration::seconds(30));

    let beat = leases
        .heartbeat(&job.id, "w1", lease.token, t0() + ChronoDuration::seconds(20))
        .await
        .expect("heartbeat");
    assert_eq!(beat.expires_at, t0() + ChronoDuration::seconds(50));
    assert!(!beat.cancel_requested);
}

#[tokio::test]
async fn submit_options_override_definition_defaults() {
    let store = store().await;
    let orch = Orchestrator::from_store(store.clone(), OrchestratorConfig::default());
    let def = orch.register_handler("noop", |_: ()| async { Ok(()) });

    let not_before = t0() + ChronoDuration::minutes(5);
    let id = orch
        .submit_with(
            &def,
            (),
            SubmitOptions {
                priority: Some(9),
                queue: Some("bulk".to_string()),
                not_before: Some(not_before),
                max_attempts: Some(7),
                rate_key: Some("tenant-42".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("submit");

    let job = orch.get_job(&id).await.expect("get").expect("present");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.priority, 9);
    assert_eq!(job.queue, "bulk");
    assert_eq!(job.max_attempts, 7);
    assert_eq!(job.rate_key.as_deref(), Some("tenant-42"));
    assert_eq!(job.not_before, Some(not_before));
}

#[tokio::test]
async fn cancelling_a_waiting_job_is_immediate() {
    let store = store().await;
    let orch = Orchestrator::from_store(store.clone(), OrchestratorConfig::default());

    let job = Job::new("work", vec![]);
    store.insert_job(&job).await.expect("insert");

    let outcome = orch.cancel(&job.id).await.expect("cancel");
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let current = store.get_job(&job.id).await.expect("get").expect("present");
    assert_eq!(current.state, JobState::Cancelled);

    // Idempotent.
    let again = orch.cancel(&job.id).await.expect("cancel again");
    assert_eq!(again, CancelOutcome::Cancelled);
}

#[tokio::test]
async fn cancelling_a_leased_job_flags_it_and_discards_the_result() {
    let store = store().await;
    let orch = Orchestrator::from_store(store.clone(), OrchestratorConfig::default());
    let leases = LeaseManager::new(store.clone(), Duration::from_secs(30));

    let job = Job::new("work", vec![]);
    store.insert_job(&job).await.expect("insert");
    let lease = leases.claim(&job.id, "w1", t0()).await.expect("claim");

    let outcome = orch.cancel(&job.id).await.expect("cancel");
    assert_eq!(outcome, CancelOutcome::Flagged);

    // Still leased; the flag is visible on the next heartbeat.
    let beat = leases
        .heartbeat(&job.id, "w1", lease.token, t0() + ChronoDuration::seconds(5))
        .await
        .expect("heartbeat");
    assert!(beat.cancel_requested);

    // Whatever the worker reports now settles as Cancelled.
    let settled = leases
        .complete(
            &job.id,
            "w1",
            lease.token,
            JobOutcome::Success,
            t0() + ChronoDuration::seconds(6),
        )
        .await
        .expect("complete");
    assert_eq!(settled.state, JobState::Cancelled);
    assert_eq!(settled.attempt_count, 1);
}

#[tokio::test]
async fn finished_jobs_are_not_cancellable() {
    let store = store().await;
    let orch = Orchestrator::from_store(store.clone(), OrchestratorConfig::default());
    let leases = LeaseManager::new(store.clone(), Duration::from_secs(30));

    let job = Job::new("work", vec![]);
    store.insert_job(&job).await.expect("insert");
    let lease = leases.claim(&job.id, "w1", t0()).await.expect("claim");
    leases
        .complete(&job.id, "w1", lease.token, JobOutcome::Success, t0())
        .await
        .expect("complete");

    let outcome = orch.cancel(&job.id).await.expect("cancel");
    assert_eq!(outcome, CancelOutcome::AlreadyFinished);

    let current = store.get_job(&job.id).await.expect("get").expect("present");
    assert_eq!(current.state, JobState::Completed);

    let missing = orch.cancel(&JobId::new()).await.expect("cancel missing");
    assert_eq!(missing, CancelOutcome::NotFound);
}
