//! Job retries, dead-lettering and acquisition leases
//!
//! Run with: cargo test -p bpmflow-engine --test job_test

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use bpmflow_engine::command::{AcquireJobs, ExecuteJob, UnacquireOwnedJobs, UnlockJob};
use bpmflow_engine::job::ASYNC_CONTINUATION;
use bpmflow_engine::persistence::Job;
use bpmflow_engine::prelude::*;
use common::TestEngine;

/// Async service task whose delegate fails until `healthy` is set
fn flaky_engine(healthy: Arc<AtomicBool>, calls: Arc<AtomicUsize>) -> TestEngine {
    let t = TestEngine::with(move |b| {
        b.with_job_retry_policy(RetryPolicy::fixed(StdDuration::ZERO, 3))
            .with_delegate_fn("sync", move |execution| {
                calls.fetch_add(1, Ordering::SeqCst);
                if healthy.load(Ordering::SeqCst) {
                    execution.set_variable("synced", true);
                    Ok(())
                } else {
                    Err(DelegateError::failure("inventory service unavailable"))
                }
            })
    });
    t.deploy(
        ProcessDefinitionBuilder::new("sync")
            .start_event("start")
            .service_task("push", "sync")
            .async_before("push")
            .user_task("verify")
            .end_event("end")
            .flow("start", "push")
            .flow("push", "verify")
            .flow("verify", "end"),
    );
    t
}

async fn only_job(t: &TestEngine, process_instance_id: uuid::Uuid) -> Job {
    let jobs = t
        .engine
        .jobs(&JobQuery::default().with_process_instance(process_instance_id))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1, "expected exactly one job");
    jobs.into_iter().next().unwrap()
}

#[tokio::test]
async fn test_async_before_creates_executable_job() {
    let t = flaky_engine(Arc::new(AtomicBool::new(true)), Arc::new(AtomicUsize::new(0)));

    let pi = t.start("sync").await.unwrap();

    let job = only_job(&t, pi).await;
    assert_eq!(job.state, JobState::Executable);
    assert_eq!(job.handler_type, ASYNC_CONTINUATION);
    assert_eq!(job.element_id.as_deref(), Some("push"));
    assert_eq!(job.retries, 3);
    assert!(job.due_date.is_none());

    let waiting = t.engine.executions_at(pi, "push").await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].state, ExecutionState::Waiting);
    assert_eq!(t.events.count("job_created"), 1);

    assert!(t.engine.execute_job(job.id).await.unwrap());
    assert_eq!(t.count_at(pi, "verify").await, 1);
    assert_eq!(
        t.engine.get_variables(pi).await.unwrap().get("synced"),
        Some(&json!(true))
    );
    assert_eq!(t.store.job_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_retries_exhaust_into_dead_letter() {
    let healthy = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let t = flaky_engine(healthy.clone(), calls.clone());
    let pi = t.start("sync").await.unwrap();
    let job_id = only_job(&t, pi).await.id;

    for remaining in [2, 1] {
        let err = t.engine.execute_job(job_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Delegate { .. }));

        let job = only_job(&t, pi).await;
        assert_eq!(job.state, JobState::Timer);
        assert_eq!(job.retries, remaining);
        assert!(job.lock_owner.is_none());
        assert!(job
            .exception_message
            .as_deref()
            .is_some_and(|m| m.contains("inventory service unavailable")));
    }

    assert_err!(t.engine.execute_job(job_id).await);
    let job = only_job(&t, pi).await;
    assert_eq!(job.state, JobState::DeadLetter);
    assert_eq!(job.retries, 0);
    assert_eq!(t.store.dead_letter_count(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(t.events.count("job_failed"), 2);
    assert_eq!(t.events.count("job_dead_lettered"), 1);

    // Dead letters are never run again and the failure is not re-recorded
    let err = t.engine.execute_job(job_id).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalState(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(t.events.count("job_dead_lettered"), 1);

    // The instance never moved past the async boundary
    assert_eq!(t.count_at(pi, "push").await, 1);
    assert_eq!(t.state(pi).await, ProcessInstanceState::Active);
}

#[tokio::test]
async fn test_dead_letter_job_can_be_revived() {
    let healthy = Arc::new(AtomicBool::new(false));
    let t = flaky_engine(healthy.clone(), Arc::new(AtomicUsize::new(0)));
    let pi = t.start("sync").await.unwrap();
    let job_id = only_job(&t, pi).await.id;
    for _ in 0..3 {
        assert_err!(t.engine.execute_job(job_id).await);
    }
    assert_eq!(t.store.dead_letter_count(), 1);

    let revived = t
        .engine
        .move_dead_letter_job_to_executable(job_id, 2)
        .await
        .unwrap();
    assert_eq!(revived.state, JobState::Executable);
    assert_eq!(revived.retries, 2);
    assert_eq!(t.store.dead_letter_count(), 0);

    healthy.store(true, Ordering::SeqCst);
    assert!(t.engine.execute_job(job_id).await.unwrap());
    assert_eq!(t.count_at(pi, "verify").await, 1);
}

#[tokio::test]
async fn test_failed_job_waits_for_backoff_before_acquisition() {
    let t = TestEngine::with(|b| {
        b.with_job_retry_policy(RetryPolicy::fixed(StdDuration::from_secs(30), 3))
            .with_delegate_fn("sync", |_| Err(DelegateError::failure("down")))
    });
    t.deploy(
        ProcessDefinitionBuilder::new("sync")
            .start_event("start")
            .service_task("push", "sync")
            .async_before("push")
            .end_event("end")
            .flow("start", "push")
            .flow("push", "end"),
    );
    let pi = t.start("sync").await.unwrap();
    let executor = t
        .engine
        .async_executor(AsyncExecutorConfig::new().with_lock_owner("node-1"));

    // A failed attempt is not counted as executed
    assert_eq!(executor.run_acquisition_cycle().await.unwrap(), 0);
    let job = only_job(&t, pi).await;
    assert_eq!(job.state, JobState::Timer);
    assert_eq!(job.retries, 2);

    t.clock.advance(Duration::seconds(29));
    assert_eq!(executor.run_acquisition_cycle().await.unwrap(), 0);
    assert_eq!(only_job(&t, pi).await.retries, 2);

    t.clock.advance(Duration::seconds(2));
    executor.run_acquisition_cycle().await.unwrap();
    assert_eq!(only_job(&t, pi).await.retries, 1);
}

#[tokio::test]
async fn test_set_job_retries_revives_dead_letter() {
    let t = flaky_engine(Arc::new(AtomicBool::new(false)), Arc::new(AtomicUsize::new(0)));
    let pi = t.start("sync").await.unwrap();
    let job_id = only_job(&t, pi).await.id;
    for _ in 0..3 {
        assert_err!(t.engine.execute_job(job_id).await);
    }

    assert_ok!(t.engine.set_job_retries(job_id, 5).await);

    let job = only_job(&t, pi).await;
    assert_eq!(job.retries, 5);
    assert_ne!(job.state, JobState::DeadLetter);
}

// ============================================
// Acquisition
// ============================================

#[tokio::test]
async fn test_lease_excludes_other_owners_until_expiry() {
    let t = flaky_engine(Arc::new(AtomicBool::new(true)), Arc::new(AtomicUsize::new(0)));
    let pi = t.start("sync").await.unwrap();
    let job_id = only_job(&t, pi).await.id;

    let acquired = t
        .engine
        .executor()
        .execute(AcquireJobs {
            lock_owner: "node-a".to_string(),
            lock_duration: StdDuration::from_secs(60),
            max_jobs: 10,
        })
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].lock_owner.as_deref(), Some("node-a"));

    let node_b = t
        .engine
        .async_executor(AsyncExecutorConfig::new().with_lock_owner("node-b"));
    assert_eq!(node_b.run_acquisition_cycle().await.unwrap(), 0);

    t.clock.advance(Duration::seconds(61));
    let stolen = t
        .engine
        .executor()
        .execute(AcquireJobs {
            lock_owner: "node-b".to_string(),
            lock_duration: StdDuration::from_secs(60),
            max_jobs: 10,
        })
        .await
        .unwrap();
    assert_eq!(stolen.len(), 1);

    // node-a lost its lease and must not run the job
    let executed = t
        .engine
        .executor()
        .execute(ExecuteJob::new(job_id).with_lock_owner("node-a"))
        .await
        .unwrap();
    assert!(!executed);
    assert_eq!(t.count_at(pi, "push").await, 1);

    let executed = t
        .engine
        .executor()
        .execute(ExecuteJob::new(job_id).with_lock_owner("node-b"))
        .await
        .unwrap();
    assert!(executed);
    assert_eq!(t.count_at(pi, "verify").await, 1);
}

#[tokio::test]
async fn test_released_leases_are_acquirable_again() {
    let t = flaky_engine(Arc::new(AtomicBool::new(true)), Arc::new(AtomicUsize::new(0)));
    let first = t.start("sync").await.unwrap();
    let second = t.start("sync").await.unwrap();
    let acquire = |owner: &str| AcquireJobs {
        lock_owner: owner.to_string(),
        lock_duration: StdDuration::from_secs(60),
        max_jobs: 10,
    };

    let held = t.engine.executor().execute(acquire("node-a")).await.unwrap();
    assert_eq!(held.len(), 2);

    t.engine
        .executor()
        .execute(UnlockJob { job_id: held[0].id })
        .await
        .unwrap();
    let picked = t.engine.executor().execute(acquire("node-b")).await.unwrap();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].id, held[0].id);

    let released = t
        .engine
        .executor()
        .execute(UnacquireOwnedJobs {
            lock_owner: "node-a".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(released, 1);

    let node_c = t
        .engine
        .async_executor(AsyncExecutorConfig::new().with_lock_owner("node-c"));
    assert_eq!(node_c.run_acquisition_cycle().await.unwrap(), 1);
    assert_eq!(t.count_at(first, "verify").await + t.count_at(second, "verify").await, 1);
}

#[tokio::test]
async fn test_deleted_job_is_never_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let t = flaky_engine(Arc::new(AtomicBool::new(true)), calls.clone());
    let pi = t.start("sync").await.unwrap();
    let job_id = only_job(&t, pi).await.id;

    assert_ok!(t.engine.delete_job(job_id).await);

    assert!(!t.engine.execute_job(job_id).await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_scheduled_timer_without_execution() {
    let t = TestEngine::new();
    let due = t.clock.now() + Duration::seconds(5);

    let job_id = t
        .engine
        .schedule_timer(due, ASYNC_CONTINUATION, json!({}), None)
        .await
        .unwrap();

    let job = t.engine.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Timer);
    assert_eq!(job.due_date, Some(due));
    assert!(job.process_instance_id.is_none());

    let unknown = t
        .engine
        .schedule_async("no_such_handler", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(unknown, EngineError::UnknownJobHandler(_)));
}
