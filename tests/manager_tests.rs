
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jobrunner::config::{CallableConfig, ManagerConfig, ProcessConfig};
use jobrunner::error::JobError;
use jobrunner::events::Event;
use jobrunner::persist::load_snapshot;
use jobrunner::scheduler::job::RUNTIME_LIMIT_MARKER;
use jobrunner::scheduler::{Callable, FailureKind, JobSpec, JobState, Manager, RetryPolicy};
use jobrunner::worker::{CallableBackend, ProcessBackend};
use test_harness::{assert_eventually, fast_config, manager_with, ScriptedBackend, Step};

/// Counts emitted events per channel.
fn count_events(manager: &Manager) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for event in Event::ALL {
        let seen = seen.clone();
        manager.register_fn(event, move |event, _| seen.lock().unwrap().push(event));
    }
    seen
}

fn occurrences(seen: &Mutex<Vec<Event>>, event: Event) -> usize {
    seen.lock().unwrap().iter().filter(|e| **e == event).count()
}

fn quick_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries)
        .with_backoff_base(0.01)
        .with_jitter(0.0)
}

#[tokio::test]
async fn test_invalid_spec_is_rejected_without_creating_a_job() {
    let (_dir, manager) = manager_with(Arc::new(ScriptedBackend::new(Step::Succeed)));
    let seen = count_events(&manager);

    let neither = JobSpec::default();
    assert!(matches!(
        manager.submit(neither).await,
        Err(JobError::Validation(_))
    ));

    let both = JobSpec::command(["true"]);
    let both = JobSpec {
        callable: Some(Callable::blocking("noop", |_| Ok(serde_json::Value::Null))),
        ..both
    };
    assert!(matches!(manager.submit(both).await, Err(JobError::Validation(_))));

    let empty = JobSpec::command(Vec::<String>::new());
    assert!(matches!(manager.submit(empty).await, Err(JobError::Validation(_))));

    assert!(manager.list(None).await.is_empty());
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_successful_job_emits_start_and_finish_once() {
    let (_dir, manager) = manager_with(Arc::new(ScriptedBackend::new(Step::Succeed)));
    let seen = count_events(&manager);

    let id = manager.submit(JobSpec::command(["true"])).await.unwrap();
    let job = manager.wait(&id).await.unwrap();

    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.exit_code, Some(0));
    assert!(job.ended_at.is_some());
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Event::Submit, Event::Start, Event::Finish]
    );
}

#[tokio::test]
async fn test_retries_until_exhausted() {
    let backend = Arc::new(ScriptedBackend::new(Step::Fail(3)));
    let (_dir, manager) = manager_with(backend.clone());
    let seen = count_events(&manager);

    let spec = JobSpec::command(["false"]).with_retry(quick_retry(2));
    let id = manager.submit(spec).await.unwrap();
    let job = manager.wait(&id).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.exit_code, Some(3));
    assert_eq!(job.failure, Some(FailureKind::Exit));
    assert_eq!(backend.attempt_count(), 3);
    assert_eq!(occurrences(&seen, Event::Start), 3);
    assert_eq!(occurrences(&seen, Event::Retry), 2);
    assert_eq!(occurrences(&seen, Event::Finish), 1);
}

#[tokio::test]
async fn test_retry_recovers_after_failures() {
    let backend = Arc::new(
        ScriptedBackend::new(Step::Succeed).with_script([Step::Fail(1), Step::Refuse]),
    );
    let (_dir, manager) = manager_with(backend.clone());

    let spec = JobSpec::command(["flaky"]).with_retry(quick_retry(3));
    let id = manager.submit(spec).await.unwrap();
    let job = manager.wait(&id).await.unwrap();

    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 3);
    assert!(job.error.is_none());
    assert!(job.failure.is_none());
}

#[tokio::test]
async fn test_launch_failure_is_recorded_on_the_job() {
    let (_dir, manager) = manager_with(Arc::new(ScriptedBackend::new(Step::Refuse)));

    let id = manager.submit(JobSpec::command(["nope"])).await.unwrap();
    let job = manager.wait(&id).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureKind::Launch));
    assert!(job.error.unwrap().contains("scripted refusal"));
}

#[tokio::test]
async fn test_backoff_delay_stays_within_jitter_bounds() {
    let backend = Arc::new(ScriptedBackend::new(Step::Fail(1)).with_delay(Duration::ZERO));
    let (_dir, manager) = manager_with(backend.clone());

    let retry = RetryPolicy::new(2)
        .with_backoff_base(0.2)
        .with_jitter(0.1);
    let id = manager
        .submit(JobSpec::command(["false"]).with_retry(retry))
        .await
        .unwrap();
    manager.wait(&id).await.unwrap();

    let starts = backend.attempt_starts();
    assert_eq!(starts.len(), 3);
    // base^1 = 0.2s, base^2 = 0.04s, each plus up to 0.1s jitter and polling slack
    let first = starts[1] - starts[0];
    let second = starts[2] - starts[1];
    assert!(first >= Duration::from_millis(200), "first gap {:?}", first);
    assert!(first < Duration::from_millis(500), "first gap {:?}", first);
    assert!(second >= Duration::from_millis(40), "second gap {:?}", second);
    assert!(second < Duration::from_millis(340), "second gap {:?}", second);
}

#[tokio::test]
async fn test_max_backoff_caps_delay() {
    let backend = Arc::new(ScriptedBackend::new(Step::Fail(1)).with_delay(Duration::ZERO));
    let (_dir, manager) = manager_with(backend.clone());

    let retry = RetryPolicy::new(1)
        .with_backoff_base(30.0)
        .with_jitter(0.0)
        .with_max_backoff(0.1);
    let id = manager
        .submit(JobSpec::command(["false"]).with_retry(retry))
        .await
        .unwrap();
    let started = Instant::now();
    manager.wait(&id).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(backend.attempt_count(), 2);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let backend = Arc::new(
        ScriptedBackend::new(Step::Succeed).with_delay(Duration::from_millis(50)),
    );
    let (_dir, config) = fast_config();
    let manager = Manager::new(backend.clone(), config.with_max_concurrent(2)).unwrap();

    let mut ids = Vec::new();
    for i in 0..6 {
        let spec = JobSpec::command(["true"]).with_name(format!("job{}", i));
        ids.push(manager.submit(spec).await.unwrap());
    }
    for id in &ids {
        let job = manager.wait(id).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
    }

    assert_eq!(backend.attempt_count(), 6);
    assert!(backend.peak_running() <= 2, "peak {}", backend.peak_running());
    assert_eq!(backend.peak_running(), 2);
}

#[tokio::test]
async fn test_jobs_start_in_submission_order() {
    let (_dir, config) = fast_config();
    let manager = Manager::new(
        Arc::new(ScriptedBackend::new(Step::Succeed)),
        config.with_max_concurrent(1),
    )
    .unwrap();
    let started = Arc::new(Mutex::new(Vec::new()));
    let order = started.clone();
    manager.register_fn(Event::Start, move |_, job| {
        order.lock().unwrap().push(job.id.clone())
    });

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(manager.submit(JobSpec::command(["true"])).await.unwrap());
    }
    for id in &ids {
        manager.wait(id).await.unwrap();
    }
    assert_eq!(*started.lock().unwrap(), ids);
}

#[tokio::test]
async fn test_cancel_running_job_skips_retries() {
    let backend = Arc::new(ScriptedBackend::new(Step::Hang));
    let (_dir, manager) = manager_with(backend.clone());
    let seen = count_events(&manager);

    let spec = JobSpec::command(["sleep", "100"]).with_retry(quick_retry(5));
    let id = manager.submit(spec).await.unwrap();

    let m = manager.clone();
    let job_id = id.clone();
    assert_eventually(
        || {
            let m = m.clone();
            let job_id = job_id.clone();
            async move { m.status(&job_id).await.unwrap().state == JobState::Running }
        },
        Duration::from_secs(2),
        "job never started",
    )
    .await;

    manager.cancel(&id).await.unwrap();
    let job = manager.wait(&id).await.unwrap();

    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.failure, Some(FailureKind::Cancelled));
    assert_eq!(backend.attempt_count(), 1);
    assert_eq!(occurrences(&seen, Event::Cancel), 1);
    assert_eq!(occurrences(&seen, Event::Retry), 0);
}

#[tokio::test]
async fn test_cancel_pending_job_never_starts_it() {
    let backend = Arc::new(ScriptedBackend::new(Step::Hang));
    let (_dir, config) = fast_config();
    let manager = Manager::new(backend.clone(), config.with_max_concurrent(1)).unwrap();
    let seen = count_events(&manager);

    let blocker = manager.submit(JobSpec::command(["sleep", "100"])).await.unwrap();
    let queued = manager.submit(JobSpec::command(["true"])).await.unwrap();

    let m = manager.clone();
    let job_id = blocker.clone();
    assert_eventually(
        || {
            let m = m.clone();
            let job_id = job_id.clone();
            async move { m.status(&job_id).await.unwrap().state == JobState::Running }
        },
        Duration::from_secs(2),
        "blocker never started",
    )
    .await;

    manager.cancel(&queued).await.unwrap();
    let job = manager.wait(&queued).await.unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.attempts, 0);
    assert!(job.started_at.is_none());

    manager.cancel(&blocker).await.unwrap();
    manager.wait(&blocker).await.unwrap();
    assert_eq!(backend.attempt_count(), 1);
    assert_eq!(occurrences(&seen, Event::Start), 1);
    assert_eq!(occurrences(&seen, Event::Cancel), 2);
}

#[tokio::test]
async fn test_cancel_finished_job_keeps_state() {
    let (_dir, manager) = manager_with(Arc::new(ScriptedBackend::new(Step::Succeed)));
    let seen = count_events(&manager);

    let id = manager.submit(JobSpec::command(["true"])).await.unwrap();
    manager.wait(&id).await.unwrap();
    manager.cancel(&id).await.unwrap();

    assert_eq!(manager.status(&id).await.unwrap().state, JobState::Succeeded);
    assert_eq!(occurrences(&seen, Event::Cancel), 0);
}

#[tokio::test]
async fn test_cancel_during_backoff() {
    let backend = Arc::new(ScriptedBackend::new(Step::Fail(1)));
    let (_dir, manager) = manager_with(backend.clone());

    let retry = RetryPolicy::new(3).with_backoff_base(30.0).with_jitter(0.0);
    let id = manager
        .submit(JobSpec::command(["false"]).with_retry(retry))
        .await
        .unwrap();

    let m = manager.clone();
    let job_id = id.clone();
    assert_eventually(
        || {
            let m = m.clone();
            let job_id = job_id.clone();
            async move { m.status(&job_id).await.unwrap().state == JobState::Failed }
        },
        Duration::from_secs(2),
        "first attempt never failed",
    )
    .await;

    let started = Instant::now();
    manager.cancel(&id).await.unwrap();
    let job = manager.wait(&id).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(backend.attempt_count(), 1);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let (_dir, manager) = manager_with(Arc::new(ScriptedBackend::new(Step::Succeed)));
    assert!(matches!(manager.status("ghost").await, Err(JobError::NotFound(_))));
    assert!(matches!(manager.cancel("ghost").await, Err(JobError::NotFound(_))));
    assert!(matches!(manager.wait("ghost").await, Err(JobError::NotFound(_))));
}

#[tokio::test]
async fn test_snapshot_reload_matches_memory() {
    let (_dir, config) = fast_config();
    let snapshot_path = config.snapshot_path.clone().unwrap();
    let manager = Manager::new(
        Arc::new(ScriptedBackend::new(Step::Succeed).with_script([Step::Fail(2)])),
        config.with_max_concurrent(1),
    )
    .unwrap();

    let failed = manager.submit(JobSpec::command(["false"])).await.unwrap();
    let ok = manager.submit(JobSpec::command(["true"])).await.unwrap();
    manager.wait(&failed).await.unwrap();
    manager.wait(&ok).await.unwrap();

    let records = load_snapshot(&snapshot_path).unwrap();
    let jobs = manager.list(None).await;
    assert_eq!(records.len(), jobs.len());
    for job in jobs {
        let record = &records[&job.id];
        assert_eq!(record.state, job.state);
        assert_eq!(record.attempts, job.attempts);
        assert_eq!(record.exit_code, job.exit_code);
    }
    assert_eq!(records[&failed].state, JobState::Failed);
    assert_eq!(records[&ok].state, JobState::Succeeded);
}

#[tokio::test]
async fn test_runtime_limit_stops_retries() {
    let backend = Arc::new(
        ScriptedBackend::new(Step::Fail(1)).with_delay(Duration::from_millis(100)),
    );
    let (_dir, manager) = manager_with(backend.clone());
    let seen = count_events(&manager);

    let spec = JobSpec::command(["false"])
        .with_retry(RetryPolicy::new(10).with_backoff_base(0.1).with_jitter(0.0))
        .with_runtime_limit(Duration::from_millis(150));
    let id = manager.submit(spec).await.unwrap();
    let job = manager.wait(&id).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureKind::RuntimeLimit));
    assert!(job.error.unwrap().ends_with(RUNTIME_LIMIT_MARKER));
    assert!(backend.attempt_count() < 11);
    assert_eq!(occurrences(&seen, Event::Finish), 1);
}

#[tokio::test]
async fn test_handler_faults_do_not_affect_jobs() {
    let (_dir, manager) = manager_with(Arc::new(ScriptedBackend::new(Step::Succeed)));
    manager.register(Event::Start, |_, _| async { anyhow::bail!("handler broke") });
    manager.register_fn(Event::Finish, |_, _| panic!("handler panicked"));
    let finishes = Arc::new(AtomicUsize::new(0));
    let counter = finishes.clone();
    manager
        .register_named("on_finish", move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
    assert!(matches!(
        manager.register_named("on_done", |_, _| async { Ok(()) }),
        Err(JobError::UnknownEvent(_))
    ));

    let id = manager.submit(JobSpec::command(["true"])).await.unwrap();
    let job = manager.wait(&id).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_list_filters_by_state_and_purge() {
    let (_dir, manager) = manager_with(Arc::new(
        ScriptedBackend::new(Step::Succeed).with_script([Step::Fail(1)]),
    ));

    let a = manager.submit(JobSpec::command(["false"])).await.unwrap();
    let b = manager.submit(JobSpec::command(["true"])).await.unwrap();
    manager.wait(&a).await.unwrap();
    manager.wait(&b).await.unwrap();

    let all = manager.list(None).await;
    assert_eq!(all.iter().map(|j| j.id.clone()).collect::<Vec<_>>(), vec![a.clone(), b.clone()]);
    assert_eq!(manager.list(Some(JobState::Failed)).await.len(), 1);
    assert_eq!(manager.list(Some(JobState::Running)).await.len(), 0);

    assert_eq!(manager.purge_finished().await, 2);
    assert!(manager.list(None).await.is_empty());
    assert!(matches!(manager.status(&a).await, Err(JobError::NotFound(_))));
}

#[tokio::test]
async fn test_shutdown_cancels_unfinished_jobs() {
    let (_dir, config) = fast_config();
    let manager = Manager::new(
        Arc::new(ScriptedBackend::new(Step::Hang)),
        config.with_max_concurrent(1),
    )
    .unwrap();

    let running = manager.submit(JobSpec::command(["sleep", "100"])).await.unwrap();
    let queued = manager.submit(JobSpec::command(["sleep", "100"])).await.unwrap();
    manager.shutdown().await;

    assert_eq!(manager.wait(&running).await.unwrap().state, JobState::Cancelled);
    assert_eq!(manager.wait(&queued).await.unwrap().state, JobState::Cancelled);
}

#[tokio::test]
async fn test_zero_concurrency_is_rejected() {
    let (_dir, config) = fast_config();
    let result = Manager::new(
        Arc::new(ScriptedBackend::new(Step::Succeed)),
        config.with_max_concurrent(0),
    );
    assert!(matches!(result, Err(JobError::Validation(_))));
}

// =============================================================================
// End-to-end scenarios with real backends
// =============================================================================

#[tokio::test]
async fn test_false_command_retries_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(
        Arc::new(ProcessBackend::new(ProcessConfig::default())),
        ManagerConfig::new(dir.path()).with_poll_interval(Duration::from_millis(20)),
    )
    .unwrap();

    let spec = JobSpec::command(["false"]).with_retry(
        RetryPolicy::new(1)
            .with_backoff_base(1.5)
            .with_jitter(0.0),
    );
    let started = Instant::now();
    let id = manager.submit(spec).await.unwrap();
    let job = manager.wait(&id).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.exit_code, Some(1));
    assert!(started.elapsed() >= Duration::from_millis(1500));
}

#[tokio::test]
async fn test_square_callable_writes_result_log() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(
        Arc::new(CallableBackend::new(CallableConfig::default())),
        ManagerConfig::new(dir.path()).with_poll_interval(Duration::from_millis(10)),
    )
    .unwrap();

    let square = Callable::blocking("square", |ctx| {
        let x = ctx.arg(0).and_then(|v| v.as_i64()).unwrap_or_default();
        Ok(serde_json::json!(x * x))
    });
    let spec = JobSpec::callable(square)
        .with_args(vec![serde_json::json!(7)])
        .with_timeout(Duration::from_secs(3));
    let id = manager.submit(spec).await.unwrap();
    let job = manager.wait(&id).await.unwrap();

    assert_eq!(job.state, JobState::Succeeded);
    let result_path = job.stdout_path.unwrap();
    assert_eq!(result_path, dir.path().join(&id).join("result.log"));
    let contents = std::fs::read_to_string(result_path).unwrap();
    assert!(contents.contains("49"));
}

#[tokio::test]
async fn test_process_timeout_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(
        Arc::new(ProcessBackend::new(
            ProcessConfig::default().with_grace_period(Duration::from_millis(200)),
        )),
        ManagerConfig::new(dir.path()).with_poll_interval(Duration::from_millis(10)),
    )
    .unwrap();
    let seen = count_events(&manager);

    let spec = JobSpec::command(["sleep", "5"])
        .with_timeout(Duration::from_millis(100))
        .with_retry(quick_retry(1));
    let id = manager.submit(spec).await.unwrap();
    let job = manager.wait(&id).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureKind::Timeout));
    assert_eq!(job.attempts, 2);
    assert_eq!(occurrences(&seen, Event::Retry), 1);
}

// =============================================================================
// Cancellation and shutdown with processes that ignore SIGTERM
// =============================================================================

const STUBBORN: &str = "trap '' TERM; while true; do sleep 0.05; done";

fn stubborn_manager(dir: &std::path::Path, max_concurrent: usize) -> Manager {
    Manager::new(
        Arc::new(ProcessBackend::new(
            ProcessConfig::default().with_grace_period(Duration::from_secs(1)),
        )),
        ManagerConfig::new(dir)
            .with_poll_interval(Duration::from_millis(10))
            .with_snapshot_path(dir.join("state.json"))
            .with_max_concurrent(max_concurrent),
    )
    .unwrap()
}

async fn wait_running(manager: &Manager, id: &str) {
    let m = manager.clone();
    let job_id = id.to_string();
    assert_eventually(
        || {
            let m = m.clone();
            let job_id = job_id.clone();
            async move { m.status(&job_id).await.unwrap().state == JobState::Running }
        },
        Duration::from_secs(3),
        "job never started",
    )
    .await;
    // Let the shell install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_wait_after_cancel_sees_persisted_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let manager = stubborn_manager(dir.path(), 1);
    let seen = count_events(&manager);

    let id = manager
        .submit(JobSpec::command(["sh", "-c", STUBBORN]))
        .await
        .unwrap();
    wait_running(&manager, &id).await;

    let m = manager.clone();
    let job_id = id.clone();
    let cancel = tokio::spawn(async move { m.cancel(&job_id).await });
    let job = manager.wait(&id).await.unwrap();

    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.pid.is_some());
    let records = load_snapshot(&dir.path().join("state.json")).unwrap();
    assert_eq!(records[&id].state, JobState::Cancelled);
    assert_eq!(occurrences(&seen, Event::Cancel), 1);

    cancel.await.unwrap().unwrap();
    assert_eq!(occurrences(&seen, Event::Cancel), 1);
}

#[tokio::test]
async fn test_dropped_cancel_still_records_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let manager = stubborn_manager(dir.path(), 1);
    let seen = count_events(&manager);

    let running = manager
        .submit(JobSpec::command(["sh", "-c", STUBBORN]))
        .await
        .unwrap();
    let queued = manager.submit(JobSpec::command(["true"])).await.unwrap();
    wait_running(&manager, &running).await;

    // Give up on the cancel long before the grace period runs out.
    let _ = tokio::time::timeout(Duration::from_millis(20), manager.cancel(&running)).await;
    let job = manager.wait(&running).await.unwrap();
    assert_eq!(job.state, JobState::Cancelled);

    let records = load_snapshot(&dir.path().join("state.json")).unwrap();
    assert_eq!(records[&running].state, JobState::Cancelled);
    assert_eq!(occurrences(&seen, Event::Cancel), 1);

    // The queued job ran once the slot was free.
    let job = manager.wait(&queued).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_refused() {
    let (_dir, manager) = manager_with(Arc::new(ScriptedBackend::new(Step::Succeed)));
    let seen = count_events(&manager);

    manager.shutdown().await;
    let result = manager.submit(JobSpec::command(["true"])).await;

    assert!(matches!(result, Err(JobError::ShutDown)));
    assert!(manager.list(None).await.is_empty());
    assert_eq!(occurrences(&seen, Event::Submit), 0);
}

#[tokio::test]
async fn test_shutdown_stops_jobs_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let manager = stubborn_manager(dir.path(), 3);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = manager
            .submit(JobSpec::command(["sh", "-c", STUBBORN]))
            .await
            .unwrap();
        ids.push(id);
    }
    for id in &ids {
        wait_running(&manager, id).await;
    }

    let started = Instant::now();
    manager.shutdown().await;
    let elapsed = started.elapsed();

    // Each job needs the full 1s grace before SIGKILL.
    assert!(elapsed >= Duration::from_millis(900), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2500), "elapsed {:?}", elapsed);
    for id in &ids {
        assert_eq!(manager.status(id).await.unwrap().state, JobState::Cancelled);
    }
}
