use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::error::{JobError, Result};
use crate::events::{Event, EventBus};
use crate::persist::SnapshotWriter;
use crate::scheduler::job::{Job, JobState, SharedJob};
use crate::scheduler::queue::{JobTable, Lifecycle};
use crate::scheduler::spec::JobSpec;
use crate::worker::Backend;

/// Per-process sequence number folded into every job id.
static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_job_id(spec: &JobSpec) -> String {
    let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
    format!(
        "{}-{}-{}-{}",
        spec.id_prefix(),
        Utc::now().timestamp_millis(),
        std::process::id(),
        seq
    )
}

struct Shared {
    config: ManagerConfig,
    backend: Arc<dyn Backend>,
    table: RwLock<JobTable>,
    events: EventBus,
    snapshots: SnapshotWriter,
    admission: Arc<Semaphore>,
    closed: AtomicBool,
}

impl Shared {
    async fn persist(&self) {
        self.snapshots.persist(&self.table).await;
    }

    async fn emit(&self, event: Event, job: &SharedJob) {
        let snapshot = job.read().await.clone();
        self.events.emit(event, &snapshot).await;
    }

    /// Claim the end of a job's lifecycle for the retry loop. Returns false
    /// when a cancel got there first.
    async fn claim_finish(&self, id: &str, token: &CancellationToken) -> bool {
        let mut table = self.table.write().await;
        if token.is_cancelled() {
            return false;
        }
        table.seal(id);
        true
    }

    /// Poll the backend until the current attempt settles. A cancel request
    /// stops the attempt through the backend.
    async fn wait_settled(&self, job: &SharedJob, token: &CancellationToken) -> JobState {
        loop {
            let state = self.backend.poll(job).await;
            if state.is_settled() {
                return state;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = token.cancelled() => {
                    if let Err(e) = self.backend.cancel(job).await {
                        tracing::warn!(error = %e, "Backend failed to cancel attempt");
                    }
                    job.write().await.cancel();
                }
            }
        }
    }

    /// Record a cancellation the retry loop observed.
    async fn record_cancel(&self, id: &str, job: &SharedJob) {
        let cancelled = {
            let mut job = job.write().await;
            job.cancel();
            job.state == JobState::Cancelled
        };
        if cancelled {
            tracing::info!(job_id = %id, "Job cancelled");
            self.emit(Event::Cancel, job).await;
        }
        self.persist().await;
    }

    /// Cancel a job that never left the queue. Returns false if it was
    /// dispatched or finished in the meantime.
    async fn cancel_queued(&self, id: &str) -> bool {
        let job = {
            let mut table = self.table.write().await;
            if !matches!(table.lifecycle(id), Some(Lifecycle::Queued)) {
                return false;
            }
            let Some(job) = table.get(id).cloned() else {
                return false;
            };
            job.write().await.cancel();
            table.seal(id);
            job
        };
        tracing::info!(job_id = %id, "Cancelled queued job");
        self.emit(Event::Cancel, &job).await;
        self.persist().await;
        self.table.write().await.finish(id);
        true
    }
}

/// What a cancel request found when it looked at the job.
enum CancelTarget {
    Queued,
    Active(watch::Receiver<bool>),
}

/// Orchestrates jobs: assigns ids, queues them FIFO, admits at most
/// `max_concurrent` at a time and drives each through its attempts.
///
/// Must be created inside a tokio runtime. Cloning is cheap and clones share
/// the same job table.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<Shared>,
    queue_tx: mpsc::UnboundedSender<String>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.shared.config)
            .field("events", &self.shared.events)
            .finish_non_exhaustive()
    }
}

impl Manager {
    pub fn new(backend: Arc<dyn Backend>, config: ManagerConfig) -> Result<Self> {
        if config.max_concurrent == 0 {
            return Err(JobError::Validation(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        std::fs::create_dir_all(&config.log_root)?;

        let shared = Arc::new(Shared {
            backend,
            table: RwLock::new(JobTable::new()),
            events: EventBus::new(),
            snapshots: SnapshotWriter::new(config.snapshot_path.clone()),
            admission: Arc::new(Semaphore::new(config.max_concurrent)),
            closed: AtomicBool::new(false),
            config,
        });

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(shared.clone(), queue_rx));

        Ok(Self { shared, queue_tx })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Subscribe an async handler to `event`.
    pub fn register<F, Fut>(&self, event: Event, handler: F)
    where
        F: Fn(Event, Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.events.register(event, handler);
    }

    /// Subscribe a plain closure to `event`.
    pub fn register_fn<F>(&self, event: Event, handler: F)
    where
        F: Fn(Event, &Job) + Send + Sync + 'static,
    {
        self.shared.events.register_fn(event, handler);
    }

    /// Subscribe an async handler by channel name, e.g. `"on_finish"`.
    pub fn register_named<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Event, Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.events.register_named(name, handler)
    }

    /// Validate `spec`, create its job and queue it. Returns as soon as the
    /// job is queued.
    pub async fn submit(&self, spec: JobSpec) -> Result<String> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(JobError::ShutDown);
        }
        spec.validate()?;

        let spec = Arc::new(spec);
        let id = next_job_id(&spec);
        let job = Job::new(id.clone(), spec).shared();
        self.shared
            .table
            .write()
            .await
            .insert(id.clone(), job.clone());
        tracing::info!(job_id = %id, "Job submitted");

        self.shared.emit(Event::Submit, &job).await;
        if self.queue_tx.send(id.clone()).is_err() {
            self.shared.cancel_queued(&id).await;
            return Err(JobError::ShutDown);
        }
        self.shared.persist().await;
        Ok(id)
    }

    pub async fn status(&self, id: &str) -> Result<Job> {
        let job = self
            .shared
            .table
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let job = job.read().await.clone();
        Ok(job)
    }

    /// Snapshots of all jobs in submission order, optionally filtered by state.
    pub async fn list(&self, state: Option<JobState>) -> Vec<Job> {
        let shared = self.shared.table.read().await.jobs();
        let mut jobs = Vec::with_capacity(shared.len());
        for job in shared {
            let job = job.read().await;
            if state.map_or(true, |s| s == job.state) {
                jobs.push(job.clone());
            }
        }
        jobs
    }

    /// Cancel a job in any phase, skipping any remaining retries.
    ///
    /// A queued job is marked CANCELLED without ever starting. A running
    /// job's attempt is stopped through the backend by its retry loop. A job
    /// whose lifecycle is already over keeps its terminal state.
    ///
    /// Resolves once the cancellation has been persisted and `on_cancel`
    /// has fired. Dropping the future early does not undo the request.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        loop {
            let target = {
                let table = self.shared.table.read().await;
                let job = table
                    .get(id)
                    .cloned()
                    .ok_or_else(|| JobError::NotFound(id.to_string()))?;
                match table.lifecycle(id) {
                    Some(Lifecycle::Queued) => CancelTarget::Queued,
                    Some(Lifecycle::Active(token)) => {
                        token.cancel();
                        // Between attempts nothing is running, so the backend
                        // has nothing to mark.
                        let mut job = job.write().await;
                        if job.state != JobState::Running {
                            job.cancel();
                        }
                        match table.subscribe(id) {
                            Some(done) => CancelTarget::Active(done),
                            None => return Ok(()),
                        }
                    }
                    _ => {
                        tracing::debug!(job_id = %id, "Cancel ignored, job already finished");
                        return Ok(());
                    }
                }
            };

            match target {
                CancelTarget::Queued => {
                    let shared = self.shared.clone();
                    let owned_id = id.to_string();
                    let task = tokio::spawn(async move { shared.cancel_queued(&owned_id).await });
                    match task.await {
                        Ok(true) => return Ok(()),
                        // Dispatched while we looked; cancel it as active.
                        Ok(false) => continue,
                        Err(e) => {
                            tracing::warn!(job_id = %id, error = %e, "Queued cancel task failed");
                            return Ok(());
                        }
                    }
                }
                CancelTarget::Active(mut done) => {
                    tracing::info!(job_id = %id, "Cancelling active job");
                    let _ = done.wait_for(|finished| *finished).await;
                    return Ok(());
                }
            }
        }
    }

    /// Wait until the job's lifecycle is over and return its final snapshot.
    pub async fn wait(&self, id: &str) -> Result<Job> {
        let (job, mut done) = {
            let table = self.shared.table.read().await;
            match (table.get(id).cloned(), table.subscribe(id)) {
                (Some(job), Some(done)) => (job, done),
                _ => return Err(JobError::NotFound(id.to_string())),
            }
        };
        // An error means the job was purged, which only happens once finished.
        let _ = done.wait_for(|finished| *finished).await;
        let job = job.read().await.clone();
        Ok(job)
    }

    /// True once the job's lifecycle is over and its final record is in
    /// place.
    pub async fn is_finished(&self, id: &str) -> Result<bool> {
        self.shared
            .table
            .read()
            .await
            .is_done(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Drop finished jobs from the table. Returns how many were removed.
    pub async fn purge_finished(&self) -> usize {
        let removed = self.shared.table.write().await.purge_finished();
        if removed > 0 {
            tracing::info!(removed, "Purged finished jobs");
            self.shared.persist().await;
        }
        removed
    }

    /// Stop accepting jobs and cancel every job that has not finished yet.
    /// Later submits fail with [`JobError::ShutDown`].
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.admission.close();

        let ids = self.shared.table.read().await.unfinished_ids();
        tracing::info!(jobs = ids.len(), "Shutting down job manager");
        let results = futures::future::join_all(ids.iter().map(|id| self.cancel(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(job_id = %id, error = %e, "Failed to cancel job during shutdown");
            }
        }
    }
}

/// Pulls job ids off the pending queue in FIFO order and starts a retry
/// loop for each one once an admission permit is available.
async fn dispatch_loop(shared: Arc<Shared>, mut queue_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(id) = queue_rx.recv().await {
        let queued = matches!(
            shared.table.read().await.lifecycle(&id),
            Some(Lifecycle::Queued)
        );
        if !queued {
            continue;
        }

        let permit = match shared.admission.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // Admission closed: nothing left in the queue will run.
                queue_rx.close();
                shared.cancel_queued(&id).await;
                while let Some(id) = queue_rx.recv().await {
                    shared.cancel_queued(&id).await;
                }
                break;
            }
        };

        // Cancelled while we waited for the permit: the permit goes back.
        let Some((job, token)) = shared.table.write().await.activate(&id) else {
            continue;
        };
        tracing::debug!(
            job_id = %id,
            available_slots = shared.admission.available_permits(),
            "Dispatching job"
        );
        tokio::spawn(run_job(shared.clone(), id, job, token, permit));
    }
    tracing::debug!("Dispatcher stopped");
}

/// The retry loop. Sole owner of the job between attempts; holds one
/// admission permit for the job's whole lifetime.
async fn run_job(
    shared: Arc<Shared>,
    id: String,
    job: SharedJob,
    token: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let spec = job.read().await.spec.clone();
    let log_root: &Path = &shared.config.log_root;
    let started = Instant::now();
    let mut attempts_remaining = 1 + u64::from(spec.retry.max_retries);
    let mut attempt_idx: u32 = 0;

    loop {
        if token.is_cancelled() {
            shared.record_cancel(&id, &job).await;
            break;
        }

        attempt_idx = attempt_idx.saturating_add(1);
        job.write().await.attempts = attempt_idx;
        tracing::info!(job_id = %id, attempt = attempt_idx, "Starting attempt");
        shared.emit(Event::Start, &job).await;

        if let Err(e) = shared.backend.submit(&job, log_root).await {
            tracing::warn!(job_id = %id, attempt = attempt_idx, error = %e, "Attempt failed to launch");
            job.write().await.fail_to_launch(e.to_string());
        }
        shared.persist().await;

        match shared.wait_settled(&job, &token).await {
            JobState::Succeeded => {
                shared.claim_finish(&id, &token).await;
                tracing::info!(job_id = %id, attempts = attempt_idx, "Job succeeded");
                shared.emit(Event::Finish, &job).await;
                shared.persist().await;
                break;
            }
            JobState::Cancelled => {
                shared.record_cancel(&id, &job).await;
                break;
            }
            _ => {}
        }

        attempts_remaining -= 1;
        if attempts_remaining == 0 {
            if shared.claim_finish(&id, &token).await {
                let error = job.read().await.error.clone();
                tracing::warn!(job_id = %id, attempts = attempt_idx, error = ?error, "Job failed, retries exhausted");
                shared.emit(Event::Finish, &job).await;
                shared.persist().await;
            } else {
                shared.record_cancel(&id, &job).await;
            }
            break;
        }

        if let Some(limit) = spec.runtime_limit {
            if started.elapsed() > limit {
                if shared.claim_finish(&id, &token).await {
                    job.write().await.exceed_runtime_limit();
                    tracing::warn!(
                        job_id = %id,
                        attempts = attempt_idx,
                        limit_secs = limit.as_secs_f64(),
                        "Job failed, runtime limit exceeded"
                    );
                    shared.emit(Event::Finish, &job).await;
                    shared.persist().await;
                } else {
                    shared.record_cancel(&id, &job).await;
                }
                break;
            }
        }

        let delay = spec.retry.backoff(attempt_idx, &mut rand::thread_rng());
        shared.persist().await;
        tracing::info!(
            job_id = %id,
            attempt = attempt_idx,
            delay_secs = delay.as_secs_f64(),
            "Attempt failed, retrying after backoff"
        );
        shared.emit(Event::Retry, &job).await;

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => {
                shared.record_cancel(&id, &job).await;
                break;
            }
        }
    }

    // Waiters wake only after the final record is persisted and announced.
    shared.table.write().await.finish(&id);
}
