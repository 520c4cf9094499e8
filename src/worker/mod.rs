//! Execution backends for job attempts.
//!
//! A [`Backend`] runs one attempt of a job at a time:
//! - **submit**: moves the job to RUNNING and drives the attempt to
//!   SUCCEEDED or FAILED in a background task, honoring the per-attempt timeout
//! - **poll**: reads the current state without blocking
//! - **cancel**: stops the running attempt (graceful first, forceful after a
//!   grace period) and marks the job CANCELLED
//!
//! # Backends
//!
//! - [`ProcessBackend`]: launches the job's command as a child process with
//!   stdout/stderr redirected to `<log_dir>/<job-id>/`
//! - [`CallableBackend`]: invokes an in-process [`Callable`](crate::scheduler::Callable),
//!   on a blocking worker thread when it is synchronous
//!
//! Attempt failures are written into the job record, never returned. `submit`
//! only errors when an attempt cannot be started at all.

pub mod callable;
pub mod process;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::job::{JobState, SharedJob};

pub use callable::CallableBackend;
pub use process::ProcessBackend;

/// Extra time `cancel` allows on top of the grace period before giving up
/// on an attempt task.
const CANCEL_MARGIN: Duration = Duration::from_secs(1);

#[async_trait]
pub trait Backend: Send + Sync {
    /// Start one attempt of `job`, writing logs under `log_dir/<job-id>/`.
    async fn submit(&self, job: &SharedJob, log_dir: &Path) -> Result<()>;

    /// Current state of `job`.
    async fn poll(&self, job: &SharedJob) -> JobState {
        job.read().await.state
    }

    /// Stop the running attempt of `job`, if any, and mark it CANCELLED.
    /// Resolves once the attempt has wound down.
    async fn cancel(&self, job: &SharedJob) -> Result<()>;
}

/// A running attempt owned by a backend.
#[derive(Debug)]
pub(crate) struct Attempt {
    pub token: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Attempts currently tracked by a backend, keyed by job id.
///
/// `submit` holds the lock while it launches, and `cancel` holds it while it
/// marks the job, so a cancel can never slip between the two and leave an
/// attempt running under a CANCELLED job.
pub(crate) type InFlight = Mutex<HashMap<String, Attempt>>;

/// Move `job` to RUNNING for a new attempt. Returns the job id and spec, or
/// `None` when the job was cancelled before the attempt could start.
pub(crate) async fn begin_attempt(
    job: &SharedJob,
) -> Option<(String, std::sync::Arc<crate::scheduler::JobSpec>)> {
    let mut job = job.write().await;
    if job.state == JobState::Cancelled {
        tracing::debug!(job_id = %job.id, "Job cancelled before attempt start");
        return None;
    }
    job.begin_attempt();
    Some((job.id.clone(), job.spec.clone()))
}

/// Mark `job` CANCELLED, signal its running attempt and wait up to
/// `grace + CANCEL_MARGIN` for the attempt task to finish.
pub(crate) async fn cancel_attempt(inflight: &InFlight, job: &SharedJob, grace: Duration) {
    let (id, attempt) = {
        let mut inflight = inflight.lock().await;
        let id = {
            let mut job = job.write().await;
            job.cancel();
            job.id.clone()
        };
        let attempt = inflight.remove(&id);
        if let Some(attempt) = &attempt {
            attempt.token.cancel();
        }
        (id, attempt)
    };

    let Some(attempt) = attempt else {
        return;
    };
    match tokio::time::timeout(grace + CANCEL_MARGIN, attempt.task).await {
        Ok(Ok(())) => tracing::debug!(job_id = %id, "Attempt stopped"),
        Ok(Err(e)) => tracing::warn!(job_id = %id, error = %e, "Attempt task failed while stopping"),
        Err(_) => tracing::warn!(job_id = %id, "Attempt did not stop within the grace period"),
    }
}

/// Await `fut`, giving up after `limit`. `None` limit waits forever.
pub(crate) async fn with_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
