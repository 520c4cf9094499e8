use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::CallableConfig;
use crate::error::{JobError, Result};
use crate::scheduler::job::{FailureKind, SharedJob};
use crate::scheduler::spec::{CallContext, CallFault, CallResult, Callable, CallableFn};
use crate::worker::{begin_attempt, cancel_attempt, with_timeout, Attempt, Backend, InFlight};

enum Outcome {
    Done(CallResult),
    TimedOut,
    Cancelled,
}

/// Runs jobs whose spec carries an in-process [`Callable`].
///
/// Blocking callables run on tokio's blocking pool so they never stall the
/// runtime; async callables run as tasks. Successful return values are
/// appended to `result.log` and faults to `error.log` under
/// `<log_dir>/<job-id>/`.
///
/// A blocking call that is already executing cannot be interrupted. On
/// timeout or cancel its thread is left to finish and the result is dropped.
#[derive(Debug, Default)]
pub struct CallableBackend {
    config: CallableConfig,
    inflight: InFlight,
}

impl CallableBackend {
    pub fn new(config: CallableConfig) -> Self {
        Self {
            config,
            inflight: InFlight::default(),
        }
    }
}

#[async_trait]
impl Backend for CallableBackend {
    async fn submit(&self, job: &SharedJob, log_dir: &Path) -> Result<()> {
        let callable = job.read().await.spec.callable.clone().ok_or_else(|| {
            JobError::Launch("callable backend requires a callable".to_string())
        })?;

        let mut inflight = self.inflight.lock().await;
        inflight.retain(|_, attempt| !attempt.task.is_finished());

        let Some((id, spec)) = begin_attempt(job).await else {
            return Ok(());
        };

        let job_dir = log_dir.join(&id);
        tokio::fs::create_dir_all(&job_dir).await?;
        let result_path = job_dir.join("result.log");
        let error_path = job_dir.join("error.log");
        {
            let mut job = job.write().await;
            job.stdout_path = Some(result_path.clone());
            job.stderr_path = Some(error_path.clone());
        }

        let ctx = CallContext {
            job_id: id.clone(),
            args: spec.args.clone(),
            kwargs: spec.kwargs.clone(),
        };
        tracing::info!(job_id = %id, callable = %callable.name(), "Invoking callable");

        let token = CancellationToken::new();
        let task = tokio::spawn(drive(
            job.clone(),
            callable,
            ctx,
            spec.timeout,
            token.clone(),
            result_path,
            error_path,
        ));
        inflight.insert(id, Attempt { token, task });
        Ok(())
    }

    async fn cancel(&self, job: &SharedJob) -> Result<()> {
        cancel_attempt(&self.inflight, job, self.config.grace_period).await;
        Ok(())
    }
}

async fn invoke(callable: Callable, ctx: CallContext) -> CallResult {
    match callable.func().clone() {
        CallableFn::Blocking(func) => match tokio::task::spawn_blocking(move || func(ctx)).await
        {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(panic_fault(e.into_panic())),
            Err(e) => Err(CallFault::new("JoinError", e.to_string())),
        },
        CallableFn::Async(func) => {
            match AssertUnwindSafe(async move { func(ctx).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(panic_fault(payload)),
            }
        }
    }
}

fn panic_fault(payload: Box<dyn Any + Send>) -> CallFault {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "callable panicked".to_string());
    CallFault::new("panic", message)
}

/// Strings are written verbatim, everything else as JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

async fn drive(
    job: SharedJob,
    callable: Callable,
    ctx: CallContext,
    timeout: Option<Duration>,
    token: CancellationToken,
    result_path: PathBuf,
    error_path: PathBuf,
) {
    let outcome = tokio::select! {
        result = with_timeout(timeout, invoke(callable, ctx)) => match result {
            Some(result) => Outcome::Done(result),
            None => Outcome::TimedOut,
        },
        _ = token.cancelled() => Outcome::Cancelled,
    };

    match outcome {
        Outcome::Done(Ok(value)) => {
            if let Err(e) = append_line(&result_path, &render(&value)).await {
                tracing::warn!(path = %result_path.display(), error = %e, "Failed to write result log");
            }
            job.write().await.succeed(0);
        }
        Outcome::Done(Err(fault)) => {
            if let Err(e) = append_line(&error_path, &fault.to_string()).await {
                tracing::warn!(path = %error_path.display(), error = %e, "Failed to write error log");
            }
            job.write()
                .await
                .fail(FailureKind::Fault, fault.to_string(), Some(1));
        }
        Outcome::TimedOut => {
            let limit = timeout.unwrap_or_default();
            let message = format!("attempt timed out after {:.3}s", limit.as_secs_f64());
            if let Err(e) = append_line(&error_path, &message).await {
                tracing::warn!(path = %error_path.display(), error = %e, "Failed to write error log");
            }
            job.write().await.fail(FailureKind::Timeout, message, None);
        }
        Outcome::Cancelled => {
            job.write().await.cancel();
        }
    }

    let job = job.read().await;
    tracing::info!(job_id = %job.id, state = %job.state, "Callable attempt finished");
}
