use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::ProcessConfig;
use crate::error::{JobError, Result};
use crate::scheduler::job::{FailureKind, SharedJob};
use crate::worker::{begin_attempt, cancel_attempt, with_timeout, Attempt, Backend, InFlight};

/// How an attempt's process came to an end.
enum Exit {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs jobs as local child processes.
///
/// The command vector is executed directly (no shell). Standard output and
/// error go to `stdout.log` and `stderr.log` under `<log_dir>/<job-id>/`,
/// truncated at the start of every attempt.
#[derive(Debug, Default)]
pub struct ProcessBackend {
    config: ProcessConfig,
    inflight: InFlight,
}

impl ProcessBackend {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            inflight: InFlight::default(),
        }
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn submit(&self, job: &SharedJob, log_dir: &Path) -> Result<()> {
        let has_command = job
            .read()
            .await
            .spec
            .command
            .as_ref()
            .is_some_and(|argv| !argv.is_empty());
        if !has_command {
            return Err(JobError::Launch(
                "process backend requires a command".to_string(),
            ));
        }

        let mut inflight = self.inflight.lock().await;
        inflight.retain(|_, attempt| !attempt.task.is_finished());

        let Some((id, spec)) = begin_attempt(job).await else {
            return Ok(());
        };
        let argv = spec.command.as_deref().unwrap_or_default();

        let job_dir = log_dir.join(&id);
        tokio::fs::create_dir_all(&job_dir).await?;
        let stdout_path = job_dir.join("stdout.log");
        let stderr_path = job_dir.join("stderr.log");
        let stdout = std::fs::File::create(&stdout_path)?;
        let stderr = std::fs::File::create(&stderr_path)?;

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| JobError::Launch(format!("{}: {}", argv[0], e)))?;
        let pid = child.id();

        {
            let mut job = job.write().await;
            job.pid = pid;
            job.stdout_path = Some(stdout_path);
            job.stderr_path = Some(stderr_path);
        }
        tracing::info!(job_id = %id, pid = ?pid, program = %argv[0], "Launched process");

        let token = CancellationToken::new();
        let task = tokio::spawn(drive(
            job.clone(),
            child,
            spec.timeout,
            self.config.grace_period,
            token.clone(),
        ));
        inflight.insert(id, Attempt { token, task });
        Ok(())
    }

    async fn cancel(&self, job: &SharedJob) -> Result<()> {
        cancel_attempt(&self.inflight, job, self.config.grace_period).await;
        Ok(())
    }
}

/// Wait for the process, then record the attempt's outcome.
async fn drive(
    job: SharedJob,
    mut child: Child,
    timeout: Option<Duration>,
    grace: Duration,
    token: CancellationToken,
) {
    let exit = {
        tokio::select! {
            status = with_timeout(timeout, child.wait()) => match status {
                Some(status) => Exit::Exited(status),
                None => Exit::TimedOut,
            },
            _ = token.cancelled() => Exit::Cancelled,
        }
    };

    let mut job = match exit {
        Exit::Exited(status) => {
            let mut job = job.write().await;
            match status {
                Ok(status) if status.success() => {
                    job.succeed(0);
                }
                Ok(status) => match status.code() {
                    Some(code) => {
                        job.fail(
                            FailureKind::Exit,
                            format!("process exited with code {}", code),
                            Some(code),
                        );
                    }
                    None => {
                        job.fail(FailureKind::Signal, describe_signal(status), None);
                    }
                },
                Err(e) => {
                    job.fail(
                        FailureKind::Fault,
                        format!("failed to wait for process: {}", e),
                        None,
                    );
                }
            }
            job
        }
        Exit::TimedOut => {
            let limit = timeout.unwrap_or_default();
            tracing::warn!(timeout_secs = limit.as_secs_f64(), "Attempt timed out, terminating process");
            terminate(&mut child, grace).await;
            let mut job = job.write().await;
            job.fail(
                FailureKind::Timeout,
                format!("attempt timed out after {:.3}s", limit.as_secs_f64()),
                None,
            );
            job
        }
        Exit::Cancelled => {
            terminate(&mut child, grace).await;
            let mut job = job.write().await;
            job.cancel();
            job
        }
    };

    tracing::info!(
        job_id = %job.id,
        state = %job.state,
        exit_code = ?job.exit_code,
        "Process attempt finished"
    );
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        send_sigterm(pid).await;
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(pid, "Process ignored SIGTERM, killing");
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill process");
    }
}

#[cfg(unix)]
async fn send_sigterm(pid: u32) {
    let result = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        tracing::warn!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
async fn send_sigterm(_pid: u32) {}

#[cfg(unix)]
fn describe_signal(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("process terminated by signal {}", signal),
        None => format!("process terminated: {}", status),
    }
}

#[cfg(not(unix))]
fn describe_signal(status: ExitStatus) -> String {
    format!("process terminated: {}", status)
}
