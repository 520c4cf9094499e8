use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::scheduler::spec::JobSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// True once the current attempt has an outcome. A FAILED job may still
    /// be retried; only the manager knows whether its lifecycle is over.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "SUCCEEDED" => Ok(JobState::Succeeded),
            "FAILED" => Ok(JobState::Failed),
            "CANCELLED" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Why the latest attempt (or the job as a whole) did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The attempt exceeded its per-attempt timeout.
    Timeout,
    /// The process exited with a nonzero code.
    Exit,
    /// The process was killed by a signal.
    Signal,
    /// The callable returned a fault or panicked.
    Fault,
    /// The attempt could not be started.
    Launch,
    /// Cumulative wall time exceeded the runtime limit.
    RuntimeLimit,
    /// Cancelled on request.
    Cancelled,
}

/// Marker appended to the error text when the runtime limit ends a job.
pub const RUNTIME_LIMIT_MARKER: &str = "runtime limit exceeded";

/// Job record shared between the manager, the retry loop and the backend.
pub type SharedJob = Arc<RwLock<Job>>;

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub spec: Arc<JobSpec>,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub pid: Option<u32>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

impl Job {
    pub fn new(id: String, spec: Arc<JobSpec>) -> Self {
        Self {
            id,
            spec,
            state: JobState::Pending,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            error: None,
            failure: None,
            pid: None,
            stdout_path: None,
            stderr_path: None,
        }
    }

    pub fn shared(self) -> SharedJob {
        Arc::new(RwLock::new(self))
    }

    /// Move to RUNNING for a new attempt, clearing the previous attempt's outcome.
    pub fn begin_attempt(&mut self) {
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
        self.exit_code = None;
        self.error = None;
        self.failure = None;
        self.pid = None;
    }

    /// Record a successful attempt. Ignored unless the job is RUNNING.
    pub fn succeed(&mut self, exit_code: i32) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        self.state = JobState::Succeeded;
        self.exit_code = Some(exit_code);
        self.ended_at = Some(Utc::now());
        true
    }

    /// Record a failed attempt. Ignored unless the job is RUNNING.
    pub fn fail(
        &mut self,
        kind: FailureKind,
        error: impl Into<String>,
        exit_code: Option<i32>,
    ) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        self.state = JobState::Failed;
        self.failure = Some(kind);
        self.error = Some(error.into());
        self.exit_code = exit_code;
        self.ended_at = Some(Utc::now());
        true
    }

    /// Record an attempt that never got off the ground. A cancelled job
    /// stays cancelled.
    pub fn fail_to_launch(&mut self, error: impl Into<String>) {
        if self.state == JobState::Cancelled {
            return;
        }
        if self.state != JobState::Running {
            self.begin_attempt();
        }
        self.fail(FailureKind::Launch, error, None);
    }

    /// Force CANCELLED. A succeeded job keeps its outcome.
    pub fn cancel(&mut self) -> bool {
        if matches!(self.state, JobState::Succeeded | JobState::Cancelled) {
            return false;
        }
        self.state = JobState::Cancelled;
        self.failure = Some(FailureKind::Cancelled);
        self.ended_at = Some(Utc::now());
        true
    }

    /// Annotate a failed job as ended by its runtime ceiling.
    pub fn exceed_runtime_limit(&mut self) {
        self.error = Some(match self.error.take() {
            Some(error) => format!("{}\n{}", error, RUNTIME_LIMIT_MARKER),
            None => RUNTIME_LIMIT_MARKER.to_string(),
        });
        self.failure = Some(FailureKind::RuntimeLimit);
        self.state = JobState::Failed;
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }
}
