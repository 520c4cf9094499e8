use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the job manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root directory for per-job log directories (`<log_root>/<job-id>/`).
    pub log_root: PathBuf,
    /// Where to write the state snapshot. `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
    /// Maximum number of jobs holding an admission slot at once.
    pub max_concurrent: usize,
    /// How often the retry loop polls the backend for an attempt outcome.
    pub poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("./job_logs"),
            snapshot_path: None,
            max_concurrent: 32,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl ManagerConfig {
    pub fn new(log_root: impl Into<PathBuf>) -> Self {
        Self {
            log_root: log_root.into(),
            ..Default::default()
        }
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Configuration for the external-process backend.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Time a process gets between SIGTERM and SIGKILL.
    pub grace_period: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
        }
    }
}

impl ProcessConfig {
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

/// Configuration for the in-process callable backend.
#[derive(Debug, Clone)]
pub struct CallableConfig {
    /// How long `cancel` waits for an aborted attempt to wind down.
    pub grace_period: Duration,
}

impl Default for CallableConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
        }
    }
}

impl CallableConfig {
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}
