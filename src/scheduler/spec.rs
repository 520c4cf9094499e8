use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{JobError, Result};

/// Retry behaviour for a job: how many extra attempts and how long to wait
/// between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Base of the exponential backoff: attempt `i` waits `base^i` seconds.
    pub backoff_base_seconds: f64,
    /// Upper bound of the uniform jitter added on top of the backoff.
    pub jitter_seconds: f64,
    /// Caps the exponential term. Jitter is added after the cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_seconds: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base_seconds: 2.0,
            jitter_seconds: 0.5,
            max_backoff_seconds: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_backoff_base(mut self, seconds: f64) -> Self {
        self.backoff_base_seconds = seconds;
        self
    }

    pub fn with_jitter(mut self, seconds: f64) -> Self {
        self.jitter_seconds = seconds;
        self
    }

    pub fn with_max_backoff(mut self, seconds: f64) -> Self {
        self.max_backoff_seconds = Some(seconds);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backoff_base_seconds.is_finite() || self.backoff_base_seconds <= 0.0 {
            return Err(JobError::Validation(format!(
                "backoff_base_seconds must be positive, got {}",
                self.backoff_base_seconds
            )));
        }
        if !self.jitter_seconds.is_finite() || self.jitter_seconds < 0.0 {
            return Err(JobError::Validation(format!(
                "jitter_seconds must be >= 0, got {}",
                self.jitter_seconds
            )));
        }
        if let Some(cap) = self.max_backoff_seconds {
            if cap.is_nan() || cap <= 0.0 {
                return Err(JobError::Validation(format!(
                    "max_backoff_seconds must be positive, got {}",
                    cap
                )));
            }
        }
        Ok(())
    }

    /// Backoff before the attempt following `attempt_idx`, without jitter.
    pub fn base_delay(&self, attempt_idx: u32) -> Duration {
        let exponent = i32::try_from(attempt_idx).unwrap_or(i32::MAX);
        let mut secs = self.backoff_base_seconds.powi(exponent);
        if let Some(cap) = self.max_backoff_seconds {
            secs = secs.min(cap);
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Backoff before the attempt following `attempt_idx`, with jitter
    /// sampled uniformly from `[0, jitter_seconds)`.
    pub fn backoff<R: Rng + ?Sized>(&self, attempt_idx: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt_idx);
        if self.jitter_seconds <= 0.0 {
            return base;
        }
        let jitter = rng.gen_range(0.0..self.jitter_seconds);
        base.saturating_add(Duration::try_from_secs_f64(jitter).unwrap_or_default())
    }
}

/// A fault raised by an in-process callable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CallFault {
    pub kind: String,
    pub message: String,
}

impl CallFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Build a fault from any error, using its type name as the kind.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let kind = type_name.rsplit("::").next().unwrap_or(type_name);
        Self::new(kind, err.to_string())
    }
}

pub type CallResult = std::result::Result<Value, CallFault>;

/// Arguments handed to a callable for one attempt.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub job_id: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallContext {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

type BlockingFn = dyn Fn(CallContext) -> CallResult + Send + Sync;
type AsyncFn = dyn Fn(CallContext) -> BoxFuture<'static, CallResult> + Send + Sync;

#[derive(Clone)]
pub(crate) enum CallableFn {
    /// Runs on a worker thread so it cannot stall the runtime.
    Blocking(Arc<BlockingFn>),
    /// Runs as a task on the runtime.
    Async(Arc<AsyncFn>),
}

/// A named in-process function a job can run instead of a command.
#[derive(Clone)]
pub struct Callable {
    name: String,
    func: CallableFn,
}

impl Callable {
    /// Wrap a synchronous function. It is executed on a blocking worker thread.
    pub fn blocking<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(CallContext) -> CallResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: CallableFn::Blocking(Arc::new(func)),
        }
    }

    /// Wrap an async function.
    pub fn from_async<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: CallableFn::Async(Arc::new(
                move |ctx: CallContext| -> BoxFuture<'static, CallResult> { Box::pin(func(ctx)) },
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.func, CallableFn::Blocking(_))
    }

    pub(crate) fn func(&self) -> &CallableFn {
        &self.func
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("blocking", &self.is_blocking())
            .finish()
    }
}

// Snapshots record which callable a job ran, not its body.
impl Serialize for Callable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

fn serialize_secs<S: Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// Immutable description of the work a job performs.
///
/// Exactly one of `command` or `callable` must be set. `args` and `kwargs`
/// are passed to the callable after the job id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callable: Option<Callable>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Per-attempt timeout. `None` means the attempt may run indefinitely.
    #[serde(rename = "timeout_seconds", serialize_with = "serialize_secs")]
    pub timeout: Option<Duration>,
    /// Ceiling on wall time across all attempts and backoffs.
    #[serde(rename = "runtime_limit_seconds", serialize_with = "serialize_secs")]
    pub runtime_limit: Option<Duration>,
    pub retry: RetryPolicy,

    pub name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl JobSpec {
    /// A job that runs `argv[0]` with the remaining elements as arguments.
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: Some(argv.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// A job from a single shell-style command line, split the way a POSIX
    /// shell splits words. No shell is involved at run time.
    pub fn command_line(line: &str) -> Result<Self> {
        let argv = shlex::split(line).ok_or_else(|| {
            JobError::Validation(format!("unbalanced quotes in command line: {}", line))
        })?;
        if argv.is_empty() {
            return Err(JobError::Validation("command line is empty".to_string()));
        }
        Ok(Self::command(argv))
    }

    /// A job that invokes an in-process callable.
    pub fn callable(callable: Callable) -> Self {
        Self {
            callable: Some(callable),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_runtime_limit(mut self, limit: Duration) -> Self {
        self.runtime_limit = Some(limit);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.command, &self.callable) {
            (Some(_), Some(_)) => {
                return Err(JobError::Validation(
                    "exactly one of command or callable must be set, got both".to_string(),
                ))
            }
            (None, None) => {
                return Err(JobError::Validation(
                    "exactly one of command or callable must be set, got neither".to_string(),
                ))
            }
            (Some(argv), None) => {
                if argv.is_empty() || argv[0].is_empty() {
                    return Err(JobError::Validation(
                        "command must name a program".to_string(),
                    ));
                }
                if !self.args.is_empty() || !self.kwargs.is_empty() {
                    return Err(JobError::Validation(
                        "args and kwargs only apply to callables".to_string(),
                    ));
                }
            }
            (None, Some(_)) => {}
        }

        if self.timeout == Some(Duration::ZERO) {
            return Err(JobError::Validation(
                "timeout must be positive; leave it unset for no limit".to_string(),
            ));
        }
        if self.runtime_limit == Some(Duration::ZERO) {
            return Err(JobError::Validation(
                "runtime_limit must be positive; leave it unset for no limit".to_string(),
            ));
        }
        self.retry.validate()
    }

    /// Name used as the prefix of generated job ids.
    pub(crate) fn id_prefix(&self) -> String {
        let raw = self
            .name
            .clone()
            .or_else(|| {
                self.command.as_ref().and_then(|argv| argv.first()).map(|program| {
                    Path::new(program)
                        .file_name()
                        .map(|f| f.to_string_lossy().into_owned())
                        .unwrap_or_else(|| program.clone())
                })
            })
            .or_else(|| self.callable.as_ref().map(|c| c.name().to_string()))
            .unwrap_or_default();

        let sanitized: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        if sanitized.is_empty() {
            "job".to_string()
        } else {
            sanitized
        }
    }
}
