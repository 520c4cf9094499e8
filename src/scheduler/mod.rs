pub mod job;
pub mod manager;
pub mod queue;
pub mod spec;

pub use job::{FailureKind, Job, JobState, SharedJob};
pub use manager::Manager;
pub use queue::{JobTable, Lifecycle};
pub use spec::{CallContext, CallFault, CallResult, Callable, JobSpec, RetryPolicy};
