pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod persist;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use client::SyncClient;
pub use config::{CallableConfig, ManagerConfig, ProcessConfig};
pub use error::{JobError, Result};
pub use events::Event;
pub use scheduler::{
    CallContext, CallFault, Callable, FailureKind, Job, JobSpec, JobState, Manager, RetryPolicy,
};
pub use worker::{Backend, CallableBackend, ProcessBackend};
