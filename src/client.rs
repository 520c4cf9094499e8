//! Blocking facade over [`Manager`] for callers outside an async runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;

use crate::config::ManagerConfig;
use crate::error::Result;
use crate::events::Event;
use crate::scheduler::{Job, JobSpec, JobState, Manager};
use crate::worker::Backend;

/// Owns a multi-thread runtime and a [`Manager`] living on it. Every method
/// blocks the calling thread for the duration of the call; jobs keep running
/// on the runtime's workers between calls.
///
/// Must not be used from inside another tokio runtime. Dropping the client
/// cancels every unfinished job.
#[derive(Debug)]
pub struct SyncClient {
    runtime: Runtime,
    manager: Manager,
}

impl SyncClient {
    pub fn new(backend: Arc<dyn Backend>, config: ManagerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("jobrunner-worker")
            .build()?;
        let manager = {
            let _guard = runtime.enter();
            Manager::new(backend, config)?
        };
        Ok(Self { runtime, manager })
    }

    /// The async manager behind this client.
    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn register_fn<F>(&self, event: Event, handler: F)
    where
        F: Fn(Event, &Job) + Send + Sync + 'static,
    {
        self.manager.register_fn(event, handler);
    }

    pub fn submit(&self, spec: JobSpec) -> Result<String> {
        self.runtime.block_on(self.manager.submit(spec))
    }

    pub fn status(&self, id: &str) -> Result<Job> {
        self.runtime.block_on(self.manager.status(id))
    }

    pub fn list(&self, state: Option<JobState>) -> Vec<Job> {
        self.runtime.block_on(self.manager.list(state))
    }

    pub fn cancel(&self, id: &str) -> Result<()> {
        self.runtime.block_on(self.manager.cancel(id))
    }

    /// Block until the job's lifecycle is over, checking every
    /// `poll_interval`.
    pub fn wait(&self, id: &str, poll_interval: Duration) -> Result<Job> {
        self.runtime.block_on(async {
            while !self.manager.is_finished(id).await? {
                tokio::time::sleep(poll_interval).await;
            }
            self.manager.status(id).await
        })
    }

    pub fn purge_finished(&self) -> usize {
        self.runtime.block_on(self.manager.purge_finished())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        self.runtime.block_on(async move { manager.shutdown().await });
    }
}
