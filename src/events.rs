//! Lifecycle event channels.
//!
//! Handlers for an event run one after another in registration order, and
//! each is awaited before the next one starts. A handler that returns an
//! error or panics is logged and skipped; it never affects the job.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::JobError;
use crate::scheduler::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Submit,
    Start,
    Finish,
    Retry,
    Cancel,
}

impl Event {
    pub const ALL: [Event; 5] = [
        Event::Submit,
        Event::Start,
        Event::Finish,
        Event::Retry,
        Event::Cancel,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Event::Submit => "on_submit",
            Event::Start => "on_start",
            Event::Finish => "on_finish",
            Event::Retry => "on_retry",
            Event::Cancel => "on_cancel",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Event {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Event::ALL
            .into_iter()
            .find(|e| e.name() == s)
            .ok_or_else(|| JobError::UnknownEvent(s.to_string()))
    }
}

pub type Handler = Arc<dyn Fn(Event, Job) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<Event, Vec<Handler>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&str, usize> =
            handlers.iter().map(|(e, h)| (e.name(), h.len())).collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe an async handler.
    pub fn register<F, Fut>(&self, event: Event, handler: F)
    where
        F: Fn(Event, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(
            move |event: Event, job: Job| -> BoxFuture<'static, anyhow::Result<()>> {
                handler(event, job).boxed()
            },
        );
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push(boxed);
    }

    /// Subscribe a plain closure.
    pub fn register_fn<F>(&self, event: Event, handler: F)
    where
        F: Fn(Event, &Job) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(event, move |event, job| {
            let handler = handler.clone();
            async move {
                handler(event, &job);
                Ok(())
            }
        });
    }

    /// Subscribe by channel name (`on_submit`, `on_start`, ...).
    pub fn register_named<F, Fut>(&self, name: &str, handler: F) -> crate::error::Result<()>
    where
        F: Fn(Event, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let event = name.parse()?;
        self.register(event, handler);
        Ok(())
    }

    pub fn handler_count(&self, event: Event) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .map_or(0, Vec::len)
    }

    /// Run every handler for `event` in registration order.
    pub async fn emit(&self, event: Event, job: &Job) {
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            let call = async { handler(event, job.clone()).await };
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event = %event, job_id = %job.id, error = %e, "Event handler failed");
                }
                Err(_) => {
                    tracing::warn!(event = %event, job_id = %job.id, "Event handler panicked");
                }
            }
        }
    }
}
