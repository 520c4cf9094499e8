use std::collections::HashMap;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::scheduler::job::SharedJob;

/// Where a job is in its lifecycle, as far as the manager is concerned.
#[derive(Debug, Clone)]
pub enum Lifecycle {
    /// Submitted, waiting in the pending queue for an admission slot.
    Queued,
    /// Owned by a retry loop. The token interrupts backoff sleeps.
    Active(CancellationToken),
    /// Terminal: no further attempts will be made.
    Finished,
}

#[derive(Debug)]
struct Entry {
    job: SharedJob,
    lifecycle: Lifecycle,
    done: watch::Sender<bool>,
}

/// Table of every job the manager knows about, in submission order.
#[derive(Debug, Default)]
pub struct JobTable {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly submitted job as queued.
    pub fn insert(&mut self, id: String, job: SharedJob) {
        let (done, _) = watch::channel(false);
        self.order.push(id.clone());
        self.entries.insert(
            id,
            Entry {
                job,
                lifecycle: Lifecycle::Queued,
                done,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&SharedJob> {
        self.entries.get(id).map(|e| &e.job)
    }

    pub fn lifecycle(&self, id: &str) -> Option<&Lifecycle> {
        self.entries.get(id).map(|e| &e.lifecycle)
    }

    /// Hand a queued job to a retry loop. Returns `None` if the job was
    /// cancelled or purged while it waited.
    pub fn activate(&mut self, id: &str) -> Option<(SharedJob, CancellationToken)> {
        let entry = self.entries.get_mut(id)?;
        if !matches!(entry.lifecycle, Lifecycle::Queued) {
            return None;
        }
        let token = CancellationToken::new();
        entry.lifecycle = Lifecycle::Active(token.clone());
        Some((entry.job.clone(), token))
    }

    /// Mark a job's lifecycle as over without waking waiters yet. Later
    /// cancels become no-ops.
    pub fn seal(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.lifecycle = Lifecycle::Finished;
                true
            }
            None => false,
        }
    }

    /// Mark a job's lifecycle as over and wake any waiters.
    pub fn finish(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.lifecycle = Lifecycle::Finished;
                entry.done.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Receiver that flips to `true` when the job finishes.
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<bool>> {
        self.entries.get(id).map(|e| e.done.subscribe())
    }

    /// Whether waiters for the job have been released.
    pub fn is_done(&self, id: &str) -> Option<bool> {
        self.entries.get(id).map(|e| *e.done.borrow())
    }

    /// All jobs in submission order.
    pub fn jobs(&self) -> Vec<SharedJob> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| e.job.clone()))
            .collect()
    }

    /// Ids of jobs that are queued or active, in submission order.
    pub fn unfinished_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.entries
                    .get(*id)
                    .is_some_and(|e| !matches!(e.lifecycle, Lifecycle::Finished))
            })
            .cloned()
            .collect()
    }

    /// Remove jobs whose lifecycle is over. Returns the number removed.
    pub fn purge_finished(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !matches!(e.lifecycle, Lifecycle::Finished));
        let entries = &self.entries;
        self.order.retain(|id| entries.contains_key(id));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
