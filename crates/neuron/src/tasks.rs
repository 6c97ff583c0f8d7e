// SPDX-License-Identifier: PolyForm-Shield-1.0

//! At most one deployment attempt per abbr.
//!
//! [`DeploymentTasks::begin`] hands out an [`AttemptTicket`] that the attempt
//! keeps for its whole lifetime. Dropping the ticket (normal completion, early
//! return or panic unwinding) frees the slot and wakes anyone waiting in
//! [`DeploymentTasks::cancel_and_wait`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

struct Entry {
    id: u64,
    cancel: watch::Sender<bool>,
    finished: Arc<Notify>,
}

#[derive(Clone, Default)]
pub struct DeploymentTasks {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
    next_id: Arc<AtomicU64>,
}

/// Returned by [`DeploymentTasks::begin`] when an attempt is already running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlreadyActive(pub String);

impl DeploymentTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // entries stay consistent even if a holder panicked mid-insert.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot for `abbr`.
    pub fn begin(&self, abbr: &str) -> Result<AttemptTicket, AlreadyActive> {
        let mut entries = self.lock();
        if entries.contains_key(abbr) {
            return Err(AlreadyActive(abbr.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = watch::channel(false);
        entries.insert(
            abbr.to_string(),
            Entry {
                id,
                cancel,
                finished: Arc::new(Notify::new()),
            },
        );
        debug!("neuron::tasks: attempt {id} started for {abbr}");
        Ok(AttemptTicket {
            tasks: self.clone(),
            abbr: abbr.to_string(),
            id,
            cancelled,
        })
    }

    pub fn is_active(&self, abbr: &str) -> bool {
        self.lock().contains_key(abbr)
    }

    /// Ask the attempt for `abbr` to stop; returns whether one was running.
    pub fn cancel(&self, abbr: &str) -> bool {
        match self.lock().get(abbr) {
            Some(entry) => {
                entry.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Cancel the attempt for `abbr` and wait (up to `limit`) for it to end.
    ///
    /// Returns `false` only when an attempt was still running at the limit.
    pub async fn cancel_and_wait(&self, abbr: &str, limit: Duration) -> bool {
        self.wait(abbr, true, Some(limit)).await
    }

    /// Wait for the current attempt for `abbr` (if any) to end on its own.
    pub async fn wait_finished(&self, abbr: &str) {
        self.wait(abbr, false, None).await;
    }

    async fn wait(&self, abbr: &str, cancel: bool, limit: Option<Duration>) -> bool {
        let (id, finished) = match self.lock().get(abbr) {
            Some(entry) => {
                if cancel {
                    entry.cancel.send_replace(true);
                }
                (entry.id, entry.finished.clone())
            }
            None => return true,
        };

        let notified = finished.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        // the ticket may have dropped between the lookup and `enable`.
        if !self.holds(abbr, id) {
            return true;
        }

        let Some(limit) = limit else {
            notified.await;
            return true;
        };
        match tokio::time::timeout(limit, notified).await {
            Ok(()) => true,
            Err(_) => {
                warn!("neuron::tasks: attempt {id} for {abbr} did not stop within {limit:?}");
                false
            }
        }
    }

    fn holds(&self, abbr: &str, id: u64) -> bool {
        self.lock().get(abbr).is_some_and(|e| e.id == id)
    }

    fn finish(&self, abbr: &str, id: u64) {
        let mut entries = self.lock();
        if entries.get(abbr).is_some_and(|e| e.id == id) {
            if let Some(entry) = entries.remove(abbr) {
                entry.finished.notify_waiters();
            }
            debug!("neuron::tasks: attempt {id} finished for {abbr}");
        }
    }
}

/// Proof of holding the attempt slot for one abbr.
pub struct AttemptTicket {
    tasks: DeploymentTasks,
    abbr: String,
    id: u64,
    cancelled: watch::Receiver<bool>,
}

impl AttemptTicket {
    pub fn abbr(&self) -> &str {
        &self.abbr
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&mut self) {
        // a closed channel means the registry is gone; nothing will cancel us.
        if self.cancelled.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for AttemptTicket {
    fn drop(&mut self) {
        self.tasks.finish(&self.abbr, self.id);
    }
}
