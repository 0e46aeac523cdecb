//! Registry of in-flight executions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use deferral_core::WorkItemId;

/// Outcome of waiting for in-flight executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub completed: usize,
    pub abandoned: usize,
}

/// Running executions keyed by work item.
///
/// Entries are added when an execution is spawned and removed when it
/// finishes; finished entries of other items are swept opportunistically, so
/// the map may briefly hold executions that have already completed.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    running: Mutex<HashMap<WorkItemId, JoinHandle<()>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<WorkItemId, JoinHandle<()>>> {
        // Entries are plain handles; a panic elsewhere cannot leave them half-written.
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn `execution` and record its handle under `id`.
    ///
    /// The map is not locked while spawning: a runtime that is shutting down
    /// drops the future on this thread, and its completion cleanup must be
    /// able to take the lock. An execution that finishes before it is
    /// recorded is never inserted, or is swept by the next cleanup.
    pub fn spawn<F>(self: &Arc<Self>, id: WorkItemId, execution: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = CompletionGuard {
            registry: Arc::clone(self),
            id,
        };

        let handle = tokio::spawn(async move {
            let _guard = guard;
            execution.await;
        });

        let mut running = self.entries();
        if !handle.is_finished() {
            running.insert(id, handle);
        }
    }

    /// Drop `id` and every other entry whose execution has finished.
    pub fn complete(&self, id: WorkItemId) {
        let mut running = self.entries();
        running.remove(&id);
        let before = running.len();
        running.retain(|_, handle| !handle.is_finished());
        let swept = before - running.len();
        if swept > 0 {
            debug!(swept, "pruned finished executions");
        }
    }

    /// Remove every finished entry. Idempotent.
    pub fn prune(&self) -> usize {
        let mut running = self.entries();
        let before = running.len();
        running.retain(|_, handle| !handle.is_finished());
        before - running.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: WorkItemId) -> bool {
        self.entries().contains_key(&id)
    }

    /// Wait for every execution registered right now, for at most `timeout`.
    ///
    /// Executions still running at the deadline are detached: they keep
    /// running but nobody waits for them any longer.
    pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
        let snapshot: Vec<(WorkItemId, JoinHandle<()>)> = self.entries().drain().collect();
        let total = snapshot.len();
        if total == 0 {
            return DrainOutcome {
                completed: 0,
                abandoned: 0,
            };
        }

        info!(in_flight = total, timeout_ms = timeout.as_millis() as u64, "draining executions");

        let deadline = tokio::time::Instant::now() + timeout;
        let mut expired = false;
        let mut completed = 0;
        for (id, mut handle) in snapshot {
            if expired {
                // Past the deadline only look, never wait.
                if handle.is_finished() {
                    completed += 1;
                }
                continue;
            }
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => completed += 1,
                Ok(Err(err)) => {
                    completed += 1;
                    warn!(item_id = %id, error = %err, "execution ended abnormally during drain");
                }
                // Dropping the handle detaches the execution without aborting it.
                Err(_) => expired = true,
            }
        }

        let abandoned = total - completed;
        if abandoned > 0 {
            warn!(abandoned, "shutdown budget exhausted; abandoning in-flight executions");
        }
        DrainOutcome {
            completed,
            abandoned,
        }
    }
}

/// Removes the execution's entry once it ends, including by panic.
struct CompletionGuard {
    registry: Arc<InFlightRegistry>,
    id: WorkItemId,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.registry.complete(self.id);
    }
}
