//! Dispatch worker loop and shutdown coordination.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use deferral_core::DispatchError;

use crate::config::DispatchConfig;
use crate::executor::{Executor, SignalDelivery};
use crate::gate::{AdmissionGate, ShutdownOutcome};
use crate::queue::WorkQueue;
use crate::registry::InFlightRegistry;

/// Lifecycle of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Draining,
    Stopped,
}

/// Counters for what the worker did with dequeued items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub dequeued: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// What happened during `stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub gate: ShutdownOutcome,
    pub completed: usize,
    pub abandoned: usize,
    pub elapsed: Duration,
}

type SharedStats = Arc<Mutex<DispatchStats>>;

fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut DispatchStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Background consumer of the work queue.
///
/// One worker per queue. Each admitted item runs on its own task, so a long
/// delay never holds up the next dequeue.
#[derive(Debug)]
pub struct DispatchWorker {
    queue: Arc<WorkQueue>,
    gate: Arc<AdmissionGate>,
    registry: Arc<InFlightRegistry>,
    executor: Executor,
    config: DispatchConfig,
}

impl DispatchWorker {
    pub fn new(
        queue: Arc<WorkQueue>,
        delivery: Arc<dyn SignalDelivery>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            gate: Arc::new(AdmissionGate::new()),
            registry: InFlightRegistry::arc(),
            executor: Executor::new(delivery),
            config,
        }
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    /// Spawn the worker loop on the current tokio runtime.
    pub fn start(self) -> DispatchHandle {
        let cancel = CancellationToken::new();
        let stats: SharedStats = Arc::default();
        let (state_tx, state_rx) = watch::channel(WorkerState::Running);

        let name = self.config.name.clone();
        let shutdown_timeout = self.config.shutdown_timeout;
        let gate = self.gate.clone();
        let registry = self.registry.clone();
        let join = tokio::spawn(worker_loop(self, cancel.clone(), stats.clone(), state_tx));

        DispatchHandle {
            name,
            shutdown_timeout,
            cancel,
            gate,
            registry,
            stats,
            state: state_rx,
            join: Some(join),
        }
    }
}

async fn worker_loop(
    worker: DispatchWorker,
    cancel: CancellationToken,
    stats: SharedStats,
    state: watch::Sender<WorkerState>,
) {
    let DispatchWorker {
        queue,
        gate,
        registry,
        executor,
        config,
    } = worker;
    let name: Arc<str> = Arc::from(config.name.as_str());

    info!(worker = %name, "dispatch worker started");

    while let Some(item) = queue.dequeue_blocking(&cancel).await {
        let id = item.id();
        update_stats(&stats, |s| s.dequeued += 1);

        // The slot covers the admission decision and hand-off only.
        let Some(permit) = gate.try_admit(config.admission_timeout).await else {
            update_stats(&stats, |s| s.rejected += 1);
            warn!(
                worker = %name,
                error = %DispatchError::AdmissionTimeout(id),
                conversation = %item.payload().conversation_id(),
                "work item dropped"
            );
            continue;
        };

        update_stats(&stats, |s| s.admitted += 1);
        debug!(
            worker = %name,
            item_id = %id,
            queued_for_ms = (chrono::Utc::now() - item.enqueued_at()).num_milliseconds(),
            "work item admitted"
        );

        let executor = executor.clone();
        let stats = stats.clone();
        let name = name.clone();
        registry.spawn(id, async move {
            match AssertUnwindSafe(executor.execute(item)).catch_unwind().await {
                Ok(Ok(())) => {
                    update_stats(&stats, |s| s.succeeded += 1);
                    debug!(worker = %name, item_id = %id, "work item completed");
                }
                Ok(Err(err)) => {
                    update_stats(&stats, |s| s.failed += 1);
                    error!(worker = %name, item_id = %id, error = %err, "work item execution failed");
                }
                Err(panic) => {
                    update_stats(&stats, |s| s.failed += 1);
                    error!(
                        worker = %name,
                        item_id = %id,
                        panic = panic_message(panic.as_ref()),
                        "work item execution panicked"
                    );
                }
            }
        });

        drop(permit);
    }

    state.send_replace(WorkerState::Draining);
    debug!(worker = %name, queued = queue.len(), "dispatch worker no longer dequeuing");

    state.send_replace(WorkerState::Stopped);
    info!(worker = %name, "dispatch worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Handle to observe and stop a running worker.
#[derive(Debug)]
pub struct DispatchHandle {
    name: String,
    shutdown_timeout: Duration,
    cancel: CancellationToken,
    gate: Arc<AdmissionGate>,
    registry: Arc<InFlightRegistry>,
    stats: SharedStats,
    state: watch::Receiver<WorkerState>,
    join: Option<JoinHandle<()>>,
}

impl DispatchHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    /// Stop using the configured shutdown budget.
    pub async fn shutdown(self) -> ShutdownReport {
        let timeout = self.shutdown_timeout;
        self.stop(timeout).await
    }

    /// Close admissions, drain in-flight work, then stop the loop.
    ///
    /// Closing the gate and draining share the single `timeout` budget.
    /// Executions still running at the deadline are left running, unawaited.
    pub async fn stop(mut self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + timeout;
        info!(
            worker = %self.name,
            timeout_secs = timeout.as_secs_f64(),
            "dispatch worker is stopping"
        );

        let gate = self.gate.begin_shutdown(timeout).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let drain = self.registry.drain(remaining).await;

        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(worker = %self.name, error = %err, "dispatch worker loop panicked");
            }
        }

        let report = ShutdownReport {
            gate,
            completed: drain.completed,
            abandoned: drain.abandoned,
            elapsed: started.elapsed(),
        };
        info!(
            worker = %self.name,
            completed = report.completed,
            abandoned = report.abandoned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "dispatch worker shut down"
        );
        report
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
