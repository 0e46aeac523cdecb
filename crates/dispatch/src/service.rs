//! Hosted-service facade over the queue and worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use deferral_core::{ContinuationPayload, DispatchResult, SecurityContext, WorkItemId};

use crate::config::DispatchConfig;
use crate::executor::SignalDelivery;
use crate::queue::WorkQueue;
use crate::worker::{DispatchHandle, DispatchStats, DispatchWorker, ShutdownReport};

/// Owns the work queue and drives the worker's `start` / `stop` lifecycle.
///
/// Producers only ever see `enqueue`, which is safe to call before `start`
/// (items wait in the queue) and after `stop` (items are never run).
pub struct DispatchService {
    queue: Arc<WorkQueue>,
    delivery: Arc<dyn SignalDelivery>,
    config: DispatchConfig,
    running: Mutex<Option<DispatchHandle>>,
}

impl DispatchService {
    pub fn new(delivery: Arc<dyn SignalDelivery>, config: DispatchConfig) -> Self {
        Self::with_queue(Arc::new(WorkQueue::new()), delivery, config)
    }

    /// Build around a queue that producers already hold.
    pub fn with_queue(
        queue: Arc<WorkQueue>,
        delivery: Arc<dyn SignalDelivery>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            delivery,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Fire-and-forget hand-off of deferred work.
    pub fn enqueue(
        &self,
        security: SecurityContext,
        payload: ContinuationPayload,
        delay_seconds: Option<u32>,
    ) -> DispatchResult<WorkItemId> {
        self.queue.enqueue(security, payload, delay_seconds)
    }

    /// Start the worker. Returns `false` if it was already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!(worker = %self.config.name, "dispatch service already started");
            return false;
        }

        info!(worker = %self.config.name, "starting dispatch service");
        let worker = DispatchWorker::new(self.queue.clone(), self.delivery.clone(), self.config.clone());
        *running = Some(worker.start());
        true
    }

    /// Stop the worker within `timeout`. `None` if it was not running.
    pub async fn stop(&self, timeout: Duration) -> Option<ShutdownReport> {
        let handle = self.running.lock().await.take()?;
        Some(handle.stop(timeout).await)
    }

    /// Stop using the configured shutdown budget.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        self.stop(self.config.shutdown_timeout).await
    }

    pub async fn stats(&self) -> Option<DispatchStats> {
        self.running.lock().await.as_ref().map(DispatchHandle::stats)
    }

    pub async fn in_flight(&self) -> usize {
        self.running
            .lock()
            .await
            .as_ref()
            .map_or(0, |handle| handle.registry().len())
    }
}

impl core::fmt::Debug for DispatchService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DispatchService")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}
