//! How a waiting operation's timeout signal gets produced.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use deferral_core::{ContinuationPayload, SecurityContext};
use deferral_dispatch::{SignalDelivery, WorkQueue};

use crate::waiting::DialogError;

/// Arranges for `payload` to be delivered after `delay_seconds`.
///
/// Must return without waiting for the delay.
pub trait TimeoutScheduler: Send + Sync {
    fn schedule(
        &self,
        security: SecurityContext,
        payload: ContinuationPayload,
        delay_seconds: u32,
    ) -> Result<(), DialogError>;
}

/// Hands the timeout to the shared work queue and dispatch worker.
///
/// Covered by the worker's admission gate and shutdown drain.
#[derive(Debug, Clone)]
pub struct QueueTimeoutScheduler {
    queue: Arc<WorkQueue>,
}

impl QueueTimeoutScheduler {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }
}

impl TimeoutScheduler for QueueTimeoutScheduler {
    fn schedule(
        &self,
        security: SecurityContext,
        payload: ContinuationPayload,
        delay_seconds: u32,
    ) -> Result<(), DialogError> {
        let id = self.queue.enqueue(security, payload, Some(delay_seconds))?;
        debug!(item_id = %id, delay_secs = delay_seconds, "timeout queued");
        Ok(())
    }
}

/// Spawns a one-off timer task per timeout that delivers the signal itself.
///
/// Not tracked by the dispatch worker: a pending timer is simply lost when
/// the process exits.
#[derive(Clone)]
pub struct TimerTimeoutScheduler {
    delivery: Arc<dyn SignalDelivery>,
}

impl TimerTimeoutScheduler {
    pub fn new(delivery: Arc<dyn SignalDelivery>) -> Self {
        Self { delivery }
    }
}

impl core::fmt::Debug for TimerTimeoutScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerTimeoutScheduler").finish_non_exhaustive()
    }
}

impl TimeoutScheduler for TimerTimeoutScheduler {
    fn schedule(
        &self,
        security: SecurityContext,
        payload: ContinuationPayload,
        delay_seconds: u32,
    ) -> Result<(), DialogError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DialogError::NoRuntime)?;
        let delivery = self.delivery.clone();

        runtime.spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(delay_seconds))).await;
            let audience = security.audience();
            if let Err(err) = delivery.deliver(&security, &audience, &payload).await {
                error!(
                    conversation = %payload.conversation_id(),
                    error = %err,
                    "timer timeout delivery failed"
                );
            }
        });
        Ok(())
    }
}
