//! One-shot admission gate.
//!
//! Normal operation hands out shared slots, one per admission decision.
//! Shutdown takes every slot at once and never gives them back. The semaphore
//! is fair, so once shutdown is queued no later admission can overtake it;
//! the `closed` flag is checked on both sides of the wait so nothing is
//! admitted after `begin_shutdown` has started, whatever its outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Upper bound on concurrently held admission slots.
const SHARED_SLOTS: u32 = 1 << 20;

/// Result of `begin_shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every shared slot was released in time; the exclusive slot is held.
    Acquired,
    /// Slots were still held when the timeout expired. The gate is closed anyway.
    TimedOut,
    /// Shutdown had already been started by an earlier call.
    AlreadyClosed,
}

/// Shared slot held while an admission decision is in progress.
///
/// Released on drop, on every exit path.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct AdmissionGate {
    slots: Arc<Semaphore>,
    closed: AtomicBool,
    exclusive: Mutex<Option<OwnedSemaphorePermit>>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Semaphore::new(SHARED_SLOTS as usize)),
            closed: AtomicBool::new(false),
            exclusive: Mutex::new(None),
        }
    }

    /// Take a shared slot, waiting at most `timeout`.
    ///
    /// Returns `None` when the gate is closing/closed or the wait timed out;
    /// the caller must then skip the gated work.
    pub async fn try_admit(&self, timeout: Duration) -> Option<AdmissionPermit> {
        if self.is_closed() {
            return None;
        }

        let permit = match tokio::time::timeout(timeout, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return None,
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "admission wait timed out");
                return None;
            }
        };

        // Shutdown may have started while we were waiting.
        if self.is_closed() {
            return None;
        }

        Some(AdmissionPermit { _permit: permit })
    }

    /// Close the gate for good, waiting up to `timeout` for held slots.
    ///
    /// After this returns no `try_admit` succeeds, whether or not the
    /// exclusive slot was obtained. Only the first call does any work.
    pub async fn begin_shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        if self.closed.swap(true, Ordering::SeqCst) {
            return ShutdownOutcome::AlreadyClosed;
        }

        info!(
            held = self.active(),
            timeout_ms = timeout.as_millis() as u64,
            "admission gate closing"
        );

        let outcome = match tokio::time::timeout(
            timeout,
            self.slots.clone().acquire_many_owned(SHARED_SLOTS),
        )
        .await
        {
            Ok(Ok(permit)) => {
                *self.exclusive.lock().await = Some(permit);
                ShutdownOutcome::Acquired
            }
            Ok(Err(_)) => ShutdownOutcome::TimedOut,
            Err(_) => {
                warn!(held = self.active(), "admission slots still held at shutdown timeout");
                ShutdownOutcome::TimedOut
            }
        };

        // Fail any waiter still queued behind the exclusive request.
        self.slots.close();
        outcome
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shared slots currently held.
    pub fn active(&self) -> usize {
        if self.slots.is_closed() {
            return 0;
        }
        (SHARED_SLOTS as usize).saturating_sub(self.slots.available_permits())
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}
