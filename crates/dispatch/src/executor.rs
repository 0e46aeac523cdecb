//! Execution of a single admitted work item.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use deferral_core::{
    Audience, ContinuationPayload, DeliveryError, DispatchError, SecurityContext, WorkItem,
};

/// Outbound "deliver this signal to that conversation" call.
///
/// Implemented by the conversation transport. The security context has
/// already been verified; implementations only use it to act on behalf of the
/// original caller.
#[async_trait]
pub trait SignalDelivery: Send + Sync + 'static {
    async fn deliver(
        &self,
        security: &SecurityContext,
        audience: &Audience,
        payload: &ContinuationPayload,
    ) -> Result<(), DeliveryError>;
}

#[async_trait]
impl<D> SignalDelivery for Arc<D>
where
    D: SignalDelivery + ?Sized,
{
    async fn deliver(
        &self,
        security: &SecurityContext,
        audience: &Audience,
        payload: &ContinuationPayload,
    ) -> Result<(), DeliveryError> {
        (**self).deliver(security, audience, payload).await
    }
}

/// Applies an item's delay, then delivers its payload.
#[derive(Clone)]
pub struct Executor {
    delivery: Arc<dyn SignalDelivery>,
}

impl Executor {
    pub fn new(delivery: Arc<dyn SignalDelivery>) -> Self {
        Self { delivery }
    }

    /// Run `item` to completion. Failures are returned, never retried.
    pub async fn execute(&self, item: WorkItem) -> Result<(), DispatchError> {
        let id = item.id();

        if let Some(delay) = item.delay() {
            debug!(item_id = %id, delay_secs = delay.as_secs(), "delaying work item");
            tokio::time::sleep(delay).await;
        }

        let audience = item.security().audience();
        let (security, payload) = item.into_parts();

        debug!(
            item_id = %id,
            conversation = %payload.conversation_id(),
            signal = payload.signal.kind(),
            audience = %audience,
            "delivering continuation"
        );

        self.delivery
            .deliver(&security, &audience, &payload)
            .await
            .map_err(|source| DispatchError::execution(id, source))
    }
}

impl core::fmt::Debug for Executor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use deferral_core::{ConversationReference, PrincipalId, Signal};

    use super::*;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(Audience, ContinuationPayload)>>,
        fail: bool,
    }

    #[async_trait]
    impl SignalDelivery for Recording {
        async fn deliver(
            &self,
            _security: &SecurityContext,
            audience: &Audience,
            payload: &ContinuationPayload,
        ) -> Result<(), DeliveryError> {
            self.calls
                .lock()
                .unwrap()
                .push((audience.clone(), payload.clone()));
            if self.fail {
                return Err(DeliveryError::rejected("channel unavailable"));
            }
            Ok(())
        }
    }

    fn item(security: SecurityContext, delay: Option<u32>) -> WorkItem {
        let payload = ContinuationPayload::new(
            ConversationReference::new("conv-1", "test"),
            Signal::message("hello"),
        );
        WorkItem::new(security, payload, delay).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_delay_before_delivering() {
        let delivery = Arc::new(Recording::default());
        let executor = Executor::new(delivery.clone());
        let ctx = SecurityContext::channel(PrincipalId::new(), "app");

        let started = tokio::time::Instant::now();
        executor.execute(item(ctx, Some(3))).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(delivery.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn skill_context_delivers_to_caller_app() {
        let delivery = Arc::new(Recording::default());
        let executor = Executor::new(delivery.clone());
        let ctx = SecurityContext::skill(PrincipalId::new(), "app", "root-bot");

        executor.execute(item(ctx, None)).await.unwrap();

        let calls = delivery.calls.lock().unwrap();
        assert_eq!(calls[0].0, Audience::App("root-bot".to_string()));
    }

    #[tokio::test]
    async fn delivery_failure_becomes_execution_failure() {
        let delivery = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let executor = Executor::new(delivery);
        let ctx = SecurityContext::channel(PrincipalId::new(), "app");
        let work = item(ctx, None);
        let id = work.id();

        let err = executor.execute(work).await.unwrap_err();
        assert!(err.is_delivery_failure());
        assert!(matches!(err, DispatchError::ExecutionFailure { item, .. } if item == id));
    }
}
