//! Hand-off queue between request handlers and the dispatch worker.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use deferral_core::{ContinuationPayload, DispatchResult, SecurityContext, WorkItem, WorkItemId};

/// Multi-producer, single-consumer FIFO of work items.
///
/// - `enqueue` never blocks or suspends
/// - `dequeue_blocking` suspends until an item arrives or the token fires
/// - Items come out in the order their `enqueue` calls completed
#[derive(Debug)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: Mutex<mpsc::UnboundedReceiver<WorkItem>>,
    len: AtomicUsize,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            len: AtomicUsize::new(0),
        }
    }

    /// Queue work to run in the background, optionally after `delay_seconds`.
    ///
    /// Fails with `InvalidArgument` when the context is anonymous or the
    /// payload has no target conversation.
    pub fn enqueue(
        &self,
        security: SecurityContext,
        payload: ContinuationPayload,
        delay_seconds: Option<u32>,
    ) -> DispatchResult<WorkItemId> {
        let item = WorkItem::new(security, payload, delay_seconds)?;
        Ok(self.push(item))
    }

    /// Queue an item that was already built.
    pub fn push(&self, item: WorkItem) -> WorkItemId {
        let id = item.id();
        self.len.fetch_add(1, Ordering::SeqCst);
        // The queue owns a receiver for its whole lifetime, so the channel
        // cannot be closed while `self` is alive.
        if self.tx.send(item).is_err() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(item_id = %id, "work item queued");
        id
    }

    /// Wait for the next item, or `None` once `cancel` has fired.
    ///
    /// An already-cancelled token returns immediately and leaves queued items
    /// in place.
    pub async fn dequeue_blocking(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        if cancel.is_cancelled() {
            return None;
        }

        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };

        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = rx.recv() => item,
        };

        if item.is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Number of items waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use deferral_core::{ConversationReference, DispatchError, PrincipalId, Signal};
    use proptest::prelude::*;

    use super::*;

    fn ctx() -> SecurityContext {
        SecurityContext::channel(PrincipalId::new(), "test-app")
    }

    fn payload(n: usize) -> ContinuationPayload {
        ContinuationPayload::new(
            ConversationReference::new(format!("conv-{n}"), "test"),
            Signal::message(format!("m{n}")),
        )
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();

        let ids: Vec<_> = (0..5)
            .map(|n| queue.enqueue(ctx(), payload(n), None).unwrap())
            .collect();
        assert_eq!(queue.len(), 5);

        for id in ids {
            let item = queue.dequeue_blocking(&cancel).await.unwrap();
            assert_eq!(item.id(), id);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn rejects_missing_fields_without_queueing() {
        let queue = WorkQueue::new();

        let err = queue
            .enqueue(SecurityContext::anonymous(), payload(1), None)
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_does_not_consume() {
        let queue = WorkQueue::new();
        let id = queue.enqueue(ctx(), payload(1), None).unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(queue.dequeue_blocking(&cancelled).await.is_none());
        assert_eq!(queue.len(), 1);

        let live = CancellationToken::new();
        assert_eq!(queue.dequeue_blocking(&live).await.unwrap().id(), id);
    }

    #[tokio::test]
    async fn cancel_unblocks_a_waiting_consumer() {
        let queue = Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue_blocking(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("consumer did not wake up")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn round_trip_preserves_every_field() {
        let queue = WorkQueue::new();
        let security = SecurityContext::skill(PrincipalId::new(), "bot", "parent");
        let sent = ContinuationPayload::new(
            ConversationReference::new("conv-rt", "msteams").with_user("user-7"),
            Signal::timed_out("op-rt".into()),
        );

        queue.enqueue(security.clone(), sent.clone(), Some(42)).unwrap();
        let item = queue.dequeue_blocking(&CancellationToken::new()).await.unwrap();

        assert_eq!(item.security(), &security);
        assert_eq!(item.payload(), &sent);
        assert_eq!(item.delay_seconds(), Some(42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_deliver_each_item_once() {
        let queue = Arc::new(WorkQueue::new());
        let mut producers = Vec::new();
        for p in 0..8 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                (0..50)
                    .map(|n| queue.enqueue(ctx(), payload(p * 100 + n), None).unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut expected = std::collections::HashSet::new();
        for producer in producers {
            expected.extend(producer.await.unwrap());
        }

        let cancel = CancellationToken::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..expected.len() {
            let item = queue.dequeue_blocking(&cancel).await.unwrap();
            assert!(seen.insert(item.id()), "item delivered twice");
        }
        assert_eq!(seen, expected);
        assert!(queue.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: whatever the interleaving of enqueues and dequeues, each
        /// dequeue returns the oldest item still queued.
        #[test]
        fn dequeue_always_returns_oldest(ops in prop::collection::vec(any::<bool>(), 1..64)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let queue = WorkQueue::new();
                let cancel = CancellationToken::new();
                let mut model = std::collections::VecDeque::new();

                for (n, enqueue) in ops.into_iter().enumerate() {
                    if enqueue || model.is_empty() {
                        model.push_back(queue.enqueue(ctx(), payload(n), None).unwrap());
                    } else {
                        let item = queue.dequeue_blocking(&cancel).await.unwrap();
                        assert_eq!(Some(item.id()), model.pop_front());
                    }
                }
                assert_eq!(queue.len(), model.len());
            });
        }
    }
}
