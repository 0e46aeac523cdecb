//! Routes turns, inbound or proactive, to the conversation's waiting operation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use deferral_core::{
    Audience, ContinuationPayload, ConversationId, DeliveryError, OperationId, SecurityContext,
};
use deferral_dialog::{
    CounterStore, DialogError, MessageSender, OutboundMessage, TimeoutScheduler, TurnContext,
    TurnResult, WaitOptions, WaitingStateMachine,
};
use deferral_dispatch::SignalDelivery;

type ActiveWait = Arc<Mutex<WaitingStateMachine>>;

/// At most one waiting operation per conversation.
pub struct ConversationAdapter {
    scheduler: Arc<dyn TimeoutScheduler>,
    counters: Arc<dyn CounterStore>,
    sender: Arc<dyn MessageSender>,
    completion_notice: Option<String>,
    active: Mutex<HashMap<ConversationId, ActiveWait>>,
}

impl ConversationAdapter {
    pub fn new(
        scheduler: Arc<dyn TimeoutScheduler>,
        counters: Arc<dyn CounterStore>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            scheduler,
            counters,
            sender,
            completion_notice: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Text sent to the conversation whenever one of its waits ends.
    pub fn with_completion_notice(mut self, text: impl Into<String>) -> Self {
        self.completion_notice = Some(text.into());
        self
    }

    /// Start a waiting operation in the turn's conversation.
    pub async fn begin_wait(
        &self,
        turn: &TurnContext,
        operation: OperationId,
        options: WaitOptions,
    ) -> Result<TurnResult, DialogError> {
        let conversation = turn.conversation.conversation_id.clone();
        let mut active = self.active.lock().await;
        if active.contains_key(&conversation) {
            return Err(DialogError::AlreadyStarted);
        }

        let mut machine = WaitingStateMachine::new(
            operation,
            self.scheduler.clone(),
            self.counters.clone(),
            self.sender.clone(),
        );
        let result = machine.begin(turn, options)?;
        if result == TurnResult::Waiting {
            active.insert(conversation, Arc::new(Mutex::new(machine)));
        }
        Ok(result)
    }

    /// Route a turn. `Ok(None)` when the conversation has nothing waiting.
    ///
    /// A failing turn is reported to the user and wipes the conversation's
    /// stored state before the error is returned.
    pub async fn handle_turn(&self, turn: &TurnContext) -> Result<Option<TurnResult>, DialogError> {
        match self.route(turn).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.on_turn_error(turn, &err).await;
                Err(err)
            }
        }
    }

    pub async fn is_waiting(&self, conversation: &ConversationId) -> bool {
        self.active.lock().await.contains_key(conversation)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    async fn route(&self, turn: &TurnContext) -> Result<Option<TurnResult>, DialogError> {
        let conversation = &turn.conversation.conversation_id;
        let Some(wait) = self.active.lock().await.get(conversation).cloned() else {
            debug!(conversation = %conversation, signal = turn.signal.kind(), "no waiting operation");
            return Ok(None);
        };

        let result = wait.lock().await.on_signal(turn).await?;
        if result == TurnResult::Ended {
            self.forget(conversation, &wait).await;
            if let Some(notice) = &self.completion_notice {
                self.sender
                    .send(&turn.conversation, OutboundMessage::text(notice.clone()))
                    .await?;
            }
        }
        Ok(Some(result))
    }

    async fn forget(&self, conversation: &ConversationId, wait: &ActiveWait) {
        let mut active = self.active.lock().await;
        if active
            .get(conversation)
            .is_some_and(|current| Arc::ptr_eq(current, wait))
        {
            active.remove(conversation);
        }
    }

    async fn on_turn_error(&self, turn: &TurnContext, err: &DialogError) {
        let conversation = &turn.conversation.conversation_id;
        error!(conversation = %conversation, error = %err, "unhandled turn error");

        if let Err(send_err) = self
            .sender
            .send(&turn.conversation, OutboundMessage::text(err.to_string()))
            .await
        {
            error!(conversation = %conversation, error = %send_err, "failed to report turn error");
        }

        if let Err(clear_err) = self.counters.clear(conversation).await {
            error!(conversation = %conversation, error = %clear_err, "failed to clear conversation state");
        }
        self.active.lock().await.remove(conversation);
    }
}

#[async_trait]
impl SignalDelivery for ConversationAdapter {
    async fn deliver(
        &self,
        security: &SecurityContext,
        audience: &Audience,
        payload: &ContinuationPayload,
    ) -> Result<(), DeliveryError> {
        debug!(
            conversation = %payload.conversation_id(),
            audience = %audience,
            signal = payload.signal.kind(),
            "continuing conversation"
        );

        let turn = TurnContext::new(security.clone(), payload.conversation.clone(), payload.signal.clone());
        match self.handle_turn(&turn).await {
            Ok(Some(TurnResult::Ended)) => {
                info!(conversation = %payload.conversation_id(), "waiting operation completed");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => Err(DeliveryError::turn(err.to_string())),
        }
    }
}

impl core::fmt::Debug for ConversationAdapter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConversationAdapter")
            .field("completion_notice", &self.completion_notice)
            .finish_non_exhaustive()
    }
}
