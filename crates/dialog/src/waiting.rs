//! Waiting state machine for one pending operation.
//!
//! ```text
//!        begin             timeout signal / reprompt budget spent
//! Idle ────────▶ Waiting ──────────────────────────────────────▶ Ended
//!                  │  ▲
//!                  └──┘ message (reprompt), other events, other signals
//! ```
//!
//! The reprompt counter lives in conversation-scoped storage under a key
//! derived from the operation id and is deleted when the operation ends.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use deferral_core::{
    ContinuationPayload, ConversationReference, DeliveryError, DispatchError, OperationId,
    SecurityContext, Signal,
};

use crate::prompt::{MessageSender, PromptState, PromptTemplate, RenderError};
use crate::scheduler::TimeoutScheduler;
use crate::state::{CounterStore, StateError};

const REPROMPT_COUNT_KEY: &str = "waitRepromptCount";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    Idle,
    Waiting,
    Ended,
}

/// What the caller should do with the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnResult {
    /// The operation is still pending; keep routing signals to it.
    Waiting,
    /// The operation finished; drop it.
    Ended,
}

#[derive(Debug, Error)]
pub enum DialogError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("sending prompt failed: {0}")]
    Send(#[from] DeliveryError),
    #[error("operation is {0:?}, not waiting")]
    NotWaiting(WaitState),
    #[error("operation already started")]
    AlreadyStarted,
    #[error("no async runtime available to schedule the timeout")]
    NoRuntime,
}

/// Per-invocation settings.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub delay_seconds: u32,
    pub max_ignored_messages: u32,
    pub prompt: Option<Arc<dyn PromptTemplate>>,
}

impl WaitOptions {
    pub fn new(delay_seconds: u32, max_ignored_messages: u32) -> Self {
        Self {
            delay_seconds,
            max_ignored_messages,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PromptTemplate>) -> Self {
        self.prompt = Some(prompt);
        self
    }
}

/// One inbound turn as seen by the state machine.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub security: SecurityContext,
    pub conversation: ConversationReference,
    pub signal: Signal,
}

impl TurnContext {
    pub fn new(security: SecurityContext, conversation: ConversationReference, signal: Signal) -> Self {
        Self {
            security,
            conversation,
            signal,
        }
    }
}

pub struct WaitingStateMachine {
    operation: OperationId,
    state: WaitState,
    options: WaitOptions,
    scheduler: Arc<dyn TimeoutScheduler>,
    counters: Arc<dyn CounterStore>,
    sender: Arc<dyn MessageSender>,
}

impl WaitingStateMachine {
    pub fn new(
        operation: OperationId,
        scheduler: Arc<dyn TimeoutScheduler>,
        counters: Arc<dyn CounterStore>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            operation,
            state: WaitState::Idle,
            options: WaitOptions::new(0, 0),
            scheduler,
            counters,
            sender,
        }
    }

    pub fn operation(&self) -> &OperationId {
        &self.operation
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    fn counter_key(&self) -> String {
        format!("{REPROMPT_COUNT_KEY}:{}", self.operation)
    }

    /// Schedule the timeout signal and start waiting. Never blocks on the delay.
    ///
    /// The reprompt counter is not reset here: it is only ever removed when
    /// an operation ends.
    pub fn begin(&mut self, turn: &TurnContext, options: WaitOptions) -> Result<TurnResult, DialogError> {
        if self.state != WaitState::Idle {
            return Err(DialogError::AlreadyStarted);
        }

        let payload = ContinuationPayload::new(
            turn.conversation.clone(),
            Signal::timed_out(self.operation.clone()),
        );
        self.scheduler
            .schedule(turn.security.clone(), payload, options.delay_seconds)?;

        info!(
            operation = %self.operation,
            conversation = %turn.conversation.conversation_id,
            delay_secs = options.delay_seconds,
            max_ignored = options.max_ignored_messages,
            "waiting operation started"
        );
        self.options = options;
        self.state = WaitState::Waiting;
        Ok(TurnResult::Waiting)
    }

    /// Feed an inbound signal to a waiting operation.
    pub async fn on_signal(&mut self, turn: &TurnContext) -> Result<TurnResult, DialogError> {
        if self.state != WaitState::Waiting {
            return Err(DialogError::NotWaiting(self.state));
        }

        match &turn.signal {
            Signal::Event(_) if turn.signal.is_timeout_for(&self.operation) => {
                self.end(turn, "timeout signal received").await
            }
            Signal::Message { .. } => self.on_message(turn).await,
            other => {
                debug!(operation = %self.operation, kind = other.kind(), "ignoring signal while waiting");
                Ok(TurnResult::Waiting)
            }
        }
    }

    async fn on_message(&mut self, turn: &TurnContext) -> Result<TurnResult, DialogError> {
        let scope = &turn.conversation.conversation_id;
        let key = self.counter_key();
        let count = self.counters.get(scope, &key, 0).await?;

        if count >= self.options.max_ignored_messages {
            return self.end(turn, "reprompt budget exhausted").await;
        }

        if let Some(prompt) = &self.options.prompt {
            let message = prompt.render(&PromptState {
                operation: &self.operation,
                conversation: &turn.conversation,
                reprompt: count + 1,
                max_ignored_messages: self.options.max_ignored_messages,
            })?;
            self.sender.send(&turn.conversation, message).await?;
        }

        self.counters.set(scope, &key, count + 1).await?;
        debug!(operation = %self.operation, reprompts = count + 1, "reprompted while waiting");
        Ok(TurnResult::Waiting)
    }

    async fn end(&mut self, turn: &TurnContext, reason: &str) -> Result<TurnResult, DialogError> {
        self.counters
            .delete(&turn.conversation.conversation_id, &self.counter_key())
            .await?;
        self.state = WaitState::Ended;
        info!(operation = %self.operation, reason, "waiting operation ended");
        Ok(TurnResult::Ended)
    }
}

impl core::fmt::Debug for WaitingStateMachine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitingStateMachine")
            .field("operation", &self.operation)
            .field("state", &self.state)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use deferral_core::{ConversationId, PrincipalId};
    use proptest::prelude::*;

    use super::*;
    use crate::prompt::{OutboundMessage, TextTemplate};
    use crate::state::InMemoryCounterStore;

    #[derive(Default)]
    struct Scheduled(Mutex<Vec<(ContinuationPayload, u32)>>);

    impl TimeoutScheduler for Scheduled {
        fn schedule(
            &self,
            _security: SecurityContext,
            payload: ContinuationPayload,
            delay_seconds: u32,
        ) -> Result<(), DialogError> {
            self.0.lock().unwrap().push((payload, delay_seconds));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Outbox(Mutex<Vec<String>>);

    #[async_trait]
    impl MessageSender for Outbox {
        async fn send(
            &self,
            _conversation: &ConversationReference,
            message: OutboundMessage,
        ) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().push(message.text);
            Ok(())
        }
    }

    struct Fixture {
        machine: WaitingStateMachine,
        scheduled: Arc<Scheduled>,
        outbox: Arc<Outbox>,
        counters: Arc<InMemoryCounterStore>,
    }

    fn fixture() -> Fixture {
        let scheduled = Arc::new(Scheduled::default());
        let outbox = Arc::new(Outbox::default());
        let counters = Arc::new(InMemoryCounterStore::new());
        let machine = WaitingStateMachine::new(
            OperationId::new("wait-1"),
            scheduled.clone(),
            counters.clone(),
            outbox.clone(),
        );
        Fixture {
            machine,
            scheduled,
            outbox,
            counters,
        }
    }

    fn turn(signal: Signal) -> TurnContext {
        TurnContext::new(
            SecurityContext::channel(PrincipalId::new(), "app"),
            ConversationReference::new("conv-1", "test"),
            signal,
        )
    }

    fn options(max: u32) -> WaitOptions {
        let prompt = TextTemplate::parse("still working ({{reprompt}}/{{max}})").unwrap();
        WaitOptions::new(5, max).with_prompt(Arc::new(prompt))
    }

    fn conv() -> ConversationId {
        ConversationId::new("conv-1")
    }

    #[test]
    fn begin_schedules_timeout_and_waits() {
        let mut f = fixture();
        let result = f.machine.begin(&turn(Signal::message("go")), options(2)).unwrap();

        assert_eq!(result, TurnResult::Waiting);
        assert_eq!(f.machine.state(), WaitState::Waiting);

        let scheduled = f.scheduled.0.lock().unwrap();
        assert_eq!(scheduled.len(), 1);
        let (payload, delay) = &scheduled[0];
        assert_eq!(*delay, 5);
        assert!(payload.signal.is_timeout_for(&OperationId::new("wait-1")));
        assert_eq!(payload.conversation_id(), &conv());
    }

    #[test]
    fn begin_twice_is_rejected() {
        let mut f = fixture();
        f.machine.begin(&turn(Signal::message("go")), options(2)).unwrap();
        let err = f.machine.begin(&turn(Signal::message("go")), options(2)).unwrap_err();
        assert!(matches!(err, DialogError::AlreadyStarted));
    }

    #[tokio::test]
    async fn two_ignored_messages_reprompt_then_third_ends() {
        let mut f = fixture();
        f.machine.begin(&turn(Signal::message("go")), options(2)).unwrap();

        for _ in 0..2 {
            let result = f.machine.on_signal(&turn(Signal::message("are you done?"))).await.unwrap();
            assert_eq!(result, TurnResult::Waiting);
        }
        assert_eq!(
            *f.outbox.0.lock().unwrap(),
            vec!["still working (1/2)".to_string(), "still working (2/2)".to_string()]
        );

        let result = f.machine.on_signal(&turn(Signal::message("hello?"))).await.unwrap();
        assert_eq!(result, TurnResult::Ended);
        assert_eq!(f.machine.state(), WaitState::Ended);
        assert_eq!(f.outbox.0.lock().unwrap().len(), 2);
        assert_eq!(f.counters.count(&conv()), 0);
    }

    #[tokio::test]
    async fn timeout_ends_regardless_of_reprompts() {
        let mut f = fixture();
        f.machine.begin(&turn(Signal::message("go")), options(5)).unwrap();
        f.machine.on_signal(&turn(Signal::message("1"))).await.unwrap();
        f.machine.on_signal(&turn(Signal::message("2"))).await.unwrap();
        assert_eq!(f.counters.count(&conv()), 1);

        let timeout = Signal::timed_out(OperationId::new("wait-1"));
        let result = f.machine.on_signal(&turn(timeout)).await.unwrap();

        assert_eq!(result, TurnResult::Ended);
        assert_eq!(f.counters.count(&conv()), 0);
    }

    #[tokio::test]
    async fn unrelated_events_and_signals_are_ignored() {
        let mut f = fixture();
        f.machine.begin(&turn(Signal::message("go")), options(1)).unwrap();

        let foreign_timeout = Signal::timed_out(OperationId::new("someone-else"));
        for signal in [Signal::event("cardAction"), foreign_timeout, Signal::other("typing")] {
            let result = f.machine.on_signal(&turn(signal)).await.unwrap();
            assert_eq!(result, TurnResult::Waiting);
        }
        assert!(f.outbox.0.lock().unwrap().is_empty());
        assert_eq!(f.counters.count(&conv()), 0);
    }

    #[tokio::test]
    async fn without_prompt_messages_still_count() {
        let mut f = fixture();
        f.machine.begin(&turn(Signal::message("go")), WaitOptions::new(5, 1)).unwrap();

        assert_eq!(
            f.machine.on_signal(&turn(Signal::message("x"))).await.unwrap(),
            TurnResult::Waiting
        );
        assert_eq!(
            f.machine.on_signal(&turn(Signal::message("y"))).await.unwrap(),
            TurnResult::Ended
        );
        assert!(f.outbox.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn signals_outside_waiting_are_errors() {
        let mut f = fixture();
        let err = f.machine.on_signal(&turn(Signal::message("early"))).await.unwrap_err();
        assert!(matches!(err, DialogError::NotWaiting(WaitState::Idle)));

        f.machine.begin(&turn(Signal::message("go")), options(0)).unwrap();
        f.machine.on_signal(&turn(Signal::message("end"))).await.unwrap();
        let err = f.machine.on_signal(&turn(Signal::message("late"))).await.unwrap_err();
        assert!(matches!(err, DialogError::NotWaiting(WaitState::Ended)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: with budget `max`, message number `max + 1` ends the
        /// operation and exactly `max` prompts were sent before it.
        #[test]
        fn reprompt_budget_is_exact(max in 0u32..8) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let mut f = fixture();
                f.machine.begin(&turn(Signal::message("go")), options(max)).unwrap();

                for _ in 0..max {
                    let result = f.machine.on_signal(&turn(Signal::message("?"))).await.unwrap();
                    assert_eq!(result, TurnResult::Waiting);
                }
                let result = f.machine.on_signal(&turn(Signal::message("?"))).await.unwrap();
                assert_eq!(result, TurnResult::Ended);
                assert_eq!(f.outbox.0.lock().unwrap().len(), max as usize);
                assert_eq!(f.counters.count(&conv()), 0);
            });
        }
    }
}
