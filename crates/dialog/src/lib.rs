//! `deferral-dialog`: the client side of deferred work.
//!
//! A waiting operation hands a delayed timeout signal to a scheduler and then
//! reacts to each following turn until the timeout or the reprompt budget
//! ends it.

pub mod prompt;
pub mod scheduler;
pub mod state;
pub mod waiting;

pub use prompt::{MessageSender, OutboundMessage, PromptState, PromptTemplate, RenderError, TextTemplate};
pub use scheduler::{QueueTimeoutScheduler, TimeoutScheduler, TimerTimeoutScheduler};
pub use state::{CounterStore, InMemoryCounterStore, StateError};
pub use waiting::{DialogError, TurnContext, TurnResult, WaitOptions, WaitState, WaitingStateMachine};
