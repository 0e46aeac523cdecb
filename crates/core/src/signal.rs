//! Inbound signals and the continuation payload that carries them.

use serde::{Deserialize, Serialize};

use crate::id::{ConversationId, OperationId};

/// Name of the event a waiting operation's deferred timeout delivers.
pub const TIMED_OUT_EVENT: &str = "timedOutEvent";

/// Where a continuation should land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationReference {
    pub conversation_id: ConversationId,
    pub channel_id: String,
    pub user_id: Option<String>,
}

impl ConversationReference {
    pub fn new(conversation_id: impl Into<ConversationId>, channel_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            channel_id: channel_id.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// A named event delivered into a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSignal {
    pub name: String,
    /// Operation the event belongs to, when it targets one.
    pub operation: Option<OperationId>,
    pub value: Option<serde_json::Value>,
}

/// Anything that can arrive in a conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Signal {
    /// Text typed by the user.
    Message { text: String },
    /// Named event (deferred timeouts, client events, ...).
    Event(EventSignal),
    /// Typing indicators, membership updates and the like.
    Other { kind: String },
}

impl Signal {
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message { text: text.into() }
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self::Event(EventSignal {
            name: name.into(),
            operation: None,
            value: None,
        })
    }

    /// The timeout notification for `operation`.
    pub fn timed_out(operation: OperationId) -> Self {
        Self::Event(EventSignal {
            name: TIMED_OUT_EVENT.to_string(),
            operation: Some(operation),
            value: None,
        })
    }

    pub fn other(kind: impl Into<String>) -> Self {
        Self::Other { kind: kind.into() }
    }

    /// True for the timeout event addressed to `operation`.
    ///
    /// A timeout event without an operation id matches any operation.
    pub fn is_timeout_for(&self, operation: &OperationId) -> bool {
        match self {
            Signal::Event(ev) if ev.name == TIMED_OUT_EVENT => {
                ev.operation.as_ref().is_none_or(|op| op == operation)
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Signal::Message { .. } => "message",
            Signal::Event(_) => "event",
            Signal::Other { kind } => kind,
        }
    }
}

/// Continuation description: which conversation, which signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationPayload {
    pub conversation: ConversationReference,
    pub signal: Signal,
}

impl ContinuationPayload {
    pub fn new(conversation: ConversationReference, signal: Signal) -> Self {
        Self {
            conversation,
            signal,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation.conversation_id
    }
}
