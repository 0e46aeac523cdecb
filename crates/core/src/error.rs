//! Dispatch error model.

use thiserror::Error;

use crate::id::WorkItemId;

/// Result type used by the dispatch surface.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Failure of the outbound "deliver signal to conversation" call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The target conversation is unknown to the transport.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// The transport refused the call (auth, throttling, closed channel...).
    #[error("delivery rejected: {0}")]
    Rejected(String),

    /// Handling the delivered signal failed inside the conversation turn.
    #[error("turn failed: {0}")]
    Turn(String),
}

impl DeliveryError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn turn(msg: impl Into<String>) -> Self {
        Self::Turn(msg.into())
    }
}

/// Errors of the deferred-work subsystem.
///
/// Only `InvalidArgument` ever reaches a caller: it is returned synchronously
/// from `enqueue`. The other variants describe why a background item ended
/// without delivering and are only ever logged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A required work item field was missing.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The item was dropped because admission was refused (shutdown in progress).
    #[error("work item {0} not admitted: shutting down")]
    AdmissionTimeout(WorkItemId),

    /// Running the item's payload failed.
    #[error("work item {item} failed: {source}")]
    ExecutionFailure {
        item: WorkItemId,
        #[source]
        source: DeliveryError,
    },
}

impl DispatchError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn execution(item: WorkItemId, source: DeliveryError) -> Self {
        Self::ExecutionFailure { item, source }
    }

    /// Whether a delivery call was the root cause.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, Self::ExecutionFailure { .. })
    }
}
