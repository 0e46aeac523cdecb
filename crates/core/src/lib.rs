//! `deferral-core`: shared vocabulary for deferred work.
//!
//! This crate holds the data that crosses the boundary between request
//! handling and the background dispatcher: identities, the already
//! authenticated security context, conversation signals and the work item
//! itself. It has no runtime or IO concerns.

pub mod error;
pub mod id;
pub mod security;
pub mod signal;
pub mod work_item;

pub use error::{DeliveryError, DispatchError, DispatchResult};
pub use id::{ConversationId, OperationId, PrincipalId, WorkItemId};
pub use security::{Audience, CallerKind, SecurityContext};
pub use signal::{ContinuationPayload, ConversationReference, EventSignal, Signal, TIMED_OUT_EVENT};
pub use work_item::WorkItem;
