//! The unit of deferred work.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::id::WorkItemId;
use crate::security::SecurityContext;
use crate::signal::ContinuationPayload;

/// Deferred work: run `payload` as `security` after an optional delay.
///
/// Items are created once per enqueue call and never retained after their
/// execution ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedWorkItem")]
pub struct WorkItem {
    id: WorkItemId,
    security: SecurityContext,
    payload: ContinuationPayload,
    delay_seconds: Option<u32>,
    enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    /// Build an item, rejecting missing identity or target.
    pub fn new(
        security: SecurityContext,
        payload: ContinuationPayload,
        delay_seconds: Option<u32>,
    ) -> Result<Self, DispatchError> {
        validate(&security, &payload)?;

        Ok(Self {
            id: WorkItemId::new(),
            security,
            payload,
            delay_seconds,
            enqueued_at: Utc::now(),
        })
    }

    pub fn id(&self) -> WorkItemId {
        self.id
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    pub fn payload(&self) -> &ContinuationPayload {
        &self.payload
    }

    pub fn delay_seconds(&self) -> Option<u32> {
        self.delay_seconds
    }

    /// Delay to apply before running; `None` and `Some(0)` both mean "run now".
    pub fn delay(&self) -> Option<Duration> {
        self.delay_seconds
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(u64::from(secs)))
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn into_parts(self) -> (SecurityContext, ContinuationPayload) {
        (self.security, self.payload)
    }
}

fn validate(security: &SecurityContext, payload: &ContinuationPayload) -> Result<(), DispatchError> {
    if !security.is_authenticated() {
        return Err(DispatchError::invalid_argument(
            "security context is required (anonymous context given)",
        ));
    }
    if payload.conversation_id().is_empty() {
        return Err(DispatchError::invalid_argument(
            "payload is required (conversation reference has no conversation id)",
        ));
    }
    Ok(())
}

/// Wire shape of a `WorkItem`; only reaches the real type through validation.
#[derive(Deserialize)]
struct UncheckedWorkItem {
    id: WorkItemId,
    security: SecurityContext,
    payload: ContinuationPayload,
    delay_seconds: Option<u32>,
    enqueued_at: DateTime<Utc>,
}

impl TryFrom<UncheckedWorkItem> for WorkItem {
    type Error = DispatchError;

    fn try_from(raw: UncheckedWorkItem) -> Result<Self, Self::Error> {
        validate(&raw.security, &raw.payload)?;
        Ok(Self {
            id: raw.id,
            security: raw.security,
            payload: raw.payload,
            delay_seconds: raw.delay_seconds,
            enqueued_at: raw.enqueued_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConversationReference, PrincipalId, Signal};

    fn payload(conversation: &str) -> ContinuationPayload {
        ContinuationPayload::new(
            ConversationReference::new(conversation, "test"),
            Signal::message("ping"),
        )
    }

    #[test]
    fn rejects_anonymous_context() {
        let err = WorkItem::new(SecurityContext::anonymous(), payload("c1"), None).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(msg) if msg.contains("security")));
    }

    #[test]
    fn rejects_missing_conversation() {
        let ctx = SecurityContext::channel(PrincipalId::new(), "app");
        let err = WorkItem::new(ctx, payload(""), Some(3)).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(msg) if msg.contains("payload")));
    }

    #[test]
    fn each_item_gets_its_own_identity() {
        let ctx = SecurityContext::channel(PrincipalId::new(), "app");
        let a = WorkItem::new(ctx.clone(), payload("c1"), None).unwrap();
        let b = WorkItem::new(ctx, payload("c1"), None).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
    }

    #[test]
    fn deserializing_applies_the_same_checks() {
        let ctx = SecurityContext::channel(PrincipalId::new(), "app");
        let item = WorkItem::new(ctx, payload("c1"), Some(2)).unwrap();
        let json = serde_json::to_value(&item).unwrap();

        let back: WorkItem = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, item);

        let mut anonymous = json.clone();
        anonymous["security"] = serde_json::to_value(SecurityContext::anonymous()).unwrap();
        let err = serde_json::from_value::<WorkItem>(anonymous).unwrap_err();
        assert!(err.to_string().contains("security context is required"));

        let mut targetless = json;
        targetless["payload"] = serde_json::to_value(payload("  ")).unwrap();
        assert!(serde_json::from_value::<WorkItem>(targetless).is_err());
    }

    #[test]
    fn zero_delay_means_no_delay() {
        let ctx = SecurityContext::channel(PrincipalId::new(), "app");
        let item = WorkItem::new(ctx.clone(), payload("c1"), Some(0)).unwrap();
        assert_eq!(item.delay(), None);

        let item = WorkItem::new(ctx, payload("c1"), Some(5)).unwrap();
        assert_eq!(item.delay(), Some(Duration::from_secs(5)));
    }
}
