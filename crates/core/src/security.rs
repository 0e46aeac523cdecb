//! Authenticated caller identity carried with deferred work.
//!
//! Verification happens before anything is enqueued; this crate only carries
//! the result. Nothing here re-validates signatures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::PrincipalId;

/// Audience used when calling the channel directly (not on behalf of a skill).
pub const CHANNEL_AUDIENCE: &str = "channel";

/// Who originally called into the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CallerKind {
    /// A user-facing channel.
    Channel,
    /// Another agent invoking this one as a skill.
    Skill { caller_app_id: String },
}

/// Audience for an outbound continuation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Channel,
    App(String),
}

impl core::fmt::Display for Audience {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Audience::Channel => f.write_str(CHANNEL_AUDIENCE),
            Audience::App(app_id) => f.write_str(app_id),
        }
    }
}

/// Already-authenticated principal a work item runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    principal: Option<PrincipalId>,
    app_id: String,
    caller: CallerKind,
    authenticated_at: DateTime<Utc>,
}

impl SecurityContext {
    /// Context for a call that arrived from a channel.
    pub fn channel(principal: PrincipalId, app_id: impl Into<String>) -> Self {
        Self {
            principal: Some(principal),
            app_id: app_id.into(),
            caller: CallerKind::Channel,
            authenticated_at: Utc::now(),
        }
    }

    /// Context for a call made by another agent acting as skill consumer.
    pub fn skill(
        principal: PrincipalId,
        app_id: impl Into<String>,
        caller_app_id: impl Into<String>,
    ) -> Self {
        Self {
            principal: Some(principal),
            app_id: app_id.into(),
            caller: CallerKind::Skill {
                caller_app_id: caller_app_id.into(),
            },
            authenticated_at: Utc::now(),
        }
    }

    /// Context with no principal attached. Never accepted for deferred work.
    pub fn anonymous() -> Self {
        Self {
            principal: None,
            app_id: String::new(),
            caller: CallerKind::Channel,
            authenticated_at: Utc::now(),
        }
    }

    pub fn principal(&self) -> Option<PrincipalId> {
        self.principal
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn caller(&self) -> &CallerKind {
        &self.caller
    }

    pub fn authenticated_at(&self) -> DateTime<Utc> {
        self.authenticated_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some() && !self.app_id.trim().is_empty()
    }

    /// Skill calls are answered on the calling app's id, everything else on the channel.
    pub fn audience(&self) -> Audience {
        match &self.caller {
            CallerKind::Skill { caller_app_id } => Audience::App(caller_app_id.clone()),
            CallerKind::Channel => Audience::Channel,
        }
    }
}
