//! Prompt templates and the outbound message seam.
//!
//! Templates are handlebars text with `{{placeholder}}` fields filled from
//! the waiting operation's current state. Output is plain text, so nothing is
//! HTML-escaped.

use async_trait::async_trait;
use handlebars::{Handlebars, no_escape};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use deferral_core::{ConversationReference, DeliveryError, OperationId};

const TEMPLATE_NAME: &str = "prompt";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The template does not parse or names a field that does not exist.
    #[error("invalid prompt template: {0}")]
    Invalid(String),
    #[error("prompt rendering failed: {0}")]
    Render(String),
}

/// Message sent back into the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// State a prompt is rendered against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptState<'a> {
    pub operation: &'a OperationId,
    pub conversation: &'a ConversationReference,
    /// Which reprompt this is (1 for the first).
    pub reprompt: u32,
    pub max_ignored_messages: u32,
}

impl<'a> PromptState<'a> {
    fn context(&self) -> PromptContext<'a> {
        PromptContext {
            reprompt: self.reprompt,
            max: self.max_ignored_messages,
            remaining: self.max_ignored_messages.saturating_sub(self.reprompt),
            operation: self.operation.as_str(),
            conversation: self.conversation.conversation_id.as_str(),
            user: self.conversation.user_id.as_deref().unwrap_or(""),
        }
    }
}

/// Fields a template may reference.
#[derive(Debug, Serialize)]
struct PromptContext<'a> {
    reprompt: u32,
    max: u32,
    remaining: u32,
    operation: &'a str,
    conversation: &'a str,
    /// Empty when the transport did not identify the user.
    user: &'a str,
}

impl PromptContext<'static> {
    fn sample() -> Self {
        Self {
            reprompt: 1,
            max: 1,
            remaining: 0,
            operation: "",
            conversation: "",
            user: "",
        }
    }
}

/// Renders an outbound message from the waiting operation's state.
pub trait PromptTemplate: Send + Sync + core::fmt::Debug {
    fn render(&self, state: &PromptState<'_>) -> Result<OutboundMessage, RenderError>;
}

/// Sends a message into a conversation (transport collaborator).
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        conversation: &ConversationReference,
        message: OutboundMessage,
    ) -> Result<(), DeliveryError>;
}

/// Handlebars-backed prompt.
///
/// Supported fields: `reprompt`, `max`, `remaining`, `operation`,
/// `conversation`, `user`. Strict mode is on and the template is rendered
/// once against sample values while parsing, so a misspelled field fails at
/// `parse` rather than mid-conversation.
pub struct TextTemplate {
    source: String,
    registry: Handlebars<'static>,
}

impl TextTemplate {
    pub fn parse(source: &str) -> Result<Self, RenderError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(no_escape);
        registry
            .register_template_string(TEMPLATE_NAME, source)
            .map_err(|err| RenderError::Invalid(err.to_string()))?;
        registry
            .render(TEMPLATE_NAME, &PromptContext::sample())
            .map_err(|err| RenderError::Invalid(err.to_string()))?;

        Ok(Self {
            source: source.to_string(),
            registry,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl PromptTemplate for TextTemplate {
    fn render(&self, state: &PromptState<'_>) -> Result<OutboundMessage, RenderError> {
        let text = self
            .registry
            .render(TEMPLATE_NAME, &state.context())
            .map_err(|err| RenderError::Render(err.to_string()))?;
        Ok(OutboundMessage { text })
    }
}

impl core::fmt::Debug for TextTemplate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TextTemplate")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
