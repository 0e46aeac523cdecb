//! Stdin/stdout conversation used by the host binary.

use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;

use deferral_core::{ConversationReference, DeliveryError};
use deferral_dialog::{MessageSender, OutboundMessage};

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/wait <seconds> <max ignored messages>`
    Wait {
        delay_seconds: u32,
        max_ignored_messages: u32,
    },
    /// `/stats`
    Stats,
    /// `/quit`
    Quit,
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CommandParseError(pub String);

impl FromStr for Command {
    type Err = CommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Command::Message(line.to_string()));
        };

        let mut parts = rest.split_whitespace();
        match parts.next() {
            Some("wait") => {
                let mut number = |what: &str| -> Result<u32, CommandParseError> {
                    parts
                        .next()
                        .ok_or_else(|| CommandParseError(format!("missing {what}")))?
                        .parse()
                        .map_err(|_| CommandParseError(format!("{what} must be a non-negative integer")))
                };
                let delay_seconds = number("seconds")?;
                let max_ignored_messages = number("max ignored messages")?;
                Ok(Command::Wait {
                    delay_seconds,
                    max_ignored_messages,
                })
            }
            Some("stats") => Ok(Command::Stats),
            Some("quit") | Some("exit") => Ok(Command::Quit),
            Some(other) => Err(CommandParseError(format!("unknown command /{other}"))),
            None => Err(CommandParseError("empty command".to_string())),
        }
    }
}

/// Prints bot messages to stdout.
#[derive(Debug, Clone, Default)]
pub struct ConsoleSender;

impl ConsoleSender {
    pub fn new() -> Self {
        Self
    }

    pub fn line(conversation: &ConversationReference, message: &OutboundMessage) -> String {
        format!("[{}] bot: {}", conversation.conversation_id, message.text)
    }
}

#[async_trait]
impl MessageSender for ConsoleSender {
    async fn send(
        &self,
        conversation: &ConversationReference,
        message: OutboundMessage,
    ) -> Result<(), DeliveryError> {
        println!("{}", Self::line(conversation, &message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wait() {
        assert_eq!(
            "/wait 5 2".parse::<Command>().unwrap(),
            Command::Wait {
                delay_seconds: 5,
                max_ignored_messages: 2
            }
        );
    }

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            "  hello there ".parse::<Command>().unwrap(),
            Command::Message("hello there".to_string())
        );
    }

    #[test]
    fn bad_commands_are_rejected() {
        assert!("/wait".parse::<Command>().is_err());
        assert!("/wait five 2".parse::<Command>().is_err());
        assert!("/wait 5 -1".parse::<Command>().is_err());
        assert!("/dance".parse::<Command>().is_err());
        assert_eq!("/quit".parse::<Command>().unwrap(), Command::Quit);
    }

    #[test]
    fn console_line_names_the_conversation() {
        let conv = ConversationReference::new("c-9", "console");
        assert_eq!(
            ConsoleSender::line(&conv, &OutboundMessage::text("hi")),
            "[c-9] bot: hi"
        );
    }
}
