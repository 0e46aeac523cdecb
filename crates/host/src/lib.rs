//! Process wiring: the conversation adapter that turns delivered
//! continuations back into turns, and the console front end.

pub mod adapter;
pub mod console;

pub use adapter::ConversationAdapter;
pub use console::{Command, CommandParseError, ConsoleSender};
