//! Process-wide logging setup shared by every binary in the workspace.

pub mod tracing;

pub use crate::tracing::{LOG_FORMAT_ENV, LogFormat};

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    crate::tracing::init();
}
