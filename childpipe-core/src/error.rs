use std::io;

use thiserror::Error;

/// Result alias used throughout the supervisor.
pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Errors produced while creating, driving, or tearing down a supervised child.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to create pipe: {source}")]
    PipeCreation {
        #[source]
        source: io::Error,
    },

    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("partial write to child stdin: wrote {written} of {expected} bytes")]
    PartialWrite {
        written: usize,
        expected: usize,
        #[source]
        source: Option<io::Error>,
    },

    #[error("child stdin pipe is closed")]
    ClosedPipe,

    #[error("waiting on the child process failed: {source}")]
    Wait {
        #[source]
        source: io::Error,
    },

    #[error("cannot {operation}: {reason}")]
    InvalidState {
        operation: &'static str,
        reason: &'static str,
    },

    #[error("invalid supervisor configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown code page `{0}`")]
    UnknownCodePage(String),

    #[error("failed to start output drain thread: {source}")]
    DrainStart {
        #[source]
        source: io::Error,
    },

    #[error("output drain stopped on read failure: {source}")]
    Drain {
        #[source]
        source: io::Error,
    },

    #[error("I/O error while {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    pub(crate) fn invalid_state(operation: &'static str, reason: &'static str) -> Self {
        Self::InvalidState { operation, reason }
    }

    /// True for errors that signal a programming mistake rather than an OS failure.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}
