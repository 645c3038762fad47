//! Session-level error taxonomy.
//!
//! Every [`AgentError`] ends the session. Recoverable conditions (declined
//! commands, invalid answers, commands that fail to start) are handled where
//! they occur and never reach this type.

use std::io;

use thiserror::Error;

use crate::conversation::RenderError;
use crate::engine::EngineError;

/// Broad category used for the exit report and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    ContextExhausted,
    Template,
    Protocol,
    Io,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::ContextExhausted => "context_exhausted",
            ErrorCategory::Template => "template",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Io => "io",
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to build prompt: {0}")]
    Render(#[from] RenderError),
    #[error("terminal I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl AgentError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            AgentError::Engine(err) | AgentError::Render(RenderError::Engine(err)) => engine_category(err),
            AgentError::Render(_) => ErrorCategory::Template,
            AgentError::Io(_) => ErrorCategory::Io,
        }
    }
}

fn engine_category(err: &EngineError) -> ErrorCategory {
    match err {
        EngineError::Template(_) => ErrorCategory::Template,
        EngineError::ContextExhausted(_) => ErrorCategory::ContextExhausted,
        EngineError::Status { .. } | EngineError::Transport(_) => ErrorCategory::Network,
        EngineError::Protocol(_) => ErrorCategory::Protocol,
    }
}
