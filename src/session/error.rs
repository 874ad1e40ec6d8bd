//! Errors raised by the session state machine.

use std::path::PathBuf;

use thiserror::Error;

use crate::inference::EngineError;
use crate::session::state::SessionState;

#[derive(Debug, Error, Clone)]
pub enum SessionError {
    #[error("A model is already loaded from {}; unload it first", .0.display())]
    AlreadyLoaded(PathBuf),

    #[error("No model loaded")]
    NotLoaded,

    #[error("Session is busy ({0})")]
    Busy(SessionState),

    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SessionError {
    /// True for errors caused by calling an operation in the wrong state
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            SessionError::AlreadyLoaded(_) | SessionError::NotLoaded | SessionError::Busy(_)
        )
    }
}
