//! Session lifecycle states and the published status snapshot.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle of the session's single model slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Generating,
    Unloading,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Generating => "generating",
            SessionState::Unloading => "unloading",
        };
        f.write_str(name)
    }
}

/// Read-only view of the session, readable without the session lock
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Whether weights are resident (true in `Ready`, `Generating` and while unloading)
    pub loaded: bool,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    /// Context window of the loaded model, 0 when nothing is loaded
    pub context_size: u32,
    /// Decode threads of the loaded model, 0 when nothing is loaded
    pub thread_count: u32,
}

impl SessionStatus {
    pub(crate) fn unloaded() -> Self {
        Self {
            loaded: false,
            state: SessionState::Unloaded,
            model_path: None,
            context_size: 0,
            thread_count: 0,
        }
    }
}
