//! Local inference session
//!
//! A serialized state machine around one loaded model.

pub mod error;
pub mod manager;
pub mod state;
#[cfg(test)]
pub(crate) mod testing;

pub use error::SessionError;
pub use manager::{SessionConfig, SessionManager};
pub use state::{SessionState, SessionStatus};
