//! Offline LLM
//!
//! Runs a local GGUF model behind a serialized session and exposes it to a
//! host through a small request/event bridge.

pub mod bridge;
pub mod inference;
pub mod session;
pub mod storage;

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backwards from max_bytes to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
