//! Inference engine contract
//!
//! The session manager drives any backend through [`InferenceEngine`]. The
//! engine is opaque: it loads weights, produces tokens, and honors
//! cancellation. Everything about lifecycle ordering is the session's job.
//!
//! # Threading
//!
//! All methods are blocking. Callers must run `load`, `unload`,
//! `reset_context` and `generate` on a blocking worker thread; `cancel` is
//! cheap and may be called from any thread while `generate` is running.

use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::model::ModelError;

/// Default context window in tokens.
pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;
/// Default number of CPU threads used for decoding.
pub const DEFAULT_THREAD_COUNT: u32 = 4;

/// Errors reported by an inference backend
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Unknown model handle: {0}")]
    UnknownHandle(HandleId),

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Engine-assigned identifier of a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Parameters for loading a model into the engine
#[derive(Debug, Clone, PartialEq)]
pub struct LoadParams {
    /// Context window size in tokens
    pub context_size: u32,
    /// Decode threads
    pub thread_count: u32,
    /// Offload every layer to the GPU when the backend supports it
    pub gpu_offload: bool,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
            thread_count: DEFAULT_THREAD_COUNT,
            gpu_offload: false,
        }
    }
}

/// A single generation call.
///
/// Immutable once handed to the session; the in-flight generation owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// The input prompt text
    pub prompt: String,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Repetition penalty
    pub repeat_penalty: f32,
}

impl GenerationRequest {
    /// Creates a request for `prompt` with the default sampling parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Checks that the sampling parameters are usable.
    pub fn validate(&self) -> Result<(), String> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(format!("temperature must be >= 0, got {}", self.temperature));
        }
        if !self.top_p.is_finite() || !(0.0..=1.0).contains(&self.top_p) {
            return Err(format!("topP must be within 0..=1, got {}", self.top_p));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(format!(
                "repeatPenalty must be > 0, got {}",
                self.repeat_penalty
            ));
        }
        Ok(())
    }
}

/// Receives generated tokens in order.
///
/// Returning [`ControlFlow::Break`] asks the engine to stop after the current
/// token, exactly like [`InferenceEngine::cancel`].
pub type TokenSink<'a> = dyn FnMut(&str) -> ControlFlow<()> + Send + 'a;

/// Primitives of a native inference backend.
pub trait InferenceEngine: Send + Sync {
    /// Loads the model at `path`. Heavy; call from a blocking thread.
    fn load(&self, path: &Path, params: &LoadParams) -> Result<HandleId, EngineError>;

    /// Releases the model. Never called while a generation is running.
    fn unload(&self, handle: HandleId) -> Result<(), EngineError>;

    /// Clears conversational state but keeps the weights loaded.
    fn reset_context(&self, handle: HandleId) -> Result<(), EngineError>;

    /// Runs a generation, feeding every token to `sink`, and returns once it
    /// finished naturally or was cancelled.
    fn generate(
        &self,
        handle: HandleId,
        request: &GenerationRequest,
        sink: &mut TokenSink<'_>,
    ) -> Result<(), EngineError>;

    /// Requests early termination of the running generation. No-op when idle.
    fn cancel(&self, handle: HandleId);
}

/// A model as the session sees it after a successful load.
///
/// Never handed out to callers; only the session talks to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelHandle {
    pub(crate) id: HandleId,
    pub context_size: u32,
    pub thread_count: u32,
    pub source_path: PathBuf,
}
