//! LLM inference engine
//!
//! The engine contract, stream types, and the llama.cpp backend.

pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{
    EngineError, GenerationRequest, HandleId, InferenceEngine, LoadParams, ModelHandle, TokenSink,
    DEFAULT_CONTEXT_SIZE, DEFAULT_THREAD_COUNT,
};
#[cfg(feature = "llama")]
pub use llama::LlamaEngine;
pub use model::{validate_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use streaming::{GenerationStats, StreamEvent, TokenStream};
