//! Deterministic engine for exercising sessions without native code.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::inference::{EngineError, GenerationRequest, HandleId, InferenceEngine, LoadParams, TokenSink};

/// Emits `t0`, `t1`, ... up to `max_tokens`, optionally sleeping per token.
#[derive(Default)]
pub(crate) struct ScriptedEngine {
    token_delay: Duration,
    load_delay: Duration,
    unload_delay: Duration,
    tokens_emitted: AtomicU64,
    fail_next_load: Mutex<Option<String>>,
    fail_after: Mutex<Option<u32>>,
    cancelled: AtomicBool,
    generating: AtomicBool,
    freed_mid_generation: AtomicBool,
    next_id: AtomicU64,
    live: Mutex<Vec<HandleId>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_token_delay(delay: Duration) -> Self {
        Self {
            token_delay: delay,
            ..Self::default()
        }
    }

    /// Makes every load block for `delay` before returning.
    pub(crate) fn load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub(crate) fn unload_delay(mut self, delay: Duration) -> Self {
        self.unload_delay = delay;
        self
    }

    pub(crate) fn fail_next_load(&self, message: &str) {
        *self.fail_next_load.lock().unwrap() = Some(message.to_string());
    }

    /// Makes every generation fail after emitting `tokens` tokens.
    pub(crate) fn fail_generation_after(&self, tokens: u32) {
        *self.fail_after.lock().unwrap() = Some(tokens);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Tokens handed to a sink so far, across all generations.
    pub(crate) fn tokens_emitted(&self) -> u64 {
        self.tokens_emitted.load(Ordering::SeqCst)
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// True if unload or reset ever ran while generate was still executing.
    pub(crate) fn freed_mid_generation(&self) -> bool {
        self.freed_mid_generation.load(Ordering::SeqCst)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn check_live(&self, handle: HandleId) -> Result<(), EngineError> {
        if self.live.lock().unwrap().contains(&handle) {
            Ok(())
        } else {
            Err(EngineError::UnknownHandle(handle))
        }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn load(&self, path: &Path, _params: &LoadParams) -> Result<HandleId, EngineError> {
        self.record(format!("load:{}", path.display()));
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        if let Some(message) = self.fail_next_load.lock().unwrap().take() {
            return Err(EngineError::ModelLoad(message));
        }
        let handle = HandleId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.live.lock().unwrap().push(handle);
        Ok(handle)
    }

    fn unload(&self, handle: HandleId) -> Result<(), EngineError> {
        self.record("unload");
        if !self.unload_delay.is_zero() {
            std::thread::sleep(self.unload_delay);
        }
        if self.generating.load(Ordering::SeqCst) {
            self.freed_mid_generation.store(true, Ordering::SeqCst);
        }
        self.check_live(handle)?;
        self.live.lock().unwrap().retain(|h| *h != handle);
        Ok(())
    }

    fn reset_context(&self, handle: HandleId) -> Result<(), EngineError> {
        self.record("reset");
        if self.generating.load(Ordering::SeqCst) {
            self.freed_mid_generation.store(true, Ordering::SeqCst);
        }
        self.check_live(handle)
    }

    fn generate(
        &self,
        handle: HandleId,
        request: &GenerationRequest,
        sink: &mut TokenSink<'_>,
    ) -> Result<(), EngineError> {
        self.check_live(handle)?;
        self.record("generate");
        self.cancelled.store(false, Ordering::SeqCst);
        self.generating.store(true, Ordering::SeqCst);
        let fail_after = *self.fail_after.lock().unwrap();

        let mut result = Ok(());
        for i in 0..request.max_tokens {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }
            if fail_after == Some(i) {
                result = Err(EngineError::Inference("scripted failure".to_string()));
                break;
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            self.tokens_emitted.fetch_add(1, Ordering::SeqCst);
            if let ControlFlow::Break(()) = sink(&format!("t{i}")) {
                break;
            }
        }

        self.generating.store(false, Ordering::SeqCst);
        result
    }

    fn cancel(&self, _handle: HandleId) {
        self.record("cancel");
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
