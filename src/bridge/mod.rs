//! Host bridge
//!
//! Translates host method calls into session and store operations and streams
//! their events back out. The concrete backend is chosen once at startup: a
//! native runtime when a llama.cpp engine is available, otherwise a runtime
//! that rejects every call.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::inference::{GenerationStats, InferenceEngine, LoadParams};
use crate::session::{SessionError, SessionManager, SessionStatus};
use crate::storage::{ModelInfo, ModelSource, ModelStore, RuntimeSettings, StorageError};

pub mod host;
pub mod protocol;

pub use protocol::{
    BridgeCall, BridgeEvent, CallResult, DeleteModelParams, EnsureModelParams, GenerateParams,
    LoadModelParams, Request, Response,
};

/// Errors surfaced to the host; each carries a stable [`code`](BridgeError::code)
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Offline inference is not supported on this platform")]
    UnsupportedPlatform,
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Session(e) => match e {
                SessionError::AlreadyLoaded(_) => "ALREADY_LOADED",
                SessionError::NotLoaded => "NOT_LOADED",
                SessionError::Busy(_) => "BUSY",
                SessionError::Load(_) => "LOAD_ERROR",
                SessionError::Generation(_) => "GENERATION_ERROR",
                SessionError::InvalidArgument(_) => "INVALID_ARGUMENT",
                SessionError::Engine(_) => "ENGINE_ERROR",
            },
            BridgeError::Storage(e) => match e {
                StorageError::Download(_) => "DOWNLOAD_ERROR",
                StorageError::Integrity { .. } => "INTEGRITY_ERROR",
                StorageError::ModelNotFound(_) => "NOT_FOUND",
                StorageError::InvalidFilename(_) => "INVALID_ARGUMENT",
                _ => "STORAGE_ERROR",
            },
            BridgeError::InvalidArgument(_) => "INVALID_ARGUMENT",
            BridgeError::UnsupportedPlatform => "UNSUPPORTED_PLATFORM",
        }
    }
}

/// Receives the events of one call
///
/// `emit` may wait while the host is not reading; the caller stops producing
/// until it returns.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: BridgeEvent);
}

/// Backend behind the bridge
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    async fn ensure_model(
        &self,
        params: EnsureModelParams,
        events: &dyn EventSink,
    ) -> Result<PathBuf, BridgeError>;

    fn list_models(&self) -> Result<Vec<ModelInfo>, BridgeError>;

    fn delete_model(&self, filename: &str) -> Result<(), BridgeError>;

    async fn load_model(&self, params: LoadModelParams) -> Result<(), BridgeError>;

    async fn unload_model(&self) -> Result<(), BridgeError>;

    async fn clear_context(&self) -> Result<(), BridgeError>;

    /// Streams tokens as `tokenEvent`s, then emits `generationComplete`.
    async fn generate(
        &self,
        params: GenerateParams,
        events: &dyn EventSink,
    ) -> Result<GenerationStats, BridgeError>;

    async fn cancel_generation(&self) -> Result<(), BridgeError>;

    fn model_info(&self) -> Result<SessionStatus, BridgeError>;

    /// Best-effort release of everything held. Never fails.
    async fn shutdown(&self);
}

/// Runtime backed by a real engine
pub struct NativeRuntime {
    session: SessionManager,
    store: ModelStore,
    settings: RuntimeSettings,
}

impl NativeRuntime {
    pub fn new(engine: Arc<dyn InferenceEngine>, store: ModelStore, settings: RuntimeSettings) -> Self {
        Self {
            session: SessionManager::new(engine, settings.session_config()),
            store,
            settings,
        }
    }

}

#[async_trait]
impl InferenceRuntime for NativeRuntime {
    async fn ensure_model(
        &self,
        params: EnsureModelParams,
        events: &dyn EventSink,
    ) -> Result<PathBuf, BridgeError> {
        if params.url.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("url must not be empty".to_string()));
        }
        let source = ModelSource {
            url: params.url,
            filename: params.filename,
            sha256: params.integrity_hash.filter(|h| !h.trim().is_empty()),
        };

        // At most one event per percent, so the relay queue stays small
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let download = self.store.resolve(&source, move |progress| {
            let _ = progress_tx.send(progress);
        });
        let relay = async {
            while let Some(progress) = progress_rx.recv().await {
                events.emit(BridgeEvent::ModelDownloadProgress(progress)).await;
            }
        };
        let (path, ()) = tokio::join!(download, relay);
        Ok(path?)
    }

    fn list_models(&self) -> Result<Vec<ModelInfo>, BridgeError> {
        Ok(self.store.list()?)
    }

    fn delete_model(&self, filename: &str) -> Result<(), BridgeError> {
        Ok(self.store.delete(filename)?)
    }

    async fn load_model(&self, params: LoadModelParams) -> Result<(), BridgeError> {
        if params.path.as_os_str().is_empty() {
            return Err(BridgeError::InvalidArgument("path must not be empty".to_string()));
        }
        let defaults = self.settings.load_params();
        let load = LoadParams {
            context_size: params.context_size.unwrap_or(defaults.context_size),
            thread_count: params.thread_count.unwrap_or(defaults.thread_count),
            gpu_offload: params.use_metal.unwrap_or(defaults.gpu_offload),
        };
        self.session.load_model(&params.path, load).await?;
        Ok(())
    }

    async fn unload_model(&self) -> Result<(), BridgeError> {
        Ok(self.session.unload_model().await?)
    }

    async fn clear_context(&self) -> Result<(), BridgeError> {
        Ok(self.session.clear_context().await?)
    }

    async fn generate(
        &self,
        params: GenerateParams,
        events: &dyn EventSink,
    ) -> Result<GenerationStats, BridgeError> {
        let mut request = self.settings.generation_request(params.prompt);
        if let Some(max_tokens) = params.max_tokens {
            request.max_tokens = max_tokens;
        }
        if let Some(temperature) = params.temperature {
            request.temperature = temperature;
        }
        if let Some(top_p) = params.top_p {
            request.top_p = top_p;
        }
        if let Some(top_k) = params.top_k {
            request.top_k = top_k;
        }
        if let Some(repeat_penalty) = params.repeat_penalty {
            request.repeat_penalty = repeat_penalty;
        }

        let stream = self.session.generate(request).await?;
        let stats = stream
            .for_each_token(move |token| events.emit(BridgeEvent::TokenEvent { token }))
            .await
            .map_err(SessionError::Generation)?;

        events.emit(BridgeEvent::GenerationComplete(stats.clone())).await;
        Ok(stats)
    }

    async fn cancel_generation(&self) -> Result<(), BridgeError> {
        self.session.cancel_generation().await;
        Ok(())
    }

    fn model_info(&self) -> Result<SessionStatus, BridgeError> {
        Ok(self.session.status())
    }

    async fn shutdown(&self) {
        self.session.shutdown().await
    }
}

/// Runtime for builds without an inference backend
pub struct UnavailableRuntime;

#[async_trait]
impl InferenceRuntime for UnavailableRuntime {
    async fn ensure_model(&self, _: EnsureModelParams, _: &dyn EventSink) -> Result<PathBuf, BridgeError> {
        Err(BridgeError::UnsupportedPlatform)
    }

    fn list_models(&self) -> Result<Vec<ModelInfo>, BridgeError> {
        Err(BridgeError::UnsupportedPlatform)
    }

    fn delete_model(&self, _: &str) -> Result<(), BridgeError> {
        Err(BridgeError::UnsupportedPlatform)
    }

    async fn load_model(&self, _: LoadModelParams) -> Result<(), BridgeError> {
        Err(BridgeError::UnsupportedPlatform)
    }

    async fn unload_model(&self) -> Result<(), BridgeError> {
        Err(BridgeError::UnsupportedPlatform)
    }

    async fn clear_context(&self) -> Result<(), BridgeError> {
        Err(BridgeError::UnsupportedPlatform)
    }

    async fn generate(&self, _: GenerateParams, _: &dyn EventSink) -> Result<GenerationStats, BridgeError> {
        Err(BridgeError::UnsupportedPlatform)
    }

    async fn cancel_generation(&self) -> Result<(), BridgeError> {
        Err(BridgeError::UnsupportedPlatform)
    }

    fn model_info(&self) -> Result<SessionStatus, BridgeError> {
        Err(BridgeError::UnsupportedPlatform)
    }

    async fn shutdown(&self) {}
}

/// Picks the runtime for this build
#[cfg(feature = "llama")]
pub fn select_runtime(settings: RuntimeSettings) -> Arc<dyn InferenceRuntime> {
    match crate::inference::LlamaEngine::new() {
        Ok(engine) => {
            tracing::info!("Using native llama.cpp runtime");
            let store = ModelStore::new(settings.models_directory.clone());
            Arc::new(NativeRuntime::new(Arc::new(engine), store, settings))
        }
        Err(e) => {
            tracing::error!("Failed to initialize llama.cpp backend: {}", e);
            Arc::new(UnavailableRuntime)
        }
    }
}

/// Picks the runtime for this build
#[cfg(not(feature = "llama"))]
pub fn select_runtime(_settings: RuntimeSettings) -> Arc<dyn InferenceRuntime> {
    tracing::warn!("Built without the `llama` feature; inference is unavailable");
    Arc::new(UnavailableRuntime)
}

/// Entry point for host calls
pub struct BridgeAdapter {
    runtime: Arc<dyn InferenceRuntime>,
}

impl BridgeAdapter {
    pub fn new(runtime: Arc<dyn InferenceRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn dispatch(&self, call: BridgeCall, events: &dyn EventSink) -> Result<CallResult, BridgeError> {
        tracing::debug!("Bridge call: {}", call.method());
        let result = match call {
            BridgeCall::EnsureModel(params) => CallResult::Path {
                path: self.runtime.ensure_model(params, events).await?,
            },
            BridgeCall::ListDownloadedModels => CallResult::Models {
                models: self.runtime.list_models()?,
            },
            BridgeCall::DeleteModel(params) => {
                self.runtime.delete_model(&params.filename)?;
                CallResult::Done
            }
            BridgeCall::LoadModel(params) => {
                self.runtime.load_model(params).await?;
                CallResult::Done
            }
            BridgeCall::UnloadModel => {
                self.runtime.unload_model().await?;
                CallResult::Done
            }
            BridgeCall::ClearContext => {
                self.runtime.clear_context().await?;
                CallResult::Done
            }
            BridgeCall::Generate(params) => CallResult::Stats(self.runtime.generate(params, events).await?),
            BridgeCall::CancelGeneration => {
                self.runtime.cancel_generation().await?;
                CallResult::Done
            }
            BridgeCall::GetModelInfo => CallResult::ModelInfo(self.runtime.model_info()?),
        };
        Ok(result)
    }

    /// Decodes and dispatches one request, folding any failure into the response.
    pub async fn handle(&self, request: Request, events: &dyn EventSink) -> Response {
        let outcome = match BridgeCall::parse(&request.method, request.params) {
            Ok(call) => self.dispatch(call, events).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            tracing::warn!(code = e.code(), "{} failed: {}", request.method, e);
        }
        Response::from_outcome(request.id, outcome)
    }

    pub async fn teardown(&self) {
        self.runtime.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedEngine;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<BridgeEvent>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<BridgeEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, event: BridgeEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn native(engine: ScriptedEngine, dir: &TempDir, settings: RuntimeSettings) -> Arc<BridgeAdapter> {
        let store = ModelStore::new(dir.path().join("models"));
        let runtime = NativeRuntime::new(Arc::new(engine), store, settings);
        Arc::new(BridgeAdapter::new(Arc::new(runtime)))
    }

    fn call(method: &str, params: serde_json::Value) -> BridgeCall {
        BridgeCall::parse(method, params).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_generate_unload_scenario() {
        let dir = TempDir::new().unwrap();
        let bridge = native(ScriptedEngine::new(), &dir, RuntimeSettings::default());
        let sink = RecordingSink::default();

        bridge
            .dispatch(call("loadModel", json!({"path": "/models/test.gguf"})), &sink)
            .await
            .unwrap();

        let result = bridge
            .dispatch(call("generate", json!({"prompt": "hi", "maxTokens": 5})), &sink)
            .await
            .unwrap();
        let CallResult::Stats(stats) = result else {
            panic!("expected stats");
        };
        assert_eq!(stats.token_count, 5);
        assert!(!stats.cancelled);

        let events = sink.events();
        assert_eq!(events.len(), 6);
        for (i, event) in events[..5].iter().enumerate() {
            assert_eq!(event, &BridgeEvent::TokenEvent { token: format!("t{i}") });
        }
        assert_eq!(events[5], BridgeEvent::GenerationComplete(stats));

        bridge.dispatch(BridgeCall::UnloadModel, &sink).await.unwrap();
        let info = bridge.dispatch(BridgeCall::GetModelInfo, &sink).await.unwrap();
        let value = serde_json::to_value(info).unwrap();
        assert_eq!(value["loaded"], json!(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_defaults_come_from_settings() {
        let dir = TempDir::new().unwrap();
        let settings = RuntimeSettings {
            context_size: 1024,
            thread_count: 3,
            ..RuntimeSettings::default()
        };
        let bridge = native(ScriptedEngine::new(), &dir, settings);
        let sink = RecordingSink::default();

        bridge
            .dispatch(call("loadModel", json!({"path": "/models/a.gguf", "nThreads": 8})), &sink)
            .await
            .unwrap();
        let CallResult::ModelInfo(status) = bridge.dispatch(BridgeCall::GetModelInfo, &sink).await.unwrap() else {
            panic!("expected model info");
        };
        assert!(status.loaded);
        assert_eq!(status.context_size, 1024);
        assert_eq!(status.thread_count, 8);
        assert_eq!(status.model_path, Some(PathBuf::from("/models/a.gguf")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_codes() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new();
        engine.fail_next_load("unsupported format");
        let bridge = native(engine, &dir, RuntimeSettings::default());
        let sink = RecordingSink::default();
        let load = || call("loadModel", json!({"path": "/models/test.gguf"}));

        let err = bridge.dispatch(load(), &sink).await.unwrap_err();
        assert_eq!(err.code(), "LOAD_ERROR");

        let err = bridge
            .dispatch(call("generate", json!({"prompt": "hi"})), &sink)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_LOADED");

        bridge.dispatch(load(), &sink).await.unwrap();
        let err = bridge.dispatch(load(), &sink).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_LOADED");

        let err = bridge
            .dispatch(call("deleteModel", json!({"filename": "missing.gguf"})), &sink)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        let err = bridge
            .dispatch(
                call("ensureModel", json!({"url": "http://127.0.0.1:9/x", "filename": "../x.gguf"})),
                &sink,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_context_size_rejected() {
        let dir = TempDir::new().unwrap();
        let bridge = native(ScriptedEngine::new(), &dir, RuntimeSettings::default());
        let sink = RecordingSink::default();

        let err = bridge
            .dispatch(call("loadModel", json!({"path": "/m.gguf", "contextSize": 0})), &sink)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
        let CallResult::ModelInfo(status) = bridge.dispatch(BridgeCall::GetModelInfo, &sink).await.unwrap() else {
            panic!("expected model info");
        };
        assert!(!status.loaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_interrupts_running_generate() {
        let dir = TempDir::new().unwrap();
        let bridge = native(
            ScriptedEngine::with_token_delay(Duration::from_millis(2)),
            &dir,
            RuntimeSettings::default(),
        );
        let sink = Arc::new(RecordingSink::default());
        bridge
            .dispatch(call("loadModel", json!({"path": "/models/test.gguf"})), &*sink)
            .await
            .unwrap();

        let running = {
            let bridge = bridge.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                bridge
                    .dispatch(call("generate", json!({"prompt": "go", "maxTokens": 100000})), &*sink)
                    .await
            })
        };

        while sink.events().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let err = bridge
            .dispatch(call("generate", json!({"prompt": "again"})), &*sink)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BUSY");

        bridge
            .dispatch(call("stopInference", serde_json::Value::Null), &*sink)
            .await
            .unwrap();
        let CallResult::Stats(stats) = running.await.unwrap().unwrap() else {
            panic!("expected stats");
        };
        assert!(stats.cancelled);
        assert!(stats.token_count < 100000);

        let tokens = sink.events().iter().filter(|e| matches!(e, BridgeEvent::TokenEvent { .. })).count();
        assert_eq!(tokens as u64, stats.token_count);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_generation_failure_keeps_partial_tokens() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new();
        engine.fail_generation_after(3);
        let bridge = native(engine, &dir, RuntimeSettings::default());
        let sink = RecordingSink::default();

        bridge
            .dispatch(call("loadModel", json!({"path": "/models/test.gguf"})), &sink)
            .await
            .unwrap();
        let err = bridge
            .dispatch(call("generate", json!({"prompt": "hi", "maxTokens": 10})), &sink)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "GENERATION_ERROR");
        assert_eq!(sink.events().len(), 3);

        let CallResult::ModelInfo(status) = bridge.dispatch(BridgeCall::GetModelInfo, &sink).await.unwrap() else {
            panic!("expected model info");
        };
        assert_eq!(status.state, crate::session::SessionState::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_calls() {
        let dir = TempDir::new().unwrap();
        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(models.join("cached.gguf"), b"GGUF").unwrap();
        let bridge = native(ScriptedEngine::new(), &dir, RuntimeSettings::default());
        let sink = RecordingSink::default();

        let result = bridge
            .dispatch(
                call("ensureModel", json!({"url": "http://127.0.0.1:9/cached.gguf", "filename": "cached.gguf"})),
                &sink,
            )
            .await
            .unwrap();
        assert_eq!(result, CallResult::Path { path: models.join("cached.gguf") });
        assert!(sink.events().is_empty());

        let result = bridge.dispatch(BridgeCall::ListDownloadedModels, &sink).await.unwrap();
        let value = serde_json::to_value(result).unwrap();
        assert_eq!(value["models"][0]["filename"], json!("cached.gguf"));
        assert_eq!(value["models"][0]["sizeBytes"], json!(4));

        bridge
            .dispatch(call("deleteModel", json!({"filename": "cached.gguf"})), &sink)
            .await
            .unwrap();
        assert!(!models.join("cached.gguf").exists());
    }

    #[tokio::test]
    async fn test_unavailable_runtime_rejects_everything() {
        let bridge = BridgeAdapter::new(Arc::new(UnavailableRuntime));
        let sink = RecordingSink::default();
        let calls = vec![
            call("ensureModel", json!({"url": "u", "filename": "f.gguf"})),
            BridgeCall::ListDownloadedModels,
            call("deleteModel", json!({"filename": "f.gguf"})),
            call("loadModel", json!({"path": "/m.gguf"})),
            BridgeCall::UnloadModel,
            BridgeCall::ClearContext,
            call("generate", json!({"prompt": "hi"})),
            BridgeCall::CancelGeneration,
            BridgeCall::GetModelInfo,
        ];
        for c in calls {
            let method = c.method();
            let err = bridge.dispatch(c, &sink).await.unwrap_err();
            assert_eq!(err.code(), "UNSUPPORTED_PLATFORM", "{method}");
        }
        bridge.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handle_folds_errors_into_response() {
        let dir = TempDir::new().unwrap();
        let bridge = native(ScriptedEngine::new(), &dir, RuntimeSettings::default());
        let sink = RecordingSink::default();

        let request: Request = serde_json::from_value(json!({"id": 3, "method": "nope"})).unwrap();
        let response = bridge.handle(request, &sink).await;
        assert!(!response.ok);
        assert_eq!(response.id, json!(3));
        assert_eq!(response.error.unwrap().code, "INVALID_ARGUMENT");

        let request: Request = serde_json::from_value(json!({"id": 4, "method": "unloadModel"})).unwrap();
        let response = bridge.handle(request, &sink).await;
        assert!(response.ok);
    }
}
