//! Session manager
//!
//! Owns the single loaded model and serializes every lifecycle transition
//! behind one async lock ("the session lock").
//!
//! # Architecture
//!
//! - State transitions happen with the session lock held. Engine calls that
//!   can take a while (load, unload, reset) run on the blocking pool.
//! - A generation holds no lock while it runs: the state says `Generating`
//!   and a driver task owns the engine call. It takes the lock once more to
//!   move back to `Ready` before it sends the terminal event.
//! - Waiters (cancel, unload, teardown) park on `transitions`, which is
//!   notified on every change made under the lock.
//! - `status()` reads a snapshot republished on every change and never
//!   touches the session lock.

use std::future::Future;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard, Notify};

use crate::inference::{
    EngineError, GenerationRequest, GenerationStats, HandleId, InferenceEngine, LoadParams,
    ModelHandle, StreamEvent, TokenStream,
};
use crate::session::error::SessionError;
use crate::session::state::{SessionState, SessionStatus};
use crate::truncate_str;

/// Tunables of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tokens buffered between the engine and a slow consumer before the
    /// engine is paused
    pub stream_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 64,
        }
    }
}

/// Handle to one inference session.
///
/// Cheap to clone; clones share the same model slot. When the last clone is
/// dropped any still-loaded model is released.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

struct Shared {
    engine: Arc<dyn InferenceEngine>,
    config: SessionConfig,
    inner: Mutex<Inner>,
    status: RwLock<SessionStatus>,
    transitions: Notify,
}

struct Inner {
    state: SessionState,
    model: Option<ModelHandle>,
    active: Option<ActiveGeneration>,
}

struct ActiveGeneration {
    cancel: watch::Sender<bool>,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn InferenceEngine>, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                config: SessionConfig {
                    stream_capacity: config.stream_capacity.max(1),
                },
                inner: Mutex::new(Inner {
                    state: SessionState::Unloaded,
                    model: None,
                    active: None,
                }),
                status: RwLock::new(SessionStatus::unloaded()),
                transitions: Notify::new(),
            }),
        }
    }

    /// Loads the model at `path`. Requires `Unloaded`.
    pub async fn load_model(
        &self,
        path: impl AsRef<Path>,
        params: LoadParams,
    ) -> Result<(), SessionError> {
        if params.context_size == 0 {
            return Err(SessionError::InvalidArgument(
                "contextSize must be greater than 0".to_string(),
            ));
        }
        if params.thread_count == 0 {
            return Err(SessionError::InvalidArgument(
                "threadCount must be greater than 0".to_string(),
            ));
        }
        let path = path.as_ref().to_path_buf();
        detached(self.shared.clone().load(path, params)).await
    }

    /// Unloads the model, cancelling a running generation first.
    ///
    /// Succeeds trivially when nothing is loaded.
    pub async fn unload_model(&self) -> Result<(), SessionError> {
        detached(self.shared.clone().unload()).await
    }

    /// Clears the conversational KV state of the loaded model. Requires `Ready`.
    pub async fn clear_context(&self) -> Result<(), SessionError> {
        detached(self.shared.clone().clear_context()).await
    }

    /// Starts a generation and returns its event stream.
    ///
    /// Fails immediately with [`SessionError::NotLoaded`] or
    /// [`SessionError::Busy`]; requests are never queued.
    pub async fn generate(&self, request: GenerationRequest) -> Result<TokenStream, SessionError> {
        request.validate().map_err(SessionError::InvalidArgument)?;

        let mut inner = self.shared.inner.lock().await;
        match inner.state {
            SessionState::Ready => {}
            SessionState::Unloaded => return Err(SessionError::NotLoaded),
            state => return Err(SessionError::Busy(state)),
        }
        let handle = inner.model.as_ref().ok_or(SessionError::NotLoaded)?.id;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        inner.active = Some(ActiveGeneration { cancel: cancel_tx });
        self.shared.transition(&mut inner, SessionState::Generating);
        drop(inner);

        tracing::debug!(
            max_tokens = request.max_tokens,
            "Generating for prompt {:?}",
            truncate_str(&request.prompt, 64)
        );

        let (tx, rx) = mpsc::channel(self.shared.config.stream_capacity);
        tokio::spawn(self.shared.clone().drive_generation(handle, request, tx, cancel_rx));
        Ok(TokenStream::new(rx))
    }

    /// Cancels the running generation and waits until the engine returned.
    ///
    /// A no-op in any state other than `Generating`.
    pub async fn cancel_generation(&self) {
        self.shared.cancel().await
    }

    /// Best-effort cancel plus unload. Never fails; errors are logged.
    pub async fn shutdown(&self) {
        self.cancel_generation().await;
        match self.unload_model().await {
            Ok(()) => tracing::info!("Session torn down"),
            Err(e) => tracing::warn!("Error during session teardown: {}", e),
        }
    }

    /// Snapshot of the session; never waits on the session lock.
    pub fn status(&self) -> SessionStatus {
        match self.shared.status.read() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.status().state
    }
}

/// Runs a transition on its own task so a dropped caller cannot strand the
/// session in `Loading` or `Unloading`.
async fn detached<T, F>(transition: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(transition)
        .await
        .map_err(|e| SessionError::Engine(EngineError::WorkerError(e.to_string())))?
}

/// Runs a blocking engine call on the blocking pool.
async fn blocking<T, F>(call: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| EngineError::WorkerError(e.to_string()))?
}

impl Shared {
    async fn load(self: Arc<Self>, path: std::path::PathBuf, params: LoadParams) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Unloaded => {}
                SessionState::Loading | SessionState::Unloading => {
                    return Err(SessionError::Busy(inner.state))
                }
                SessionState::Ready | SessionState::Generating => {
                    let loaded = inner
                        .model
                        .as_ref()
                        .map(|m| m.source_path.clone())
                        .unwrap_or_default();
                    return Err(SessionError::AlreadyLoaded(loaded));
                }
            }
            self.transition(&mut inner, SessionState::Loading);
        }

        tracing::info!(
            "Loading model {} (ctx={}, threads={})",
            path.display(),
            params.context_size,
            params.thread_count
        );
        let engine = self.engine.clone();
        let (load_path, load_params) = (path.clone(), params.clone());
        let result = blocking(move || engine.load(&load_path, &load_params)).await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(id) => {
                inner.model = Some(ModelHandle {
                    id,
                    context_size: params.context_size,
                    thread_count: params.thread_count,
                    source_path: path,
                });
                self.transition(&mut inner, SessionState::Ready);
                tracing::info!("Model ready ({})", id);
                Ok(())
            }
            Err(e) => {
                self.transition(&mut inner, SessionState::Unloaded);
                tracing::warn!("Model load failed: {}", e);
                Err(SessionError::Load(e.to_string()))
            }
        }
    }

    async fn unload(self: Arc<Self>) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        loop {
            match inner.state {
                SessionState::Unloaded => return Ok(()),
                SessionState::Ready => {
                    self.transition(&mut inner, SessionState::Unloading);
                    break;
                }
                SessionState::Generating => {
                    tracing::info!("Unload requested mid-generation, cancelling first");
                    self.signal_cancel(&inner);
                    self.transition(&mut inner, SessionState::Unloading);
                    while inner.active.is_some() {
                        self.wait_for_transition(inner).await;
                        inner = self.inner.lock().await;
                    }
                    break;
                }
                // Another caller owns the transition; wait for it to settle
                SessionState::Loading | SessionState::Unloading => {}
            }
            self.wait_for_transition(inner).await;
            inner = self.inner.lock().await;
        }

        let model = inner.model.take();
        drop(inner);
        let released = match model {
            Some(model) => {
                let engine = self.engine.clone();
                blocking(move || engine.unload(model.id)).await
            }
            None => Ok(()),
        };

        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, SessionState::Unloaded);
        match released {
            Ok(()) => {
                tracing::info!("Model unloaded");
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Engine reported an error while unloading: {}", e);
                Err(SessionError::Engine(e))
            }
        }
    }

    async fn clear_context(self: Arc<Self>) -> Result<(), SessionError> {
        let inner = self.inner.lock().await;
        match inner.state {
            SessionState::Ready => {}
            SessionState::Unloaded => return Err(SessionError::NotLoaded),
            state => return Err(SessionError::Busy(state)),
        }
        let handle = inner.model.as_ref().ok_or(SessionError::NotLoaded)?.id;
        let engine = self.engine.clone();
        blocking(move || engine.reset_context(handle)).await?;
        tracing::info!("Context cleared");
        Ok(())
    }

    async fn cancel(&self) {
        let mut inner = self.inner.lock().await;
        if inner.active.is_none() {
            tracing::debug!("Cancel with no generation running ({})", inner.state);
            return;
        }
        self.signal_cancel(&inner);
        while inner.active.is_some() {
            self.wait_for_transition(inner).await;
            inner = self.inner.lock().await;
        }
        tracing::info!("Generation cancelled");
    }

    async fn drive_generation(
        self: Arc<Self>,
        handle: HandleId,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: watch::Receiver<bool>,
    ) {
        let started = Instant::now();
        let engine = self.engine.clone();
        let runtime = Handle::current();
        let token_tx = tx.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let mut produced: u64 = 0;
            let mut sink = |token: &str| -> ControlFlow<()> {
                let flow = deliver(&runtime, &token_tx, &cancel, token);
                if flow.is_continue() {
                    produced += 1;
                }
                flow
            };
            let result = engine.generate(handle, &request, &mut sink);
            // A cancel that lands after the engine returned did not stop anything
            let cancelled = *cancel.borrow();
            (result, produced, cancelled)
        })
        .await;

        let elapsed = started.elapsed();
        let event = match outcome {
            Ok((Ok(()), produced, cancelled)) => {
                let stats = GenerationStats::from_elapsed(produced, elapsed, cancelled);
                tracing::info!(
                    "Generation finished: {} tokens in {} ms ({:.1} tok/s){}",
                    stats.token_count,
                    stats.elapsed_ms,
                    stats.tokens_per_second,
                    if cancelled { ", cancelled" } else { "" }
                );
                StreamEvent::Done(stats)
            }
            Ok((Err(e), produced, _)) => {
                tracing::warn!("Generation failed after {} tokens: {}", produced, e);
                StreamEvent::Error(e.to_string())
            }
            Err(e) => {
                tracing::error!("Generation worker panicked: {}", e);
                StreamEvent::Error(format!("generation worker failed: {e}"))
            }
        };

        {
            let mut inner = self.inner.lock().await;
            inner.active = None;
            if inner.state == SessionState::Generating {
                self.transition(&mut inner, SessionState::Ready);
            } else {
                self.commit(&inner);
            }
        }

        // The consumer may already be gone.
        let _ = tx.send(event).await;
    }

    fn signal_cancel(&self, inner: &Inner) {
        if let Some(active) = &inner.active {
            active.cancel.send_replace(true);
        }
        if let Some(model) = &inner.model {
            self.engine.cancel(model.id);
        }
    }

    fn transition(&self, inner: &mut Inner, next: SessionState) {
        if inner.state != next {
            tracing::debug!("Session {} -> {}", inner.state, next);
            inner.state = next;
        }
        self.commit(inner);
    }

    /// Republishes the status snapshot and wakes transition waiters.
    fn commit(&self, inner: &Inner) {
        let status = SessionStatus {
            loaded: inner.model.is_some(),
            state: inner.state,
            model_path: inner.model.as_ref().map(|m| m.source_path.clone()),
            context_size: inner.model.as_ref().map_or(0, |m| m.context_size),
            thread_count: inner.model.as_ref().map_or(0, |m| m.thread_count),
        };
        match self.status.write() {
            Ok(mut slot) => *slot = status,
            Err(poisoned) => *poisoned.into_inner() = status,
        }
        self.transitions.notify_waiters();
    }

    /// Releases the session lock and waits for the next committed change.
    async fn wait_for_transition(&self, inner: MutexGuard<'_, Inner>) {
        let notified = self.transitions.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(inner);
        notified.await;
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(model) = inner.model.take() {
            match self.engine.unload(model.id) {
                Ok(()) => tracing::info!("Released model {} on session drop", model.id),
                Err(e) => tracing::warn!("Failed to release model on session drop: {}", e),
            }
        }
    }
}

/// Hands one token to the consumer, parking the engine thread while the
/// channel is full. A pending cancellation releases the park.
fn deliver(
    runtime: &Handle,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &watch::Receiver<bool>,
    token: &str,
) -> ControlFlow<()> {
    if *cancel.borrow() {
        return ControlFlow::Break(());
    }
    let event = match tx.try_send(StreamEvent::Token(token.to_string())) {
        Ok(()) => return ControlFlow::Continue(()),
        Err(TrySendError::Closed(_)) => return ControlFlow::Break(()),
        Err(TrySendError::Full(event)) => event,
    };

    let mut cancel = cancel.clone();
    runtime.block_on(async move {
        tokio::select! {
            sent = tx.send(event) => match sent {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            },
            _ = cancel.wait_for(|cancelled| *cancelled) => ControlFlow::Break(()),
        }
    })
}
