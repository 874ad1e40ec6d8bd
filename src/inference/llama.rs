//! llama.cpp backend
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) hold raw
//! pointers that are not `Send`, so everything native lives on one dedicated
//! worker thread. [`LlamaEngine`] only owns the command channel; each
//! [`InferenceEngine`] call is a command plus a reply channel.
//!
//! While a model is loaded the worker keeps a single `LlamaContext` borrowed
//! from it, which is the KV context successive generations extend until it
//! is reset.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::engine::{
    EngineError, GenerationRequest, HandleId, InferenceEngine, LoadParams, TokenSink,
};
use crate::inference::model::validate_gguf;

const BATCH_SIZE: usize = 512;
/// Layer count that means "everything" to llama.cpp.
const ALL_GPU_LAYERS: u32 = 999;
/// Window the repetition penalty looks back over.
const PENALTY_LAST_N: i32 = 64;

type Reply<T> = Sender<Result<T, EngineError>>;

/// Commands sent to the worker thread
enum Command {
    Load {
        path: PathBuf,
        params: LoadParams,
        handle: HandleId,
        reply: Reply<()>,
    },
    Unload {
        handle: HandleId,
        reply: Reply<()>,
    },
    Reset {
        handle: HandleId,
        reply: Reply<()>,
    },
    Generate {
        handle: HandleId,
        request: GenerationRequest,
        events: Sender<WorkerEvent>,
    },
    Shutdown,
}

/// What the worker streams back during a generation
enum WorkerEvent {
    Token(String),
    Done,
    Error(EngineError),
}

/// Outcome of serving one loaded model
enum Served {
    Unloaded,
    Shutdown,
}

/// llama.cpp engine running on its own worker thread.
pub struct LlamaEngine {
    commands: Mutex<Sender<Command>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    next_handle: AtomicU64,
}

impl LlamaEngine {
    /// Spawns the worker and initializes the llama.cpp backend on it.
    pub fn new() -> Result<Self, EngineError> {
        let (command_tx, command_rx) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || match LlamaBackend::init() {
                Ok(backend) => {
                    let _ = ready_tx.send(Ok(()));
                    worker_main(backend, command_rx, worker_stop);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(EngineError::BackendInit(e.to_string())));
                }
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        tracing::info!("llama.cpp worker thread started");
        Ok(Self {
            commands: Mutex::new(command_tx),
            worker: Mutex::new(Some(handle)),
            stop,
            next_handle: AtomicU64::new(1),
        })
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        let commands = self
            .commands
            .lock()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;
        commands
            .send(command)
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }

    fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
        let (reply, response) = mpsc::channel();
        self.send(command(reply))?;
        response
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }
}

impl InferenceEngine for LlamaEngine {
    fn load(&self, path: &Path, params: &LoadParams) -> Result<HandleId, EngineError> {
        // Cheap sniff on the calling thread before native code touches the file
        let header = validate_gguf(path)?;
        tracing::debug!(
            "GGUF v{} with {} tensors at {}",
            header.version,
            header.tensor_count,
            path.display()
        );

        let handle = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.call(|reply| Command::Load {
            path: path.to_path_buf(),
            params: params.clone(),
            handle,
            reply,
        })?;
        Ok(handle)
    }

    fn unload(&self, handle: HandleId) -> Result<(), EngineError> {
        self.call(|reply| Command::Unload { handle, reply })
    }

    fn reset_context(&self, handle: HandleId) -> Result<(), EngineError> {
        self.call(|reply| Command::Reset { handle, reply })
    }

    fn generate(
        &self,
        handle: HandleId,
        request: &GenerationRequest,
        sink: &mut TokenSink<'_>,
    ) -> Result<(), EngineError> {
        self.stop.store(false, Ordering::SeqCst);

        let (events_tx, events) = mpsc::channel();
        self.send(Command::Generate {
            handle,
            request: request.clone(),
            events: events_tx,
        })?;

        loop {
            match events.recv() {
                Ok(WorkerEvent::Token(token)) => {
                    if sink(&token).is_break() {
                        self.stop.store(true, Ordering::SeqCst);
                    }
                }
                Ok(WorkerEvent::Done) => return Ok(()),
                Ok(WorkerEvent::Error(e)) => return Err(e),
                Err(_) => {
                    return Err(EngineError::WorkerError(
                        "worker exited during generation".to_string(),
                    ))
                }
            }
        }
    }

    fn cancel(&self, _handle: HandleId) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.send(Command::Shutdown);
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Worker thread main loop while no model is loaded.
fn worker_main(backend: LlamaBackend, commands: Receiver<Command>, stop: Arc<AtomicBool>) {
    loop {
        match commands.recv() {
            Ok(Command::Load {
                path,
                params,
                handle,
                reply,
            }) => {
                let model_params = LlamaModelParams::default().with_n_gpu_layers(if params.gpu_offload {
                    ALL_GPU_LAYERS
                } else {
                    0
                });
                let model = match LlamaModel::load_from_file(&backend, &path, &model_params) {
                    Ok(model) => model,
                    Err(e) => {
                        let _ = reply.send(Err(EngineError::ModelLoad(e.to_string())));
                        continue;
                    }
                };
                tracing::info!(
                    "Model loaded in worker: {} ({} params, {} ctx trained)",
                    path.display(),
                    model.n_params(),
                    model.n_ctx_train()
                );

                match serve_model(&backend, &model, handle, &params, reply, &commands, &stop) {
                    Served::Unloaded => tracing::info!("Model {} unloaded in worker", handle),
                    Served::Shutdown => break,
                }
            }
            Ok(Command::Unload { handle, reply }) | Ok(Command::Reset { handle, reply }) => {
                let _ = reply.send(Err(EngineError::UnknownHandle(handle)));
            }
            Ok(Command::Generate { handle, events, .. }) => {
                let _ = events.send(WorkerEvent::Error(EngineError::UnknownHandle(handle)));
            }
            Ok(Command::Shutdown) | Err(_) => break,
        }
    }
    tracing::info!("llama.cpp worker thread exiting");
}

/// Serves commands against one loaded model until it is unloaded.
fn serve_model(
    backend: &LlamaBackend,
    model: &LlamaModel,
    loaded: HandleId,
    params: &LoadParams,
    load_reply: Reply<()>,
    commands: &Receiver<Command>,
    stop: &AtomicBool,
) -> Served {
    let n_ctx = params.context_size.min(model.n_ctx_train().max(1));
    let threads = params.thread_count.max(1) as i32;
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(BATCH_SIZE as u32)
        .with_n_threads(threads)
        .with_n_threads_batch(threads);

    let mut ctx = match model.new_context(backend, ctx_params) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = load_reply.send(Err(EngineError::ContextCreate(e.to_string())));
            return Served::Unloaded;
        }
    };
    let _ = load_reply.send(Ok(()));

    let mut n_past: i32 = 0;
    loop {
        match commands.recv() {
            Ok(Command::Load { reply, .. }) => {
                let _ = reply.send(Err(EngineError::ModelLoad(
                    "a model is already loaded on this engine".to_string(),
                )));
            }
            Ok(Command::Unload { handle, reply }) => {
                if handle != loaded {
                    let _ = reply.send(Err(EngineError::UnknownHandle(handle)));
                    continue;
                }
                let _ = reply.send(Ok(()));
                return Served::Unloaded;
            }
            Ok(Command::Reset { handle, reply }) => {
                if handle != loaded {
                    let _ = reply.send(Err(EngineError::UnknownHandle(handle)));
                    continue;
                }
                ctx.clear_kv_cache();
                n_past = 0;
                tracing::debug!("KV cache cleared");
                let _ = reply.send(Ok(()));
            }
            Ok(Command::Generate {
                handle,
                request,
                events,
            }) => {
                if handle != loaded {
                    let _ = events.send(WorkerEvent::Error(EngineError::UnknownHandle(handle)));
                    continue;
                }
                let event = match run_generation(&mut ctx, model, &mut n_past, n_ctx, &request, &events, stop) {
                    Ok(()) => WorkerEvent::Done,
                    Err(e) => WorkerEvent::Error(e),
                };
                let _ = events.send(event);
            }
            Ok(Command::Shutdown) | Err(_) => return Served::Shutdown,
        }
    }
}

/// Evaluates the prompt and samples until `max_tokens`, end of generation, or
/// the stop flag.
fn run_generation(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    n_past: &mut i32,
    n_ctx: u32,
    request: &GenerationRequest,
    events: &Sender<WorkerEvent>,
    stop: &AtomicBool,
) -> Result<(), EngineError> {
    let add_bos = if *n_past == 0 {
        AddBos::Always
    } else {
        AddBos::Never
    };
    let prompt_tokens = model
        .str_to_token(&request.prompt, add_bos)
        .map_err(|e| EngineError::Tokenization(e.to_string()))?;
    if prompt_tokens.is_empty() {
        return Ok(());
    }

    let needed = *n_past as u64 + prompt_tokens.len() as u64 + request.max_tokens as u64;
    if *n_past as u64 + prompt_tokens.len() as u64 >= n_ctx as u64 {
        return Err(EngineError::Inference(format!(
            "prompt does not fit the context window ({} of {} tokens used); clear the context",
            *n_past,
            n_ctx
        )));
    }
    if needed > n_ctx as u64 {
        tracing::debug!("Generation may stop early: {} tokens requested for a {} window", needed, n_ctx);
    }

    let mut batch = LlamaBatch::new(BATCH_SIZE, 1);
    decode_prompt(ctx, &mut batch, &prompt_tokens, n_past)?;

    let mut sampler = build_sampler(request);
    let mut pending = Utf8Pending::default();

    for _ in 0..request.max_tokens {
        if stop.load(Ordering::SeqCst) {
            tracing::debug!("Generation stopped by request");
            break;
        }
        if *n_past as u32 >= n_ctx {
            tracing::debug!("Context window full, ending generation");
            break;
        }

        let token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(token);
        if model.is_eog_token(token) {
            break;
        }

        let bytes = model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        if let Some(text) = pending.push(&bytes) {
            if events.send(WorkerEvent::Token(text)).is_err() {
                break;
            }
        }

        batch.clear();
        batch
            .add(token, *n_past, &[0], true)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        *n_past += 1;
    }

    if let Some(rest) = pending.flush() {
        let _ = events.send(WorkerEvent::Token(rest));
    }
    Ok(())
}

fn decode_prompt(
    ctx: &mut LlamaContext,
    batch: &mut LlamaBatch,
    tokens: &[LlamaToken],
    n_past: &mut i32,
) -> Result<(), EngineError> {
    let chunks = tokens.chunks(BATCH_SIZE);
    let last_chunk = chunks.len().saturating_sub(1);
    for (chunk_index, chunk) in chunks.enumerate() {
        batch.clear();
        for (i, token) in chunk.iter().enumerate() {
            let wants_logits = chunk_index == last_chunk && i == chunk.len() - 1;
            batch
                .add(*token, *n_past, &[0], wants_logits)
                .map_err(|e| EngineError::Inference(e.to_string()))?;
            *n_past += 1;
        }
        ctx.decode(batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode prompt: {e}")))?;
    }
    Ok(())
}

fn build_sampler(request: &GenerationRequest) -> LlamaSampler {
    let penalties = LlamaSampler::penalties(PENALTY_LAST_N, request.repeat_penalty, 0.0, 0.0);
    if request.temperature < 0.01 {
        return LlamaSampler::chain_simple([penalties, LlamaSampler::greedy()]);
    }
    LlamaSampler::chain_simple([
        penalties,
        LlamaSampler::top_k(request.top_k as i32),
        LlamaSampler::top_p(request.top_p, 1),
        LlamaSampler::temp(request.temperature),
        LlamaSampler::dist(rand_seed()),
    ])
}

/// Holds back bytes of a UTF-8 sequence split across tokens.
#[derive(Default)]
struct Utf8Pending {
    bytes: Vec<u8>,
}

impl Utf8Pending {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.bytes.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.bytes) {
            Ok(_) => self.bytes.len(),
            // error_len() == None means the tail is an incomplete sequence
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => return Some(String::from_utf8_lossy(&std::mem::take(&mut self.bytes)).into_owned()),
        };
        if valid == 0 {
            return None;
        }
        let rest = self.bytes.split_off(valid);
        let text = String::from_utf8_lossy(&std::mem::replace(&mut self.bytes, rest)).into_owned();
        Some(text)
    }

    fn flush(&mut self) -> Option<String> {
        if self.bytes.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&std::mem::take(&mut self.bytes)).into_owned())
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
