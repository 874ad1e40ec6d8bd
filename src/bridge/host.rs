//! JSON-lines host over stdin/stdout.
//!
//! Each input line is one request. Requests run concurrently so a
//! `cancelGeneration` can reach a `generate` that is still streaming; all
//! output lines go through a single writer task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::bridge::protocol::{ErrorBody, EventEnvelope, Request, Response};
use crate::bridge::{BridgeAdapter, BridgeError, BridgeEvent, EventSink};

/// How long in-flight requests get to answer after teardown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Output lines queued ahead of a host that is not reading stdout
const OUTPUT_CAPACITY: usize = 64;

/// Forwards the events of one request to the writer.
struct LineSink {
    request_id: Value,
    out: mpsc::Sender<String>,
}

#[async_trait]
impl EventSink for LineSink {
    async fn emit(&self, event: BridgeEvent) {
        let envelope = EventEnvelope {
            request_id: &self.request_id,
            event: &event,
        };
        match serde_json::to_string(&envelope) {
            Ok(line) => {
                // Blocks while the queue is full; fails only once the writer is gone
                let _ = self.out.send(line).await;
            }
            Err(e) => tracing::error!("Failed to encode event: {}", e),
        }
    }
}

fn encode_response(response: &Response) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        tracing::error!("Failed to encode response: {}", e);
        internal_error_line(&response.id, &e.to_string())
    })
}

fn internal_error_line(id: &Value, message: &str) -> String {
    json!({
        "id": id,
        "ok": false,
        "error": {"code": "INTERNAL", "message": message},
    })
    .to_string()
}

/// Serves the bridge on the process stdio until stdin closes or Ctrl-C.
pub async fn run_stdio(adapter: Arc<BridgeAdapter>) -> std::io::Result<()> {
    tracing::info!("Serving bridge on stdio");
    let input = BufReader::new(tokio::io::stdin());
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupt received"),
            Err(e) => {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await
            }
        }
    };
    serve(adapter, input, tokio::io::stdout(), shutdown).await
}

/// Runs the request loop over arbitrary streams, then tears the runtime down.
///
/// End of input lets in-flight requests finish before teardown; `shutdown`
/// resolving tears down first, cancelling any running generation.
pub async fn serve<R, W, S>(adapter: Arc<BridgeAdapter>, input: R, output: W, shutdown: S) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: std::future::Future<Output = ()>,
{
    let (out_tx, out_rx) = mpsc::channel::<String>(OUTPUT_CAPACITY);
    let writer = tokio::spawn(write_lines(output, out_rx));
    let mut lines = input.lines();
    let mut requests = JoinSet::new();
    tokio::pin!(shutdown);

    let mut interrupted = false;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => {
                interrupted = true;
                break;
            }
        };
        let Some(line) = line else {
            tracing::info!("Input closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Failed to parse request: {}", e);
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .unwrap_or(Value::Null);
                let error = BridgeError::InvalidArgument(format!("malformed request: {e}"));
                let response = Response {
                    id,
                    ok: false,
                    result: None,
                    error: Some(ErrorBody::from(&error)),
                };
                let _ = out_tx.send(encode_response(&response)).await;
                continue;
            }
        };

        let adapter = adapter.clone();
        let out = out_tx.clone();
        requests.spawn(async move {
            let sink = LineSink {
                request_id: request.id.clone(),
                out: out.clone(),
            };
            let response = adapter.handle(request, &sink).await;
            let _ = out.send(encode_response(&response)).await;
        });

        // Reap finished requests so the set does not grow without bound
        while requests.try_join_next().is_some() {}
    }

    // On end of input pending requests finish first; an interrupt cancels them.
    if interrupted {
        adapter.teardown().await;
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while requests.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Abandoning {} in-flight requests", requests.len());
            requests.shutdown().await;
        }
    } else {
        while requests.join_next().await.is_some() {}
        adapter.teardown().await;
    }

    drop(out_tx);
    match writer.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

async fn write_lines<W>(mut output: W, mut lines: mpsc::Receiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}
