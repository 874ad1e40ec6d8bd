//! Streaming inference support
//!
//! A generation is observed as a [`TokenStream`]: zero or more
//! [`StreamEvent::Token`] items followed by exactly one terminal event.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Summary of a finished generation, natural or cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStats {
    pub token_count: u64,
    pub elapsed_ms: u64,
    pub tokens_per_second: f64,
    /// True when the generation was cut short by a cancellation
    #[serde(default)]
    pub cancelled: bool,
}

impl GenerationStats {
    /// Derives throughput from a token count and wall-clock duration.
    pub fn from_elapsed(token_count: u64, elapsed: Duration, cancelled: bool) -> Self {
        let elapsed_ms = elapsed.as_millis() as u64;
        let tokens_per_second = if elapsed_ms > 0 {
            token_count as f64 / (elapsed_ms as f64 / 1000.0)
        } else {
            0.0
        };
        Self {
            token_count,
            elapsed_ms,
            tokens_per_second,
            cancelled,
        }
    }
}

/// One event of a generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A generated token string
    Token(String),
    /// Generation finished (possibly cancelled); always the last event
    Done(GenerationStats),
    /// The engine failed; always the last event
    Error(String),
}

/// Receiving half of a running generation.
///
/// Dropping the stream before the terminal event stops the generation at the
/// next token; the session still returns to `Ready`.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl TokenStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx }
    }

    /// Waits for the next event; `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drains the stream, awaiting `on_token` for each token, and returns the
    /// terminal outcome. The next token is not received until the previous
    /// callback has completed, so a slow consumer holds back the engine.
    pub async fn for_each_token<F, Fut>(mut self, mut on_token: F) -> Result<GenerationStats, String>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        while let Some(event) = self.rx.recv().await {
            match event {
                StreamEvent::Token(token) => on_token(token).await,
                StreamEvent::Done(stats) => return Ok(stats),
                StreamEvent::Error(message) => return Err(message),
            }
        }
        Err("generation stream closed without a terminal event".to_string())
    }

    /// Collects every token and the terminal outcome.
    #[cfg(test)]
    pub(crate) async fn collect_tokens(self) -> (Vec<String>, Result<GenerationStats, String>) {
        let mut tokens = Vec::new();
        let outcome = self
            .for_each_token(|t| {
                tokens.push(t);
                std::future::ready(())
            })
            .await;
        (tokens, outcome)
    }
}

impl Stream for TokenStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
