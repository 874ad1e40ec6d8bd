//! Offline LLM host
//!
//! Serves the inference bridge as JSON lines on stdin/stdout. Logs go to stderr
//! so they never mix with protocol output.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use offline_llm::bridge::{host, select_runtime, BridgeAdapter};
use offline_llm::storage::load_settings;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offline_llm=info")))
        .init();

    info!("Starting offline-llm v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings();
    info!("Models directory: {}", settings.models_directory.display());

    let adapter = Arc::new(BridgeAdapter::new(select_runtime(settings)));
    host::run_stdio(adapter).await
}
