//! ws-echo: a minimal WebSocket echo server
//!
//! Features:
//! - Replies to every text message with `You said: <message>`
//! - Logs connect, message, disconnect and error events
//! - Graceful shutdown on Ctrl-C
//! - Configuration via CLI arguments or TOML file

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ws_echo::{Config, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        max_message_size = config.max_message_size,
        "Starting ws-echo server"
    );

    // All connections share one event loop thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::bind(&config).await?;
        server.run(shutdown_signal()).await
    })?;

    Ok(())
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            // Without a signal handler the server runs until killed.
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    }
}
