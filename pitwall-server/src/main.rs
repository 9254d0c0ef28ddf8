//! Pitwall Server
//!
//! Runs the dispatch loop and serves the WebSocket and REST API

use anyhow::{Context, Result};
use pitwall_server::{api, config::Config, state::AppState};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Pitwall Server");

    let config = Config::from_env().context("loading configuration")?;
    let (state, dispatcher) = AppState::from_config(&config);
    let app = api::create_router(state);

    let cancel = CancellationToken::new();
    // A dead dispatch loop cancels the token, which also stops the server
    let dispatch_task = dispatcher.spawn_supervised(cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    let graceful = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;

    cancel.cancel();
    dispatch_task.await.context("joining dispatch supervisor")??;
    info!("Server stopped");

    Ok(())
}
