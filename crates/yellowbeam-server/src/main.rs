//! # Yellowbeam Server
//!
//! Single binary that wires everything together:
//! - configuration (`.env`, `config.toml`, `YELLOWBEAM_*` variables)
//! - the Kurento media engine connection
//! - the signaling WebSocket plus health/stats routes

use std::net::SocketAddr;
use std::sync::Arc;
use yellowbeam_media::KurentoClient;
use yellowbeam_signaling::{Dispatcher, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = yellowbeam_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yellowbeam=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting Yellowbeam v{}", env!("CARGO_PKG_VERSION"));

    // === Media engine ===
    let engine = KurentoClient::connect(
        &config.media.kurento_url,
        config.media.request_timeout(),
        config.media.keepalive(),
    )
    .await?;

    // === Signaling ===
    let dispatcher =
        Dispatcher::new(Arc::new(engine)).with_proposal_ttl(config.signaling.call_proposal_ttl());
    let router = build_router(dispatcher);

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Signaling listening on ws://{addr}/call");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
