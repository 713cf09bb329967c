//! Asset Upload Server
//!
//! Accepts large editor and client asset files in resumable chunks and
//! publishes them into the update server's asset tree.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use asset_upload_server::config::Config;
use asset_upload_server::routes;
use asset_upload_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "asset_upload_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Starting Asset Upload Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Asset root: {}", config.upload.asset_root.display());
    tracing::info!("Staging directory: {}", config.upload.staging_dir.display());
    if !config.upload.enabled {
        tracing::warn!("Chunked uploads are disabled");
    }

    tokio::fs::create_dir_all(&config.upload.staging_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create staging directory {}",
                config.upload.staging_dir.display()
            )
        })?;

    let state = AppState::new(config.clone());

    // Sessions live in memory only, so nothing staged before a restart can resume
    if let Err(e) = state.uploads().purge_orphaned_staging().await {
        tracing::warn!("Failed to purge orphaned staging areas: {}", e);
    }

    let sweeper = state
        .uploads()
        .clone()
        .start_sweeper(Duration::from_secs(config.upload.sweep_interval_secs.max(1)));

    let app = routes::app(state);

    // Start server with graceful shutdown
    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST {:?}", config.server.host))?;
    let addr = SocketAddr::new(host, config.server.port);
    tracing::info!("Asset Upload Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
