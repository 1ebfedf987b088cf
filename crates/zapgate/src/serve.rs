// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `zapgate serve` command implementation.
//!
//! Wires the metadata store, the blob store, the sidecar client factory,
//! the session engine, and the HTTP gateway together, rehydrates enabled
//! instances, and runs until a shutdown signal arrives.

use std::sync::Arc;

use tracing::{error, info, warn};

use zapgate_bridge::BridgeClientFactory;
use zapgate_config::ZapgateConfig;
use zapgate_core::{MetadataStore, ZapgateError};
use zapgate_engine::SessionEngine;
use zapgate_gateway::{AuthConfig, GatewayState, HealthState, ServerConfig};
use zapgate_storage::{FsBlobStore, SqliteMetadataStore};

/// Runs the `zapgate serve` command.
pub async fn run_serve(config: ZapgateConfig) -> Result<(), ZapgateError> {
    init_tracing(&config.daemon.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "starting zapgate serve");

    // A panicking background task must not take the gateway down; log it
    // and keep serving the other instances.
    std::panic::set_hook(Box::new(|info| {
        error!(panic = %info, "panic in task");
    }));

    // Metadata store: opens the database and brings the schema current.
    let store: Arc<dyn MetadataStore> =
        Arc::new(SqliteMetadataStore::new(&config.storage.database_path));
    store.initialize().await?;

    // Auth blobs and the staging area the sidecar writes archives into.
    let blobs = Arc::new(FsBlobStore::open(&config.storage.session_storage_path).await?);
    tokio::fs::create_dir_all(&config.storage.cache_path)
        .await
        .map_err(|e| ZapgateError::Config(format!("cannot create cache path: {e}")))?;

    // Browser automation sidecar seam.
    let factory = Arc::new(BridgeClientFactory::new(&config.bridge)?);
    info!(base_url = config.bridge.base_url.as_str(), "sidecar bridge configured");

    let engine = SessionEngine::new(
        store.clone(),
        blobs,
        factory,
        config.engine.clone(),
        config.daemon.clone(),
        &config.storage.cache_path,
    );
    engine.spawn_background();

    // Signal handling drives everything else down.
    let cancel = engine.install_signal_handler();

    // Rehydrate enabled instances in the background; the stagger keeps the
    // browser layer from a thundering herd.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.rehydrate().await;
        });
    }

    let server_config = ServerConfig {
        host: config.server.host.clone(),
        port: config.server.port,
        bearer_token: config.server.bearer_token.clone(),
    };
    let state = GatewayState {
        engine: engine.clone(),
        store: store.clone(),
        auth: AuthConfig {
            bearer_token: config.server.bearer_token.clone(),
        },
        health: HealthState {
            start_time: std::time::Instant::now(),
        },
    };

    if let Err(e) = zapgate_gateway::start_server(&server_config, state, cancel.clone()).await {
        // Keep going into shutdown so sessions still quiesce cleanly.
        warn!(error = %e, "gateway server exited with error");
        cancel.cancel();
    }

    engine.shutdown_gracefully().await;

    info!("zapgate serve shutdown complete");
    Ok(())
}

/// Initializes the tracing subscriber with the given log level.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("zapgate={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .init();
}
