// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gateway HTTP server built on axum.
//!
//! Sets up routes, auth middleware, and shared state. Health stays public
//! so process supervisors can poll it; everything else sits behind the
//! bearer token when one is configured.

use std::sync::Arc;

use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use zapgate_core::{MetadataStore, ZapgateError};
use zapgate_engine::SessionEngine;

use crate::auth::{auth_middleware, AuthConfig};
use crate::handlers;

/// Health state for the unauthenticated health endpoint.
#[derive(Clone)]
pub struct HealthState {
    /// Process start time for uptime calculation.
    pub start_time: std::time::Instant,
}

/// Shared state for axum request handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub engine: Arc<SessionEngine>,
    pub store: Arc<dyn MetadataStore>,
    pub auth: AuthConfig,
    pub health: HealthState,
}

/// Gateway server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for auth (None = auth disabled).
    pub bearer_token: Option<String>,
}

/// Build the full API router over the given state.
pub fn build_router(state: GatewayState) -> Router {
    let auth_state = state.auth.clone();

    // Health stays public for supervisors and load balancers.
    let public_routes = Router::new()
        .route("/api/health", get(handlers::get_health))
        .with_state(state.clone());

    let api_routes = Router::new()
        .route("/api/session/start", post(handlers::post_session_start))
        .route("/api/session/stop", post(handlers::post_session_stop))
        .route(
            "/api/session/reconnect",
            post(handlers::post_session_reconnect),
        )
        .route("/api/session/reset", post(handlers::post_session_reset))
        .route("/api/session/status/:id", get(handlers::get_session_status))
        .route("/api/session/qr/:id", get(handlers::get_session_qr))
        .route("/api/instance/:id/enable", post(handlers::post_instance_enable))
        .route(
            "/api/instance/:id/disable",
            post(handlers::post_instance_disable),
        )
        .route("/api/queue/:id", get(handlers::get_queue))
        .route("/api/queue/:id", delete(handlers::delete_queue))
        .route("/api/send-text", post(handlers::post_send_text))
        .route("/api/send-media", post(handlers::post_send_media))
        .route_layer(axum_middleware::from_fn_with_state(
            auth_state,
            auth_middleware,
        ))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(CorsLayer::permissive())
}

/// Start the gateway HTTP server; runs until the token is cancelled.
pub async fn start_server(
    config: &ServerConfig,
    state: GatewayState,
    cancel: CancellationToken,
) -> Result<(), ZapgateError> {
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ZapgateError::Internal(format!("failed to bind gateway to {addr}: {e}")))?;

    tracing::info!("gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ZapgateError::Internal(format!("gateway server error: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_debug() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 3333,
            bearer_token: None,
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("127.0.0.1"));
    }
}
