// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Browser client adapter over the automation sidecar.
//!
//! The sidecar owns the actual browser-backed WhatsApp Web clients; this
//! crate is the narrow seam the engine talks through: a REST call per
//! operation and one SSE stream per instance for events.

pub mod client;
pub mod events;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use zapgate_config::BridgeConfig;
use zapgate_core::{ClientEvent, ClientFactory, WebClient, ZapgateError};

pub use client::BridgeClient;

/// Creates one [`BridgeClient`] plus its event pump per instance.
pub struct BridgeClientFactory {
    http: reqwest::Client,
    base_url: String,
}

impl BridgeClientFactory {
    pub fn new(config: &BridgeConfig) -> Result<Self, ZapgateError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ZapgateError::Client {
                message: format!("failed to build sidecar HTTP client: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ClientFactory for BridgeClientFactory {
    async fn create(
        &self,
        instance_id: &str,
    ) -> Result<(Arc<dyn WebClient>, mpsc::Receiver<ClientEvent>), ZapgateError> {
        // Registration is idempotent on the sidecar side.
        let register = self
            .http
            .post(format!("{}/instances", self.base_url))
            .json(&json!({ "id": instance_id }))
            .send()
            .await;
        match register {
            Ok(response) if response.status().is_success() => {
                debug!(instance_id, "instance registered with sidecar");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(ZapgateError::Client {
                    message: format!("sidecar refused registration ({status}): {body}"),
                    source: None,
                });
            }
            Err(e) => {
                return Err(ZapgateError::Client {
                    message: format!("sidecar unreachable: {e}"),
                    source: Some(Box::new(e)),
                });
            }
        }

        let client = Arc::new(BridgeClient::new(
            self.http.clone(),
            &self.base_url,
            instance_id,
        ));

        let (tx, rx) = mpsc::channel(256);
        let events_url = client.instance_url("/events");
        let pump_http = self.http.clone();
        let pump_id = instance_id.to_string();
        tokio::spawn(async move {
            events::run_event_pump(pump_http, events_url, pump_id.clone(), tx).await;
            warn!(instance_id = pump_id.as_str(), "event pump exited");
        });

        Ok((client, rx))
    }
}
