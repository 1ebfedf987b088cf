// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP client for the browser-automation sidecar.
//!
//! One [`BridgeClient`] per instance, speaking the sidecar's per-instance
//! REST surface. Long-running calls (`initialize`) override the pooled
//! client's default timeout; the engine races every call against its own
//! policy timeout on top.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use zapgate_core::{ClientInfo, ClientState, MediaRef, WebClient, ZapgateError};

/// Initialize can sit through a full browser launch plus WhatsApp sync.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

#[derive(Debug, Deserialize)]
struct BrowserResponse {
    healthy: bool,
}

#[derive(Debug, Deserialize)]
struct HeapResponse {
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// `WebClient` implementation over the sidecar's HTTP API.
pub struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
    instance_id: String,
}

impl BridgeClient {
    pub(crate) fn new(http: reqwest::Client, base_url: &str, instance_id: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            instance_id: instance_id.to_string(),
        }
    }

    pub(crate) fn instance_url(&self, suffix: &str) -> String {
        format!(
            "{}/instances/{}{}",
            self.base_url, self.instance_id, suffix
        )
    }

    async fn read_error(response: reqwest::Response) -> ZapgateError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(parsed) => parsed.error,
            Err(_) => format!("sidecar returned {status}: {body}"),
        };
        ZapgateError::Client {
            message,
            source: None,
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: String) -> Result<T, ZapgateError> {
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        response.json().await.map_err(map_transport_error)
    }

    async fn parse_state(&self, url: String) -> Result<ClientState, ZapgateError> {
        let parsed: StateResponse = self.get_json(url).await?;
        Ok(parsed
            .state
            .parse()
            .unwrap_or(ClientState::Other(parsed.state)))
    }
}

/// Transport-level failures keep their source; torn-down browser contexts
/// surface through the message-based classification on `ZapgateError`.
fn map_transport_error(e: reqwest::Error) -> ZapgateError {
    ZapgateError::Client {
        message: format!("sidecar request failed: {e}"),
        source: Some(Box::new(e)),
    }
}

#[async_trait]
impl WebClient for BridgeClient {
    async fn initialize(&self) -> Result<(), ZapgateError> {
        debug!(instance_id = self.instance_id.as_str(), "initializing sidecar client");
        let response = self
            .http
            .post(self.instance_url("/start"))
            .timeout(INITIALIZE_TIMEOUT)
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }

    async fn get_state(&self) -> Result<ClientState, ZapgateError> {
        self.parse_state(self.instance_url("/state")).await
    }

    async fn socket_state(&self) -> Result<ClientState, ZapgateError> {
        self.parse_state(self.instance_url("/socket-state")).await
    }

    async fn browser_healthy(&self) -> Result<bool, ZapgateError> {
        let parsed: BrowserResponse = self.get_json(self.instance_url("/browser")).await?;
        Ok(parsed.healthy)
    }

    async fn heap_used_bytes(&self) -> Result<u64, ZapgateError> {
        let parsed: HeapResponse = self.get_json(self.instance_url("/heap")).await?;
        Ok(parsed.bytes)
    }

    async fn info(&self) -> Result<Option<ClientInfo>, ZapgateError> {
        let parsed: Option<ClientInfo> = self.get_json(self.instance_url("/info")).await?;
        Ok(parsed)
    }

    async fn take_over(&self) -> Result<(), ZapgateError> {
        let response = self
            .http
            .post(self.instance_url("/takeover"))
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<String, ZapgateError> {
        let response = self
            .http
            .post(self.instance_url("/messages"))
            .json(&json!({ "to": to, "body": body }))
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        let parsed: SendResponse = response.json().await.map_err(map_transport_error)?;
        Ok(parsed.id)
    }

    async fn send_media(
        &self,
        to: &str,
        media: &MediaRef,
        caption: Option<&str>,
    ) -> Result<String, ZapgateError> {
        let response = self
            .http
            .post(self.instance_url("/media"))
            .json(&json!({
                "to": to,
                "url": media.url,
                "base64": media.base64,
                "mime": media.mime,
                "filename": media.filename,
                "caption": caption,
            }))
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        let parsed: SendResponse = response.json().await.map_err(map_transport_error)?;
        Ok(parsed.id)
    }

    async fn destroy(&self) -> Result<(), ZapgateError> {
        let response = self
            .http
            .delete(self.instance_url(""))
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }
}
