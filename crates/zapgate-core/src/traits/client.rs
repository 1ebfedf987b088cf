// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Browser client adapter trait.
//!
//! The adapter wraps one browser-backed WhatsApp Web client. It is an
//! external collaborator: every call may cross a process boundary and block,
//! so callers race each call against a timeout and never hold a registry
//! lock across one.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ZapgateError;
use crate::types::{ClientEvent, ClientInfo, ClientState, MediaRef};

/// One browser-backed WhatsApp Web client.
#[async_trait]
pub trait WebClient: Send + Sync {
    /// Start the browser session. Resolves once the page is up; the pairing
    /// and sync progress arrive through the event channel.
    async fn initialize(&self) -> Result<(), ZapgateError>;

    /// Current connection state as WhatsApp Web reports it.
    async fn get_state(&self) -> Result<ClientState, ZapgateError>;

    /// State of the internal websocket, bypassing the page-level view.
    /// Used by the deep probe only.
    async fn socket_state(&self) -> Result<ClientState, ZapgateError>;

    /// Whether the underlying browser process is alive and its page open.
    async fn browser_healthy(&self) -> Result<bool, ZapgateError>;

    /// JS heap usage of the instance's page, in bytes.
    async fn heap_used_bytes(&self) -> Result<u64, ZapgateError>;

    /// Phone identity, available once authenticated.
    async fn info(&self) -> Result<Option<ClientInfo>, ZapgateError>;

    /// Reclaim the session from a conflicting client on another device.
    async fn take_over(&self) -> Result<(), ZapgateError>;

    /// Send a text message. Returns the wire message id.
    async fn send_text(&self, to: &str, body: &str) -> Result<String, ZapgateError>;

    /// Send a media message. Returns the wire message id.
    async fn send_media(
        &self,
        to: &str,
        media: &MediaRef,
        caption: Option<&str>,
    ) -> Result<String, ZapgateError>;

    /// Tear down the browser session and release its resources.
    async fn destroy(&self) -> Result<(), ZapgateError>;
}

/// Creates clients and their event channels, one per instance.
///
/// Adapter handles are never shared between instances; each `create` call
/// produces a fresh client and a fresh event stream.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(
        &self,
        instance_id: &str,
    ) -> Result<(Arc<dyn WebClient>, mpsc::Receiver<ClientEvent>), ZapgateError>;
}
