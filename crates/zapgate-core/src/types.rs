// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types used across adapter traits and the Zapgate engine.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Connection status of an instance as tracked by the session registry.
///
/// Persisted to the metadata store as SCREAMING_SNAKE strings; the loading
/// percentage is display-only and dropped on persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Adapter initialization in progress.
    Initializing,
    /// WhatsApp Web is syncing; carries the reported percentage.
    Loading(u8),
    /// Waiting for the operator to scan a pairing QR code.
    QrRequired,
    /// Authenticated but not yet promoted to connected.
    Authenticated,
    /// Fully connected; probes armed, sends go straight through.
    Connected,
    /// Authenticated but never reached connected within the sync window.
    SyncTimeout,
    /// No live client.
    Disconnected,
    /// Authentication rejected; no automatic reconnect.
    AuthFailure,
    /// Adapter initialization failed or timed out.
    InitError,
    /// Teardown complete, restart scheduled.
    Reconnecting,
}

impl InstanceStatus {
    /// The string persisted in the `connection_status` column.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            InstanceStatus::Initializing => "INITIALIZING",
            InstanceStatus::Loading(_) => "LOADING",
            InstanceStatus::QrRequired => "QR_REQUIRED",
            InstanceStatus::Authenticated => "AUTHENTICATED",
            InstanceStatus::Connected => "CONNECTED",
            InstanceStatus::SyncTimeout => "SYNC_TIMEOUT",
            InstanceStatus::Disconnected => "DISCONNECTED",
            InstanceStatus::AuthFailure => "AUTH_FAILURE",
            InstanceStatus::InitError => "INIT_ERROR",
            InstanceStatus::Reconnecting => "RECONNECTING",
        }
    }

    /// States from which the recovery sweep restarts an enabled instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Disconnected
                | InstanceStatus::InitError
                | InstanceStatus::SyncTimeout
        )
    }

}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Loading(pct) => write!(f, "LOADING({pct}%)"),
            other => f.write_str(other.as_db_str()),
        }
    }
}

/// Why an instance disconnected, as reported by the adapter or diagnosed by
/// the liveness supervisor.
///
/// Wire reasons parse from the adapter's SCREAMING_SNAKE strings; anything
/// unrecognised is preserved verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    Logout,
    Banned,
    TosBlock,
    SmbTosBlock,
    Conflict,
    Unpaired,
    Navigation,
    Timeout,
    NetworkError,
    InitTimeout,
    SyncTimeout,
    ConsecutiveHeartbeatFailures,
    ContextErrors,
    PingTimeout,
    SocketDown,
    Zombie,
    Stuck,
    Inactive,
    MemoryPressure,
    Recovery,
    Manual,
    #[strum(default)]
    Other(String),
}

impl DisconnectReason {
    /// Reasons that permanently disable the instance (`enabled = false`);
    /// the engine never reconnects after these.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Logout
                | DisconnectReason::Banned
                | DisconnectReason::TosBlock
                | DisconnectReason::SmbTosBlock
        )
    }

    /// Reasons that take the short linear delay instead of exponential backoff.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Conflict
                | DisconnectReason::Unpaired
                | DisconnectReason::Navigation
                | DisconnectReason::Timeout
                | DisconnectReason::NetworkError
        )
    }

    /// Classify a raw reason string from the adapter.
    pub fn classify(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|_| DisconnectReason::Other(raw.to_string()))
    }
}

/// State of the underlying browser-backed client as reported by `get_state`.
#[derive(Debug, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    Connected,
    Opening,
    Pairing,
    Unpaired,
    UnpairedIdle,
    Conflict,
    Timeout,
    #[strum(default)]
    Other(String),
}

/// Events emitted by the browser client adapter.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A pairing QR code was generated (payload is the raw QR data).
    Qr(String),
    /// WhatsApp Web sync progress.
    Loading { percent: u8, message: String },
    /// Credentials accepted.
    Authenticated,
    /// Fully connected and ready to send.
    Ready,
    /// Credentials rejected.
    AuthFailure(String),
    /// The session dropped; carries the adapter's raw reason string.
    Disconnected(String),
    /// The adapter observed a state change outside the usual event flow.
    ChangeState(ClientState),
    /// The adapter finished writing the auth archive for this session.
    RemoteSessionSaved,
    /// An inbound message arrived (payload forwarded to the webhook layer).
    Message(serde_json::Value),
}

/// Phone identity reported by a connected client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Phone number in wire format (`5511999887766`).
    pub phone: Option<String>,
    /// Display name configured on the device.
    pub pushname: Option<String>,
    /// Device platform string.
    pub platform: Option<String>,
}

/// Kind of a pending outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Media,
}

/// Reference to media content for an outbound message.
///
/// Exactly one of `url` or `base64` is set; the gateway validates this
/// before the message enters the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: Option<String>,
    pub base64: Option<String>,
    pub mime: Option<String>,
    pub filename: Option<String>,
}

/// An outbound message held in the pending queue while its instance is
/// not connected.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Message id returned to the caller when the send was queued.
    pub id: String,
    pub kind: MessageKind,
    /// Destination chat id (`<phone>@c.us` wire format).
    pub to: String,
    /// Text body (text messages, or empty for media).
    pub content: String,
    pub media: Option<MediaRef>,
    pub caption: Option<String>,
    /// Monotonic enqueue time used for TTL arithmetic.
    pub enqueued_at: Instant,
    /// Wall-clock enqueue time surfaced in the queue inspection endpoint.
    pub enqueued_at_utc: chrono::DateTime<chrono::Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl PendingMessage {
    /// Build a fresh text message with a new id.
    pub fn text(to: &str, body: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MessageKind::Text,
            to: to.to_string(),
            content: body.to_string(),
            media: None,
            caption: None,
            enqueued_at: Instant::now(),
            enqueued_at_utc: chrono::Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Build a fresh media message with a new id.
    pub fn media(to: &str, media: MediaRef, caption: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MessageKind::Media,
            to: to.to_string(),
            content: String::new(),
            media: Some(media),
            caption,
            enqueued_at: Instant::now(),
            enqueued_at_utc: chrono::Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}

/// Outcome of a send request against the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered synchronously through the live client.
    Sent { message_id: String },
    /// Instance not connected; held in the pending queue.
    Queued { message_id: String, position: usize },
}

/// A durable instance row in the metadata store.
///
/// `enabled` is the operator's intent: the rehydrator and the recovery sweep
/// keep every enabled instance running. `connection_status` is observational
/// and may lag the in-memory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub webhook_url: Option<String>,
    pub sistema_url: Option<String>,
    pub api_token: Option<String>,
    pub phone: Option<String>,
    pub enabled: bool,
    pub connection_status: String,
    /// ISO 8601 timestamp of the last successful connection.
    pub last_connection_at: Option<String>,
    pub last_disconnect_reason: Option<String>,
    pub reconnect_attempts: u32,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
}

impl InstanceRecord {
    /// A fresh enabled row with default status.
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            webhook_url: None,
            sistema_url: None,
            api_token: None,
            phone: None,
            enabled: true,
            connection_status: "DISCONNECTED".to_string(),
            last_connection_at: None,
            last_disconnect_reason: None,
            reconnect_attempts: 0,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_db_strings_are_stable() {
        assert_eq!(InstanceStatus::Connected.as_db_str(), "CONNECTED");
        assert_eq!(InstanceStatus::Loading(50).as_db_str(), "LOADING");
        assert_eq!(InstanceStatus::QrRequired.as_db_str(), "QR_REQUIRED");
        assert_eq!(InstanceStatus::SyncTimeout.as_db_str(), "SYNC_TIMEOUT");
    }

    #[test]
    fn loading_display_carries_percentage() {
        assert_eq!(InstanceStatus::Loading(42).to_string(), "LOADING(42%)");
        assert_eq!(InstanceStatus::Connected.to_string(), "CONNECTED");
    }

    #[test]
    fn terminal_states() {
        assert!(InstanceStatus::Disconnected.is_terminal());
        assert!(InstanceStatus::InitError.is_terminal());
        assert!(InstanceStatus::SyncTimeout.is_terminal());
        assert!(!InstanceStatus::Connected.is_terminal());
        assert!(!InstanceStatus::AuthFailure.is_terminal());
    }

    #[test]
    fn reason_round_trips_screaming_snake() {
        assert_eq!(DisconnectReason::NetworkError.to_string(), "NETWORK_ERROR");
        assert_eq!(
            DisconnectReason::from_str("NETWORK_ERROR").unwrap(),
            DisconnectReason::NetworkError
        );
        assert_eq!(
            DisconnectReason::ConsecutiveHeartbeatFailures.to_string(),
            "CONSECUTIVE_HEARTBEAT_FAILURES"
        );
        assert_eq!(DisconnectReason::SmbTosBlock.to_string(), "SMB_TOS_BLOCK");
    }

    #[test]
    fn unknown_reason_is_preserved() {
        let reason = DisconnectReason::classify("SOME_FUTURE_REASON");
        assert_eq!(reason, DisconnectReason::Other("SOME_FUTURE_REASON".into()));
        assert!(!reason.is_permanent());
        assert!(!reason.is_immediate());
    }

    #[test]
    fn permanent_reasons() {
        for raw in ["LOGOUT", "BANNED", "TOS_BLOCK", "SMB_TOS_BLOCK"] {
            assert!(DisconnectReason::classify(raw).is_permanent(), "{raw}");
        }
        assert!(!DisconnectReason::classify("NAVIGATION").is_permanent());
    }

    #[test]
    fn immediate_reasons() {
        for raw in ["CONFLICT", "UNPAIRED", "NAVIGATION", "TIMEOUT", "NETWORK_ERROR"] {
            assert!(DisconnectReason::classify(raw).is_immediate(), "{raw}");
        }
        assert!(!DisconnectReason::classify("LOGOUT").is_immediate());
    }

    #[test]
    fn client_state_parses_adapter_strings() {
        assert_eq!(
            ClientState::from_str("UNPAIRED_IDLE").unwrap(),
            ClientState::UnpairedIdle
        );
        assert_eq!(
            ClientState::from_str("CONNECTED").unwrap(),
            ClientState::Connected
        );
        assert_eq!(
            ClientState::from_str("DEPRECATED_VERSION").unwrap(),
            ClientState::Other("DEPRECATED_VERSION".into())
        );
    }

    #[test]
    fn pending_message_constructors() {
        let text = PendingMessage::text("5511999887766@c.us", "hello");
        assert_eq!(text.kind, MessageKind::Text);
        assert_eq!(text.attempts, 0);
        assert!(!text.id.is_empty());

        let media = PendingMessage::media(
            "5511999887766@c.us",
            MediaRef {
                url: Some("https://example.com/cat.jpg".into()),
                ..Default::default()
            },
            Some("look".into()),
        );
        assert_eq!(media.kind, MessageKind::Media);
        assert!(media.media.is_some());
    }

    #[test]
    fn instance_record_defaults() {
        let rec = InstanceRecord::new("inst-1", "Main line");
        assert!(rec.enabled);
        assert_eq!(rec.connection_status, "DISCONNECTED");
        assert_eq!(rec.reconnect_attempts, 0);
    }
}
