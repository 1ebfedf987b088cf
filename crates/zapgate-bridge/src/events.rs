// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SSE event intake from the automation sidecar.
//!
//! The sidecar exposes one `text/event-stream` per instance; each SSE event
//! name maps to a [`ClientEvent`] variant. Unknown event names are silently
//! skipped so the sidecar can grow its vocabulary without breaking the
//! gateway. The pump reconnects with a short delay until the engine drops
//! the receiving side.

use std::str::FromStr;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use zapgate_core::{ClientEvent, ClientState};

#[derive(Debug, Deserialize)]
struct QrData {
    qr: String,
}

#[derive(Debug, Deserialize)]
struct LoadingData {
    percent: u8,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReasonData {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct AuthFailureData {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StateData {
    state: String,
}

/// Map one SSE event to a typed client event. `None` for unknown names or
/// malformed payloads (logged by the caller).
pub(crate) fn parse_event(name: &str, data: &str) -> Option<ClientEvent> {
    match name {
        "qr" => serde_json::from_str::<QrData>(data)
            .ok()
            .map(|d| ClientEvent::Qr(d.qr)),
        "loading" => serde_json::from_str::<LoadingData>(data)
            .ok()
            .map(|d| ClientEvent::Loading {
                percent: d.percent,
                message: d.message,
            }),
        "authenticated" => Some(ClientEvent::Authenticated),
        "ready" => Some(ClientEvent::Ready),
        "auth_failure" => serde_json::from_str::<AuthFailureData>(data)
            .ok()
            .map(|d| ClientEvent::AuthFailure(d.message)),
        "disconnected" => serde_json::from_str::<ReasonData>(data)
            .ok()
            .map(|d| ClientEvent::Disconnected(d.reason)),
        "change_state" => serde_json::from_str::<StateData>(data).ok().map(|d| {
            ClientEvent::ChangeState(
                ClientState::from_str(&d.state).unwrap_or(ClientState::Other(d.state)),
            )
        }),
        "remote_session_saved" => Some(ClientEvent::RemoteSessionSaved),
        "message" => serde_json::from_str::<serde_json::Value>(data)
            .ok()
            .map(ClientEvent::Message),
        _ => None,
    }
}

/// Pump the sidecar's event stream into the engine's channel.
///
/// Runs until the receiver is dropped; stream errors trigger a reconnect
/// after a short delay.
pub(crate) async fn run_event_pump(
    http: reqwest::Client,
    events_url: String,
    instance_id: String,
    tx: mpsc::Sender<ClientEvent>,
) {
    loop {
        if tx.is_closed() {
            break;
        }

        let response = match http.get(&events_url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(
                    instance_id = instance_id.as_str(),
                    status = %response.status(),
                    "event stream rejected, retrying"
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
            Err(e) => {
                warn!(
                    instance_id = instance_id.as_str(),
                    error = %e,
                    "event stream connect failed, retrying"
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let mut stream = response.bytes_stream().eventsource();
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    match parse_event(&event.event, &event.data) {
                        Some(parsed) => {
                            if tx.send(parsed).await.is_err() {
                                debug!(
                                    instance_id = instance_id.as_str(),
                                    "engine dropped event channel, pump exiting"
                                );
                                return;
                            }
                        }
                        None => {
                            debug!(
                                instance_id = instance_id.as_str(),
                                event = event.event.as_str(),
                                "unhandled sidecar event"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        instance_id = instance_id.as_str(),
                        error = %e,
                        "event stream broke, reconnecting"
                    );
                    break;
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_event_parses() {
        let event = parse_event("qr", r#"{"qr":"2@abc,def"}"#).unwrap();
        match event {
            ClientEvent::Qr(payload) => assert_eq!(payload, "2@abc,def"),
            other => panic!("expected QR, got {other:?}"),
        }
    }

    #[test]
    fn loading_event_parses_with_default_message() {
        let event = parse_event("loading", r#"{"percent":42}"#).unwrap();
        match event {
            ClientEvent::Loading { percent, message } => {
                assert_eq!(percent, 42);
                assert!(message.is_empty());
            }
            other => panic!("expected Loading, got {other:?}"),
        }
    }

    #[test]
    fn bare_events_parse_without_payload() {
        assert!(matches!(
            parse_event("authenticated", "{}"),
            Some(ClientEvent::Authenticated)
        ));
        assert!(matches!(parse_event("ready", ""), Some(ClientEvent::Ready)));
        assert!(matches!(
            parse_event("remote_session_saved", "{}"),
            Some(ClientEvent::RemoteSessionSaved)
        ));
    }

    #[test]
    fn disconnected_event_carries_reason() {
        let event = parse_event("disconnected", r#"{"reason":"NAVIGATION"}"#).unwrap();
        match event {
            ClientEvent::Disconnected(reason) => assert_eq!(reason, "NAVIGATION"),
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    #[test]
    fn change_state_maps_known_and_unknown_states() {
        match parse_event("change_state", r#"{"state":"CONFLICT"}"#).unwrap() {
            ClientEvent::ChangeState(ClientState::Conflict) => {}
            other => panic!("expected CONFLICT, got {other:?}"),
        }
        match parse_event("change_state", r#"{"state":"SOMETHING_NEW"}"#).unwrap() {
            ClientEvent::ChangeState(ClientState::Other(s)) => assert_eq!(s, "SOMETHING_NEW"),
            other => panic!("expected Other, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_names_are_skipped() {
        assert!(parse_event("telemetry", "{}").is_none());
    }

    #[test]
    fn malformed_payload_is_skipped() {
        assert!(parse_event("qr", "not json").is_none());
    }
}
