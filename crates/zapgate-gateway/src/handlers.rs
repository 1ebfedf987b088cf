// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP request handlers for the gateway REST API.
//!
//! Every endpoint answers with a stable machine-readable body:
//! `{success: true, ...}`, `{success: true, queued: true, ...}` for a 202,
//! or `{success: false, error: "<code>"}`.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use zapgate_core::{InstanceRecord, MediaRef, PendingMessage, SendOutcome, ZapgateError};

use crate::server::GatewayState;

/// Body for the session admin endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub instance_id: String,
}

/// Body for POST /api/send-text.
#[derive(Debug, Deserialize)]
pub struct SendTextRequest {
    pub instance: String,
    pub to: String,
    pub message: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Body for POST /api/send-media.
#[derive(Debug, Deserialize)]
pub struct SendMediaRequest {
    pub instance: String,
    pub to: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_base64: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub has_qr: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentResponse {
    pub success: bool,
    pub message_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedResponse {
    pub success: bool,
    pub queued: bool,
    pub message_id: String,
    pub position: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntryView {
    pub id: String,
    pub kind: String,
    pub to: String,
    pub enqueued_at: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub instance: String,
    pub size: usize,
    pub messages: Vec<QueueEntryView>,
}

fn error_response(status: StatusCode, code: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: code.to_string(),
        }),
    )
        .into_response()
}

fn internal_error(e: &ZapgateError) -> Response {
    error!(error = %e, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
}

/// POST /api/session/start
///
/// Queues a start; 202 because initialization continues in the background.
pub async fn post_session_start(
    State(state): State<GatewayState>,
    Json(body): Json<SessionRequest>,
) -> Response {
    // An unknown id gets a row so intent survives restarts.
    match state.store.get_instance(&body.instance_id).await {
        Ok(None) => {
            let record = InstanceRecord::new(&body.instance_id, &body.instance_id);
            if let Err(e) = state.store.upsert_instance(&record).await {
                warn!(instance_id = body.instance_id.as_str(), error = %e, "instance row create failed");
            }
        }
        Ok(Some(_)) => {
            if let Err(e) = state.store.set_enabled(&body.instance_id, true).await {
                warn!(instance_id = body.instance_id.as_str(), error = %e, "intent persist failed");
            }
        }
        Err(e) => warn!(instance_id = body.instance_id.as_str(), error = %e, "instance lookup failed"),
    }

    match state.engine.start_instance(&body.instance_id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(SuccessResponse { success: true }),
        )
            .into_response(),
        Err(e) => internal_error(&e),
    }
}

/// POST /api/session/stop
pub async fn post_session_stop(
    State(state): State<GatewayState>,
    Json(body): Json<SessionRequest>,
) -> Response {
    match state.engine.stop_instance(&body.instance_id).await {
        Ok(()) => Json(SuccessResponse { success: true }).into_response(),
        Err(e) => internal_error(&e),
    }
}

/// POST /api/session/reconnect — force a reconnect cycle.
pub async fn post_session_reconnect(
    State(state): State<GatewayState>,
    Json(body): Json<SessionRequest>,
) -> Response {
    state
        .engine
        .schedule_reconnect(&body.instance_id, zapgate_core::DisconnectReason::Manual);
    (
        StatusCode::ACCEPTED,
        Json(SuccessResponse { success: true }),
    )
        .into_response()
}

/// POST /api/session/reset — delete the local auth blob and restart.
pub async fn post_session_reset(
    State(state): State<GatewayState>,
    Json(body): Json<SessionRequest>,
) -> Response {
    match state.engine.reset_instance(&body.instance_id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(SuccessResponse { success: true }),
        )
            .into_response(),
        Err(e) => internal_error(&e),
    }
}

/// GET /api/session/status/:id
pub async fn get_session_status(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.status_of(&id).await {
        Some((status, has_qr)) => Json(StatusResponse {
            status: status.to_string(),
            has_qr,
        })
        .into_response(),
        None => {
            // No live session; fall back to the durable row.
            match state.store.get_instance(&id).await {
                Ok(Some(record)) => Json(StatusResponse {
                    status: record.connection_status,
                    has_qr: false,
                })
                .into_response(),
                Ok(None) => error_response(StatusCode::NOT_FOUND, "instance_not_found"),
                Err(e) => internal_error(&e),
            }
        }
    }
}

/// GET /api/session/qr/:id — PNG of the current pairing QR, or 404.
pub async fn get_session_qr(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    let Some(payload) = state.engine.current_qr(&id).await else {
        return error_response(StatusCode::NOT_FOUND, "no_qr_available");
    };

    match render_qr_png(&payload) {
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(e) => {
            error!(instance_id = id.as_str(), error = %e, "QR render failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "qr_render_failed")
        }
    }
}

/// POST /api/instance/:id/enable — set intent and start.
pub async fn post_instance_enable(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    if let Err(e) = state.store.set_enabled(&id, true).await {
        return internal_error(&e);
    }
    if let Err(e) = state.engine.start_instance(&id).await {
        warn!(instance_id = id.as_str(), error = %e, "start after enable failed");
    }
    Json(SuccessResponse { success: true }).into_response()
}

/// POST /api/instance/:id/disable — clear intent only; any live session
/// winds down on its next disconnect.
pub async fn post_instance_disable(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    match state.store.set_enabled(&id, false).await {
        Ok(()) => Json(SuccessResponse { success: true }).into_response(),
        Err(e) => internal_error(&e),
    }
}

/// GET /api/health — per-instance status, memory, queue sizes.
pub async fn get_health(State(state): State<GatewayState>) -> Response {
    let health = state.engine.health().await;
    let uptime_secs = state.health.start_time.elapsed().as_secs();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime_secs,
        "instances": health.instances,
        "totals": health.totals,
        "memory": health.memory,
    }))
    .into_response()
}

/// GET /api/queue/:id
pub async fn get_queue(State(state): State<GatewayState>, Path(id): Path<String>) -> Response {
    let messages: Vec<QueueEntryView> = state
        .engine
        .queue_snapshot(&id)
        .into_iter()
        .map(|m| QueueEntryView {
            id: m.id,
            kind: match m.kind {
                zapgate_core::MessageKind::Text => "text".to_string(),
                zapgate_core::MessageKind::Media => "media".to_string(),
            },
            to: m.to,
            enqueued_at: m.enqueued_at_utc.to_rfc3339(),
            attempts: m.attempts,
            last_error: m.last_error,
        })
        .collect();

    Json(QueueResponse {
        instance: id,
        size: messages.len(),
        messages,
    })
    .into_response()
}

/// DELETE /api/queue/:id
pub async fn delete_queue(State(state): State<GatewayState>, Path(id): Path<String>) -> Response {
    let dropped = state.engine.clear_queue(&id);
    Json(serde_json::json!({ "success": true, "dropped": dropped })).into_response()
}

/// Per-instance token gate for the send endpoints. Rows without a token
/// accept any caller that got past the gateway auth.
async fn check_instance_token(
    state: &GatewayState,
    instance: &str,
    presented: Option<&str>,
) -> Result<(), Response> {
    match state.store.get_instance(instance).await {
        Ok(Some(record)) => match record.api_token {
            Some(expected) if presented != Some(expected.as_str()) => {
                Err(error_response(StatusCode::UNAUTHORIZED, "invalid_token"))
            }
            _ => Ok(()),
        },
        Ok(None) => Ok(()),
        Err(e) => {
            // Metadata store down must not block sends; log and continue.
            warn!(instance_id = instance, error = %e, "token lookup failed");
            Ok(())
        }
    }
}

fn send_outcome_response(outcome: SendOutcome) -> Response {
    match outcome {
        SendOutcome::Sent { message_id } => Json(SentResponse {
            success: true,
            message_id,
        })
        .into_response(),
        SendOutcome::Queued {
            message_id,
            position,
        } => (
            StatusCode::ACCEPTED,
            Json(QueuedResponse {
                success: true,
                queued: true,
                message_id,
                position,
            }),
        )
            .into_response(),
    }
}

/// POST /api/send-text
///
/// 200 when delivered synchronously, 202 `{queued: true, ...}` when the
/// instance is not CONNECTED (a reconnect is triggered).
pub async fn post_send_text(
    State(state): State<GatewayState>,
    Json(body): Json<SendTextRequest>,
) -> Response {
    if body.to.is_empty() || body.message.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing_to_or_message");
    }
    if let Err(response) =
        check_instance_token(&state, &body.instance, body.token.as_deref()).await
    {
        return response;
    }

    let message = PendingMessage::text(&body.to, &body.message);
    match state.engine.send_or_enqueue(&body.instance, message).await {
        Ok(outcome) => send_outcome_response(outcome),
        Err(e) => {
            error!(instance_id = body.instance.as_str(), error = %e, "send failed");
            error_response(StatusCode::BAD_GATEWAY, "send_failed")
        }
    }
}

/// POST /api/send-media — identical enqueue semantics to send-text.
pub async fn post_send_media(
    State(state): State<GatewayState>,
    Json(body): Json<SendMediaRequest>,
) -> Response {
    if body.to.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing_to");
    }
    if body.media_url.is_some() == body.media_base64.is_some() {
        return error_response(StatusCode::BAD_REQUEST, "exactly_one_media_source");
    }
    if let Err(response) =
        check_instance_token(&state, &body.instance, body.token.as_deref()).await
    {
        return response;
    }

    let media = MediaRef {
        url: body.media_url,
        base64: body.media_base64,
        mime: body.mime,
        filename: body.filename,
    };
    let message = PendingMessage::media(&body.to, media, body.caption);
    match state.engine.send_or_enqueue(&body.instance, message).await {
        Ok(outcome) => send_outcome_response(outcome),
        Err(e) => {
            error!(instance_id = body.instance.as_str(), error = %e, "media send failed");
            error_response(StatusCode::BAD_GATEWAY, "send_failed")
        }
    }
}

/// Render a QR payload into PNG bytes: dark modules on white with a quiet
/// zone, 10 px per module.
pub fn render_qr_png(payload: &str) -> Result<Vec<u8>, String> {
    use qrcode::{Color, EcLevel, QrCode};

    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::L)
        .map_err(|e| format!("QR generation failed: {e}"))?;

    let module_size: u32 = 10;
    let quiet_zone: u32 = 2;
    let modules = code.width() as u32;
    let img_size = (modules + quiet_zone * 2) * module_size;

    let img = image::ImageBuffer::from_fn(img_size, img_size, |x, y| {
        let mx = (x / module_size).saturating_sub(quiet_zone);
        let my = (y / module_size).saturating_sub(quiet_zone);

        if x / module_size < quiet_zone
            || y / module_size < quiet_zone
            || mx >= modules
            || my >= modules
        {
            image::Luma([255u8])
        } else {
            match code[(mx as usize, my as usize)] {
                Color::Dark => image::Luma([0u8]),
                Color::Light => image::Luma([255u8]),
            }
        }
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| format!("PNG encoding failed: {e}"))?;

    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_request_uses_camel_case() {
        let req: SessionRequest =
            serde_json::from_str(r#"{"instanceId": "inst-1"}"#).unwrap();
        assert_eq!(req.instance_id, "inst-1");
    }

    #[test]
    fn send_text_request_token_is_optional() {
        let req: SendTextRequest = serde_json::from_str(
            r#"{"instance": "a", "to": "551199@c.us", "message": "hi"}"#,
        )
        .unwrap();
        assert!(req.token.is_none());
    }

    #[test]
    fn queued_response_serializes_contract_fields() {
        let resp = QueuedResponse {
            success: true,
            queued: true,
            message_id: "m-1".to_string(),
            position: 1,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"queued\":true"));
        assert!(json.contains("\"messageId\":\"m-1\""));
        assert!(json.contains("\"position\":1"));
    }

    #[test]
    fn status_response_serializes_has_qr() {
        let resp = StatusResponse {
            status: "QR_REQUIRED".to_string(),
            has_qr: true,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"hasQr\":true"));
    }

    #[test]
    fn qr_png_has_png_magic_bytes() {
        let png = render_qr_png("2@test-payload,xyz").unwrap();
        assert_eq!(&png[..4], &[0x89, 0x50, 0x4E, 0x47]);
        assert!(png.len() > 100, "PNG should carry real image data");
    }

    #[test]
    fn qr_png_size_scales_with_payload() {
        let small = render_qr_png("short").unwrap();
        let large = render_qr_png(&"x".repeat(400)).unwrap();
        assert!(!small.is_empty());
        assert!(!large.is_empty());
    }
}
