// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gateway API tests against the real router, engine, and temp storage.
//! Only the browser client is mocked.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use zapgate_core::{InstanceRecord, MetadataStore};
use zapgate_gateway::{AuthConfig, GatewayState, HealthState};
use zapgate_test_utils::{EngineHarness, MockBehavior};

async fn gateway(harness: &EngineHarness, bearer_token: Option<&str>) -> axum::Router {
    let state = GatewayState {
        engine: harness.engine.clone(),
        store: harness.store.clone(),
        auth: AuthConfig {
            bearer_token: bearer_token.map(|t| t.to_string()),
        },
        health: HealthState {
            start_time: std::time::Instant::now(),
        },
    };
    zapgate_gateway::build_router(state)
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_public_and_reports_shape() {
    let harness = EngineHarness::builder().build().await.unwrap();
    let app = gateway(&harness, Some("secret")).await;

    let response = app
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["instances"].is_array());
    assert!(json["memory"]["allocated_bytes"].is_number());
}

#[tokio::test]
async fn api_routes_require_bearer_when_configured() {
    let harness = EngineHarness::builder().build().await.unwrap();
    let app = gateway(&harness, Some("secret")).await;

    let denied = app
        .clone()
        .oneshot(
            Request::get("/api/session/status/a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let allowed = app
        .oneshot(
            Request::get("/api/session/status/a")
                .header(header::AUTHORIZATION, "Bearer secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    // Authorized but unknown instance.
    assert_eq!(allowed.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_instance_status_is_404() {
    let harness = EngineHarness::builder().build().await.unwrap();
    let app = gateway(&harness, None).await;

    let response = app
        .oneshot(
            Request::get("/api/session/status/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "instance_not_found");
}

#[tokio::test]
async fn start_yields_qr_status_and_png() {
    let harness = EngineHarness::builder().build().await.unwrap();
    harness.factory.script("a", MockBehavior::cold());
    let app = gateway(&harness, None).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/session/start",
            serde_json::json!({ "instanceId": "a" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    assert!(
        harness
            .wait_for_status(
                "a",
                zapgate_core::InstanceStatus::QrRequired,
                std::time::Duration::from_secs(5),
            )
            .await,
        "instance should reach QR_REQUIRED"
    );

    let status = app
        .clone()
        .oneshot(
            Request::get("/api/session/status/a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(status).await;
    assert_eq!(json["status"], "QR_REQUIRED");
    assert_eq!(json["hasQr"], true);

    let qr = app
        .oneshot(
            Request::get("/api/session/qr/a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(qr.status(), StatusCode::OK);
    assert_eq!(
        qr.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/png"
    );
    let png = qr.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&png[..4], &[0x89, 0x50, 0x4E, 0x47]);
}

#[tokio::test]
async fn qr_for_instance_without_qr_is_404() {
    let harness = EngineHarness::builder().build().await.unwrap();
    let app = gateway(&harness, None).await;

    let response = app
        .oneshot(
            Request::get("/api/session/qr/a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn send_text_to_offline_instance_queues_with_position() {
    let harness = EngineHarness::builder()
        .with_instance(InstanceRecord::new("b", "Queue line"))
        .build()
        .await
        .unwrap();
    let app = gateway(&harness, None).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/send-text",
            serde_json::json!({
                "instance": "b",
                "to": "5511999887766@c.us",
                "message": "queued hello"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let json = body_json(response).await;
    assert_eq!(json["queued"], true);
    assert_eq!(json["position"], 1);
    assert!(json["messageId"].is_string());

    let queue = app
        .clone()
        .oneshot(Request::get("/api/queue/b").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(queue).await;
    assert_eq!(json["size"], 1);

    let cleared = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/queue/b")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(cleared).await;
    assert_eq!(json["dropped"], 1);
}

#[tokio::test]
async fn send_text_enforces_instance_token() {
    let mut record = InstanceRecord::new("c", "Tokened line");
    record.api_token = Some("tok-abc".to_string());
    let harness = EngineHarness::builder()
        .with_instance(record)
        .build()
        .await
        .unwrap();
    let app = gateway(&harness, None).await;

    let denied = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/send-text",
            serde_json::json!({ "instance": "c", "to": "x@c.us", "message": "hi" }),
        ))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let allowed = app
        .oneshot(json_request(
            "POST",
            "/api/send-text",
            serde_json::json!({
                "instance": "c",
                "to": "x@c.us",
                "message": "hi",
                "token": "tok-abc"
            }),
        ))
        .await
        .unwrap();
    // Instance is offline, so the authorized send queues.
    assert_eq!(allowed.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn send_media_requires_exactly_one_source() {
    let harness = EngineHarness::builder().build().await.unwrap();
    let app = gateway(&harness, None).await;

    let neither = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/send-media",
            serde_json::json!({ "instance": "a", "to": "x@c.us" }),
        ))
        .await
        .unwrap();
    assert_eq!(neither.status(), StatusCode::BAD_REQUEST);

    let both = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/send-media",
            serde_json::json!({
                "instance": "a",
                "to": "x@c.us",
                "media_url": "https://example.com/a.jpg",
                "media_base64": "aGk="
            }),
        ))
        .await
        .unwrap();
    assert_eq!(both.status(), StatusCode::BAD_REQUEST);

    let ok = app
        .oneshot(json_request(
            "POST",
            "/api/send-media",
            serde_json::json!({
                "instance": "a",
                "to": "x@c.us",
                "media_url": "https://example.com/a.jpg",
                "caption": "look"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn enable_and_disable_toggle_intent() {
    let mut record = InstanceRecord::new("d", "Toggle line");
    record.enabled = false;
    let harness = EngineHarness::builder()
        .with_instance(record)
        .build()
        .await
        .unwrap();
    let app = gateway(&harness, None).await;

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/instance/d/enable")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(harness.store.get_instance("d").await.unwrap().unwrap().enabled);

    let response = app
        .oneshot(
            Request::post("/api/instance/d/disable")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!harness.store.get_instance("d").await.unwrap().unwrap().enabled);
}
