use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use gsm_pairing_gateway::{
    http::{GatewayState, router},
    render::QrRenderer,
};
use gsm_session::{
    ConnectionManager, DisconnectCause, ManagerOptions, OutboundDispatcher, Phase,
    ReconnectPolicy, SessionEvent,
    testkit::{ConnectScript, RecordingHandle, ScriptedProvider, wait_for_status},
};
use serde_json::{Value, json};
use tower::ServiceExt;

struct Harness {
    app: Router,
    manager: ConnectionManager,
    provider: Arc<ScriptedProvider>,
}

fn harness() -> Harness {
    let provider = ScriptedProvider::new();
    let options = ManagerOptions {
        policy: ReconnectPolicy::fixed(Duration::from_secs(5)).without_jitter(),
        ..ManagerOptions::default()
    };
    let manager = ConnectionManager::new(provider.clone(), options);
    let dispatcher = OutboundDispatcher::new(manager.clone());
    let app = router(GatewayState::new(dispatcher, Arc::new(QrRenderer::new(2, 1))));
    Harness {
        app,
        manager,
        provider,
    }
}

async fn connected_harness() -> (Harness, Arc<RecordingHandle>) {
    let harness = harness();
    let handle = Arc::new(RecordingHandle::new());
    harness
        .provider
        .push(ConnectScript::Connect(handle.clone()));
    harness.manager.start().await;
    wait_for_status(&harness.manager, |s| s.connected).await;
    (harness, handle)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("router handles request");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, bytes.to_vec())
}

async fn call_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = call(app, method, uri, body).await;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, json)
}

#[tokio::test(start_paused = true)]
async fn healthz_and_status() {
    let harness = harness();
    let (status, body) = call(&harness.app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());

    let (status, json) = call_json(&harness.app, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["phase"], "idle");
    assert_eq!(json["connected"], false);
    assert_eq!(json["pairing_code_available"], false);
    assert_eq!(json["reconnect_attempt"], 0);
    assert!(json["started_at"].as_str().is_some());
    assert!(json["uptime_secs"].as_u64().is_some());
}

#[tokio::test(start_paused = true)]
async fn pairing_endpoint_follows_lifecycle() {
    let harness = harness();
    let (status, json) = call_json(&harness.app, "GET", "/pairing", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "not_ready");

    let (status, _) = call(&harness.app, "GET", "/pairing.png", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    harness.provider.push(ConnectScript::Pair("pair-me".into()));
    harness.manager.start().await;
    wait_for_status(&harness.manager, |s| s.pairing_code_available).await;

    let (status, json) = call_json(&harness.app, "GET", "/pairing", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "pending");
    assert_eq!(json["code"], "pair-me");
    assert!(json["image"]
        .as_str()
        .is_some_and(|image| image.starts_with("data:image/png;base64,")));
    assert!(json["issued_at"].as_str().is_some());

    let (status, png) = call(&harness.app, "GET", "/pairing.png", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));

    harness
        .provider
        .emit(SessionEvent::Connected(Arc::new(RecordingHandle::new())));
    wait_for_status(&harness.manager, |s| s.connected).await;
    let (status, json) = call_json(&harness.app, "GET", "/pairing", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({"status": "connected"}));
}

#[tokio::test(start_paused = true)]
async fn send_delivers_normalized_message() {
    let (harness, handle) = connected_harness().await;
    let (status, json) = call_json(
        &harness.app,
        "POST",
        "/send",
        Some(json!({"recipient": "+91 99999-99999", "body": "build finished"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["providerMessageId"], "msg-1");
    assert_eq!(
        handle.sent(),
        vec![("919999999999".to_string(), "build finished".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn send_validation_is_400() {
    let (harness, handle) = connected_harness().await;
    let (status, json) = call_json(
        &harness.app,
        "POST",
        "/send",
        Some(json!({"recipient": "+91 99999-99999", "body": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "validation_error");
    assert_eq!(json["success"], false);
    assert_eq!(json["failureReason"]["kind"], "validation_error");

    let (status, json) =
        call_json(&harness.app, "POST", "/send", Some(json!({"body": "hi"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "validation_error");
    assert!(handle.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn send_before_pairing_is_503_with_pointer() {
    let harness = harness();
    harness.provider.push(ConnectScript::Pair("pair-me".into()));
    harness.manager.start().await;
    wait_for_status(&harness.manager, |s| s.phase == Phase::Pairing).await;

    let (status, json) = call_json(
        &harness.app,
        "POST",
        "/send",
        Some(json!({"recipient": "919999999999", "body": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["kind"], "not_connected");
    assert_eq!(json["pairing"], "/pairing");
    assert_eq!(json["failureReason"]["kind"], "not_connected");
}

#[tokio::test(start_paused = true)]
async fn provider_failure_is_502() {
    let (harness, handle) = connected_harness().await;
    handle.fail_next("stream reset");

    let (status, json) = call_json(
        &harness.app,
        "POST",
        "/send",
        Some(json!({"recipient": "919999999999", "body": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["kind"], "provider_error");
    assert!(json["error"].as_str().unwrap_or_default().contains("stream reset"));
    assert_eq!(json["success"], false);
    assert_eq!(json["failureReason"]["kind"], "provider_error");
    assert!(json["failureReason"]["message"]
        .as_str()
        .is_some_and(|message| message.contains("stream reset")));
}

#[tokio::test(start_paused = true)]
async fn send_and_bulk_failures_share_shape() {
    let (harness, _handle) = connected_harness().await;
    let message = json!({"recipient": "123", "body": "too short"});

    let (_, single) = call_json(&harness.app, "POST", "/send", Some(message.clone())).await;
    let (_, bulk) = call_json(
        &harness.app,
        "POST",
        "/send/bulk",
        Some(json!({"messages": [message]})),
    )
    .await;

    let entry = &bulk["results"][0];
    assert_eq!(single["success"], entry["success"]);
    assert_eq!(single["failureReason"], entry["failureReason"]);
}

#[tokio::test(start_paused = true)]
async fn logged_out_is_410_until_restart() {
    let (harness, _handle) = connected_harness().await;
    harness
        .provider
        .emit(SessionEvent::Disconnected(DisconnectCause::status(401)));
    wait_for_status(&harness.manager, |s| s.phase == Phase::ShuttingDown).await;

    let (status, json) = call_json(
        &harness.app,
        "POST",
        "/send",
        Some(json!({"recipient": "919999999999", "body": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(json["kind"], "logged_out_fatal");

    let (status, json) = call_json(&harness.app, "POST", "/restart", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "restarting");
    harness.provider.wait_for_connects(2).await;

    let (status, json) = call_json(&harness.app, "POST", "/restart", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["kind"], "restart_rejected");
}

#[tokio::test(start_paused = true)]
async fn bulk_send_reports_each_message() {
    let (harness, handle) = connected_harness().await;
    let (status, json) = call_json(
        &harness.app,
        "POST",
        "/send/bulk",
        Some(json!({"messages": [
            {"recipient": "+1 555 010 9999", "body": "first"},
            {"recipient": "123", "body": "too short"},
            {"recipient": "+44 20 7946 0958", "body": "third"},
        ]})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let results = json["results"].as_array().expect("results");
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["success"], true);
    assert_eq!(results[1]["success"], false);
    assert_eq!(results[1]["failureReason"]["kind"], "validation_error");
    assert_eq!(results[2]["success"], true);
    assert_eq!(handle.sent().len(), 2);

    let (status, json) =
        call_json(&harness.app, "POST", "/send/bulk", Some(json!({"messages": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "bad_request");
}
