//! HTTP surface tests: routing, status-code mapping and JSON bodies.

use anvil_server::db::Db;
use anvil_server::{app, AppState};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

const TEMPLATE: &str = r#"
version: "0.1"
name: provision
tasks:
  - name: install
    worker: "{{ device_1 }}"
    actions:
      - name: stream-image
        image: quay.io/anvil/image2disk:v1
      - name: kexec
        image: quay.io/anvil/kexec:v1
"#;

async fn test_app() -> Router {
    let db = Db::open_in_memory().await.unwrap();
    app(AppState { db }, Duration::from_secs(5))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_healthz() {
    let app = test_app().await;
    let (status, _) = send(&app, "GET", "/api/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_template_crud_over_http() {
    let app = test_app().await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/templates",
        Some(json!({"name": "ubuntu", "data": TEMPLATE})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", "/api/templates/ubuntu", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"].as_str().unwrap(), id);

    let (status, body) = send(&app, "GET", "/api/templates", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, "DELETE", "/api/templates/ubuntu", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "GET", "/api/templates/ubuntu", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFound");
}

#[tokio::test]
async fn test_invalid_template_maps_to_bad_request() {
    let app = test_app().await;
    let (status, body) = send(
        &app,
        "POST",
        "/api/templates",
        Some(json!({"name": "broken", "data": "version: \"0.9\"\nname: x\ntasks: []\n"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ParseError");
}

#[tokio::test]
async fn test_duplicate_template_maps_to_conflict() {
    let app = test_app().await;
    let req = json!({"name": "ubuntu", "data": TEMPLATE});
    send(&app, "POST", "/api/templates", Some(req.clone())).await;
    let (status, body) = send(&app, "POST", "/api/templates", Some(req)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "AlreadyExists");
}

#[tokio::test]
async fn test_worker_dispatch_flow_over_http() {
    let app = test_app().await;

    let (_, body) = send(
        &app,
        "POST",
        "/api/templates",
        Some(json!({"name": "ubuntu", "data": TEMPLATE})),
    )
    .await;
    let template_id = body["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        "POST",
        "/api/hardware",
        Some(json!({"id": "hw-1", "device_1": "aa:bb:cc:00:11:22"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app,
        "POST",
        "/api/workflows",
        Some(json!({"template_id": template_id, "hardware_id": "hw-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let wf_id = body["id"].as_str().unwrap().to_string();

    // The worker discovers its assignment by its own MAC.
    let (status, body) = send(
        &app,
        "GET",
        "/api/workers/aa:bb:cc:00:11:22/workflows",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(&app, "GET", &format!("/api/workflows/{}/actions", wf_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let actions = body.as_array().unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0]["name"], "stream-image");

    // First report flips the workflow to RUNNING.
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/workflows/{}/events", wf_id),
        Some(json!({
            "worker_id": "aa:bb:cc:00:11:22",
            "task_name": "install",
            "action_name": "stream-image",
            "action_status": "RUNNING",
            "seconds": 0,
            "message": "",
            "task_index": 0,
            "action_index": 0
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_action_state"], "RUNNING");

    let (status, body) = send(&app, "GET", &format!("/api/workflows/{}", wf_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "RUNNING");

    // An out-of-order report maps to 409.
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/workflows/{}/events", wf_id),
        Some(json!({
            "worker_id": "aa:bb:cc:00:11:22",
            "task_name": "install",
            "action_name": "kexec",
            "action_status": "RUNNING",
            "task_index": 0,
            "action_index": 1
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "OutOfOrder");

    let (status, body) = send(&app, "GET", &format!("/api/workflows/{}/events", wf_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_workflow_data_cas_over_http() {
    let app = test_app().await;

    let (_, body) = send(
        &app,
        "POST",
        "/api/templates",
        Some(json!({"name": "ubuntu", "data": TEMPLATE})),
    )
    .await;
    let template_id = body["id"].as_str().unwrap().to_string();
    send(
        &app,
        "POST",
        "/api/hardware",
        Some(json!({"id": "hw-1", "device_1": "aa:bb:cc:00:11:22"})),
    )
    .await;
    let (_, body) = send(
        &app,
        "POST",
        "/api/workflows",
        Some(json!({"template_id": template_id, "hardware_id": "hw-1"})),
    )
    .await;
    let wf_id = body["id"].as_str().unwrap().to_string();
    let data_uri = format!("/api/workflows/{}/data", wf_id);

    // "facts" in base64.
    let encoded = "ZmFjdHM=";
    let (status, body) = send(
        &app,
        "PUT",
        &data_uri,
        Some(json!({"expected_version": 0, "data": encoded})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);

    let (status, body) = send(
        &app,
        "PUT",
        &data_uri,
        Some(json!({"expected_version": 0, "data": encoded})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "VersionConflict");

    let (status, body) = send(&app, "GET", &data_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
    assert_eq!(body["data"], encoded);
}

#[tokio::test]
async fn test_hardware_lookup_routes() {
    let app = test_app().await;
    send(
        &app,
        "POST",
        "/api/hardware",
        Some(json!({
            "id": "hw-1",
            "network": {"interfaces": [
                {"dhcp": {"mac": "AA:BB:CC:00:11:22", "ip": {"address": "10.0.0.7"}}}
            ]}
        })),
    )
    .await;

    for uri in [
        "/api/hardware/hw-1",
        "/api/hardware/mac/aa:bb:cc:00:11:22",
        "/api/hardware/ip/10.0.0.7",
    ] {
        let (status, body) = send(&app, "GET", uri, None).await;
        assert_eq!(status, StatusCode::OK, "lookup {uri}");
        assert_eq!(body["id"], "hw-1");
    }

    let (status, body) = send(&app, "GET", "/api/hardware/mac/ff:ff:ff:ff:ff:ff", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFound");
}
