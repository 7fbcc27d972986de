mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::*;
use lan_inventory_rs::scheduler::Scheduler;
use lan_inventory_rs::server::{api_router, AppState};
use lan_inventory_rs::store::Store;
use lan_inventory_rs::types::Host;

async fn app_for(h: &Harness) -> Router {
    let scheduler = Scheduler::start(h.orchestrator.clone(), h.store.clone()).await.unwrap();
    api_router(AppState {
        orchestrator: h.orchestrator.clone(),
        store: h.store.clone(),
        scheduler: Arc::new(scheduler),
    })
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn idle_harness() -> Harness {
    harness(FakeDiscoverer::new(vec![]), FakeProber::new(), StaticVendors::default())
}

#[tokio::test]
async fn lists_devices_with_ports_sorted() {
    let h = idle_harness();
    seed_device(h.store.as_ref(), "10.0.0.2", Some("nas"), &[443, 22, 80]).await;
    let app = app_for(&h).await;

    let (status, body) = call(&app, Method::GET, "/api/devices", None).await;
    assert_eq!(status, StatusCode::OK);
    let devices = body.as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["ip"], "10.0.0.2");
    assert_eq!(devices[0]["icon_type"], "device");
    let ports: Vec<u64> = devices[0]["ports"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["port"].as_u64().unwrap())
        .collect();
    assert_eq!(ports, vec![22, 80, 443]);
}

#[tokio::test]
async fn unknown_device_is_404() {
    let h = idle_harness();
    let app = app_for(&h).await;

    let (status, body) = call(&app, Method::GET, "/api/devices/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "NOT_FOUND");

    let (status, _) = call(&app, Method::GET, "/api/devices/999/history", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::PATCH, "/api/devices/999", Some(json!({ "nickname": "x" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn patch_updates_user_fields_and_validates_icon() {
    let h = idle_harness();
    let device = seed_device(h.store.as_ref(), "10.0.0.3", None, &[]).await;
    let app = app_for(&h).await;
    let uri = format!("/api/devices/{}", device.id);

    let (status, body) = call(
        &app,
        Method::PATCH,
        &uri,
        Some(json!({ "nickname": "Den TV", "tags": ["media"], "icon_type": "tv" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nickname"], "Den TV");
    assert_eq!(body["tags"], json!(["media"]));
    assert_eq!(body["icon_type"], "tv");

    let (status, body) = call(&app, Method::PATCH, &uri, Some(json!({ "icon_type": "toaster" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "VALIDATION_ERROR");

    // Rejected patch left the device alone.
    let (_, body) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(body["icon_type"], "tv");
}

#[tokio::test]
async fn post_scan_starts_once_while_running() {
    let (discoverer, gate) = FakeDiscoverer::gated(vec![Host::new("10.0.0.1")]);
    let h = harness(discoverer, FakeProber::new(), StaticVendors::default());
    let app = app_for(&h).await;

    let (status, body) = call(&app, Method::POST, "/api/scan", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "started");

    let (status, body) = call(&app, Method::POST, "/api/scan", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_running");

    let (_, body) = call(&app, Method::GET, "/api/scan/status", None).await;
    assert_eq!(body["status"], "running");

    let (_, body) = call(&app, Method::POST, "/api/scan/cancel", None).await;
    assert_eq!(body["status"], "cancelling");
    gate.add_permits(1);
}

#[tokio::test]
async fn post_scan_rejects_bad_subnet() {
    let h = idle_harness();
    let app = app_for(&h).await;

    let (status, body) = call(&app, Method::POST, "/api/scan", Some(json!({ "subnet": "not-a-net" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "VALIDATION_ERROR");
    assert_eq!(h.store.list_runs(10).await.unwrap().len(), 0);
}

#[tokio::test]
async fn idle_status_and_cancel() {
    let h = idle_harness();
    let app = app_for(&h).await;

    let (status, body) = call(&app, Method::GET, "/api/scan/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "idle");
    assert_eq!(body["current"], 0);

    let (_, body) = call(&app, Method::POST, "/api/scan/cancel", None).await;
    assert_eq!(body["status"], "idle");
}

#[tokio::test]
async fn runs_and_history_after_a_scan() {
    let h = harness(
        FakeDiscoverer::new(vec![Host::new("10.0.0.5")]),
        FakeProber::new().answer("10.0.0.5", None, &[9100]),
        StaticVendors::default(),
    );
    h.orchestrator.run(None).await.unwrap();
    let app = app_for(&h).await;

    let (status, body) = call(&app, Method::GET, "/api/scans", None).await;
    assert_eq!(status, StatusCode::OK);
    let runs = body.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["status"], "done");
    assert_eq!(runs[0]["devices_found"], 1);

    let device = h.store.find_device_by_ip("10.0.0.5").await.unwrap().unwrap();
    let (status, body) = call(&app, Method::GET, &format!("/api/devices/{}/history", device.id), None).await;
    assert_eq!(status, StatusCode::OK);
    let history = body.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["is_online"], true);
    assert_eq!(history[0]["scan_id"], runs[0]["id"]);
}

#[tokio::test]
async fn schedule_round_trip_clamps_interval() {
    let h = idle_harness();
    let app = app_for(&h).await;

    let (status, body) = call(&app, Method::GET, "/api/schedule", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    assert_eq!(body["interval_minutes"], 60);
    assert!(body["next_run_at"].is_null());

    let (status, body) = call(
        &app,
        Method::PUT,
        "/api/schedule",
        Some(json!({ "enabled": true, "interval_minutes": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);
    assert_eq!(body["interval_minutes"], 1);
    assert!(body["next_run_at"].is_string());

    let stored = h.store.schedule().await.unwrap();
    assert!(stored.enabled);
    assert_eq!(stored.interval_minutes, 1);
}

#[tokio::test]
async fn schedule_rejects_interval_beyond_a_year() {
    let h = idle_harness();
    let app = app_for(&h).await;

    let (status, _) = call(
        &app,
        Method::PUT,
        "/api/schedule",
        Some(json!({ "enabled": true, "interval_minutes": 45 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &app,
        Method::PUT,
        "/api/schedule",
        Some(json!({ "enabled": true, "interval_minutes": 10_000_000_000u64 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "VALIDATION_ERROR");

    let (status, body) = call(&app, Method::GET, "/api/schedule", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["interval_minutes"], 45);
    assert_eq!(h.store.schedule().await.unwrap().interval_minutes, 45);
}
