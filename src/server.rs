use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as UrlPath, State,
    },
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::{
    error::{Error, Result},
    netdetect::SubnetTarget,
    orchestrator::{Orchestrator, StartOutcome},
    scheduler::{ScheduleStatus, Scheduler},
    store::{Store, HISTORY_LIMIT},
    types::{Category, Device, DevicePatch, PresenceRecord, ScanRun, ScanState, ScheduleConfig},
};

const PING_INTERVAL: Duration = Duration::from_secs(15);
const RECENT_RUNS: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn Store>,
    pub scheduler: Arc<Scheduler>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub subnet: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PatchRequest {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub icon_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub enabled: bool,
    pub interval_minutes: u64,
}

/// JSON API and the progress WebSocket, without static files or middleware.
pub fn api_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/{id}", get(get_device).patch(patch_device))
        .route("/devices/{id}/history", get(device_history))
        .route("/scan", post(post_scan))
        .route("/scan/cancel", post(cancel_scan))
        .route("/scan/status", get(scan_status))
        .route("/scans", get(list_runs))
        .route("/schedule", get(get_schedule).put(put_schedule));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Full application: API, static UI fallback, CORS for the dev server, access logs.
pub fn app(state: AppState, ui_dir: &Path) -> Router {
    let static_svc = ServeDir::new(ui_dir).append_index_html_on_directories(true);
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:5173"),
            HeaderValue::from_static("http://127.0.0.1:5173"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH])
        .allow_headers(Any);

    api_router(state)
        .fallback_service(static_svc)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(bind: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("Serving UI on http://{}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;
    Ok(())
}

/// Ports by number, blank versions as null.
fn present(mut device: Device) -> Device {
    device.ports.sort_by_key(|p| p.port);
    for port in &mut device.ports {
        port.version = port
            .version
            .take()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
    }
    device
}

async fn require_device(store: &dyn Store, id: u64) -> Result<Device> {
    store
        .get_device(id)
        .await?
        .ok_or_else(|| Error::NotFound("Device not found".into()))
}

async fn list_devices(State(app): State<AppState>) -> Result<Json<Vec<Device>>> {
    let devices = app.store.list_devices().await?;
    Ok(Json(devices.into_iter().map(present).collect()))
}

async fn get_device(
    State(app): State<AppState>,
    UrlPath(id): UrlPath<u64>,
) -> Result<Json<Device>> {
    let device = require_device(app.store.as_ref(), id).await?;
    Ok(Json(present(device)))
}

async fn device_history(
    State(app): State<AppState>,
    UrlPath(id): UrlPath<u64>,
) -> Result<Json<Vec<PresenceRecord>>> {
    require_device(app.store.as_ref(), id).await?;
    Ok(Json(app.store.device_history(id, HISTORY_LIMIT).await?))
}

async fn patch_device(
    State(app): State<AppState>,
    UrlPath(id): UrlPath<u64>,
    Json(req): Json<PatchRequest>,
) -> Result<Json<Device>> {
    let icon_type = req
        .icon_type
        .as_deref()
        .map(str::parse::<Category>)
        .transpose()
        .map_err(Error::Validation)?;
    let patch = DevicePatch {
        nickname: req.nickname,
        tags: req.tags,
        icon_type,
    };
    let device = app.store.patch_device(id, patch).await.map_err(|e| match e {
        Error::NotFound(_) => Error::NotFound("Device not found".into()),
        other => other,
    })?;
    Ok(Json(present(device)))
}

async fn post_scan(State(app): State<AppState>, body: Bytes) -> Result<impl IntoResponse> {
    let req: ScanRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ScanRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| Error::Validation(format!("invalid scan request: {e}")))?
    };
    let subnet = match req.subnet.as_deref() {
        Some(raw) => Some(SubnetTarget::from_optional(Some(raw))?),
        None => None,
    };

    let out = match app.orchestrator.start(subnet) {
        StartOutcome::Started(_) => (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))),
        StartOutcome::AlreadyRunning => (StatusCode::OK, Json(json!({ "status": "already_running" }))),
    };
    Ok(out)
}

async fn cancel_scan(State(app): State<AppState>) -> impl IntoResponse {
    let status = if app.orchestrator.cancel() { "cancelling" } else { "idle" };
    Json(json!({ "status": status }))
}

async fn scan_status(State(app): State<AppState>) -> Json<ScanState> {
    Json(app.orchestrator.current_state())
}

async fn list_runs(State(app): State<AppState>) -> Result<Json<Vec<ScanRun>>> {
    Ok(Json(app.store.list_runs(RECENT_RUNS).await?))
}

async fn get_schedule(State(app): State<AppState>) -> Json<ScheduleStatus> {
    Json(app.scheduler.status())
}

async fn put_schedule(
    State(app): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<ScheduleStatus>> {
    let status = app
        .scheduler
        .configure(ScheduleConfig {
            enabled: req.enabled,
            interval_minutes: req.interval_minutes,
        })
        .await?;
    Ok(Json(status))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

/// Push every progress snapshot to the client until either side goes away.
async fn handle_socket(socket: WebSocket, app: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let channel = app.orchestrator.progress().clone();
    let (sub_id, mut rx) = channel.subscribe();
    tracing::info!(subscriber = %sub_id, "WebSocket client connected");

    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            let text = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize progress event");
                            continue;
                        }
                    },
                    None => break,
                },
                _ = ping.tick() => json!({ "type": "ping" }).to_string(),
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket receive error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    channel.unsubscribe(sub_id);
    tracing::info!(subscriber = %sub_id, "WebSocket client disconnected");
}
