//! HTTP/WebSocket surface: router assembly, process-wide `AppState`, and every request
//! handler. No auth, session persistence, or TLS here — this process assumes a single
//! trusted caller and external TLS termination.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use base64::Engine;
use ghost_protocol::cdp::{
    ClickMouseRequest, DisplayPatchRequest, DisplayPatchResponse, DragMouseRequest,
    PasteRequest, PressKeyRequest, ProcessExecRequest, ProcessExecResponse, ScreenshotRequest,
    ScreenshotResponse, ScrollRequest,
};
use ghost_protocol::recorder::{RecorderMetadata, RecorderStartRequest};
use ghost_protocol::streamer::{
    StreamListResponse, StreamStartRequest, StreamerMetadata, WebrtcOfferRequest, WebrtcOfferResponse,
};
use ghost_protocol::virtual_input::{VirtualInputConfigureRequest, VirtualInputStatus};
use ghost_protocol::AppError;
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::cdp_client::CdpSession;
use crate::cdp_proxy;
use crate::config::GhostConfig;
use crate::domsync::DomSyncBridge;
use crate::error::{HttpError, HttpResult};
use crate::extension_policy::ExtensionPolicyApplier;
use crate::metrics::Metrics;
use crate::recorder::RecorderRegistry;
use crate::restart::restart_browser_and_wait;
use crate::scale_to_zero::ScaleToZeroGate;
use crate::streamer::StreamerRegistry;
use crate::upstream::UpstreamTracker;
use crate::virtual_input::VirtualInputPipeline;

const OPENAPI_DOCUMENT: &str = include_str!("openapi.yaml");

pub struct AppState {
    pub config: GhostConfig,
    pub upstream: Arc<UpstreamTracker>,
    pub scale_gate: Arc<ScaleToZeroGate>,
    pub streamers: Arc<StreamerRegistry>,
    pub recorders: Arc<RecorderRegistry>,
    pub virtual_input: Arc<VirtualInputPipeline>,
    pub domsync: Arc<DomSyncBridge>,
    pub extension_policy: ExtensionPolicyApplier,
    pub process_exec_semaphore: Semaphore,
    pub metrics: Metrics,
    pub started_at: Instant,
    pub display: RwLock<DisplayPatchResponse>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // Each body-bearing route carries its own `RequestBodyLimitLayer` rather than one
    // applied to the whole router: axum applies a `Router::layer()` only to routes
    // already registered at that point in the chain, so a single shared limit layer
    // would silently exempt (or, worse, double-wrap at the wrong bound) whichever
    // routes are added afterward. Per-route layers sidestep the ordering entirely.
    let body_limit = state.config.server.request_body_limit_bytes;
    let upload_limit = state.config.server.upload_body_limit_bytes;
    let web_root = state.config.server.web_root.clone();
    let extensions_dir = state.config.extension_policy.extensions_dir.clone();
    fn limited(
        mr: axum::routing::MethodRouter<Arc<AppState>>,
        limit: usize,
    ) -> axum::routing::MethodRouter<Arc<AppState>> {
        mr.layer(RequestBodyLimitLayer::new(limit))
    }

    let control_routes = Router::new()
        .route("/computer/screenshot", limited(post(screenshot), body_limit))
        .route("/computer/click_mouse", limited(post(click_mouse), body_limit))
        .route("/computer/press_key", limited(post(press_key), body_limit))
        .route("/computer/scroll", limited(post(scroll), body_limit))
        .route("/computer/drag_mouse", limited(post(drag_mouse), body_limit))
        .route("/computer/paste", limited(post(paste), body_limit))
        .route("/display", limited(patch(patch_display), body_limit))
        .route("/stream/start", limited(post(stream_start), body_limit))
        .route("/stream/stop", post(stream_stop))
        .route("/stream/list", get(stream_list))
        .route("/stream/webrtc/offer", limited(post(stream_webrtc_offer), body_limit))
        .route("/stream/socket/{id}", get(stream_socket_ws))
        .route("/recordings/start", limited(post(recordings_start), body_limit))
        .route("/recordings", get(recordings_list))
        .route("/recordings/{id}/stop", post(recordings_stop))
        .route("/recordings/{id}", delete(recordings_delete))
        .route("/recordings/{id}/download", get(recordings_download))
        .route("/input/devices/virtual/configure", limited(post(virtual_input_configure), body_limit))
        .route("/input/devices/virtual/pause", post(virtual_input_pause))
        .route("/input/devices/virtual/resume", post(virtual_input_resume))
        .route("/input/devices/virtual/stop", post(virtual_input_stop))
        .route("/input/devices/virtual/feed", get(virtual_input_feed_page))
        .route("/input/devices/virtual/feed/socket", get(virtual_input_feed_socket))
        .route("/input/devices/virtual/feed/socket/info", get(virtual_input_feed_info))
        .route("/input/devices/virtual/socket/{kind}", get(virtual_input_ingest_ws))
        .route("/input/devices/virtual/webrtc/offer", limited(post(virtual_input_webrtc_offer), body_limit))
        .route("/process/exec", limited(post(process_exec), body_limit))
        .route(
            "/chromium/upload-extensions-and-restart",
            post(upload_extensions_and_restart).layer(RequestBodyLimitLayer::new(upload_limit)),
        );

    let probe_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/spec.yaml", get(spec_yaml));

    let ws_routes = Router::new()
        .route("/cdp", get(cdp_ws))
        .route("/dom-sync", get(dom_sync_ws));

    Router::new()
        .merge(control_routes)
        .merge(probe_routes)
        .merge(ws_routes)
        .nest_service("/extensions", ServeDir::new(extensions_dir))
        .with_state(Arc::clone(&state))
        .fallback_service(ServeDir::new(web_root))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(security_headers))
}

/// Same header set the teacher's `web.rs` applies to every response: conservative
/// defaults appropriate for a process that has no login flow of its own and expects
/// to sit behind whatever reverse proxy terminates TLS.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert("x-xss-protection", HeaderValue::from_static("0"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );

    response
}

async fn open_cdp_session(state: &AppState) -> Result<CdpSession, HttpError> {
    let url = state
        .upstream
        .current()
        .ok_or_else(|| AppError::NotReady("upstream devtools endpoint not ready".to_string()))?;
    let dial_timeout = Duration::from_secs(state.config.timeouts.dial_secs);
    let round_trip_timeout = Duration::from_secs(state.config.timeouts.cdp_round_trip_secs);
    CdpSession::open(&url, dial_timeout, round_trip_timeout)
        .await
        .map_err(HttpError::from)
}

fn modifiers_bitmask(modifiers: &[String]) -> i64 {
    let mut mask = 0;
    for m in modifiers {
        mask |= match m.to_ascii_lowercase().as_str() {
            "alt" => 1,
            "ctrl" | "control" => 2,
            "meta" | "cmd" | "command" => 4,
            "shift" => 8,
            _ => 0,
        };
    }
    mask
}

async fn screenshot(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScreenshotRequest>,
) -> HttpResult<Json<ScreenshotResponse>> {
    let session = open_cdp_session(&state).await?;
    let mut params = json!({"format": "png"});
    if let Some(clip) = &req.clip {
        params["clip"] = json!({
            "x": clip.x, "y": clip.y, "width": clip.width, "height": clip.height, "scale": 1,
        });
    }
    let result = session.call("Page.captureScreenshot", params).await;
    session.close().await;
    let result = result.map_err(AppError::Other)?;
    let data = result
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Other(anyhow::anyhow!("screenshot response had no data field")))?;
    Ok(Json(ScreenshotResponse {
        png_base64: data.to_string(),
    }))
}

async fn click_mouse(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClickMouseRequest>,
) -> HttpResult<StatusCode> {
    let session = open_cdp_session(&state).await?;
    let click_count = if req.double { 2 } else { 1 };
    let result: anyhow::Result<()> = async {
        session
            .call(
                "Input.dispatchMouseEvent",
                json!({"type": "mousePressed", "x": req.x, "y": req.y, "button": req.button, "clickCount": click_count}),
            )
            .await?;
        session
            .call(
                "Input.dispatchMouseEvent",
                json!({"type": "mouseReleased", "x": req.x, "y": req.y, "button": req.button, "clickCount": click_count}),
            )
            .await?;
        Ok(())
    }
    .await;
    session.close().await;
    result.map_err(AppError::Other)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn press_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PressKeyRequest>,
) -> HttpResult<StatusCode> {
    let session = open_cdp_session(&state).await?;
    let modifiers = modifiers_bitmask(&req.modifiers);
    let result: anyhow::Result<()> = async {
        session
            .call(
                "Input.dispatchKeyEvent",
                json!({"type": "rawKeyDown", "key": req.key, "modifiers": modifiers}),
            )
            .await?;
        if req.key.chars().count() == 1 {
            session
                .call(
                    "Input.dispatchKeyEvent",
                    json!({"type": "char", "text": req.key, "key": req.key, "modifiers": modifiers}),
                )
                .await?;
        }
        session
            .call(
                "Input.dispatchKeyEvent",
                json!({"type": "keyUp", "key": req.key, "modifiers": modifiers}),
            )
            .await?;
        Ok(())
    }
    .await;
    session.close().await;
    result.map_err(AppError::Other)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn scroll(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScrollRequest>,
) -> HttpResult<StatusCode> {
    let session = open_cdp_session(&state).await?;
    let result = session
        .call(
            "Input.dispatchMouseEvent",
            json!({"type": "mouseWheel", "x": req.x, "y": req.y, "deltaX": req.delta_x, "deltaY": req.delta_y}),
        )
        .await;
    session.close().await;
    result.map_err(AppError::Other)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn drag_mouse(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DragMouseRequest>,
) -> HttpResult<StatusCode> {
    let session = open_cdp_session(&state).await?;
    let result: anyhow::Result<()> = async {
        session
            .call(
                "Input.dispatchMouseEvent",
                json!({"type": "mousePressed", "x": req.from_x, "y": req.from_y, "button": "left", "clickCount": 1}),
            )
            .await?;
        session
            .call(
                "Input.dispatchMouseEvent",
                json!({"type": "mouseMoved", "x": req.to_x, "y": req.to_y, "button": "left"}),
            )
            .await?;
        session
            .call(
                "Input.dispatchMouseEvent",
                json!({"type": "mouseReleased", "x": req.to_x, "y": req.to_y, "button": "left", "clickCount": 1}),
            )
            .await?;
        Ok(())
    }
    .await;
    session.close().await;
    result.map_err(AppError::Other)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn paste(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PasteRequest>,
) -> HttpResult<StatusCode> {
    let session = open_cdp_session(&state).await?;
    let result = session
        .call("Input.insertText", json!({"text": req.text}))
        .await;
    session.close().await;
    result.map_err(AppError::Other)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn patch_display(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DisplayPatchRequest>,
) -> HttpResult<Json<DisplayPatchResponse>> {
    restart_browser_and_wait(&state.config.display.restart_command, &state.upstream)
        .await
        .map_err(AppError::Other)?;
    state.metrics.upstream_restarts_observed.fetch_add(1, Ordering::Relaxed);
    let response = DisplayPatchResponse {
        width: req.width,
        height: req.height,
    };
    *state.display.write().await = response.clone();
    Ok(Json(response))
}

async fn stream_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StreamStartRequest>,
) -> HttpResult<Json<StreamerMetadata>> {
    let meta = state.streamers.start(req).await?;
    state.metrics.streamer_starts.fetch_add(1, Ordering::Relaxed);
    Ok(Json(meta))
}

async fn stream_stop(State(state): State<Arc<AppState>>) -> StatusCode {
    state.streamers.stop_all().await;
    state.metrics.streamer_stops.fetch_add(1, Ordering::Relaxed);
    StatusCode::NO_CONTENT
}

async fn stream_list(State(state): State<Arc<AppState>>) -> Json<StreamListResponse> {
    Json(state.streamers.list().await)
}

async fn stream_webrtc_offer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WebrtcOfferRequest>,
) -> HttpResult<Json<WebrtcOfferResponse>> {
    let id = state
        .streamers
        .first_webrtc_id()
        .await
        .ok_or_else(|| AppError::NotReady("no webrtc-mode streamer is active".to_string()))?;
    let sdp = state.streamers.webrtc_offer(&id, req.sdp).await?;
    Ok(Json(WebrtcOfferResponse { sdp }))
}

async fn stream_socket_ws(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { state.streamers.handle_socket_client(&id, socket).await })
}

async fn recordings_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecorderStartRequest>,
) -> HttpResult<Json<RecorderMetadata>> {
    Ok(Json(state.recorders.start(req).await?))
}

async fn recordings_list(State(state): State<Arc<AppState>>) -> Json<Vec<RecorderMetadata>> {
    Json(state.recorders.list().await)
}

async fn recordings_stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HttpResult<Json<RecorderMetadata>> {
    let meta = state.recorders.stop_and_finalize(&id).await?;
    state.metrics.recorder_finalizations.fetch_add(1, Ordering::Relaxed);
    Ok(Json(meta))
}

async fn recordings_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HttpResult<StatusCode> {
    state.recorders.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn recordings_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HttpResult<impl IntoResponse> {
    let path = state.recorders.download_path(&id).await?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| AppError::Other(e.into()))?;
    Ok(([(header::CONTENT_TYPE, "video/mp4")], bytes))
}

async fn virtual_input_configure(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VirtualInputConfigureRequest>,
) -> HttpResult<Json<VirtualInputStatus>> {
    Ok(Json(state.virtual_input.configure(req).await?))
}

async fn virtual_input_pause(State(state): State<Arc<AppState>>) -> HttpResult<StatusCode> {
    state.virtual_input.pause().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn virtual_input_resume(State(state): State<Arc<AppState>>) -> HttpResult<StatusCode> {
    state.virtual_input.resume().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn virtual_input_stop(State(state): State<Arc<AppState>>) -> HttpResult<StatusCode> {
    state.virtual_input.stop().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn virtual_input_feed_page(State(_state): State<Arc<AppState>>) -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html><head><title>virtual input preview</title></head>
<body>
<p>Connect to <code>/input/devices/virtual/feed/socket</code> for the raw preview stream;
see <code>/input/devices/virtual/feed/socket/info</code> for the current format hint.</p>
</body></html>"#,
    )
}

async fn virtual_input_feed_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.virtual_input.current_status().await;
    Json(json!({
        "format_hint": status.video_format_hint.unwrap_or_else(|| "mpegts".to_string()),
        "configured": status.configured,
    }))
}

async fn virtual_input_feed_socket(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { state.virtual_input.handle_preview_feed(socket).await })
}

async fn virtual_input_ingest_ws(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    ws: WebSocketUpgrade,
) -> HttpResult<impl IntoResponse> {
    let ingest_kind = state.virtual_input.ingest_kind_for(&kind).await?;
    Ok(ws.on_upgrade(move |socket| async move { state.virtual_input.handle_ingest(ingest_kind, socket).await }))
}

async fn virtual_input_webrtc_offer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WebrtcOfferRequest>,
) -> HttpResult<Json<WebrtcOfferResponse>> {
    let sdp = state.virtual_input.webrtc_offer(req.sdp).await?;
    Ok(Json(WebrtcOfferResponse { sdp }))
}

async fn upload_extensions_and_restart(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> HttpResult<Json<Value>> {
    let mut archive: Option<Bytes> = None;
    let mut name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidParams(e.to_string()))?
    {
        match field.name() {
            Some("name") => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::InvalidParams(e.to_string()))?,
                );
            }
            Some("archive") | Some("file") => {
                archive = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::InvalidParams(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let archive = archive.ok_or_else(|| AppError::InvalidParams("missing archive field".to_string()))?;
    let name = name.ok_or_else(|| AppError::InvalidParams("missing name field".to_string()))?;

    let unpacked = state
        .extension_policy
        .unpack_and_validate(archive.to_vec(), name)
        .await?;
    state.extension_policy.apply_policy(&unpacked).await?;

    let upstream_url = restart_browser_and_wait(&state.config.display.restart_command, &state.upstream)
        .await
        .map_err(AppError::Other)?;
    state.metrics.upstream_restarts_observed.fetch_add(1, Ordering::Relaxed);

    Ok(Json(json!({
        "restarted": true,
        "upstream_url": upstream_url,
        "extension_id": unpacked.extension_id,
    })))
}

async fn process_exec(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProcessExecRequest>,
) -> HttpResult<Json<ProcessExecResponse>> {
    let _permit = state
        .process_exec_semaphore
        .acquire()
        .await
        .map_err(|e| AppError::Other(anyhow::anyhow!(e)))?;

    let output = tokio::process::Command::new(&req.command)
        .args(&req.args)
        .output()
        .await
        .map_err(|e| AppError::ChildProcessFailure(format!("failed to spawn {}: {e}", req.command)))?;

    Ok(Json(ProcessExecResponse {
        exit_code: output.status.code().unwrap_or(-1),
        stdout_b64: BASE64.encode(output.stdout),
        stderr_b64: BASE64.encode(output.stderr),
    }))
}

async fn cdp_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> HttpResult<impl IntoResponse> {
    if state.upstream.current().is_none() {
        return Err(AppError::NotReady("upstream devtools endpoint not ready".to_string()).into());
    }
    let max_frame = state.config.server.cdp_max_frame_bytes;
    let introspect = state.config.server.cdp_introspection_enabled;
    let upstream = Arc::clone(&state.upstream);

    Ok(ws
        .max_frame_size(max_frame)
        .max_message_size(max_frame)
        .on_upgrade(move |socket| async move {
            state.metrics.cdp_proxy_connections_total.fetch_add(1, Ordering::Relaxed);
            state.metrics.cdp_proxy_connections_active.fetch_add(1, Ordering::Relaxed);
            cdp_proxy::run_proxy(socket, upstream, introspect).await;
            state.metrics.cdp_proxy_connections_active.fetch_sub(1, Ordering::Relaxed);
        }))
}

async fn dom_sync_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let max_frame = state.config.server.cdp_max_frame_bytes;
    ws.max_frame_size(max_frame).on_upgrade(move |socket| async move {
        state.metrics.dom_sync_clients_active.fetch_add(1, Ordering::Relaxed);
        state.domsync.handle_client(socket).await;
        state.metrics.dom_sync_clients_active.fetch_sub(1, Ordering::Relaxed);
    })
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = state.upstream.current().is_some();
    let body = json!({
        "status": if ready { "ready" } else { "starting" },
        "uptime_secs": state.started_at.elapsed().as_secs(),
    });
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn spec_yaml() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/yaml")], OPENAPI_DOCUMENT)
}
