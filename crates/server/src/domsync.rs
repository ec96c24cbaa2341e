//! DOM-sync bridge: a long-lived CDP connection that injects a `MutationObserver` into
//! the active page and broadcasts throttled element-geometry snapshots to UI clients.
//!
//! The CDP client here is a thin JSON-RPC-over-WS shape keyed by `id`, the same
//! correlation style CDP itself uses for request/response matching. Client fan-out
//! tracks each subscriber's last-sent `Instant` to enforce the 25ms minimum gap
//! between broadcasts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as AxMessage, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use ghost_protocol::cdp::CdpMessage;
use ghost_protocol::domsync::{DomElement, DomSyncEnvelope, DomSyncPayload, Rect, ADDRESS_BAR_TAG};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::upstream::UpstreamTracker;

const REATTACH_GRACE: Duration = Duration::from_millis(500);
const THROTTLE_GAP: Duration = Duration::from_millis(25);
const CDP_ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(30);

const OBSERVER_SCRIPT: &str = include_str!("domsync_observer.js");

pub struct DomSyncBridge {
    upstream: Arc<UpstreamTracker>,
    clients: RwLock<Vec<mpsc::Sender<Bytes>>>,
    last_envelope: RwLock<Option<DomSyncEnvelope>>,
    seq: AtomicU64,
    throttle: Mutex<ThrottleState>,
    cancel: CancellationToken,
}

struct ThrottleState {
    last_sent_at: Option<Instant>,
    pending: Option<DomSyncPayload>,
}

impl DomSyncBridge {
    pub fn new(upstream: Arc<UpstreamTracker>) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            clients: RwLock::new(Vec::new()),
            last_envelope: RwLock::new(None),
            seq: AtomicU64::new(0),
            throttle: Mutex::new(ThrottleState {
                last_sent_at: None,
                pending: None,
            }),
            cancel: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.supervise_loop().await;
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn supervise_loop(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let url = tokio::select! {
                _ = self.cancel.cancelled() => return,
                url = self.upstream.wait_for_initial(Duration::from_secs(3600)) => match url {
                    Ok(u) => u,
                    Err(_) => continue,
                },
            };

            if let Err(e) = self.clone().attach_and_pump(url).await {
                tracing::warn!(error = %e, "dom-sync session ended, reattaching after grace period");
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(REATTACH_GRACE) => {}
            }
        }
    }

    async fn attach_and_pump(self: Arc<Self>, upstream_url: String) -> anyhow::Result<()> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&upstream_url).await?;
        let (write, mut read) = ws_stream.split();

        let write = Arc::new(Mutex::new(write));
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> = Arc::new(Mutex::new(HashMap::new()));
        let next_id = Arc::new(AtomicU64::new(1));
        let (event_tx, mut event_rx) = mpsc::channel::<CdpMessage>(256);

        let pending_reader = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let Ok(tokio_tungstenite::tungstenite::Message::Text(text)) = msg else {
                    continue;
                };
                let Ok(parsed) = serde_json::from_str::<CdpMessage>(&text) else {
                    continue;
                };
                if let Some(id) = parsed.id {
                    if let Some(tx) = pending_reader.lock().await.remove(&id) {
                        let _ = tx.send(parsed.result.unwrap_or(Value::Null));
                        continue;
                    }
                }
                if event_tx.send(parsed).await.is_err() {
                    break;
                }
            }
        });

        let send = |method: &'static str, params: Value, session_id: Option<String>| {
            let write = Arc::clone(&write);
            let pending = Arc::clone(&pending);
            let next_id = Arc::clone(&next_id);
            async move {
                send_command(&write, &pending, &next_id, method, Some(params), session_id).await
            }
        };

        send("Target.setDiscoverTargets", json!({"discover": true}), None).await?;
        let targets = send("Target.getTargets", json!({}), None).await?;
        let target_id = targets["targetInfos"]
            .as_array()
            .and_then(|list| list.iter().find(|t| t["type"] == "page"))
            .and_then(|t| t["targetId"].as_str())
            .ok_or_else(|| anyhow::anyhow!("no page target found"))?
            .to_string();

        let attach_result = send(
            "Target.attachToTarget",
            json!({"targetId": target_id, "flatten": true}),
            None,
        )
        .await?;
        let session_id = attach_result["sessionId"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("attachToTarget returned no sessionId"))?
            .to_string();

        send(
            "Runtime.addBinding",
            json!({"name": "__ghostDomCallback__"}),
            Some(session_id.clone()),
        )
        .await?;
        send("Runtime.enable", json!({}), Some(session_id.clone())).await?;
        send("Page.enable", json!({}), Some(session_id.clone())).await?;
        send(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({"source": OBSERVER_SCRIPT}),
            Some(session_id.clone()),
        )
        .await?;
        send(
            "Runtime.evaluate",
            json!({"expression": OBSERVER_SCRIPT}),
            Some(session_id.clone()),
        )
        .await?;

        tracing::info!(target_id, session_id, "dom-sync attached to page target");

        let result = Arc::clone(&self)
            .pump_events(&mut event_rx, &target_id, &session_id)
            .await;

        reader.abort();
        result
    }

    async fn pump_events(
        self: Arc<Self>,
        event_rx: &mut mpsc::Receiver<CdpMessage>,
        target_id: &str,
        session_id: &str,
    ) -> anyhow::Result<()> {
        while let Some(event) = event_rx.recv().await {
            let Some(method) = event.method.as_deref() else {
                continue;
            };
            match method {
                "Target.targetDestroyed" => {
                    if event
                        .params
                        .as_ref()
                        .and_then(|p| p["targetId"].as_str())
                        == Some(target_id)
                    {
                        anyhow::bail!("target destroyed");
                    }
                }
                "Target.detachedFromTarget" => {
                    if event.params.as_ref().and_then(|p| p["sessionId"].as_str())
                        == Some(session_id)
                    {
                        anyhow::bail!("detached from target");
                    }
                }
                "Runtime.bindingCalled" => {
                    if let Some(params) = &event.params {
                        if params["name"] == "__ghostDomCallback__" {
                            if let Some(payload_str) = params["payload"].as_str() {
                                if let Ok(payload) = parse_payload(payload_str) {
                                    Arc::clone(&self).throttled_broadcast(payload).await;
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        anyhow::bail!("cdp event stream ended")
    }

    async fn throttled_broadcast(self: Arc<Self>, mut payload: DomSyncPayload) {
        maybe_add_address_bar(&mut payload);
        payload.seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        let mut throttle = self.throttle.lock().await;
        let now_elapsed = throttle
            .last_sent_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);

        if now_elapsed >= THROTTLE_GAP {
            throttle.last_sent_at = Some(Instant::now());
            throttle.pending = None;
            drop(throttle);
            self.broadcast(payload).await;
        } else {
            let already_scheduled = throttle.pending.is_some();
            throttle.pending = Some(payload);
            if !already_scheduled {
                drop(throttle);
                // Spawned so pump_events keeps draining the CDP event channel (including
                // reattach signals) instead of blocking on this coalescing delay.
                let wait = THROTTLE_GAP.saturating_sub(now_elapsed);
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let mut throttle = self.throttle.lock().await;
                    if let Some(pending) = throttle.pending.take() {
                        throttle.last_sent_at = Some(Instant::now());
                        drop(throttle);
                        self.broadcast(pending).await;
                    }
                });
            }
        }
    }

    async fn broadcast(&self, payload: DomSyncPayload) {
        let envelope = DomSyncEnvelope::new(payload);
        let Ok(json) = serde_json::to_vec(&envelope) else {
            return;
        };
        *self.last_envelope.write().await = Some(envelope);

        let bytes = Bytes::from(json);
        let mut dead = Vec::new();
        let clients = self.clients.read().await;
        for (idx, tx) in clients.iter().enumerate() {
            if tx.try_send(bytes.clone()).is_err() {
                dead.push(idx);
            }
        }
        drop(clients);
        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for idx in dead.into_iter().rev() {
                if idx < clients.len() {
                    clients.remove(idx);
                }
            }
        }
    }

    pub async fn handle_client(&self, mut ws: WebSocket) {
        if let Some(envelope) = self.last_envelope.read().await.clone() {
            if let Ok(json) = serde_json::to_string(&envelope) {
                if ws.send(AxMessage::Text(json.into())).await.is_err() {
                    return;
                }
            }
        }

        let (tx, mut rx) = mpsc::channel::<Bytes>(32);
        self.clients.write().await.push(tx);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(data) => {
                            let text = String::from_utf8_lossy(&data).to_string();
                            if ws.send(AxMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = ws.recv() => {
                    match incoming {
                        Some(Ok(AxMessage::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }
    }
}

fn maybe_add_address_bar(payload: &mut DomSyncPayload) {
    if payload.window_bounds.fullscreen || payload.window_bounds.chrome_top <= 50.0 {
        return;
    }
    payload.elements.push(DomElement {
        id: "__ghost_address_bar__".to_string(),
        tag: ADDRESS_BAR_TAG.to_string(),
        rect: Rect {
            x: 0.0,
            y: 0.0,
            w: payload.window_bounds.outer_width,
            h: payload.window_bounds.chrome_top,
        },
        z: i32::MAX,
    });
}

fn parse_payload(raw: &str) -> Result<DomSyncPayload, serde_json::Error> {
    serde_json::from_str(raw)
}

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::Message,
>;

async fn send_command(
    write: &Arc<Mutex<WsWrite>>,
    pending: &Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_id: &Arc<AtomicU64>,
    method: &str,
    params: Option<Value>,
    session_id: Option<String>,
) -> anyhow::Result<Value> {
    let id = next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    pending.lock().await.insert(id, tx);

    let mut frame = json!({"id": id, "method": method});
    if let Some(params) = params {
        frame["params"] = params;
    }
    if let Some(session_id) = session_id {
        frame["sessionId"] = json!(session_id);
    }

    write
        .lock()
        .await
        .send(tokio_tungstenite::tungstenite::Message::Text(
            frame.to_string().into(),
        ))
        .await?;

    tokio::time::timeout(CDP_ROUND_TRIP_TIMEOUT, rx)
        .await
        .map_err(|_| anyhow::anyhow!("cdp command {method} timed out"))?
        .map_err(|_| anyhow::anyhow!("cdp command {method} sender dropped"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_protocol::domsync::{Viewport, WindowBounds};

    fn sample_payload(chrome_top: f64, fullscreen: bool) -> DomSyncPayload {
        DomSyncPayload {
            seq: 0,
            ts: 0,
            elements: vec![],
            viewport: Viewport {
                scroll_x: 0.0,
                scroll_y: 0.0,
            },
            window_bounds: WindowBounds {
                screen_x: 0.0,
                screen_y: 0.0,
                outer_width: 1024.0,
                outer_height: 768.0,
                inner_width: 1024.0,
                inner_height: 700.0,
                chrome_top,
                fullscreen,
            },
            url: "about:blank".to_string(),
        }
    }

    #[test]
    fn address_bar_added_when_chrome_visible_and_not_fullscreen() {
        let mut payload = sample_payload(68.0, false);
        maybe_add_address_bar(&mut payload);
        assert_eq!(payload.elements.len(), 1);
        assert_eq!(payload.elements[0].tag, ADDRESS_BAR_TAG);
    }

    #[test]
    fn address_bar_omitted_when_fullscreen() {
        let mut payload = sample_payload(68.0, true);
        maybe_add_address_bar(&mut payload);
        assert!(payload.elements.is_empty());
    }

    #[test]
    fn address_bar_omitted_when_chrome_top_small() {
        let mut payload = sample_payload(10.0, false);
        maybe_add_address_bar(&mut payload);
        assert!(payload.elements.is_empty());
    }
}
