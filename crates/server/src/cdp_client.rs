//! A one-shot CDP client: dials the current upstream, attaches to the first page
//! target, issues a handful of commands, and disconnects. This is the counterpart to
//! `domsync`'s long-lived session — the `/computer/*` HTTP handlers (screenshot, mouse,
//! keyboard, scroll) need a few `Input.*`/`Page.*` round trips per request rather than a
//! standing connection, so they get their own short-lived session type instead of
//! routing every request through the dom-sync bridge's session.
//!
//! JSON-RPC-over-WS dispatch is the same shape as `domsync::send_command`: an
//! `id`-keyed `oneshot` map guarded by a mutex, a reader task draining responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::Message,
>;

pub struct CdpSession {
    write: Arc<Mutex<WsWrite>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_id: Arc<AtomicU64>,
    reader: JoinHandle<()>,
    round_trip_timeout: Duration,
    pub session_id: String,
}

impl CdpSession {
    /// Dials `upstream_url`, enables target discovery, and attaches (flattened) to
    /// the first target of type `page`.
    pub async fn open(upstream_url: &str, dial_timeout: Duration, round_trip_timeout: Duration) -> anyhow::Result<Self> {
        let (ws_stream, _response) =
            tokio::time::timeout(dial_timeout, tokio_tungstenite::connect_async(upstream_url))
                .await
                .map_err(|_| anyhow::anyhow!("dial to upstream CDP endpoint timed out"))??;
        let (write, mut read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> = Arc::new(Mutex::new(HashMap::new()));
        let next_id = Arc::new(AtomicU64::new(1));

        let pending_reader = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let Ok(tokio_tungstenite::tungstenite::Message::Text(text)) = msg else {
                    continue;
                };
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if let Some(id) = parsed["id"].as_u64() {
                    if let Some(tx) = pending_reader.lock().await.remove(&id) {
                        let result = if parsed["error"].is_null() {
                            parsed["result"].clone()
                        } else {
                            parsed.clone()
                        };
                        let _ = tx.send(result);
                    }
                }
            }
        });

        let session = Self {
            write,
            pending,
            next_id,
            reader,
            round_trip_timeout,
            session_id: String::new(),
        };

        session.send("Target.setDiscoverTargets", json!({"discover": true}), None).await?;
        let targets = session.send("Target.getTargets", json!({}), None).await?;
        let target_id = targets["targetInfos"]
            .as_array()
            .and_then(|list| list.iter().find(|t| t["type"] == "page"))
            .and_then(|t| t["targetId"].as_str())
            .ok_or_else(|| anyhow::anyhow!("no page target found"))?
            .to_string();
        let attach_result = session
            .send(
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
                None,
            )
            .await?;
        let session_id = attach_result["sessionId"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("attachToTarget returned no sessionId"))?
            .to_string();

        Ok(Self { session_id, ..session })
    }

    /// Issues one command on this session's page target and awaits its response.
    pub async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        self.send(method, params, Some(self.session_id.clone())).await
    }

    async fn send(&self, method: &str, params: Value, session_id: Option<String>) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut frame = json!({"id": id, "method": method, "params": params});
        if let Some(session_id) = session_id {
            frame["sessionId"] = json!(session_id);
        }

        self.write
            .lock()
            .await
            .send(tokio_tungstenite::tungstenite::Message::Text(frame.to_string().into()))
            .await?;

        let result = tokio::time::timeout(self.round_trip_timeout, rx)
            .await
            .map_err(|_| anyhow::anyhow!("cdp command {method} timed out"))?
            .map_err(|_| anyhow::anyhow!("cdp command {method} sender dropped"))?;

        if result.get("error").is_some() {
            anyhow::bail!("cdp command {method} failed: {result}");
        }
        Ok(result)
    }

    pub async fn close(self) {
        self.reader.abort();
        let _ = self.write.lock().await.close().await;
    }
}
