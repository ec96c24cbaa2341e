//! CDP WebSocket reverse proxy: accepts a client connection, dials the current upstream
//! DevTools endpoint, and relays frames bidirectionally.
//!
//! The relay loop races three `tokio::select!` arms: inbound-from-client,
//! inbound-from-upstream, and the upstream tracker announcing a new DevTools URL —
//! the third arm evicts the connection with close code 1001 rather than silently
//! relaying to a now-stale browser process.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as AxMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use ghost_protocol::cdp::{CdpIntrospection, FrameDirection};
use regex::Regex;
use tokio_tungstenite::tungstenite::Message as TtMessage;

use crate::upstream::UpstreamTracker;

struct IntrospectionRegexes {
    method: Regex,
    id: Regex,
    session_id: Regex,
    target_id: Regex,
    frame_id: Regex,
}

impl IntrospectionRegexes {
    fn compile() -> Self {
        Self {
            method: Regex::new(r#""method"\s*:\s*"([^"]+)""#).unwrap(),
            id: Regex::new(r#""id"\s*:\s*(\d+)"#).unwrap(),
            session_id: Regex::new(r#""sessionId"\s*:\s*"([^"]+)""#).unwrap(),
            target_id: Regex::new(r#""targetId"\s*:\s*"([^"]+)""#).unwrap(),
            frame_id: Regex::new(r#""frameId"\s*:\s*"([^"]+)""#).unwrap(),
        }
    }

    fn extract(&self, raw: &str, direction: FrameDirection) -> CdpIntrospection {
        CdpIntrospection {
            method: self.method.captures(raw).map(|c| c[1].to_string()),
            id: self
                .id
                .captures(raw)
                .and_then(|c| c[1].parse::<u64>().ok()),
            session_id: self.session_id.captures(raw).map(|c| c[1].to_string()),
            target_id: self.target_id.captures(raw).map(|c| c[1].to_string()),
            frame_id: self.frame_id.captures(raw).map(|c| c[1].to_string()),
            direction: Some(direction),
            raw_len: raw.len(),
        }
    }
}

fn log_frame(regexes: &IntrospectionRegexes, raw: &str, direction: FrameDirection) {
    let info = regexes.extract(raw, direction);
    tracing::debug!(
        method = info.method.as_deref(),
        id = info.id,
        session_id = info.session_id.as_deref(),
        target_id = info.target_id.as_deref(),
        frame_id = info.frame_id.as_deref(),
        raw_len = info.raw_len,
        ?direction,
        "cdp frame"
    );
}

fn close_with(code: u16, reason: &'static str) -> AxMessage {
    AxMessage::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Runs until either side closes or the upstream tracker announces a new URL.
pub async fn run_proxy(mut client_ws: WebSocket, tracker: Arc<UpstreamTracker>, introspect: bool) {
    let Some(upstream_url) = tracker.current() else {
        let _ = client_ws
            .send(close_with(1011, "upstream not ready"))
            .await;
        return;
    };

    let mut rx = tracker.subscribe();
    rx.borrow_and_update();

    let (upstream_stream, _response) = match tokio_tungstenite::connect_async(&upstream_url).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, upstream_url, "failed to dial upstream CDP endpoint");
            let _ = client_ws
                .send(close_with(1011, "failed to reach upstream"))
                .await;
            return;
        }
    };
    let (mut upstream_tx, mut upstream_rx) = upstream_stream.split();
    let regexes = introspect.then(IntrospectionRegexes::compile);

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_ok() {
                    let _ = client_ws.send(close_with(1001, "upstream restarted")).await;
                }
                break;
            }
            incoming = client_ws.recv() => {
                match incoming {
                    Some(Ok(AxMessage::Text(text))) => {
                        if let Some(re) = &regexes {
                            log_frame(re, &text, FrameDirection::ClientToUpstream);
                        }
                        if upstream_tx.send(TtMessage::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(AxMessage::Binary(data))) => {
                        if upstream_tx.send(TtMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(AxMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "client websocket error");
                        break;
                    }
                }
            }
            outgoing = upstream_rx.next() => {
                match outgoing {
                    Some(Ok(TtMessage::Text(text))) => {
                        if let Some(re) = &regexes {
                            log_frame(re, &text, FrameDirection::UpstreamToClient);
                        }
                        if client_ws.send(AxMessage::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(TtMessage::Binary(data))) => {
                        if client_ws.send(AxMessage::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(TtMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "upstream websocket error");
                        break;
                    }
                }
            }
        }
    }

    let _ = upstream_tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_method_and_id_from_a_command_frame() {
        let re = IntrospectionRegexes::compile();
        let raw = r#"{"id":7,"method":"Page.navigate","params":{"url":"https://example.com"},"sessionId":"ABC123"}"#;
        let info = re.extract(raw, FrameDirection::ClientToUpstream);
        assert_eq!(info.method.as_deref(), Some("Page.navigate"));
        assert_eq!(info.id, Some(7));
        assert_eq!(info.session_id.as_deref(), Some("ABC123"));
    }

    #[test]
    fn missing_fields_extract_as_none() {
        let re = IntrospectionRegexes::compile();
        let raw = r#"{"result":{}}"#;
        let info = re.extract(raw, FrameDirection::UpstreamToClient);
        assert!(info.method.is_none());
        assert!(info.id.is_none());
    }
}
