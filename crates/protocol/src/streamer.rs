use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Remote,
    Internal,
    Socket,
    Webrtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Exited,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamStartRequest {
    pub mode: StreamMode,
    /// Caller-chosen identifier. Required for socket mode (it names the WS path);
    /// generated if absent for other modes.
    pub id: Option<String>,
    /// Ingest URL for remote-RTMP mode. Ignored for other modes.
    pub target_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamerMetadata {
    pub id: String,
    pub mode: StreamMode,
    pub state: StreamerState,
    pub ingest_url: Option<String>,
    pub playback_urls: Vec<String>,
    pub started_at: Option<String>,
    pub websocket_path: Option<String>,
    pub offer_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamListResponse {
    pub streamers: Vec<StreamerMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebrtcOfferRequest {
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebrtcOfferResponse {
    pub sdp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_mode_round_trips_snake_case() {
        let json = serde_json::to_string(&StreamMode::Webrtc).unwrap();
        assert_eq!(json, "\"webrtc\"");
        let parsed: StreamMode = serde_json::from_str("\"socket\"").unwrap();
        assert_eq!(parsed, StreamMode::Socket);
    }

    #[test]
    fn start_request_parses_minimal_body() {
        let req: StreamStartRequest =
            serde_json::from_str(r#"{"mode":"socket","id":"live-ts"}"#).unwrap();
        assert_eq!(req.mode, StreamMode::Socket);
        assert_eq!(req.id.as_deref(), Some("live-ts"));
        assert!(req.target_url.is_none());
    }
}
