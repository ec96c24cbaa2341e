use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction a frame travelled through the CDP proxy, for introspection logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDirection {
    ClientToUpstream,
    UpstreamToClient,
}

/// Regex-only extraction from a CDP JSON-RPC frame, used when introspection is enabled.
/// Deliberately avoids a full JSON decode of potentially-large payloads (screenshots,
/// DOM snapshots can be tens of megabytes).
#[derive(Debug, Clone, Default, Serialize)]
pub struct CdpIntrospection {
    pub method: Option<String>,
    pub id: Option<u64>,
    pub session_id: Option<String>,
    pub target_id: Option<String>,
    pub frame_id: Option<String>,
    pub direction: Option<FrameDirection>,
    pub raw_len: usize,
}

/// A JSON-RPC-shaped CDP request the DOM-sync bridge (or any internal CDP client) sends
/// to the browser. `id` is caller-assigned and echoed back on the matching response.
#[derive(Debug, Clone, Serialize)]
pub struct CdpRequest {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A CDP response or event frame as received from the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpMessage {
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayPatchRequest {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayPatchResponse {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreenshotRequest {
    /// Region to capture; full display when absent.
    #[serde(default)]
    pub clip: Option<ScreenshotClip>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotClip {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotResponse {
    pub png_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickMouseRequest {
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_mouse_button")]
    pub button: String,
    #[serde(default)]
    pub double: bool,
}

fn default_mouse_button() -> String {
    "left".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressKeyRequest {
    pub key: String,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollRequest {
    pub x: f64,
    pub y: f64,
    pub delta_x: f64,
    pub delta_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DragMouseRequest {
    pub from_x: f64,
    pub from_y: f64,
    pub to_x: f64,
    pub to_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasteRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExecRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExecResponse {
    pub exit_code: i32,
    pub stdout_b64: String,
    pub stderr_b64: String,
}
