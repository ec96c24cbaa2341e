use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Running,
    Exited,
    Finalized,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderStartRequest {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderMetadata {
    pub id: String,
    pub state: RecorderState,
    pub started_at: String,
    pub deleted: bool,
    pub finalize_complete: bool,
    pub finalize_error: Option<String>,
}
