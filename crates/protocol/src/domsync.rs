use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomElement {
    pub id: String,
    pub tag: String,
    pub rect: Rect,
    pub z: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowBounds {
    pub screen_x: f64,
    pub screen_y: f64,
    pub outer_width: f64,
    pub outer_height: f64,
    pub inner_width: f64,
    pub inner_height: f64,
    pub chrome_top: f64,
    pub fullscreen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Viewport {
    pub scroll_x: f64,
    pub scroll_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomSyncPayload {
    pub seq: u64,
    pub ts: u64,
    pub elements: Vec<DomElement>,
    pub viewport: Viewport,
    pub window_bounds: WindowBounds,
    pub url: String,
}

/// Tag used for the synthetic overlay element appended when not fullscreen
/// and `chrome_top` exceeds 50px.
pub const ADDRESS_BAR_TAG: &str = "addressbar";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomSyncEnvelope {
    pub event: String,
    pub data: DomSyncPayload,
}

impl DomSyncEnvelope {
    pub fn new(data: DomSyncPayload) -> Self {
        Self {
            event: "dom/sync".to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_fixed_event_name() {
        let payload = DomSyncPayload {
            seq: 1,
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
                chrome_top: 68.0,
                fullscreen: false,
            },
            url: "about:blank".to_string(),
        };
        let env = DomSyncEnvelope::new(payload);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["event"], "dom/sync");
        assert_eq!(json["data"]["seq"], 1);
    }
}
