use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSocketFormat {
    Mpegts,
    Mp4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSocketFormat {
    Mp3,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VideoSource {
    Stream { url: String },
    Socket { format: VideoSocketFormat },
    Webrtc,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioSource {
    Stream { url: String },
    Socket { format: AudioSocketFormat },
    Webrtc,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualInputConfigureRequest {
    pub video: VideoSource,
    pub audio: AudioSource,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VirtualInputStatus {
    pub configured: bool,
    pub paused: bool,
    pub video_format_hint: Option<String>,
    pub audio_format_hint: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_source_tagged_by_type() {
        let src: VideoSource =
            serde_json::from_str(r#"{"type":"stream","url":"https://example.com/x.m3u8"}"#)
                .unwrap();
        match src {
            VideoSource::Stream { url } => assert_eq!(url, "https://example.com/x.m3u8"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn webrtc_variant_has_no_payload() {
        let src: AudioSource = serde_json::from_str(r#"{"type":"webrtc"}"#).unwrap();
        assert!(matches!(src, AudioSource::Webrtc));
    }
}
