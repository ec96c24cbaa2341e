//! Virtual media ingress: a synthetic camera (`/dev/video10` via v4l2 loopback) and a
//! synthetic microphone (a PulseAudio sink/source pair) the browser sees as real devices.
//!
//! Device setup shells out to `pactl`/`v4l2loopback` tooling directly; the preview
//! "feed" fan-out reuses the same bounded-channel-per-client broadcast shape as the
//! socket streamer in `streamer.rs`.

use std::process::Stdio;
use std::sync::Arc;

use axum::extract::ws::{Message as AxMessage, WebSocket};
use bytes::Bytes;
use ghost_protocol::virtual_input::{
    AudioSocketFormat, AudioSource, VideoSocketFormat, VideoSource, VirtualInputConfigureRequest,
    VirtualInputStatus,
};
use ghost_protocol::AppError;
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::VirtualInputConfig;
use crate::supervisor::Supervised;
use crate::webrtc_common::create_peer_connection;

struct PreviewClient {
    tx: mpsc::Sender<Bytes>,
}

struct State {
    request: Option<VirtualInputConfigureRequest>,
    paused: bool,
    video_child: Option<Supervised>,
    audio_child: Option<Supervised>,
    pulse_module_ids: Vec<String>,
}

/// What `bring_up` produced: the ingest children it spawned (one per `stream`-sourced
/// track) and the Pulse module ids `teardown` must later unload.
struct BroughtUp {
    video_child: Option<Supervised>,
    audio_child: Option<Supervised>,
    pulse_module_ids: Vec<String>,
}

pub struct VirtualInputPipeline {
    config: VirtualInputConfig,
    state: RwLock<State>,
    preview_clients: RwLock<Vec<PreviewClient>>,
}

impl VirtualInputPipeline {
    pub fn new(config: VirtualInputConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: RwLock::new(State {
                request: None,
                paused: false,
                video_child: None,
                audio_child: None,
                pulse_module_ids: Vec::new(),
            }),
            preview_clients: RwLock::new(Vec::new()),
        })
    }

    pub async fn configure(&self, req: VirtualInputConfigureRequest) -> Result<VirtualInputStatus, AppError> {
        if let VideoSource::Stream { url } = &req.video {
            validate_stream_url(url)?;
        }
        if let AudioSource::Stream { url } = &req.audio {
            validate_stream_url(url)?;
        }

        // Identical reconfiguration is a no-op: same child argv, so skip the restart.
        {
            let existing = self.state.read().await;
            if let Some(current) = &existing.request {
                if configure_requests_equal(current, &req) {
                    return Ok(self.status(&existing).await);
                }
            }
        }

        self.teardown().await;
        let brought_up = self.bring_up(&req).await?;

        let mut state = self.state.write().await;
        state.request = Some(req);
        state.paused = false;
        state.video_child = brought_up.video_child;
        state.audio_child = brought_up.audio_child;
        state.pulse_module_ids = brought_up.pulse_module_ids;
        Ok(self.status(&state).await)
    }

    /// Pausing swaps any live `stream`-sourced ingest child for a black-frame/silence
    /// synthetic source so downstream consumers keep seeing a well-formed feed; socket
    /// and webrtc sources have no ingest child of ours to swap, so pausing them only
    /// flips the status flag consumers are expected to honor.
    pub async fn pause(&self) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let req = state
            .request
            .clone()
            .ok_or_else(|| AppError::NotReady("virtual input is not configured".to_string()))?;
        if state.paused {
            return Ok(());
        }

        if let VideoSource::Stream { .. } = req.video {
            if let Some(mut child) = state.video_child.take() {
                if let Err(e) = child.shutdown().await {
                    tracing::warn!(error = %e, "failed to stop video ingest before pause");
                }
            }
            match spawn_silence_video(
                &self.config.ffmpeg_bin,
                &self.config.video_device,
                req.width.unwrap_or(1280),
                req.height.unwrap_or(720),
                req.frame_rate.unwrap_or(30),
            )
            .await
            {
                Ok(child) => state.video_child = Some(child),
                Err(e) => tracing::warn!(error = %e, "failed to start paused black-frame source"),
            }
        }

        if let AudioSource::Stream { .. } = req.audio {
            if let Some(mut child) = state.audio_child.take() {
                if let Err(e) = child.shutdown().await {
                    tracing::warn!(error = %e, "failed to stop audio ingest before pause");
                }
            }
            match spawn_silence_audio(&self.config.ffmpeg_bin, &self.config.pulse_sink_name).await {
                Ok(child) => state.audio_child = Some(child),
                Err(e) => tracing::warn!(error = %e, "failed to start paused silence source"),
            }
        }

        state.paused = true;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let req = state
            .request
            .clone()
            .ok_or_else(|| AppError::NotReady("virtual input is not configured".to_string()))?;
        if !state.paused {
            return Ok(());
        }

        if let VideoSource::Stream { url } = &req.video {
            if let Some(mut child) = state.video_child.take() {
                if let Err(e) = child.shutdown().await {
                    tracing::warn!(error = %e, "failed to stop paused video source before resume");
                }
            }
            match spawn_video_ingest(&self.config.ffmpeg_bin, url, &self.config.video_device).await {
                Ok(child) => state.video_child = Some(child),
                Err(e) => tracing::warn!(error = %e, "failed to resume video ingest"),
            }
        }

        if let AudioSource::Stream { url } = &req.audio {
            if let Some(mut child) = state.audio_child.take() {
                if let Err(e) = child.shutdown().await {
                    tracing::warn!(error = %e, "failed to stop paused audio source before resume");
                }
            }
            match spawn_audio_ingest(&self.config.ffmpeg_bin, url, &self.config.pulse_sink_name).await {
                Ok(child) => state.audio_child = Some(child),
                Err(e) => tracing::warn!(error = %e, "failed to resume audio ingest"),
            }
        }

        state.paused = false;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), AppError> {
        self.teardown().await;
        let mut state = self.state.write().await;
        state.request = None;
        state.paused = false;
        let mut clients = self.preview_clients.write().await;
        clients.clear();
        Ok(())
    }

    async fn status(&self, state: &State) -> VirtualInputStatus {
        let video_format_hint = state.request.as_ref().map(|r| video_format_hint(&r.video));
        let audio_format_hint = state.request.as_ref().map(|r| audio_format_hint(&r.audio));
        VirtualInputStatus {
            configured: state.request.is_some(),
            paused: state.paused,
            video_format_hint,
            audio_format_hint,
            width: state.request.as_ref().and_then(|r| r.width),
            height: state.request.as_ref().and_then(|r| r.height),
            frame_rate: state.request.as_ref().and_then(|r| r.frame_rate),
        }
    }

    pub async fn current_status(&self) -> VirtualInputStatus {
        let state = self.state.read().await;
        self.status(&state).await
    }

    /// Resolves which ingest format a `video`/`audio` ingest socket should expect,
    /// from whichever source the pipeline is currently configured with.
    pub async fn ingest_kind_for(&self, which: &str) -> Result<IngestKind, AppError> {
        let state = self.state.read().await;
        let req = state
            .request
            .as_ref()
            .ok_or_else(|| AppError::NotReady("virtual input is not configured".to_string()))?;
        match which {
            "video" => match req.video {
                VideoSource::Socket { format } => Ok(IngestKind::Video(format)),
                _ => Err(AppError::InvalidParams(
                    "video source is not configured for socket ingest".to_string(),
                )),
            },
            "audio" => match req.audio {
                AudioSource::Socket { format } => Ok(IngestKind::Audio(format)),
                _ => Err(AppError::InvalidParams(
                    "audio source is not configured for socket ingest".to_string(),
                )),
            },
            other => Err(AppError::InvalidParams(format!("unknown ingest kind {other}"))),
        }
    }

    async fn bring_up(&self, req: &VirtualInputConfigureRequest) -> Result<BroughtUp, AppError> {
        tracing::info!(video = ?req.video, audio = ?req.audio, "configuring virtual input devices");
        configure_video_loopback(&self.config.video_device, req).await?;
        let pulse_module_ids =
            configure_pulse_devices(&self.config.pulse_sink_name, &self.config.pulse_source_name).await?;

        let video_child = match &req.video {
            VideoSource::Stream { url } => Some(
                spawn_video_ingest(&self.config.ffmpeg_bin, url, &self.config.video_device)
                    .await
                    .map_err(|e| AppError::ChildProcessFailure(format!("video ingest spawn failed: {e}")))?,
            ),
            _ => None,
        };
        let audio_child = match &req.audio {
            AudioSource::Stream { url } => Some(
                spawn_audio_ingest(&self.config.ffmpeg_bin, url, &self.config.pulse_sink_name)
                    .await
                    .map_err(|e| AppError::ChildProcessFailure(format!("audio ingest spawn failed: {e}")))?,
            ),
            _ => None,
        };

        Ok(BroughtUp {
            video_child,
            audio_child,
            pulse_module_ids,
        })
    }

    /// Stops any live ingest child and unloads the Pulse modules `bring_up` loaded, so
    /// repeated `configure()` calls don't leak a fresh sink/source pair each time.
    async fn teardown(&self) {
        let mut state = self.state.write().await;
        if state.request.is_none() && state.video_child.is_none() && state.audio_child.is_none() {
            return;
        }
        tracing::info!("tearing down virtual input devices before reconfiguration");

        if let Some(mut child) = state.video_child.take() {
            if let Err(e) = child.shutdown().await {
                tracing::warn!(error = %e, "video ingest shutdown failed");
            }
        }
        if let Some(mut child) = state.audio_child.take() {
            if let Err(e) = child.shutdown().await {
                tracing::warn!(error = %e, "audio ingest shutdown failed");
            }
        }
        for module_id in state.pulse_module_ids.drain(..) {
            if let Err(e) = run_tool("pactl", &["unload-module".to_string(), module_id]).await {
                tracing::warn!(error = ?e, "failed to unload pulse module");
            }
        }
    }

    pub async fn handle_ingest(&self, kind: IngestKind, mut ws: WebSocket) {
        loop {
            match ws.recv().await {
                Some(Ok(AxMessage::Binary(data))) => {
                    let valid = match kind {
                        IngestKind::Video(format) => validate_video_chunk(format, &data),
                        IngestKind::Audio(format) => validate_audio_chunk(format, &data),
                    };
                    if !valid {
                        let _ = ws
                            .send(AxMessage::Close(Some(axum::extract::ws::CloseFrame {
                                code: 1003,
                                reason: "chunk does not match declared format".into(),
                            })))
                            .await;
                        return;
                    }
                    self.fan_out_preview(data).await;
                }
                Some(Ok(AxMessage::Close(_))) | None => return,
                Some(Err(_)) => return,
                _ => {}
            }
        }
    }

    async fn fan_out_preview(&self, chunk: Bytes) {
        let mut dead = Vec::new();
        let clients = self.preview_clients.read().await;
        for (idx, client) in clients.iter().enumerate() {
            if client.tx.try_send(chunk.clone()).is_err() {
                dead.push(idx);
            }
        }
        drop(clients);
        if !dead.is_empty() {
            let mut clients = self.preview_clients.write().await;
            for idx in dead.into_iter().rev() {
                if idx < clients.len() {
                    clients.remove(idx);
                }
            }
        }
    }

    pub async fn handle_preview_feed(&self, mut ws: WebSocket) {
        let hint = {
            let state = self.state.read().await;
            state
                .request
                .as_ref()
                .map(|r| video_format_hint(&r.video))
                .unwrap_or_else(|| "mpegts".to_string())
        };
        if ws.send(AxMessage::Text(hint.into())).await.is_err() {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        self.preview_clients.write().await.push(PreviewClient { tx });

        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    match chunk {
                        Some(data) => {
                            if ws.send(AxMessage::Binary(data)).await.is_err() {
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

    /// Accepts a browser-originated WebRTC ingest offer for the virtual camera/microphone.
    /// Recvonly: incoming RTP is read off each remote track and forwarded into the preview
    /// fan-out exactly like a socket-ingested chunk, so existing preview clients see webrtc
    /// ingest the same way they see a pushed stream.
    pub async fn webrtc_offer(self: &Arc<Self>, offer_sdp: String) -> Result<String, AppError> {
        let peer_connection = create_peer_connection().await.map_err(AppError::Other)?;

        let pipeline = Arc::clone(self);
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let mut buf = vec![0u8; 1500];
                loop {
                    match track.read(&mut buf).await {
                        Ok((rtp_packet, _attrs)) => {
                            pipeline.fan_out_preview(rtp_packet.payload).await;
                        }
                        Err(_) => return,
                    }
                }
            })
        }));

        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| AppError::InvalidParams(format!("invalid offer sdp: {e}")))?;
        peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| AppError::Other(anyhow::anyhow!(e)))?;

        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| AppError::Other(anyhow::anyhow!(e)))?;
        let mut gather_complete = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| AppError::Other(anyhow::anyhow!(e)))?;
        let _ = gather_complete.recv().await;

        let local_description = peer_connection
            .local_description()
            .await
            .ok_or_else(|| AppError::Other(anyhow::anyhow!("no local description after negotiation")))?;
        Ok(local_description.sdp)
    }
}

pub enum IngestKind {
    Video(VideoSocketFormat),
    Audio(AudioSocketFormat),
}

fn configure_requests_equal(a: &VirtualInputConfigureRequest, b: &VirtualInputConfigureRequest) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

fn validate_stream_url(url: &str) -> Result<(), AppError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(AppError::InvalidParams(format!(
            "unsupported stream source scheme: {url}"
        )))
    }
}

fn video_format_hint(source: &VideoSource) -> String {
    match source {
        VideoSource::Stream { .. } => "mpegts".to_string(),
        VideoSource::Socket { format } => match format {
            VideoSocketFormat::Mpegts => "mpegts".to_string(),
            VideoSocketFormat::Mp4 => "mp4".to_string(),
        },
        VideoSource::Webrtc => "webrtc".to_string(),
    }
}

fn audio_format_hint(source: &AudioSource) -> String {
    match source {
        AudioSource::Stream { .. } => "opus".to_string(),
        AudioSource::Socket { format } => match format {
            AudioSocketFormat::Mp3 => "mp3".to_string(),
        },
        AudioSource::Webrtc => "webrtc".to_string(),
    }
}

fn validate_video_chunk(format: VideoSocketFormat, data: &[u8]) -> bool {
    match format {
        VideoSocketFormat::Mpegts => data.first() == Some(&0x47),
        VideoSocketFormat::Mp4 => data.len() >= 8 && &data[4..8] == b"ftyp",
    }
}

fn validate_audio_chunk(format: AudioSocketFormat, data: &[u8]) -> bool {
    match format {
        AudioSocketFormat::Mp3 => data.len() >= 2 && data[0] == 0xFF && (data[1] & 0xE0) == 0xE0,
    }
}

async fn configure_video_loopback(
    device: &str,
    req: &VirtualInputConfigureRequest,
) -> Result<(), AppError> {
    let width = req.width.unwrap_or(1280).to_string();
    let height = req.height.unwrap_or(720).to_string();
    run_tool(
        "v4l2-ctl",
        &[
            "--device".to_string(),
            device.to_string(),
            "--set-fmt-video".to_string(),
            format!("width={width},height={height},pixelformat=YUYV"),
        ],
    )
    .await
}

/// Loads the null-sink/remap-source pair backing the virtual microphone and returns
/// the module ids `pactl load-module` echoes on stdout, so `teardown` can unload them.
async fn configure_pulse_devices(sink_name: &str, source_name: &str) -> Result<Vec<String>, AppError> {
    let sink_module = run_tool_capture(
        "pactl",
        &[
            "load-module".to_string(),
            "module-null-sink".to_string(),
            format!("sink_name={sink_name}"),
        ],
    )
    .await?;
    let source_module = run_tool_capture(
        "pactl",
        &[
            "load-module".to_string(),
            "module-remap-source".to_string(),
            format!("master={sink_name}.monitor"),
            format!("source_name={source_name}"),
        ],
    )
    .await?;
    Ok([sink_module, source_module].into_iter().flatten().collect())
}

async fn spawn_video_ingest(ffmpeg_bin: &str, url: &str, device: &str) -> anyhow::Result<Supervised> {
    let args = vec![
        "-re".to_string(),
        "-i".to_string(),
        url.to_string(),
        "-an".to_string(),
        "-f".to_string(),
        "v4l2".to_string(),
        "-pix_fmt".to_string(),
        "yuyv422".to_string(),
        device.to_string(),
    ];
    Supervised::spawn(ffmpeg_bin, &args, &[], Stdio::null(), Stdio::piped()).await
}

async fn spawn_audio_ingest(ffmpeg_bin: &str, url: &str, sink_name: &str) -> anyhow::Result<Supervised> {
    let args = vec![
        "-re".to_string(),
        "-i".to_string(),
        url.to_string(),
        "-vn".to_string(),
        "-f".to_string(),
        "pulse".to_string(),
        sink_name.to_string(),
    ];
    Supervised::spawn(ffmpeg_bin, &args, &[], Stdio::null(), Stdio::piped()).await
}

/// Synthetic black-frame source fed into the loopback device while paused, per the
/// spec's requirement that pausing a `stream` source swap in a still-valid feed rather
/// than stopping the device outright.
async fn spawn_silence_video(
    ffmpeg_bin: &str,
    device: &str,
    width: u32,
    height: u32,
    frame_rate: u32,
) -> anyhow::Result<Supervised> {
    let args = vec![
        "-f".to_string(),
        "lavfi".to_string(),
        "-i".to_string(),
        format!("color=c=black:s={width}x{height}:r={frame_rate}"),
        "-f".to_string(),
        "v4l2".to_string(),
        "-pix_fmt".to_string(),
        "yuyv422".to_string(),
        device.to_string(),
    ];
    Supervised::spawn(ffmpeg_bin, &args, &[], Stdio::null(), Stdio::piped()).await
}

async fn spawn_silence_audio(ffmpeg_bin: &str, sink_name: &str) -> anyhow::Result<Supervised> {
    let args = vec![
        "-f".to_string(),
        "lavfi".to_string(),
        "-i".to_string(),
        "anullsrc=r=48000:cl=stereo".to_string(),
        "-f".to_string(),
        "pulse".to_string(),
        sink_name.to_string(),
    ];
    Supervised::spawn(ffmpeg_bin, &args, &[], Stdio::null(), Stdio::piped()).await
}

async fn run_tool(bin: &str, args: &[String]) -> Result<(), AppError> {
    run_tool_capture(bin, args).await.map(|_| ())
}

/// Runs `bin` to completion and returns the first whitespace-trimmed line of stdout,
/// which is how `pactl load-module` reports the numeric module id it assigned.
async fn run_tool_capture(bin: &str, args: &[String]) -> Result<Option<String>, AppError> {
    let output = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| AppError::ChildProcessFailure(format!("failed to run {bin}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::warn!(bin, %stderr, "system tool invocation returned non-zero");
        return Ok(None);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().map(|line| line.trim().to_string()).filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn configure_rejects_non_http_stream_url() {
        let pipeline = VirtualInputPipeline::new(VirtualInputConfig {
            video_device: "/dev/video10".to_string(),
            pulse_sink_name: "test_sink".to_string(),
            pulse_source_name: "test_source".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
        });
        let req = VirtualInputConfigureRequest {
            video: VideoSource::Stream {
                url: "ftp://example.com/video".to_string(),
            },
            audio: AudioSource::Webrtc,
            width: None,
            height: None,
            frame_rate: None,
        };
        let result = pipeline.configure(req).await;
        assert!(matches!(result, Err(AppError::InvalidParams(_))));
    }

    #[test]
    fn mpegts_chunk_validation() {
        assert!(validate_video_chunk(VideoSocketFormat::Mpegts, &[0x47, 0, 0]));
        assert!(!validate_video_chunk(VideoSocketFormat::Mpegts, &[0x00, 0, 0]));
    }

    #[test]
    fn mp4_chunk_validation() {
        let mut data = vec![0u8; 4];
        data.extend_from_slice(b"ftyp");
        assert!(validate_video_chunk(VideoSocketFormat::Mp4, &data));
        assert!(!validate_video_chunk(VideoSocketFormat::Mp4, &[0u8; 8]));
    }

    #[test]
    fn mp3_chunk_validation() {
        assert!(validate_audio_chunk(AudioSocketFormat::Mp3, &[0xFF, 0xE0]));
        assert!(!validate_audio_chunk(AudioSocketFormat::Mp3, &[0x00, 0x00]));
    }
}
