//! The streamer set: four ways to get the virtual display's capture out of the
//! container (remote RTMP, internal RTMP relay, MPEG-TS over WebSocket, WebRTC), all
//! built on the same supervisor-launched transcoder child.
//!
//! Socket fan-out gives each connected client a bounded channel; a client whose
//! channel fills up is evicted on the next send error rather than backpressuring the
//! producer. WebRTC offer/answer/ICE/RTCP-PLI plumbing relays already-encoded RTP read
//! from local UDP sockets rather than encoding samples in-process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as AxMessage, WebSocket};
use bytes::Bytes;
use ghost_protocol::streamer::{
    StreamListResponse, StreamMode, StreamStartRequest, StreamerMetadata, StreamerState,
};
use ghost_protocol::AppError;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::config::StreamConfig;
use crate::internal_rtmp::InternalRtmpRelay;
use crate::scale_to_zero::{ScaleToZeroGate, ScaleToZeroGuard};
use crate::supervisor::Supervised;
use crate::webrtc_common::create_peer_connection;

const VIDEO_PAYLOAD_TYPE: u8 = 96;
const AUDIO_PAYLOAD_TYPE: u8 = 111;

struct SocketClient {
    tx: mpsc::Sender<Bytes>,
}

enum ModeState {
    Socket {
        clients: RwLock<Vec<SocketClient>>,
    },
    Webrtc {
        video_track: Arc<TrackLocalStaticRTP>,
        audio_track: Arc<TrackLocalStaticRTP>,
        peers: RwLock<HashMap<String, Arc<RTCPeerConnection>>>,
    },
    Passive,
}

pub struct Streamer {
    pub id: String,
    pub mode: StreamMode,
    pub ingest_url: Option<String>,
    pub playback_urls: Vec<String>,
    state: RwLock<StreamerState>,
    started_at: RwLock<Option<String>>,
    supervised: tokio::sync::Mutex<Option<Supervised>>,
    scale_guard: tokio::sync::Mutex<Option<ScaleToZeroGuard>>,
    mode_state: ModeState,
}

pub struct StreamerRegistry {
    streamers: RwLock<HashMap<String, Arc<Streamer>>>,
    scale_gate: Arc<ScaleToZeroGate>,
    config: StreamConfig,
    display_num: u32,
    internal_relay: Arc<InternalRtmpRelay>,
}

impl StreamerRegistry {
    pub fn new(config: StreamConfig, scale_gate: Arc<ScaleToZeroGate>, display_num: u32) -> Arc<Self> {
        let internal_relay = InternalRtmpRelay::spawn(config.internal_rtmp_port);
        Arc::new(Self {
            streamers: RwLock::new(HashMap::new()),
            scale_gate,
            config,
            display_num,
            internal_relay,
        })
    }

    pub async fn list(&self) -> StreamListResponse {
        let streamers = self.streamers.read().await;
        let mut metas = Vec::with_capacity(streamers.len());
        for s in streamers.values() {
            metas.push(s.metadata().await);
        }
        StreamListResponse { streamers: metas }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.streamers.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.stop(&id).await;
        }
    }

    pub async fn start(self: &Arc<Self>, req: StreamStartRequest) -> Result<StreamerMetadata, AppError> {
        let id = req
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if matches!(req.mode, StreamMode::Socket) && req.id.is_none() {
            return Err(AppError::InvalidParams(
                "socket mode requires an explicit id".to_string(),
            ));
        }

        {
            let streamers = self.streamers.read().await;
            if streamers.contains_key(&id) {
                return Err(AppError::Conflict(format!("stream id {id} already in use")));
            }
        }

        if matches!(req.mode, StreamMode::Remote) && req.target_url.is_none() {
            return Err(AppError::InvalidParams(
                "remote mode requires target_url".to_string(),
            ));
        }

        let guard = self.scale_gate.acquire().await;

        let (mode_state, ingest_url, playback_urls, argv) = match req.mode {
            StreamMode::Remote => {
                let target = req.target_url.clone().unwrap();
                let argv = self.capture_argv_rtmp(&target);
                (ModeState::Passive, Some(target), Vec::new(), argv)
            }
            StreamMode::Internal => {
                let port = self.config.internal_rtmp_port;
                let ingest = format!("rtmp://127.0.0.1:{port}/live/{id}");
                let playback = vec![format!("rtmp://127.0.0.1:{port}/live/{id}")];
                let argv = self.capture_argv_rtmp(&ingest);
                (ModeState::Passive, Some(ingest), playback, argv)
            }
            StreamMode::Socket => {
                let argv = self.capture_argv_mpegts();
                (
                    ModeState::Socket {
                        clients: RwLock::new(Vec::new()),
                    },
                    None,
                    Vec::new(),
                    argv,
                )
            }
            StreamMode::Webrtc => {
                let (video_track, audio_track, video_port, audio_port) =
                    build_webrtc_tracks().map_err(|e| AppError::Other(e))?;
                let argv = self.capture_argv_webrtc(video_port, audio_port);
                (
                    ModeState::Webrtc {
                        video_track,
                        audio_track,
                        peers: RwLock::new(HashMap::new()),
                    },
                    None,
                    Vec::new(),
                    argv,
                )
            }
        };

        let streamer = Arc::new(Streamer {
            id: id.clone(),
            mode: req.mode,
            ingest_url,
            playback_urls,
            state: RwLock::new(StreamerState::Starting),
            started_at: RwLock::new(None),
            supervised: tokio::sync::Mutex::new(None),
            scale_guard: tokio::sync::Mutex::new(Some(guard)),
            mode_state,
        });

        let stdout = if matches!(req.mode, StreamMode::Socket) {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let spawned = Supervised::spawn(&self.config.ffmpeg_bin, &argv, &[], stdout, Stdio::null()).await;
        let mut supervised = match spawned {
            Ok(s) => s,
            Err(e) => {
                *streamer.state.write().await = StreamerState::Exited;
                streamer.scale_guard.lock().await.take();
                return Err(AppError::ChildProcessFailure(e.to_string()));
            }
        };

        if let StreamMode::Socket = req.mode {
            self.spawn_socket_fanout(&streamer, &mut supervised);
        }

        *streamer.state.write().await = StreamerState::Running;
        *streamer.started_at.write().await = Some(now_rfc3339());
        *streamer.supervised.lock().await = Some(supervised);

        self.spawn_exit_watcher(Arc::clone(&streamer));

        self.streamers.write().await.insert(id, Arc::clone(&streamer));
        Ok(streamer.metadata().await)
    }

    fn spawn_socket_fanout(&self, streamer: &Arc<Streamer>, supervised: &mut Supervised) {
        let Some(stdout) = supervised.take_stdout() else {
            return;
        };
        let streamer = Arc::clone(streamer);
        let chunk_size = self.config.socket_chunk_bytes;
        tokio::spawn(async move {
            let ModeState::Socket { clients } = &streamer.mode_state else {
                return;
            };
            let mut stdout = stdout;
            let mut buf = vec![0u8; chunk_size];
            loop {
                let n = match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                let mut dead = Vec::new();
                let guard = clients.read().await;
                for (idx, client) in guard.iter().enumerate() {
                    if client.tx.try_send(chunk.clone()).is_err() {
                        dead.push(idx);
                    }
                }
                drop(guard);
                if !dead.is_empty() {
                    let mut guard = clients.write().await;
                    for idx in dead.into_iter().rev() {
                        if idx < guard.len() {
                            guard.remove(idx);
                        }
                    }
                }
            }
        });
    }

    fn spawn_exit_watcher(&self, streamer: Arc<Streamer>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let mut supervised_guard = streamer.supervised.lock().await;
                let Some(supervised) = supervised_guard.as_mut() else {
                    return;
                };
                match supervised.try_wait().await {
                    Ok(Some(_)) => {
                        drop(supervised_guard);
                        *streamer.state.write().await = StreamerState::Exited;
                        streamer.scale_guard.lock().await.take();
                        return;
                    }
                    Ok(None) => continue,
                    Err(_) => return,
                }
            }
        });
    }

    pub async fn stop(&self, id: &str) -> Result<(), AppError> {
        let streamer = {
            let mut streamers = self.streamers.write().await;
            streamers.remove(id)
        };
        let Some(streamer) = streamer else {
            return Err(AppError::NotReady(format!("no streamer with id {id}")));
        };
        *streamer.state.write().await = StreamerState::Stopping;
        if let Some(mut supervised) = streamer.supervised.lock().await.take() {
            let _ = supervised.shutdown().await;
        }
        *streamer.state.write().await = StreamerState::Exited;
        streamer.scale_guard.lock().await.take();
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Streamer>> {
        self.streamers.read().await.get(id).cloned()
    }

    /// The id of the first webrtc-mode streamer, for the single unparameterized
    /// `/stream/webrtc/offer` route. Only one webrtc-mode streamer is expected to be
    /// active at a time.
    pub async fn first_webrtc_id(&self) -> Option<String> {
        let streamers = self.streamers.read().await;
        streamers
            .values()
            .find(|s| matches!(s.mode, StreamMode::Webrtc))
            .map(|s| s.id.clone())
    }

    pub async fn webrtc_offer(&self, id: &str, sdp: String) -> Result<String, AppError> {
        let streamer = self
            .get(id)
            .await
            .ok_or_else(|| AppError::NotReady(format!("no streamer with id {id}")))?;
        let ModeState::Webrtc {
            video_track,
            audio_track,
            peers,
        } = &streamer.mode_state
        else {
            return Err(AppError::InvalidParams(format!("streamer {id} is not in webrtc mode")));
        };

        let peer_connection = create_peer_connection()
            .await
            .map_err(AppError::Other)?;
        peer_connection
            .add_track(Arc::clone(video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::Other(e.into()))?;
        peer_connection
            .add_track(Arc::clone(audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::Other(e.into()))?;

        let peer_id = uuid::Uuid::new_v4().to_string();
        let streamer_for_state = Arc::clone(&streamer);
        let peer_id_for_state = peer_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let streamer = Arc::clone(&streamer_for_state);
            let peer_id = peer_id_for_state.clone();
            Box::pin(async move {
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                        | RTCPeerConnectionState::Disconnected
                ) {
                    if let ModeState::Webrtc { peers, .. } = &streamer.mode_state {
                        peers.write().await.remove(&peer_id);
                    }
                }
            })
        }));

        let offer = RTCSessionDescription::offer(sdp).map_err(|e| AppError::Other(e.into()))?;
        peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| AppError::Other(e.into()))?;
        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| AppError::Other(e.into()))?;

        let mut gather_complete = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| AppError::Other(e.into()))?;
        let _ = gather_complete.recv().await;

        let local_desc = peer_connection
            .local_description()
            .await
            .ok_or_else(|| AppError::Other(anyhow::anyhow!("no local description after gathering")))?;

        peers.write().await.insert(peer_id, Arc::new(peer_connection));

        Ok(local_desc.sdp)
    }

    pub async fn handle_socket_client(&self, id: &str, mut ws: WebSocket) {
        let Some(streamer) = self.get(id).await else {
            let _ = ws.send(AxMessage::Close(None)).await;
            return;
        };
        let ModeState::Socket { clients } = &streamer.mode_state else {
            let _ = ws.send(AxMessage::Close(None)).await;
            return;
        };

        if ws.send(AxMessage::Text("mpegts".into())).await.is_err() {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        clients.write().await.push(SocketClient { tx });

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

    /// Capture-side input args shared by all four streamer modes: x11grab + pulse on
    /// Linux, the native AV framework with `nv12` on Darwin (SPEC_FULL.md §4.4).
    fn capture_input_args(&self) -> Vec<String> {
        if cfg!(target_os = "macos") {
            vec![
                "-f".into(), "avfoundation".into(),
                "-pixel_format".into(), "nv12".into(),
                "-framerate".into(), self.config.frame_rate.to_string(),
                "-i".into(), format!("{}:0", self.display_num),
            ]
        } else {
            vec![
                "-f".into(), "x11grab".into(),
                "-r".into(), self.config.frame_rate.to_string(),
                "-i".into(), format!(":{}", self.display_num),
                "-f".into(), "pulse".into(),
                "-i".into(), "default".into(),
            ]
        }
    }

    fn capture_argv_rtmp(&self, ingest_url: &str) -> Vec<String> {
        let keyframe_interval = 2 * self.config.frame_rate;
        let mut argv = self.capture_input_args();
        argv.extend([
            "-c:v".into(), "libx264".into(),
            "-preset".into(), "veryfast".into(),
            "-tune".into(), "zerolatency".into(),
            "-pix_fmt".into(), "yuv420p".into(),
            "-g".into(), keyframe_interval.to_string(),
            "-c:a".into(), "aac".into(),
            "-f".into(), "flv".into(),
            ingest_url.to_string(),
        ]);
        argv
    }

    fn capture_argv_mpegts(&self) -> Vec<String> {
        let mut argv = self.capture_input_args();
        argv.extend([
            "-c:v".into(), "libx264".into(),
            "-preset".into(), "veryfast".into(),
            "-tune".into(), "zerolatency".into(),
            "-pix_fmt".into(), "yuv420p".into(),
            "-c:a".into(), "aac".into(),
            "-f".into(), "mpegts".into(),
            "pipe:1".into(),
        ]);
        argv
    }

    fn capture_argv_webrtc(&self, video_port: u16, audio_port: u16) -> Vec<String> {
        let mut argv = self.capture_input_args();
        argv.extend([
            "-c:v".into(), "libvpx".into(),
            "-deadline".into(), "realtime".into(),
            "-f".into(), "rtp".into(),
            format!("rtp://127.0.0.1:{video_port}?pkt_size=1200"),
            "-c:a".into(), "libopus".into(),
            "-f".into(), "rtp".into(),
            format!("rtp://127.0.0.1:{audio_port}?pkt_size=1200"),
        ]);
        argv
    }
}

impl Streamer {
    async fn metadata(&self) -> StreamerMetadata {
        let (websocket_path, offer_path) = match self.mode {
            StreamMode::Socket => (Some(format!("/stream/socket/{}", self.id)), None),
            StreamMode::Webrtc => (None, Some("/stream/webrtc/offer".to_string())),
            _ => (None, None),
        };
        StreamerMetadata {
            id: self.id.clone(),
            mode: self.mode,
            state: *self.state.read().await,
            ingest_url: self.ingest_url.clone(),
            playback_urls: self.playback_urls.clone(),
            started_at: self.started_at.read().await.clone(),
            websocket_path,
            offer_path,
        }
    }
}

fn now_rfc3339() -> String {
    // Seconds-since-epoch string rather than a chrono dependency; good enough for a
    // diagnostic timestamp in streamer metadata.
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

/// Builds shared video/audio tracks and two local UDP sockets; spawns the RTP relay
/// tasks (socket -> track) and returns the ports the transcoder should target.
fn build_webrtc_tracks() -> anyhow::Result<(
    Arc<TrackLocalStaticRTP>,
    Arc<TrackLocalStaticRTP>,
    u16,
    u16,
)> {
    let video_track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            ..Default::default()
        },
        "video".to_string(),
        "ghost".to_string(),
    ));
    let audio_track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            ..Default::default()
        },
        "audio".to_string(),
        "ghost".to_string(),
    ));

    let video_port = spawn_rtp_relay(Arc::clone(&video_track), VIDEO_PAYLOAD_TYPE)?;
    let audio_port = spawn_rtp_relay(Arc::clone(&audio_track), AUDIO_PAYLOAD_TYPE)?;

    Ok((video_track, audio_track, video_port, audio_port))
}

fn spawn_rtp_relay(track: Arc<TrackLocalStaticRTP>, _payload_type: u8) -> anyhow::Result<u16> {
    let std_socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
    std_socket.set_nonblocking(true)?;
    let port = std_socket.local_addr()?.port();
    let socket = UdpSocket::from_std(std_socket)?;

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let (n, _addr): (usize, SocketAddr) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Ok(packet) = webrtc::rtp::packet::Packet::unmarshal(&mut &buf[..n]) {
                if track.write_rtp(&packet).await.is_err() {
                    // Dropped track (no subscriber yet, or peer gone); keep draining
                    // the socket so the transcoder never blocks on a full send buffer.
                    continue;
                }
            }
        }
    });

    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StreamConfig {
        StreamConfig {
            ffmpeg_bin: "/bin/true".to_string(),
            frame_rate: 30,
            internal_rtmp_port: 19350,
            socket_chunk_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn socket_mode_requires_explicit_id() {
        let gate = ScaleToZeroGate::new(None);
        let registry = StreamerRegistry::new(test_config(), gate, 0);
        let req = StreamStartRequest {
            mode: StreamMode::Socket,
            id: None,
            target_url: None,
        };
        let result = registry.start(req).await;
        assert!(matches!(result, Err(AppError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn remote_mode_requires_target_url() {
        let gate = ScaleToZeroGate::new(None);
        let registry = StreamerRegistry::new(test_config(), gate, 0);
        let req = StreamStartRequest {
            mode: StreamMode::Remote,
            id: Some("r1".to_string()),
            target_url: None,
        };
        let result = registry.start(req).await;
        assert!(matches!(result, Err(AppError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn duplicate_id_is_a_conflict() {
        let gate = ScaleToZeroGate::new(None);
        let registry = StreamerRegistry::new(test_config(), gate, 0);
        let req = StreamStartRequest {
            mode: StreamMode::Socket,
            id: Some("dup".to_string()),
            target_url: None,
        };
        let first = registry.start(req.clone_for_test()).await;
        assert!(first.is_ok());
        let second = registry.start(req).await;
        assert!(matches!(second, Err(AppError::Conflict(_))));
    }

    impl StreamStartRequest {
        fn clone_for_test(&self) -> Self {
            Self {
                mode: self.mode,
                id: self.id.clone(),
                target_url: self.target_url.clone(),
            }
        }
    }
}
