//! Embedded RTMP relay for internal-mode streamers (§4.4 "Internal RTMP").
//!
//! Unlike remote mode, where the transcoder pushes straight to a caller-supplied
//! ingest URL, internal mode needs *something* listening on `rtmp://127.0.0.1:<port>`
//! for the transcoder to push to, so that other RTMP clients can pull the same stream
//! back out under a playback URL. `rml_rtmp` gives us the handshake and chunk-stream
//! state machine as a sans-I/O session; this module supplies the TCP plumbing and the
//! publisher-to-players fan-out, the same shape as the socket streamer's MPEG-TS
//! broadcast in `streamer.rs` but speaking RTMP on both sides instead of raw bytes out
//! one side.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};

#[derive(Clone)]
enum RelayMessage {
    Video { timestamp: u32, data: Bytes },
    Audio { timestamp: u32, data: Bytes },
}

/// One broadcast channel per `stream_key` (the streamer id, per `rtmp://host:port/live/{id}`).
/// Publishers and players both resolve their channel by stream key; a player that
/// connects before the publisher just waits, the same way a late socket-mode client
/// only sees chunks from the moment it joins.
pub struct InternalRtmpRelay {
    port: u16,
    streams: RwLock<HashMap<String, broadcast::Sender<RelayMessage>>>,
}

impl InternalRtmpRelay {
    /// Binds the relay's listener and spawns its accept loop. Bound once at server
    /// startup regardless of whether any internal-mode streamer is active yet, the
    /// same way the upstream tracker starts tailing before any CDP client connects.
    pub fn spawn(port: u16) -> Arc<Self> {
        let relay = Arc::new(Self {
            port,
            streams: RwLock::new(HashMap::new()),
        });
        let accept_relay = Arc::clone(&relay);
        tokio::spawn(async move {
            let listener = match TcpListener::bind(("127.0.0.1", accept_relay.port)).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(port = accept_relay.port, "internal rtmp relay failed to bind: {e}");
                    return;
                }
            };
            tracing::info!(port = accept_relay.port, "internal rtmp relay listening");
            loop {
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        let relay = Arc::clone(&accept_relay);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, relay).await {
                                tracing::debug!(%addr, "rtmp relay connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("internal rtmp relay accept error: {e}");
                    }
                }
            }
        });
        relay
    }

    async fn channel_for(&self, stream_key: &str) -> broadcast::Sender<RelayMessage> {
        if let Some(tx) = self.streams.read().await.get(stream_key) {
            return tx.clone();
        }
        let mut streams = self.streams.write().await;
        streams
            .entry(stream_key.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    async fn drop_channel(&self, stream_key: &str) {
        self.streams.write().await.remove(stream_key);
    }
}

enum Role {
    Undecided,
    Publisher { stream_key: String },
    Player { stream_key: String },
}

async fn handle_connection(mut socket: TcpStream, relay: Arc<InternalRtmpRelay>) -> anyhow::Result<()> {
    let mut handshake = Handshake::new(PeerType::Server);
    let p0_and_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| anyhow::anyhow!("rtmp handshake generation failed: {e:?}"))?;
    socket.write_all(&p0_and_p1).await?;

    let mut read_buf = vec![0u8; 8192];
    let mut leftover: Vec<u8> = loop {
        let n = socket.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        match handshake
            .process_bytes(&read_buf[..n])
            .map_err(|e| anyhow::anyhow!("rtmp handshake failed: {e:?}"))?
        {
            HandshakeProcessResult::InProgress { response_bytes } => {
                if !response_bytes.is_empty() {
                    socket.write_all(&response_bytes).await?;
                }
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                if !response_bytes.is_empty() {
                    socket.write_all(&response_bytes).await?;
                }
                break remaining_bytes;
            }
        }
    };

    let config = ServerSessionConfig::new();
    let (mut session, initial_results) = ServerSession::new(config)
        .map_err(|e| anyhow::anyhow!("rtmp session init failed: {e:?}"))?;

    let mut role = Role::Undecided;
    let mut player_rx: Option<broadcast::Receiver<RelayMessage>> = None;

    for result in initial_results {
        handle_session_result(&mut session, &mut socket, &relay, &mut role, &mut player_rx, result).await?;
    }

    loop {
        if !leftover.is_empty() {
            let input = std::mem::take(&mut leftover);
            let results = session
                .handle_input(&input)
                .map_err(|e| anyhow::anyhow!("rtmp input handling failed: {e:?}"))?;
            for result in results {
                handle_session_result(&mut session, &mut socket, &relay, &mut role, &mut player_rx, result).await?;
            }
        }

        if let Some(rx) = player_rx.as_mut() {
            tokio::select! {
                read = socket.read(&mut read_buf) => {
                    let n = read?;
                    if n == 0 { break; }
                    let results = session
                        .handle_input(&read_buf[..n])
                        .map_err(|e| anyhow::anyhow!("rtmp input handling failed: {e:?}"))?;
                    for result in results {
                        handle_session_result(&mut session, &mut socket, &relay, &mut role, &mut player_rx, result).await?;
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Ok(RelayMessage::Video { timestamp, data }) => {
                            let packet = session
                                .send_video_data(1, data, RtmpTimestamp::new(timestamp), true)
                                .map_err(|e| anyhow::anyhow!("send_video_data failed: {e:?}"))?;
                            socket.write_all(&packet.bytes).await?;
                        }
                        Ok(RelayMessage::Audio { timestamp, data }) => {
                            let packet = session
                                .send_audio_data(1, data, RtmpTimestamp::new(timestamp), true)
                                .map_err(|e| anyhow::anyhow!("send_audio_data failed: {e:?}"))?;
                            socket.write_all(&packet.bytes).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        } else {
            let n = socket.read(&mut read_buf).await?;
            if n == 0 {
                break;
            }
            let results = session
                .handle_input(&read_buf[..n])
                .map_err(|e| anyhow::anyhow!("rtmp input handling failed: {e:?}"))?;
            for result in results {
                handle_session_result(&mut session, &mut socket, &relay, &mut role, &mut player_rx, result).await?;
            }
        }
    }

    if let Role::Publisher { stream_key } = &role {
        relay.drop_channel(stream_key).await;
    }
    Ok(())
}

async fn handle_session_result(
    session: &mut ServerSession,
    socket: &mut TcpStream,
    relay: &Arc<InternalRtmpRelay>,
    role: &mut Role,
    player_rx: &mut Option<broadcast::Receiver<RelayMessage>>,
    result: ServerSessionResult,
) -> anyhow::Result<()> {
    match result {
        ServerSessionResult::OutboundResponse(packet) => {
            socket.write_all(&packet.bytes).await?;
        }
        ServerSessionResult::RaisedEvent(event) => match event {
            ServerSessionEvent::ConnectionRequested { request_id, .. } => {
                for r in session
                    .accept_request(request_id)
                    .map_err(|e| anyhow::anyhow!("accept connection failed: {e:?}"))?
                {
                    Box::pin(handle_session_result(session, socket, relay, role, player_rx, r)).await?;
                }
            }
            ServerSessionEvent::PublishStreamRequested {
                request_id,
                stream_key,
                ..
            } => {
                *role = Role::Publisher {
                    stream_key: stream_key.clone(),
                };
                relay.channel_for(&stream_key).await;
                for r in session
                    .accept_request(request_id)
                    .map_err(|e| anyhow::anyhow!("accept publish failed: {e:?}"))?
                {
                    Box::pin(handle_session_result(session, socket, relay, role, player_rx, r)).await?;
                }
            }
            ServerSessionEvent::PlayStreamRequested {
                request_id,
                stream_key,
                ..
            } => {
                let tx = relay.channel_for(&stream_key).await;
                *player_rx = Some(tx.subscribe());
                *role = Role::Player { stream_key };
                for r in session
                    .accept_request(request_id)
                    .map_err(|e| anyhow::anyhow!("accept play failed: {e:?}"))?
                {
                    Box::pin(handle_session_result(session, socket, relay, role, player_rx, r)).await?;
                }
            }
            ServerSessionEvent::VideoDataReceived {
                stream_key,
                data,
                timestamp,
                ..
            } => {
                let tx = relay.channel_for(&stream_key).await;
                let _ = tx.send(RelayMessage::Video {
                    timestamp: timestamp.value,
                    data,
                });
            }
            ServerSessionEvent::AudioDataReceived {
                stream_key,
                data,
                timestamp,
                ..
            } => {
                let tx = relay.channel_for(&stream_key).await;
                let _ = tx.send(RelayMessage::Audio {
                    timestamp: timestamp.value,
                    data,
                });
            }
            ServerSessionEvent::PublishStreamFinished { stream_key, .. } => {
                relay.drop_channel(&stream_key).await;
            }
            _ => {}
        },
        ServerSessionResult::UnhandleableMessageReceived(_) => {}
    }
    Ok(())
}
