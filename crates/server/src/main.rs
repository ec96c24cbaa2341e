mod cdp_client;
mod cdp_proxy;
mod config;
mod domsync;
mod error;
mod extension_policy;
mod internal_rtmp;
mod metrics;
mod recorder;
mod restart;
mod scale_to_zero;
mod streamer;
mod supervisor;
mod upstream;
mod virtual_input;
mod web;
mod webrtc_common;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, Semaphore};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing_subscriber::EnvFilter;

use ghost_protocol::cdp::DisplayPatchResponse;

use crate::domsync::DomSyncBridge;
use crate::extension_policy::ExtensionPolicyApplier;
use crate::metrics::Metrics;
use crate::recorder::RecorderRegistry;
use crate::scale_to_zero::ScaleToZeroGate;
use crate::streamer::StreamerRegistry;
use crate::upstream::UpstreamTracker;
use crate::virtual_input::VirtualInputPipeline;
use crate::web::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/ghost.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(config_path.to_string_lossy().as_ref())?;
    if let Some(p) = port_override {
        config.server.port = p;
    }

    let issues = config.validate();
    let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{issue}");
        } else {
            tracing::warn!("{issue}");
        }
    }
    if has_errors {
        tracing::error!(
            "configuration has {} issue(s); fix the ERROR(s) above and restart",
            issues.len()
        );
        std::process::exit(1);
    }

    if !std::path::Path::new(&config.server.web_root).is_dir() {
        tracing::warn!(
            web_root = %config.server.web_root,
            "web root does not exist; static assets will 404"
        );
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid bind address")?;

    let scale_control_file = if config.scale_to_zero.control_file.is_empty() {
        None
    } else {
        Some(PathBuf::from(&config.scale_to_zero.control_file))
    };
    let scale_gate = ScaleToZeroGate::new(scale_control_file);

    let upstream = UpstreamTracker::new();
    upstream.start(config.upstream.log_path.clone(), config.upstream.backoff_cap_ms);

    let domsync = DomSyncBridge::new(Arc::clone(&upstream));
    domsync.start();

    let streamers = StreamerRegistry::new(
        config.stream.clone(),
        Arc::clone(&scale_gate),
        config.display.display_num,
    );
    let recorders = RecorderRegistry::new(
        config.recorder.clone(),
        Arc::clone(&scale_gate),
        config.display.display_num,
    );
    let virtual_input = VirtualInputPipeline::new(config.virtual_input.clone());
    let extension_policy = ExtensionPolicyApplier::new(config.extension_policy.clone());
    let process_exec_semaphore = Semaphore::new(config.server.process_exec_concurrency);

    let display = RwLock::new(DisplayPatchResponse {
        width: config.display.width,
        height: config.display.height,
    });

    let state = Arc::new(AppState {
        config: config.clone(),
        upstream: Arc::clone(&upstream),
        scale_gate: Arc::clone(&scale_gate),
        streamers: Arc::clone(&streamers),
        recorders: Arc::clone(&recorders),
        virtual_input: Arc::clone(&virtual_input),
        domsync: Arc::clone(&domsync),
        extension_policy,
        process_exec_semaphore,
        metrics: Metrics::new(),
        started_at: Instant::now(),
        display,
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  ghost browser host");
    tracing::info!("  listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("waiting for the upstream browser's DevTools endpoint to come up");
    match upstream
        .wait_for_initial(std::time::Duration::from_secs(config.timeouts.dial_secs.max(30)))
        .await
    {
        Ok(url) => tracing::info!(devtools_url = %url, "upstream browser is ready"),
        Err(e) => tracing::warn!("upstream browser not ready yet, serving anyway: {e}"),
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server loop exited with an error")?;

    tracing::info!("shutting down background subsystems");
    streamers.stop_all().await;
    for meta in recorders.list().await {
        if meta.state == ghost_protocol::recorder::RecorderState::Running {
            if let Err(e) = recorders.stop_and_finalize(&meta.id).await {
                tracing::warn!(id = %meta.id, "failed to finalize recording during shutdown: {e}");
            }
        }
    }
    domsync.stop();
    upstream.stop();

    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
