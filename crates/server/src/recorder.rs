//! Off-screen capture to fragmented MP4, finalized by a singleflight-guarded remux.
//!
//! The transcoder child is launched through the same supervisor as the streamer set.
//! Singleflight coordination caches a `Result` behind a `Mutex<Option<...>>`, and lets
//! concurrent callers await the same in-flight finalization via a `watch` channel
//! rather than poll.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ghost_protocol::recorder::{RecorderMetadata, RecorderStartRequest, RecorderState};
use ghost_protocol::AppError;
use tokio::sync::{watch, Mutex, RwLock};

use crate::config::RecorderConfig;
use crate::scale_to_zero::{ScaleToZeroGate, ScaleToZeroGuard};
use crate::supervisor::Supervised;

type FinalizeResult = Result<(), String>;

pub struct Recorder {
    pub id: String,
    output_path: PathBuf,
    fragment_path: PathBuf,
    state: RwLock<RecorderState>,
    started_at: String,
    deleted: AtomicBool,
    supervised: Mutex<Option<Supervised>>,
    scale_guard: Mutex<Option<ScaleToZeroGuard>>,
    finalize_once: Mutex<Option<Arc<watch::Sender<Option<FinalizeResult>>>>>,
}

pub struct RecorderRegistry {
    recorders: RwLock<HashMap<String, Arc<Recorder>>>,
    config: RecorderConfig,
    scale_gate: Arc<ScaleToZeroGate>,
    display_num: u32,
}

impl RecorderRegistry {
    pub fn new(config: RecorderConfig, scale_gate: Arc<ScaleToZeroGate>, display_num: u32) -> Arc<Self> {
        Arc::new(Self {
            recorders: RwLock::new(HashMap::new()),
            config,
            scale_gate,
            display_num,
        })
    }

    pub async fn start(self: &Arc<Self>, req: RecorderStartRequest) -> Result<RecorderMetadata, AppError> {
        let id = req.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        {
            let recorders = self.recorders.read().await;
            if recorders.contains_key(&id) {
                return Err(AppError::Conflict(format!("recording id {id} already in use")));
            }
        }

        let fragment_path = PathBuf::from(&self.config.output_dir).join(format!("{id}.fragment.mp4"));
        let output_path = PathBuf::from(&self.config.output_dir).join(format!("{id}.mp4"));
        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|e| AppError::Other(e.into()))?;

        let guard = self.scale_gate.acquire().await;
        let argv = self.capture_argv(&fragment_path);
        let spawned = Supervised::spawn("ffmpeg", &argv, &[], Stdio::null(), Stdio::null()).await;
        let supervised = match spawned {
            Ok(s) => s,
            Err(e) => return Err(AppError::ChildProcessFailure(e.to_string())),
        };

        let recorder = Arc::new(Recorder {
            id: id.clone(),
            output_path,
            fragment_path,
            state: RwLock::new(RecorderState::Running),
            started_at: now_stamp(),
            deleted: AtomicBool::new(false),
            supervised: Mutex::new(Some(supervised)),
            scale_guard: Mutex::new(Some(guard)),
            finalize_once: Mutex::new(None),
        });

        self.spawn_exit_watcher(Arc::clone(&recorder));
        self.recorders.write().await.insert(id, Arc::clone(&recorder));
        Ok(recorder.metadata().await)
    }

    fn capture_argv(&self, fragment_path: &PathBuf) -> Vec<String> {
        let display = format!(":{}", self.display_num);
        let mut argv = vec![
            "-f".to_string(), "x11grab".to_string(),
            "-i".to_string(), display,
            "-f".to_string(), "pulse".to_string(),
            "-i".to_string(), "default".to_string(),
            "-c:v".to_string(), "libx264".to_string(),
            "-c:a".to_string(), "aac".to_string(),
            "-movflags".to_string(), "frag_keyframe+empty_moov+default_base_moof".to_string(),
            "-frag_duration".to_string(), (self.config.fragment_duration_secs * 1_000_000).to_string(),
        ];
        if self.config.max_duration_secs > 0 {
            argv.push("-t".to_string());
            argv.push(self.config.max_duration_secs.to_string());
        }
        if self.config.size_ceiling_bytes > 0 {
            argv.push("-fs".to_string());
            argv.push(self.config.size_ceiling_bytes.to_string());
        }
        argv.push(fragment_path.to_string_lossy().to_string());
        argv
    }

    fn spawn_exit_watcher(&self, recorder: Arc<Recorder>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                let mut guard = recorder.supervised.lock().await;
                let Some(supervised) = guard.as_mut() else {
                    return;
                };
                match supervised.try_wait().await {
                    Ok(Some(_)) => {
                        drop(guard);
                        *recorder.state.write().await = RecorderState::Exited;
                        return;
                    }
                    Ok(None) => continue,
                    Err(_) => return,
                }
            }
        });
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Recorder>> {
        self.recorders.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<RecorderMetadata> {
        let recorders = self.recorders.read().await;
        let mut out = Vec::with_capacity(recorders.len());
        for r in recorders.values() {
            out.push(r.metadata().await);
        }
        out
    }

    pub async fn stop_and_finalize(&self, id: &str) -> Result<RecorderMetadata, AppError> {
        let recorder = self
            .get(id)
            .await
            .ok_or_else(|| AppError::NotReady(format!("no recording with id {id}")))?;

        if let Some(mut supervised) = recorder.supervised.lock().await.take() {
            let _ = supervised.shutdown().await;
        }
        *recorder.state.write().await = RecorderState::Exited;
        recorder.scale_guard.lock().await.take();

        recorder.finalize().await?;
        Ok(recorder.metadata().await)
    }

    /// Path to the finalized MP4 for `id`, for the download endpoint. Returns
    /// `AppError::Finalizing` until the remux has produced a faststart file.
    pub async fn download_path(&self, id: &str) -> Result<PathBuf, AppError> {
        let recorder = self
            .get(id)
            .await
            .ok_or_else(|| AppError::NotReady(format!("no recording with id {id}")))?;
        if *recorder.state.read().await != RecorderState::Finalized {
            return Err(AppError::Finalizing);
        }
        Ok(recorder.output_path.clone())
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        let recorder = self
            .get(id)
            .await
            .ok_or_else(|| AppError::NotReady(format!("no recording with id {id}")))?;
        if *recorder.state.read().await != RecorderState::Finalized {
            return Err(AppError::Finalizing);
        }
        recorder.deleted.store(true, Ordering::SeqCst);
        let _ = tokio::fs::remove_file(&recorder.output_path).await;
        self.recorders.write().await.remove(id);
        Ok(())
    }
}

impl Recorder {
    pub async fn metadata(&self) -> RecorderMetadata {
        let state = *self.state.read().await;
        RecorderMetadata {
            id: self.id.clone(),
            state,
            started_at: self.started_at.clone(),
            deleted: self.deleted.load(Ordering::SeqCst),
            finalize_complete: state == RecorderState::Finalized,
            finalize_error: None,
        }
    }

    /// Singleflight: the first caller runs the remux; concurrent callers await the
    /// same `watch` notification and see the same cached result.
    async fn finalize(self: &Arc<Self>) -> Result<(), AppError> {
        let mut guard = self.finalize_once.lock().await;
        if let Some(existing) = guard.as_ref() {
            let mut rx = existing.subscribe();
            drop(guard);
            loop {
                if let Some(result) = rx.borrow().clone() {
                    return map_finalize_result(result);
                }
                if rx.changed().await.is_err() {
                    return Err(AppError::ChildProcessFailure(
                        "finalize coordinator dropped".to_string(),
                    ));
                }
            }
        }

        let (tx, _rx) = watch::channel(None);
        let tx = Arc::new(tx);
        *guard = Some(Arc::clone(&tx));
        drop(guard);

        let result = self.remux().await;
        let _ = tx.send(Some(result.clone()));
        if result.is_ok() {
            *self.state.write().await = RecorderState::Finalized;
        }
        map_finalize_result(result)
    }

    async fn remux(&self) -> FinalizeResult {
        let argv = vec![
            "-y".to_string(),
            "-i".to_string(),
            self.fragment_path.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            self.output_path.to_string_lossy().to_string(),
        ];

        let spawned = Supervised::spawn("ffmpeg", &argv, &[], Stdio::null(), Stdio::null()).await;
        let mut supervised = spawned.map_err(|e| e.to_string())?;
        let status = supervised.wait().await.map_err(|e| e.to_string())?;
        if !status.success() {
            return Err(format!("faststart remux exited with {status}"));
        }
        let _ = tokio::fs::remove_file(&self.fragment_path).await;
        Ok(())
    }
}

fn map_finalize_result(result: FinalizeResult) -> Result<(), AppError> {
    result.map_err(AppError::ChildProcessFailure)
}

fn now_stamp() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RecorderConfig {
        RecorderConfig {
            output_dir: std::env::temp_dir().join("ghost-recorder-tests").to_string_lossy().to_string(),
            fragment_duration_secs: 2,
            size_ceiling_bytes: 0,
            max_duration_secs: 0,
        }
    }

    #[tokio::test]
    async fn delete_before_finalized_is_rejected() {
        let gate = ScaleToZeroGate::new(None);
        let registry = RecorderRegistry::new(test_config(), gate, 0);
        // Bypass the real ffmpeg spawn for this invariant-only test.
        let recorder = Arc::new(Recorder {
            id: "r1".to_string(),
            output_path: PathBuf::from("/tmp/r1.mp4"),
            fragment_path: PathBuf::from("/tmp/r1.fragment.mp4"),
            state: RwLock::new(RecorderState::Exited),
            started_at: now_stamp(),
            deleted: AtomicBool::new(false),
            supervised: Mutex::new(None),
            scale_guard: Mutex::new(None),
            finalize_once: Mutex::new(None),
        });
        registry.recorders.write().await.insert("r1".to_string(), recorder);

        let result = registry.delete("r1").await;
        assert!(matches!(result, Err(AppError::Finalizing)));
    }
}
