//! Scale-to-zero activity gate: tells an external autoscaler this instance is busy by
//! writing `+`/`-` tokens to a control file. A refcount under a lock means callers
//! never allocate/release the underlying resource directly, only acquire a guard.
//!
//! Silent no-op when no control file is configured, so this can be wired into every
//! subsystem unconditionally without each call site branching on whether scale-to-zero
//! is enabled.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

struct Inner {
    control_file: Option<PathBuf>,
    refcount: u64,
}

pub struct ScaleToZeroGate {
    inner: Mutex<Inner>,
}

impl ScaleToZeroGate {
    pub fn new(control_file: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                control_file,
                refcount: 0,
            }),
        })
    }

    /// Acquire one reference, writing `+` to the control file if this is the first
    /// holder. Returns a guard that releases on drop, via a blocking background task
    /// (guards are often dropped from non-async contexts, e.g. panics during a request).
    pub async fn acquire(self: &Arc<Self>) -> ScaleToZeroGuard {
        let mut inner = self.inner.lock().await;
        inner.refcount += 1;
        if inner.refcount == 1 {
            write_token(&inner.control_file, b"+").await;
        }
        ScaleToZeroGuard {
            gate: Arc::clone(self),
            released: false,
        }
    }

    async fn release(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        inner.refcount = inner.refcount.saturating_sub(1);
        if inner.refcount == 0 {
            write_token(&inner.control_file, b"-").await;
        }
    }

    #[cfg(test)]
    async fn refcount(&self) -> u64 {
        self.inner.lock().await.refcount
    }
}

async fn write_token(control_file: &Option<PathBuf>, token: &'static [u8]) {
    let Some(path) = control_file else {
        return;
    };
    if let Err(e) = tokio::fs::write(path, token).await {
        tracing::warn!(error = %e, path = %path.display(), "failed to write scale-to-zero token");
    }
}

/// Releases its activity reference when dropped. Holding this across an `.await` keeps
/// the instance marked busy for the duration of whatever it guards (a stream session, a
/// recorder run, an open CDP proxy connection).
pub struct ScaleToZeroGuard {
    gate: Arc<ScaleToZeroGate>,
    released: bool,
}

impl Drop for ScaleToZeroGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let gate = Arc::clone(&self.gate);
        tokio::spawn(async move {
            gate.release().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_control_file_is_a_silent_noop() {
        let gate = ScaleToZeroGate::new(None);
        let guard = gate.acquire().await;
        assert_eq!(gate.refcount().await, 1);
        drop(guard);
        // release runs on a spawned task; give it a tick.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(gate.refcount().await, 0);
    }

    #[tokio::test]
    async fn first_acquire_writes_plus_last_release_writes_minus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scale-control");
        let gate = ScaleToZeroGate::new(Some(path.clone()));

        let g1 = gate.acquire().await;
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"+");

        let g2 = gate.acquire().await;
        assert_eq!(gate.refcount().await, 2);

        drop(g1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // still held by g2, so no '-' yet.
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"+");

        drop(g2);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"-");
    }
}
