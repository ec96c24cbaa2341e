//! Shared "restart the browser and wait for a new DevTools URL" path, used by both
//! the extension policy applier and the display-geometry patch handler.
//! Grounded on the upstream tracker's `wait_for_initial`/subscribe shape — a restart
//! is "wait for the next watch update", same primitive, just triggered externally
//! rather than observed passively.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use crate::upstream::UpstreamTracker;

/// Runs `restart_command` through a shell, then waits indefinitely for the upstream
/// tracker to observe a subsequent DevTools URL. Callers impose their own HTTP-level
/// deadline if one is needed.
pub async fn restart_browser_and_wait(
    restart_command: &str,
    upstream: &Arc<UpstreamTracker>,
) -> anyhow::Result<String> {
    let mut rx = upstream.subscribe();
    rx.borrow_and_update();

    let status = Command::new("sh")
        .arg("-c")
        .arg(restart_command)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("failed to invoke restart command: {e}"))?;
    if !status.success() {
        anyhow::bail!("restart command `{restart_command}` exited with {status}");
    }

    loop {
        rx.changed().await?;
        if let Some(url) = rx.borrow_and_update().clone() {
            return Ok(url);
        }
    }
}
