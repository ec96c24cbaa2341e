//! Tails the browser's combined log and surfaces the current DevTools WS URL.
//!
//! Built on `tokio::sync::watch` rather than a hand-rolled 1-slot `mpsc`: a watch
//! channel gives a non-blocking sender that always succeeds by overwriting, and
//! receivers that see only the latest value and may skip intermediate ones. Dropping a
//! `watch::Receiver` unsubscribes it for free, so there is no separate cancel-closure
//! to maintain.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// `DevTools listening on (ws://\S+)` — matches Chromium's startup banner line.
fn devtools_regex() -> Regex {
    Regex::new(r"DevTools listening on (ws://\S+)").expect("static regex is valid")
}

pub struct UpstreamTracker {
    tx: watch::Sender<Option<String>>,
    rx_template: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
}

impl UpstreamTracker {
    pub fn new() -> Arc<Self> {
        let (tx, rx_template) = watch::channel(None);
        Arc::new(Self {
            tx,
            rx_template,
            cancel: CancellationToken::new(),
        })
    }

    /// Begin tailing `log_path` in a background task. Idempotent to call once at startup.
    pub fn start(self: &Arc<Self>, log_path: String, backoff_cap_ms: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.tail_loop(log_path, backoff_cap_ms).await;
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn current(&self) -> Option<String> {
        self.rx_template.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }

    pub async fn wait_for_initial(&self, timeout: Duration) -> anyhow::Result<String> {
        if let Some(url) = self.current() {
            return Ok(url);
        }
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                rx.changed().await?;
                if let Some(url) = rx.borrow_and_update().clone() {
                    return Ok::<_, anyhow::Error>(url);
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for initial upstream URL"))?
    }

    fn set_current(&self, url: String) {
        // A genuine restart that recycles the same random port is indistinguishable
        // from a spurious duplicate log line, so we deliberately always notify (plain
        // `send`, not `send_if_modified`) rather than silently coalescing either case
        // away.
        let _ = self.tx.send(Some(url));
    }

    async fn tail_loop(self: Arc<Self>, log_path: String, backoff_cap_ms: u64) {
        let re = devtools_regex();
        let cap = Duration::from_millis(backoff_cap_ms.max(1));
        let mut backoff = Duration::from_millis(100);

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match tokio::fs::File::open(&log_path).await {
                Ok(file) => {
                    backoff = Duration::from_millis(100);
                    let mut lines = BufReader::new(file).lines();
                    loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            result = lines.next_line() => {
                                match result {
                                    Ok(Some(line)) => {
                                        if let Some(caps) = re.captures(&line) {
                                            let url = caps[1].to_string();
                                            tracing::info!(url, "upstream DevTools URL observed");
                                            self.set_current(url);
                                        }
                                    }
                                    Ok(None) => {
                                        tokio::select! {
                                            _ = self.cancel.cancelled() => return,
                                            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(error = %e, "upstream log tail read error, restarting tail");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, log_path, "upstream log not yet available");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(cap);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn matches_devtools_line_and_notifies_subscribers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "some preamble").unwrap();
        file.flush().unwrap();

        let tracker = UpstreamTracker::new();
        tracker.start(file.path().to_string_lossy().to_string(), 2000);
        let mut rx = tracker.subscribe();

        writeln!(file, "[12345:1:INFO] DevTools listening on ws://127.0.0.1:9222/devtools/browser/abc").unwrap();
        file.flush().unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("timed out waiting for notification")
            .unwrap();
        let url = rx.borrow().clone().unwrap();
        assert_eq!(url, "ws://127.0.0.1:9222/devtools/browser/abc");
        tracker.stop();
    }

    #[tokio::test]
    async fn current_is_empty_before_any_match() {
        let tracker = UpstreamTracker::new();
        assert_eq!(tracker.current(), None);
    }

    #[tokio::test]
    async fn wait_for_initial_times_out_when_nothing_ever_matches() {
        let tracker = UpstreamTracker::new();
        tracker.start("/nonexistent/ghost-log-that-never-appears".to_string(), 50);
        let result = tracker.wait_for_initial(Duration::from_millis(200)).await;
        assert!(result.is_err());
        tracker.stop();
    }
}
