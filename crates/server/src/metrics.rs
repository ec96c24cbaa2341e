//! Prometheus text-format counters: plain `AtomicU64` fields rendered with a
//! `# HELP`/`# TYPE` preamble per series.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    started_at: Instant,
    pub streamer_starts: AtomicU64,
    pub streamer_stops: AtomicU64,
    pub cdp_proxy_connections_active: AtomicU64,
    pub cdp_proxy_connections_total: AtomicU64,
    pub dom_sync_clients_active: AtomicU64,
    pub upstream_restarts_observed: AtomicU64,
    pub recorder_finalizations: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            streamer_starts: AtomicU64::new(0),
            streamer_stops: AtomicU64::new(0),
            cdp_proxy_connections_active: AtomicU64::new(0),
            cdp_proxy_connections_total: AtomicU64::new(0),
            dom_sync_clients_active: AtomicU64::new(0),
            upstream_restarts_observed: AtomicU64::new(0),
            recorder_finalizations: AtomicU64::new(0),
        }
    }

    pub fn render(&self) -> String {
        let uptime_secs = self.started_at.elapsed().as_secs();
        let streamer_starts = self.streamer_starts.load(Ordering::Relaxed);
        let streamer_stops = self.streamer_stops.load(Ordering::Relaxed);
        let cdp_active = self.cdp_proxy_connections_active.load(Ordering::Relaxed);
        let cdp_total = self.cdp_proxy_connections_total.load(Ordering::Relaxed);
        let dom_sync_active = self.dom_sync_clients_active.load(Ordering::Relaxed);
        let upstream_restarts = self.upstream_restarts_observed.load(Ordering::Relaxed);
        let finalizations = self.recorder_finalizations.load(Ordering::Relaxed);

        format!(
            "# HELP ghost_uptime_seconds Server uptime in seconds\n\
             # TYPE ghost_uptime_seconds gauge\n\
             ghost_uptime_seconds {uptime_secs}\n\
             \n\
             # HELP ghost_streamer_starts_total Total streamers started\n\
             # TYPE ghost_streamer_starts_total counter\n\
             ghost_streamer_starts_total {streamer_starts}\n\
             \n\
             # HELP ghost_streamer_stops_total Total streamers stopped\n\
             # TYPE ghost_streamer_stops_total counter\n\
             ghost_streamer_stops_total {streamer_stops}\n\
             \n\
             # HELP ghost_cdp_proxy_connections_active Currently connected CDP proxy clients\n\
             # TYPE ghost_cdp_proxy_connections_active gauge\n\
             ghost_cdp_proxy_connections_active {cdp_active}\n\
             \n\
             # HELP ghost_cdp_proxy_connections_total Total CDP proxy connections accepted\n\
             # TYPE ghost_cdp_proxy_connections_total counter\n\
             ghost_cdp_proxy_connections_total {cdp_total}\n\
             \n\
             # HELP ghost_dom_sync_clients_active Currently connected dom-sync clients\n\
             # TYPE ghost_dom_sync_clients_active gauge\n\
             ghost_dom_sync_clients_active {dom_sync_active}\n\
             \n\
             # HELP ghost_upstream_restarts_total Upstream DevTools restarts observed\n\
             # TYPE ghost_upstream_restarts_total counter\n\
             ghost_upstream_restarts_total {upstream_restarts}\n\
             \n\
             # HELP ghost_recorder_finalizations_total Completed recording finalizations\n\
             # TYPE ghost_recorder_finalizations_total counter\n\
             ghost_recorder_finalizations_total {finalizations}\n"
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_help_and_type_lines_per_series() {
        let metrics = Metrics::new();
        metrics.streamer_starts.fetch_add(3, Ordering::Relaxed);
        let body = metrics.render();
        assert!(body.contains("# HELP ghost_streamer_starts_total"));
        assert!(body.contains("# TYPE ghost_streamer_starts_total counter"));
        assert!(body.contains("ghost_streamer_starts_total 3"));
        assert!(body.contains("# TYPE ghost_uptime_seconds gauge"));
    }
}
