use serde::{Deserialize, Serialize};

/// Top-level configuration for the ghost browser host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhostConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub scale_to_zero: ScaleToZeroConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub virtual_input: VirtualInputConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub extension_policy: ExtensionPolicyConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

impl GhostConfig {
    /// Collect human-readable validation issues instead of panicking on the first one.
    /// Issues prefixed "ERROR:" are fatal; the caller decides whether to exit.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be nonzero".to_string());
        }
        if self.display.width == 0 || self.display.height == 0 {
            issues.push("ERROR: display.width and display.height must be nonzero".to_string());
        }
        if self.stream.frame_rate == 0 {
            issues.push("ERROR: stream.frame_rate must be nonzero".to_string());
        }
        if self.recorder.fragment_duration_secs == 0 {
            issues.push("recorder.fragment_duration_secs is 0; fragments will be emitted continuously".to_string());
        }
        if self.extension_policy.policy_path.as_os_str().is_empty() {
            issues.push("ERROR: extension_policy.policy_path must be set".to_string());
        }

        issues
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to static files served for `/spec.yaml` and any bundled UI assets.
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// Body size limit for ordinary JSON control endpoints.
    #[serde(default = "default_body_limit")]
    pub request_body_limit_bytes: usize,
    /// Body size limit for the extension-upload multipart endpoint.
    #[serde(default = "default_upload_limit")]
    pub upload_body_limit_bytes: usize,
    /// Max WS frame size, both directions, for the CDP proxy and dom-sync channels.
    #[serde(default = "default_cdp_frame_bytes")]
    pub cdp_max_frame_bytes: usize,
    /// Regex-only CDP frame introspection logging; off by default (adds per-frame cost).
    #[serde(default)]
    pub cdp_introspection_enabled: bool,
    /// Upper bound on concurrent `/process/exec` invocations.
    #[serde(default = "default_process_exec_concurrency")]
    pub process_exec_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            web_root: default_web_root(),
            request_body_limit_bytes: default_body_limit(),
            upload_body_limit_bytes: default_upload_limit(),
            cdp_max_frame_bytes: default_cdp_frame_bytes(),
            cdp_introspection_enabled: false,
            process_exec_concurrency: default_process_exec_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_display_num")]
    pub display_num: u32,
    /// Shell command the container's process supervisor exposes to restart the
    /// browser (e.g. `supervisorctl restart chromium`). This process never launches
    /// or owns the Chromium process itself, only requests a restart of it.
    #[serde(default = "default_restart_command")]
    pub restart_command: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            display_num: default_display_num(),
            restart_command: default_restart_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Path to the browser's combined stdout/stderr log, tailed from byte 0.
    #[serde(default = "default_upstream_log")]
    pub log_path: String,
    /// Cap, in milliseconds, on the tail reader's exponential backoff.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            log_path: default_upstream_log(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleToZeroConfig {
    /// Control file toggled with `+`/`-`. Absence is a silent no-op.
    #[serde(default = "default_control_file")]
    pub control_file: String,
}

impl Default for ScaleToZeroConfig {
    fn default() -> Self {
        Self {
            control_file: default_control_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Path to the external transcoder binary (e.g. ffmpeg).
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Local port the embedded RTMP relay listens on for "internal" mode.
    #[serde(default = "default_internal_rtmp_port")]
    pub internal_rtmp_port: u16,
    /// Chunk size, in bytes, for the socket/MPEG-TS fan-out reader.
    #[serde(default = "default_socket_chunk_bytes")]
    pub socket_chunk_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: default_ffmpeg_bin(),
            frame_rate: default_frame_rate(),
            internal_rtmp_port: default_internal_rtmp_port(),
            socket_chunk_bytes: default_socket_chunk_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualInputConfig {
    #[serde(default = "default_video_device")]
    pub video_device: String,
    #[serde(default = "default_pulse_sink")]
    pub pulse_sink_name: String,
    #[serde(default = "default_pulse_source")]
    pub pulse_source_name: String,
    /// Path to the external transcoder binary used to ingest `stream` sources into the
    /// loopback device/sink and to synthesize the black-frame+silence paused source.
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,
}

impl Default for VirtualInputConfig {
    fn default() -> Self {
        Self {
            video_device: default_video_device(),
            pulse_sink_name: default_pulse_sink(),
            pulse_source_name: default_pulse_source(),
            ffmpeg_bin: default_ffmpeg_bin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default = "default_recordings_dir")]
    pub output_dir: String,
    #[serde(default = "default_fragment_duration")]
    pub fragment_duration_secs: u32,
    /// 0 = unlimited.
    #[serde(default)]
    pub size_ceiling_bytes: u64,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_duration_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: default_recordings_dir(),
            fragment_duration_secs: default_fragment_duration(),
            size_ceiling_bytes: 0,
            max_duration_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionPolicyConfig {
    #[serde(default = "default_policy_path")]
    pub policy_path: std::path::PathBuf,
    #[serde(default = "default_extensions_dir")]
    pub extensions_dir: std::path::PathBuf,
    /// Loopback HTTP port that rewritten `update.xml` codebase URLs point back at.
    #[serde(default = "default_port")]
    pub loopback_port: u16,
}

impl Default for ExtensionPolicyConfig {
    fn default() -> Self {
        Self {
            policy_path: default_policy_path(),
            extensions_dir: default_extensions_dir(),
            loopback_port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_dial_secs")]
    pub dial_secs: u64,
    #[serde(default = "default_cdp_round_trip_secs")]
    pub cdp_round_trip_secs: u64,
    #[serde(default = "default_stream_start_uptime_ms")]
    pub stream_start_uptime_ms: u64,
    #[serde(default = "default_shutdown_interrupt_secs")]
    pub shutdown_interrupt_secs: u64,
    #[serde(default = "default_shutdown_terminate_secs")]
    pub shutdown_terminate_secs: u64,
    #[serde(default = "default_shutdown_kill_ms")]
    pub shutdown_kill_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            dial_secs: default_dial_secs(),
            cdp_round_trip_secs: default_cdp_round_trip_secs(),
            stream_start_uptime_ms: default_stream_start_uptime_ms(),
            shutdown_interrupt_secs: default_shutdown_interrupt_secs(),
            shutdown_terminate_secs: default_shutdown_terminate_secs(),
            shutdown_kill_ms: default_shutdown_kill_ms(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_web_root() -> String {
    "/opt/ghost/web".to_string()
}
fn default_body_limit() -> usize {
    2 * 1024 * 1024
}
fn default_upload_limit() -> usize {
    100 * 1024 * 1024
}
fn default_cdp_frame_bytes() -> usize {
    100 * 1024 * 1024
}
fn default_process_exec_concurrency() -> usize {
    4
}
fn default_width() -> u32 {
    1024
}
fn default_height() -> u32 {
    768
}
fn default_display_num() -> u32 {
    0
}
fn default_restart_command() -> String {
    "supervisorctl restart chromium".to_string()
}
fn default_upstream_log() -> String {
    "/var/log/ghost/chromium.log".to_string()
}
fn default_backoff_cap_ms() -> u64 {
    2000
}
fn default_control_file() -> String {
    "/var/run/ghost/scale-to-zero".to_string()
}
fn default_ffmpeg_bin() -> String {
    "ffmpeg".to_string()
}
fn default_frame_rate() -> u32 {
    30
}
fn default_internal_rtmp_port() -> u16 {
    19350
}
fn default_socket_chunk_bytes() -> usize {
    32 * 1024
}
fn default_video_device() -> String {
    "/dev/video10".to_string()
}
fn default_pulse_sink() -> String {
    "ghost_virtual_sink".to_string()
}
fn default_pulse_source() -> String {
    "ghost_virtual_source".to_string()
}
fn default_recordings_dir() -> String {
    "/var/lib/ghost/recordings".to_string()
}
fn default_fragment_duration() -> u32 {
    2
}
fn default_policy_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/ghost/managed_policy.json")
}
fn default_extensions_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/ghost/extensions")
}
fn default_dial_secs() -> u64 {
    10
}
fn default_cdp_round_trip_secs() -> u64 {
    30
}
fn default_stream_start_uptime_ms() -> u64 {
    250
}
fn default_shutdown_interrupt_secs() -> u64 {
    60
}
fn default_shutdown_terminate_secs() -> u64 {
    2
}
fn default_shutdown_kill_ms() -> u64 {
    100
}

/// Load configuration from a TOML file, falling back to defaults if the file is absent.
pub fn load_config(path: &str) -> anyhow::Result<GhostConfig> {
    use anyhow::Context;

    match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config at {path}"))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path, "config file not found, using defaults");
            Ok(GhostConfig {
                server: ServerConfig::default(),
                display: DisplayConfig::default(),
                upstream: UpstreamConfig::default(),
                scale_to_zero: ScaleToZeroConfig::default(),
                stream: StreamConfig::default(),
                virtual_input: VirtualInputConfig::default(),
                recorder: RecorderConfig::default(),
                extension_policy: ExtensionPolicyConfig::default(),
                timeouts: TimeoutsConfig::default(),
            })
        }
        Err(e) => Err(e).with_context(|| format!("failed to read config at {path}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        let cfg = load_config("/nonexistent/path/ghost.toml").unwrap();
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut cfg = load_config("/nonexistent/path/ghost.toml").unwrap();
        cfg.server.port = 0;
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn parses_toml_overrides() {
        let toml_str = r#"
            [server]
            port = 9000

            [display]
            width = 1920
            height = 1080
        "#;
        let cfg: GhostConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.display.width, 1920);
        assert_eq!(cfg.display.height, 1080);
        // Unset sections still default.
        assert_eq!(cfg.stream.frame_rate, default_frame_rate());
    }
}
