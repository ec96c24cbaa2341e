//! Thin re-export of the protocol crate's config types under `crate::config`, so
//! `server` modules can `use crate::config::...` without reaching into `ghost_protocol`
//! directly.

pub use ghost_protocol::{
    DisplayConfig, ExtensionPolicyConfig, GhostConfig, RecorderConfig, ScaleToZeroConfig,
    ServerConfig, StreamConfig, TimeoutsConfig, UpstreamConfig, VirtualInputConfig,
    load_config,
};
