pub mod cdp;
pub mod config;
pub mod domsync;
pub mod error;
pub mod extension_policy;
pub mod recorder;
pub mod streamer;
pub mod virtual_input;

pub use cdp::*;
pub use config::*;
pub use domsync::*;
pub use error::*;
pub use extension_policy::*;
pub use recorder::*;
pub use streamer::*;
pub use virtual_input::*;
