//! relaykit Common Library
//!
//! Configuration, errors, supervised-child state and the generated proxy
//! configuration shared by the daemon and the status server.

pub mod config;
pub mod error;
pub mod proxy_config;
pub mod status;

// Re-export commonly used types
pub use config::{AgentConfig, ConfigOverrides, Dependency};
pub use error::{
    ConfigError, ConfigWriteError, ExtractError, FetchError, InstallError, StartupError,
    SupervisorError,
};
pub use proxy_config::{share_link, write_proxy_config};
pub use status::{ChildRole, ChildState, Overall, StatusSnapshot, SupervisorStatus};

/// relaykit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
