//! relaykit daemon library
//!
//! Installs the mesh node and the proxy into the work directory and
//! supervises them once both are present.

pub mod extract;
pub mod fetch;
pub mod installer;
pub mod locate;
pub mod supervisor;

use relaykit_common::{AgentConfig, StartupError};

pub use fetch::Fetcher;
pub use installer::{InstallOutcome, Installer};
pub use supervisor::Supervisor;

/// Install both binaries (mesh first), then launch them
pub async fn start_children(
    config: &AgentConfig,
    installer: &Installer,
    supervisor: &Supervisor,
) -> Result<(), StartupError> {
    installer
        .install_all(&[config.mesh_dependency(), config.proxy_dependency()])
        .await?;
    supervisor
        .launch(&config.mesh_bin(), &config.proxy_bin())
        .await?;
    Ok(())
}
