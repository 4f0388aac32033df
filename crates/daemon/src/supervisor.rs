//! Child process supervision
//!
//! Starts the mesh node, waits until it is ready, then starts the proxy.
//! Every child gets a watcher task that records its exit in the shared
//! [`SupervisorStatus`].

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use relaykit_common::{
    config::{AgentConfig, MeshConfig, ReadinessProbe, PROXY_CONFIG_FILE},
    write_proxy_config, ChildRole, ChildState, SupervisorError, SupervisorStatus,
};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);
const SPAWN_RETRIES: u32 = 5;

/// Arguments for easytier-core
pub fn mesh_args(mesh: &MeshConfig) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        mesh.ip.clone(),
        "--network-name".to_string(),
        mesh.network_name.clone(),
        "--network-secret".to_string(),
        mesh.network_secret.clone(),
        "-p".to_string(),
        mesh.peer.clone(),
        "--no-tun".to_string(),
    ];
    if let Some(mtu) = mesh.mtu {
        args.extend(["--mtu".to_string(), mtu.to_string()]);
    }
    if let Some(protocol) = &mesh.default_protocol {
        args.extend(["--default-protocol".to_string(), protocol.clone()]);
    }
    args
}

/// Arguments for sing-box, relative to the work directory
pub fn proxy_args() -> Vec<String> {
    vec!["run".to_string(), "-c".to_string(), PROXY_CONFIG_FILE.to_string()]
}

/// Owner of the two child processes
pub struct Supervisor {
    config: Arc<AgentConfig>,
    status: SupervisorStatus,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(config: Arc<AgentConfig>, status: SupervisorStatus, cancel: CancellationToken) -> Self {
        Self {
            config,
            status,
            cancel,
        }
    }

    pub fn status(&self) -> &SupervisorStatus {
        &self.status
    }

    /// Write the proxy config and start both children in order
    pub async fn launch(&self, mesh_bin: &Path, proxy_bin: &Path) -> Result<(), SupervisorError> {
        let config_path = write_proxy_config(&self.config.proxy, &self.config.work_dir)?;
        info!("Proxy config written to {:?}", config_path);

        let mesh_pid = self
            .spawn_child(ChildRole::Mesh, mesh_bin, &mesh_args(&self.config.mesh))
            .await?;
        info!("Mesh node started (pid {})", mesh_pid);

        self.wait_ready().await?;

        let proxy_pid = self
            .spawn_child(ChildRole::Proxy, proxy_bin, &proxy_args())
            .await?;
        info!("Proxy started (pid {})", proxy_pid);
        Ok(())
    }

    async fn spawn_child(
        &self,
        role: ChildRole,
        path: &Path,
        args: &[String],
    ) -> Result<u32, SupervisorError> {
        if self.cancel.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }
        debug!("Spawning {} {}", path.display(), args.join(" "));

        let mut attempt = 0;
        let mut child = loop {
            let spawned = Command::new(path)
                .args(args)
                .current_dir(&self.config.work_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn();
            match spawned {
                Ok(child) => break child,
                // a freshly installed binary can still be held open for writing
                Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) && attempt < SPAWN_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(source) => {
                    return Err(SupervisorError::Spawn {
                        name: role.to_string(),
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
        };

        let Some(pid) = child.id() else {
            let code = child.try_wait().ok().flatten().and_then(|s| s.code());
            self.status.set(role, ChildState::Exited { code });
            return Err(SupervisorError::ExitedEarly {
                name: role.to_string(),
                code,
            });
        };

        self.status.set(role, ChildState::Running { pid });
        tokio::spawn(watch_exit(role, child, self.status.clone()));
        Ok(pid)
    }

    /// Wait for the mesh node according to the configured probe
    async fn wait_ready(&self) -> Result<(), SupervisorError> {
        let probe = &self.config.readiness;
        let deadline = Instant::now() + probe.budget();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if let ChildState::Exited { code } = self.status.get(ChildRole::Mesh) {
                return Err(SupervisorError::ExitedEarly {
                    name: ChildRole::Mesh.to_string(),
                    code,
                });
            }

            let now = Instant::now();
            if let ReadinessProbe::Tcp { addr, .. } = probe {
                let remaining = deadline.saturating_duration_since(now).max(INITIAL_BACKOFF);
                let attempt = tokio::time::timeout(remaining, tokio::net::TcpStream::connect(addr.as_str()));
                if let Ok(Ok(_)) = attempt.await {
                    info!("Mesh node is accepting connections on {}", addr);
                    return Ok(());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                if let ReadinessProbe::Tcp { addr, .. } = probe {
                    warn!(
                        "Mesh node not reachable on {} after {:?}, starting proxy anyway",
                        addr,
                        probe.budget()
                    );
                }
                return Ok(());
            }

            let nap = backoff.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SupervisorError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
            if matches!(probe, ReadinessProbe::Tcp { .. }) {
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    /// SIGKILL every running child and wait briefly for the watchers to reap them
    pub async fn shutdown(&self) {
        for role in [ChildRole::Proxy, ChildRole::Mesh] {
            if let Some(pid) = self.status.get(role).pid() {
                info!("Killing {} (pid {})", role, pid);
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    warn!("Failed to kill {} (pid {}): {}", role, pid, e);
                }
            }
        }

        let deadline = Instant::now() + REAP_TIMEOUT;
        while Instant::now() < deadline {
            let snapshot = self.status.snapshot();
            if !snapshot.mesh.is_running() && !snapshot.proxy.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        warn!("Children still running after {:?}", REAP_TIMEOUT);
    }
}

async fn watch_exit(role: ChildRole, mut child: Child, status: SupervisorStatus) {
    match child.wait().await {
        Ok(exit) => {
            let code = exit.code();
            if exit.success() {
                info!("{} exited cleanly", role);
            } else {
                warn!("{} exited with {}", role, exit);
            }
            status.set(role, ChildState::Exited { code });
        }
        Err(e) => {
            error!("Failed to wait for {}: {}", role, e);
            status.set(role, ChildState::Exited { code: None });
        }
    }
}
