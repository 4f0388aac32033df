//! relaykit daemon
//!
//! Serves the status page, installs the mesh node and the proxy, and keeps
//! them running until interrupted.

use clap::Parser;
use relaykit_common::{
    config::{ExtractMode, Transport},
    AgentConfig, ConfigOverrides, SupervisorStatus,
};
use relaykit_daemon::{start_children, Fetcher, Installer, Supervisor};
use relaykit_web::{bind_dual_stack, StatusServer, StatusServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "relaykitd")]
#[command(about = "relaykit daemon - installs and supervises a mesh node and a VLESS relay")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Work directory for binaries and generated config
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Directory holding index.html and bg.png
    #[arg(long)]
    site_dir: Option<PathBuf>,

    /// Archive extraction: external (unzip/tar) or builtin
    #[arg(long)]
    extract: Option<ExtractMode>,

    /// Status server port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Mesh virtual IP
    #[arg(long, env = "IP")]
    ip: Option<String>,

    /// Mesh peer URL
    #[arg(long, env = "PEER")]
    peer: Option<String>,

    /// Mesh network name
    #[arg(long, env = "NAME")]
    network_name: Option<String>,

    /// Mesh network secret
    #[arg(long, env = "SECRET", hide_env_values = true)]
    network_secret: Option<String>,

    /// VLESS user id
    #[arg(long, env = "VLESS_UUID")]
    uuid: Option<String>,

    /// VLESS listen port
    #[arg(long, env = "VLESS_PORT")]
    vless_port: Option<u16>,

    /// VLESS transport (tcp or ws)
    #[arg(long, env = "VLESS_TRANSPORT")]
    transport: Option<Transport>,

    /// WebSocket path for the ws transport
    #[arg(long, env = "VLESS_PATH")]
    vless_path: Option<String>,

    /// Slug of the share-link page
    #[arg(long, env = "SECRET_PATH", hide_env_values = true)]
    secret_path: Option<String>,

    /// EasyTier release archive
    #[arg(long, env = "EASYTIER_URL")]
    easytier_url: Option<String>,

    /// sing-box release archive
    #[arg(long, env = "SINGBOX_URL")]
    singbox_url: Option<String>,

    /// File name of the installed mesh binary
    #[arg(long, env = "MESH_BIN_NAME")]
    mesh_bin_name: Option<String>,

    /// File name of the installed proxy binary
    #[arg(long, env = "PROXY_BIN_NAME")]
    proxy_bin_name: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            web_port: self.port,
            work_dir: self.work_dir.clone(),
            site_dir: self.site_dir.clone(),
            secret_path: self.secret_path.clone(),
            mesh_ip: self.ip.clone(),
            mesh_peer: self.peer.clone(),
            network_name: self.network_name.clone(),
            network_secret: self.network_secret.clone(),
            proxy_uuid: self.uuid.clone(),
            proxy_port: self.vless_port,
            proxy_transport: self.transport,
            proxy_path: self.vless_path.clone(),
            mesh_url: self.easytier_url.clone(),
            proxy_url: self.singbox_url.clone(),
            mesh_bin_name: self.mesh_bin_name.clone(),
            proxy_bin_name: self.proxy_bin_name.clone(),
            extract: self.extract,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let (plain, json) = if cli.log_json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };
    tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(filter)
        .init();

    info!("relaykit daemon v{}", relaykit_common::VERSION);

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    config.apply(cli.overrides());
    config.resolve_paths(&std::env::current_dir()?);
    config.validate()?;
    let config = Arc::new(config);

    tokio::fs::create_dir_all(&config.work_dir).await?;

    let status = SupervisorStatus::new();
    let shutdown = CancellationToken::new();

    // Status server comes up before anything is installed
    let listener = bind_dual_stack(config.web_port).await?;
    let web = StatusServer::new(StatusServerConfig::from(config.as_ref()), status.clone());
    let web_handle = tokio::spawn(web.serve(listener));

    let supervisor = Arc::new(Supervisor::new(
        config.clone(),
        status.clone(),
        shutdown.child_token(),
    ));
    let installer = Installer::new(Fetcher::new()?, &config.work_dir, config.install.extract);

    let startup_handle = tokio::spawn({
        let config = config.clone();
        let supervisor = supervisor.clone();
        async move {
            match start_children(&config, &installer, &supervisor).await {
                Ok(()) => info!("Mesh node and proxy are running"),
                Err(e) => error!("Startup failed, children will not be started: {}", e),
            }
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = web_handle => {
            match result {
                Ok(Err(e)) => error!("Status server error: {}", e),
                Err(e) => error!("Status server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    shutdown.cancel();
    startup_handle.abort();
    // a poll already in flight finishes before the abort lands, and may spawn
    let _ = startup_handle.await;
    supervisor.shutdown().await;

    info!("Daemon shutdown complete");
    Ok(())
}
