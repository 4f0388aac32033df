//! Agent configuration
//!
//! Built once at startup from defaults, an optional TOML file and
//! environment/CLI overrides, then passed by reference to every component.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Pinned EasyTier release
pub const DEFAULT_EASYTIER_URL: &str =
    "https://github.com/EasyTier/EasyTier/releases/download/v2.4.5/easytier-linux-x86_64-v2.4.5.zip";

/// Pinned sing-box release
pub const DEFAULT_SINGBOX_URL: &str =
    "https://github.com/SagerNet/sing-box/releases/download/v1.9.0/sing-box-1.9.0-linux-amd64.tar.gz";

/// File name of the generated proxy configuration inside the work directory
pub const PROXY_CONFIG_FILE: &str = "sb.json";

/// Paths the status server reserves for itself
const RESERVED_SLUGS: [&str; 2] = ["bg.png", "index.html"];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Status server port
    pub web_port: u16,

    /// Directory holding the installed binaries and generated config
    pub work_dir: PathBuf,

    /// Directory holding `index.html` and `bg.png`
    pub site_dir: PathBuf,

    /// Secret slug of the status page
    pub secret_path: String,

    /// Mesh node settings
    pub mesh: MeshConfig,

    /// Proxy settings
    pub proxy: ProxyConfig,

    /// Download and install settings
    pub install: InstallConfig,

    /// How to decide the mesh node is ready before starting the proxy
    pub readiness: ReadinessProbe,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            web_port: 7860,
            work_dir: PathBuf::from("sys_run"),
            site_dir: PathBuf::from("."),
            secret_path: "sub".to_string(),
            mesh: MeshConfig::default(),
            proxy: ProxyConfig::default(),
            install: InstallConfig::default(),
            readiness: ReadinessProbe::default(),
        }
    }
}

/// Mesh node (EasyTier) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Virtual IPv4 address of this node inside the mesh
    pub ip: String,

    /// Peer to connect to
    pub peer: String,

    pub network_name: String,

    pub network_secret: String,

    pub mtu: Option<u16>,

    /// Preferred protocol for peer connections
    pub default_protocol: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ip: "10.10.10.10".to_string(),
            peer: "wss://0.0.0.0:2053".to_string(),
            network_name: "default_name".to_string(),
            network_secret: "default_pass".to_string(),
            mtu: Some(1100),
            default_protocol: Some("tcp".to_string()),
        }
    }
}

/// Inbound transport of the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Tcp,
    Ws,
}

impl Default for Transport {
    fn default() -> Self {
        Self::Tcp
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Ws => write!(f, "ws"),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "ws" | "websocket" => Ok(Transport::Ws),
            other => Err(format!("unknown transport '{}' (expected tcp or ws)", other)),
        }
    }
}

/// Proxy (sing-box VLESS inbound) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub uuid: String,

    pub port: u16,

    pub transport: Transport,

    /// WebSocket path, only used with `Transport::Ws`
    pub ws_path: String,

    /// Inbound listen address
    pub listen: String,

    /// sing-box log level
    pub log_level: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            uuid: "00000000-0000-0000-0000-000000000000".to_string(),
            port: 4365,
            transport: Transport::Tcp,
            ws_path: "/vless".to_string(),
            listen: "0.0.0.0".to_string(),
            log_level: "debug".to_string(),
        }
    }
}

/// How archives are unpacked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMode {
    /// Shell out to `unzip` / `tar`
    External,
    /// Unpack in-process
    Builtin,
}

impl Default for ExtractMode {
    fn default() -> Self {
        Self::External
    }
}

impl FromStr for ExtractMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "external" => Ok(ExtractMode::External),
            "builtin" => Ok(ExtractMode::Builtin),
            other => Err(format!(
                "unknown extract mode '{}' (expected external or builtin)",
                other
            )),
        }
    }
}

/// Download and install settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub mesh_url: String,

    pub proxy_url: String,

    /// File name of the installed mesh binary
    pub mesh_bin_name: String,

    /// File name of the installed proxy binary
    pub proxy_bin_name: String,

    pub extract: ExtractMode,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            mesh_url: DEFAULT_EASYTIER_URL.to_string(),
            proxy_url: DEFAULT_SINGBOX_URL.to_string(),
            mesh_bin_name: "easytier-core".to_string(),
            proxy_bin_name: "sing-box".to_string(),
            extract: ExtractMode::External,
        }
    }
}

/// Readiness check for the mesh node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessProbe {
    /// Poll a TCP connect until it succeeds or the timeout expires
    Tcp { addr: String, timeout_secs: u64 },
    /// Wait a fixed time
    Delay { millis: u64 },
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        // easytier-core's RPC portal
        Self::Tcp {
            addr: "127.0.0.1:15888".to_string(),
            timeout_secs: 10,
        }
    }
}

impl ReadinessProbe {
    /// Upper bound of the wait
    pub fn budget(&self) -> Duration {
        match self {
            ReadinessProbe::Tcp { timeout_secs, .. } => Duration::from_secs(*timeout_secs),
            ReadinessProbe::Delay { millis } => Duration::from_millis(*millis),
        }
    }
}

/// Archive format of a release download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Extension used for the temporary download
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

/// One external binary to install
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Short name used for temp files and logs
    pub name: String,
    pub url: String,
    pub format: ArchiveFormat,
    /// Substring of the executable's file name inside the archive
    pub binary_pattern: String,
    /// Skip candidates ending with this suffix
    pub exclude_suffix: Option<String>,
    /// Final location of the executable
    pub install_path: PathBuf,
}

impl Dependency {
    /// Temporary download name inside the work directory
    pub fn archive_file_name(&self) -> String {
        format!("{}_temp.{}", self.name, self.format.extension())
    }

    /// Directory the archive is unpacked into before relocation
    pub fn staging_dir_name(&self) -> String {
        format!(".staging-{}", self.name)
    }
}

impl AgentConfig {
    /// Load configuration from file, falling back to defaults when it is missing
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment/CLI overrides on top of this configuration
    pub fn apply(&mut self, o: ConfigOverrides) {
        if let Some(v) = o.web_port {
            self.web_port = v;
        }
        if let Some(v) = o.work_dir {
            self.work_dir = v;
        }
        if let Some(v) = o.site_dir {
            self.site_dir = v;
        }
        if let Some(v) = o.secret_path {
            self.secret_path = v;
        }
        if let Some(v) = o.mesh_ip {
            self.mesh.ip = v;
        }
        if let Some(v) = o.mesh_peer {
            self.mesh.peer = v;
        }
        if let Some(v) = o.network_name {
            self.mesh.network_name = v;
        }
        if let Some(v) = o.network_secret {
            self.mesh.network_secret = v;
        }
        if let Some(v) = o.proxy_uuid {
            self.proxy.uuid = v;
        }
        if let Some(v) = o.proxy_port {
            self.proxy.port = v;
        }
        if let Some(v) = o.proxy_transport {
            self.proxy.transport = v;
        }
        if let Some(v) = o.proxy_path {
            self.proxy.ws_path = v;
        }
        if let Some(v) = o.mesh_url {
            self.install.mesh_url = v;
        }
        if let Some(v) = o.proxy_url {
            self.install.proxy_url = v;
        }
        if let Some(v) = o.mesh_bin_name {
            self.install.mesh_bin_name = v;
        }
        if let Some(v) = o.proxy_bin_name {
            self.install.proxy_bin_name = v;
        }
        if let Some(v) = o.extract {
            self.install.extract = v;
        }
    }

    /// Make relative directories absolute against `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.work_dir.is_relative() {
            self.work_dir = base.join(&self.work_dir);
        }
        if self.site_dir.is_relative() {
            self.site_dir = base.join(&self.site_dir);
        }
    }

    /// Reject settings that would produce a broken deployment
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.uuid.trim().is_empty() {
            return Err(ConfigError::Invalid("proxy uuid must not be empty".to_string()));
        }
        if uuid::Uuid::parse_str(&self.proxy.uuid).is_err() {
            // sing-box will refuse it, but the page and config are still generated
            warn!("proxy uuid '{}' is not a canonical UUID", self.proxy.uuid);
        }

        if self.proxy.port == 0 {
            return Err(ConfigError::Invalid("proxy port must not be 0".to_string()));
        }

        let slug = self.secret_path.as_str();
        if slug.is_empty() || slug.contains('/') || RESERVED_SLUGS.contains(&slug) {
            return Err(ConfigError::Invalid(format!(
                "secret path '{}' must be a non-empty single segment other than {:?}",
                slug, RESERVED_SLUGS
            )));
        }

        if self.proxy.transport == Transport::Ws && !self.proxy.ws_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "websocket path '{}' must start with '/'",
                self.proxy.ws_path
            )));
        }

        let deps = [self.mesh_dependency(), self.proxy_dependency()];
        for name in [&self.install.mesh_bin_name, &self.install.proxy_bin_name] {
            // leading dots also cover ".", ".." and the staging directories
            if name.is_empty() || name.contains('/') || name.starts_with('.') {
                return Err(ConfigError::Invalid(format!(
                    "install name '{}' must be a plain file name",
                    name
                )));
            }
            let scratch = deps.iter().any(|d| *name == d.archive_file_name());
            if name == PROXY_CONFIG_FILE || scratch {
                return Err(ConfigError::Invalid(format!(
                    "install name '{}' collides with a file relaykit writes",
                    name
                )));
            }
        }
        if self.install.mesh_bin_name == self.install.proxy_bin_name {
            return Err(ConfigError::Invalid(
                "mesh and proxy install names must differ".to_string(),
            ));
        }

        Ok(())
    }

    /// Installed mesh binary
    pub fn mesh_bin(&self) -> PathBuf {
        self.work_dir.join(&self.install.mesh_bin_name)
    }

    /// Installed proxy binary
    pub fn proxy_bin(&self) -> PathBuf {
        self.work_dir.join(&self.install.proxy_bin_name)
    }

    /// Generated proxy config
    pub fn proxy_config_path(&self) -> PathBuf {
        self.work_dir.join(PROXY_CONFIG_FILE)
    }

    /// The EasyTier release
    pub fn mesh_dependency(&self) -> Dependency {
        Dependency {
            name: "easytier".to_string(),
            url: self.install.mesh_url.clone(),
            format: ArchiveFormat::Zip,
            binary_pattern: "easytier-core".to_string(),
            exclude_suffix: None,
            install_path: self.mesh_bin(),
        }
    }

    /// The sing-box release
    pub fn proxy_dependency(&self) -> Dependency {
        Dependency {
            name: "singbox".to_string(),
            url: self.install.proxy_url.clone(),
            format: ArchiveFormat::TarGz,
            binary_pattern: "sing-box".to_string(),
            exclude_suffix: Some(".tar.gz".to_string()),
            install_path: self.proxy_bin(),
        }
    }
}

/// Optional overrides, typically sourced from environment variables and CLI flags
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub web_port: Option<u16>,
    pub work_dir: Option<PathBuf>,
    pub site_dir: Option<PathBuf>,
    pub secret_path: Option<String>,
    pub mesh_ip: Option<String>,
    pub mesh_peer: Option<String>,
    pub network_name: Option<String>,
    pub network_secret: Option<String>,
    pub proxy_uuid: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_transport: Option<Transport>,
    pub proxy_path: Option<String>,
    pub mesh_url: Option<String>,
    pub proxy_url: Option<String>,
    pub mesh_bin_name: Option<String>,
    pub proxy_bin_name: Option<String>,
    pub extract: Option<ExtractMode>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.web_port, 7860);
        assert_eq!(config.proxy.port, 4365);
        assert_eq!(config.secret_path, "sub");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaykit.toml");
        std::fs::write(
            &path,
            r#"
            secret_path = "hidden"

            [proxy]
            port = 8443
            transport = "ws"

            [readiness]
            kind = "delay"
            millis = 2000
            "#,
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.secret_path, "hidden");
        assert_eq!(config.proxy.port, 8443);
        assert_eq!(config.proxy.transport, Transport::Ws);
        assert_eq!(config.proxy.ws_path, "/vless");
        assert_eq!(config.mesh.ip, "10.10.10.10");
        assert_eq!(config.readiness, ReadinessProbe::Delay { millis: 2000 });
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = AgentConfig::load(Path::new("/nonexistent/relaykit.toml")).unwrap();
        assert_eq!(config.web_port, 7860);
    }

    #[test]
    fn test_overrides_win() {
        let mut config = AgentConfig::default();
        config.apply(ConfigOverrides {
            proxy_uuid: Some("abc-123".to_string()),
            proxy_port: Some(9999),
            secret_path: Some("mysub".to_string()),
            ..Default::default()
        });
        assert_eq!(config.proxy.uuid, "abc-123");
        assert_eq!(config.proxy.port, 9999);
        assert_eq!(config.secret_path, "mysub");
        assert_eq!(config.mesh.network_name, "default_name");
    }

    #[test]
    fn test_validate_rejects_bad_slugs() {
        for slug in ["", "a/b", "bg.png", "index.html"] {
            let config = AgentConfig {
                secret_path: slug.to_string(),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "slug {:?} accepted", slug);
        }
    }

    #[test]
    fn test_validate_rejects_colliding_install_names() {
        for name in ["sb.json", ".", "..", ".staging-easytier", "easytier_temp.zip", "singbox_temp.tar.gz"] {
            let mut config = AgentConfig::default();
            config.install.mesh_bin_name = name.to_string();
            assert!(config.validate().is_err(), "mesh name {:?} accepted", name);

            let mut config = AgentConfig::default();
            config.install.proxy_bin_name = name.to_string();
            assert!(config.validate().is_err(), "proxy name {:?} accepted", name);
        }

        let mut config = AgentConfig::default();
        config.install.mesh_bin_name = "php-fpm".to_string();
        config.install.proxy_bin_name = "nginx-worker".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_scratch_names() {
        let config = AgentConfig::default();
        assert_eq!(config.mesh_dependency().archive_file_name(), "easytier_temp.zip");
        assert_eq!(config.proxy_dependency().staging_dir_name(), ".staging-singbox");
    }

    #[test]
    fn test_validate_uuid() {
        let mut config = AgentConfig::default();
        config.proxy.uuid = "abc-123".to_string();
        config.validate().unwrap();

        config.proxy.uuid = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resolve_paths() {
        let mut config = AgentConfig::default();
        config.resolve_paths(Path::new("/srv/app"));
        assert_eq!(config.work_dir, PathBuf::from("/srv/app/sys_run"));
        assert_eq!(config.mesh_bin(), PathBuf::from("/srv/app/sys_run/easytier-core"));
        assert_eq!(config.proxy_config_path(), PathBuf::from("/srv/app/sys_run/sb.json"));
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("WS".parse::<Transport>().unwrap(), Transport::Ws);
        assert_eq!("builtin".parse::<ExtractMode>().unwrap(), ExtractMode::Builtin);
        assert!("quic".parse::<Transport>().is_err());
    }
}
