//! sing-box configuration and client share links

use crate::config::{ProxyConfig, Transport, PROXY_CONFIG_FILE};
use crate::error::ConfigWriteError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Serialize)]
struct SingBoxConfig<'a> {
    log: LogSection<'a>,
    inbounds: Vec<Inbound<'a>>,
    outbounds: Vec<Outbound>,
}

#[derive(Debug, Serialize)]
struct LogSection<'a> {
    output: &'static str,
    level: &'a str,
}

#[derive(Debug, Serialize)]
struct Inbound<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    tag: &'static str,
    listen: &'a str,
    listen_port: u16,
    users: Vec<User<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transport: Option<InboundTransport<'a>>,
}

#[derive(Debug, Serialize)]
struct User<'a> {
    uuid: &'a str,
}

#[derive(Debug, Serialize)]
struct InboundTransport<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct Outbound {
    #[serde(rename = "type")]
    kind: &'static str,
    tag: &'static str,
}

/// Render the proxy configuration document
pub fn render_proxy_config(proxy: &ProxyConfig) -> Result<String, ConfigWriteError> {
    let transport = match proxy.transport {
        Transport::Tcp => None,
        Transport::Ws => Some(InboundTransport {
            kind: "ws",
            path: &proxy.ws_path,
        }),
    };

    let doc = SingBoxConfig {
        log: LogSection {
            output: "stdout",
            level: &proxy.log_level,
        },
        inbounds: vec![Inbound {
            kind: "vless",
            tag: "in",
            listen: &proxy.listen,
            listen_port: proxy.port,
            users: vec![User { uuid: &proxy.uuid }],
            transport,
        }],
        outbounds: vec![Outbound {
            kind: "direct",
            tag: "out",
        }],
    };

    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Write the proxy configuration into `dir`, replacing any previous file
pub fn write_proxy_config(proxy: &ProxyConfig, dir: &Path) -> Result<PathBuf, ConfigWriteError> {
    let path = dir.join(PROXY_CONFIG_FILE);
    let content = render_proxy_config(proxy)?;
    std::fs::write(&path, content).map_err(|source| ConfigWriteError::Io {
        path: path.clone(),
        source,
    })?;
    debug!("Wrote proxy config to {:?}", path);
    Ok(path)
}

/// Client URI for the inbound, reached through the mesh address
pub fn share_link(proxy: &ProxyConfig, mesh_ip: &str) -> String {
    let transport = match proxy.transport {
        Transport::Tcp => "type=tcp&headerType=none".to_string(),
        Transport::Ws => format!("type=ws&path={}", urlencoding::encode(&proxy.ws_path)),
    };
    format!(
        "vless://{}@{}:{}?security=none&encryption=none&{}#{}",
        proxy.uuid, mesh_ip, proxy.port, transport, proxy.port
    )
}
