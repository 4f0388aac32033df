//! Status server
//!
//! Four fixed routes: the secret share-link page, `/bg.png`, the index
//! (`/` and `/index.html`) and a 404 for everything else.

use crate::static_files::SiteFiles;
use axum::{
    extract::State,
    http::{header, Method, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use relaykit_common::{
    config::{AgentConfig, ProxyConfig},
    share_link, SupervisorStatus,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Settings the status server needs from the agent configuration
#[derive(Debug, Clone)]
pub struct StatusServerConfig {
    pub secret_path: String,
    pub site_dir: PathBuf,
    pub mesh_ip: String,
    pub proxy: ProxyConfig,
}

impl From<&AgentConfig> for StatusServerConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            secret_path: config.secret_path.clone(),
            site_dir: config.site_dir.clone(),
            mesh_ip: config.mesh.ip.clone(),
            proxy: config.proxy.clone(),
        }
    }
}

struct ServerState {
    secret_route: String,
    share_page: String,
    site: SiteFiles,
    status: SupervisorStatus,
}

/// Status web server
#[derive(Clone)]
pub struct StatusServer {
    state: Arc<ServerState>,
}

impl StatusServer {
    pub fn new(cfg: StatusServerConfig, status: SupervisorStatus) -> Self {
        let link = share_link(&cfg.proxy, &cfg.mesh_ip);
        Self {
            state: Arc::new(ServerState {
                secret_route: format!("/{}", cfg.secret_path),
                share_page: render_share_page(&link, &cfg.proxy.transport.to_string()),
                site: SiteFiles::new(cfg.site_dir),
                status,
            }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index_handler).fallback(not_found))
            .route("/index.html", get(index_handler).fallback(not_found))
            .route("/bg.png", get(background_handler).fallback(not_found))
            .fallback(secret_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on an already bound listener until the task is dropped
    pub async fn serve(self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        info!("Status server listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Bind `[::]:port` accepting IPv4 too, falling back to `0.0.0.0:port`
pub async fn bind_dual_stack(port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    match bind_v6_any(port) {
        Ok(listener) => Ok(tokio::net::TcpListener::from_std(listener)?),
        Err(e) => {
            warn!("IPv6 bind failed ({}), falling back to IPv4 only", e);
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            Ok(tokio::net::TcpListener::bind(addr).await?)
        }
    }
}

fn bind_v6_any(port: u16) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

// ============================================================================
// Handlers
// ============================================================================

async fn index_handler(State(state): State<Arc<ServerState>>) -> Response {
    if let Some(resp) = state.site.serve("index.html").await {
        return resp;
    }
    let overall = state.status.snapshot().overall();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        overall.to_string(),
    )
        .into_response()
}

async fn background_handler(State(state): State<Arc<ServerState>>) -> Response {
    match state.site.serve("bg.png").await {
        Some(resp) => resp,
        None => (StatusCode::NOT_FOUND, "Image Not Found").into_response(),
    }
}

async fn secret_handler(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
) -> Response {
    let is_get = method == Method::GET || method == Method::HEAD;
    if is_get && uri.path() == state.secret_route {
        return Html(state.share_page.clone()).into_response();
    }
    not_found().await
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404").into_response()
}

fn render_share_page(link: &str, transport: &str) -> String {
    let link = escape_html(link);
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Status</title></head>
<body>
<h3>System Online ({transport} mode)</h3>
<p>Connect through the mesh address with this link:</p>
<textarea style="width:100%;height:100px;" readonly>{link}</textarea>
</body>
</html>
"#
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
