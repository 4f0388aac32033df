//! Static file serving from the site directory

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::path::PathBuf;
use tokio_util::io::ReaderStream;
use tracing::warn;

/// Files served from a local directory
#[derive(Debug, Clone)]
pub struct SiteFiles {
    dir: PathBuf,
}

impl SiteFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Stream `name` from the site directory, or `None` if it cannot be opened
    pub async fn serve(&self, name: &str) -> Option<Response> {
        let path = self.dir.join(name);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Cannot open {:?}: {}", path, e);
                return None;
            }
        };

        // Directories open fine on unix but fail on first read
        match file.metadata().await {
            Ok(meta) if meta.is_file() => {}
            _ => return None,
        }

        let body = Body::from_stream(ReaderStream::new(file));
        Some(
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, guess_content_type(name))],
                body,
            )
                .into_response(),
        )
    }
}

fn guess_content_type(path: &str) -> &'static str {
    if path.ends_with(".html") {
        "text/html; charset=utf-8"
    } else if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".css") {
        "text/css"
    } else if path.ends_with(".js") {
        "application/javascript"
    } else {
        "application/octet-stream"
    }
}
