//! Release downloads
//!
//! Redirects are followed by hand so the partial file can be discarded
//! between hops and the chain length is bounded.

use relaykit_common::FetchError;
use reqwest::{header::LOCATION, StatusCode, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Longest redirect chain followed before giving up
pub const MAX_REDIRECTS: usize = 10;

enum Hop {
    Done(u64),
    Redirect(Url),
}

/// HTTP downloader
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    max_redirects: usize,
}

impl Fetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("relaykit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport {
                url: String::new(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            max_redirects: MAX_REDIRECTS,
        })
    }

    /// Download `url` into `dest`, returning `dest` once the file is closed
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf, FetchError> {
        let mut current = Url::parse(url).map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: format!("invalid url: {}", e),
        })?;

        for _ in 0..=self.max_redirects {
            match self.fetch_once(&current, dest).await? {
                Hop::Done(bytes) => {
                    info!("Downloaded {} ({} bytes) to {:?}", current, bytes, dest);
                    return Ok(dest.to_path_buf());
                }
                Hop::Redirect(next) => {
                    debug!("Redirect {} -> {}", current, next);
                    current = next;
                }
            }
        }

        Err(FetchError::TooManyRedirects {
            url: current.to_string(),
            limit: self.max_redirects,
        })
    }

    async fn fetch_once(&self, url: &Url, dest: &Path) -> Result<Hop, FetchError> {
        let mut file = fs::File::create(dest).await?;

        let mut resp = match self.client.get(url.clone()).send().await {
            Ok(resp) => resp,
            Err(e) => {
                drop(file);
                discard(dest).await;
                return Err(FetchError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                });
            }
        };

        let status = resp.status();
        if is_followed_redirect(status) {
            drop(file);
            discard(dest).await;
            let next = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|location| url.join(location).ok())
                .ok_or_else(|| FetchError::MissingLocation {
                    url: url.to_string(),
                })?;
            return Ok(Hop::Redirect(next));
        }

        if !status.is_success() {
            drop(file);
            discard(dest).await;
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut written = 0u64;
        let copied: Result<(), FetchError> = async {
            while let Some(chunk) = resp.chunk().await.map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = copied {
            discard(dest).await;
            return Err(e);
        }
        Ok(Hop::Done(written))
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Best-effort removal of a partial download
async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        debug!("Could not remove partial download {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path as UrlPath,
        http::{header, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::get,
        Router,
    };
    use tokio::net::TcpListener;

    const PAYLOAD: &[u8] = b"release archive bytes";

    async fn redirect_chain(UrlPath(n): UrlPath<u32>) -> impl IntoResponse {
        let next = if n == 0 {
            "/file".to_string()
        } else {
            format!("/r/{}", n - 1)
        };
        (AxumStatus::FOUND, [(header::LOCATION, next)])
    }

    async fn origin() -> String {
        let app = Router::new()
            .route("/file", get(|| async { PAYLOAD }))
            .route("/missing", get(|| async { AxumStatus::NOT_FOUND }))
            .route("/boom", get(|| async { AxumStatus::INTERNAL_SERVER_ERROR }))
            .route("/r/:n", get(redirect_chain))
            .route(
                "/moved",
                get(|| async { (AxumStatus::MOVED_PERMANENTLY, [(header::LOCATION, "file")]) }),
            )
            .route(
                "/loop",
                get(|| async { (AxumStatus::FOUND, [(header::LOCATION, "/loop")]) }),
            )
            .route("/nowhere", get(|| async { AxumStatus::FOUND }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://127.0.0.1:{}", port)
    }

    #[tokio::test]
    async fn test_fetch_ok() {
        let base = origin().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.zip");

        let got = Fetcher::new()
            .unwrap()
            .fetch(&format!("{}/file", base), &dest)
            .await
            .unwrap();
        assert_eq!(got, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), PAYLOAD);
    }

    #[tokio::test]
    async fn test_error_status_leaves_no_file() {
        let base = origin().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new().unwrap();

        for (path, code) in [("/missing", 404), ("/boom", 500)] {
            let dest = dir.path().join("a.zip");
            let err = fetcher
                .fetch(&format!("{}{}", base, path), &dest)
                .await
                .unwrap_err();
            assert!(
                matches!(err, FetchError::Status { status, .. } if status == code),
                "{:?}",
                err
            );
            assert!(!dest.exists());
        }
    }

    #[tokio::test]
    async fn test_redirect_chain_matches_direct_fetch() {
        let base = origin().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new().unwrap();

        let direct = dir.path().join("direct");
        fetcher.fetch(&format!("{}/file", base), &direct).await.unwrap();

        let chained = dir.path().join("chained");
        fetcher.fetch(&format!("{}/r/5", base), &chained).await.unwrap();
        assert_eq!(std::fs::read(&direct).unwrap(), std::fs::read(&chained).unwrap());

        let relative = dir.path().join("relative");
        fetcher.fetch(&format!("{}/moved", base), &relative).await.unwrap();
        assert_eq!(std::fs::read(&relative).unwrap(), PAYLOAD);
    }

    #[tokio::test]
    async fn test_redirect_limit() {
        let base = origin().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.zip");
        let fetcher = Fetcher::new().unwrap();

        // exactly at the limit still resolves
        fetcher
            .fetch(&format!("{}/r/{}", base, MAX_REDIRECTS - 1), &dest)
            .await
            .unwrap();

        let err = fetcher
            .fetch(&format!("{}/loop", base), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooManyRedirects { limit: MAX_REDIRECTS, .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_redirect_without_location() {
        let base = origin().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.zip");
        let err = Fetcher::new()
            .unwrap()
            .fetch(&format!("{}/nowhere", base), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MissingLocation { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.zip");
        let err = Fetcher::new()
            .unwrap()
            .fetch(&format!("http://127.0.0.1:{}/file", port), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }));
        assert!(!dest.exists());
    }
}
