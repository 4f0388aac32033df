//! Dependency installation
//!
//! download -> extract into a staging directory -> locate the executable ->
//! move it to its install path -> chmod -> clean up. A dependency whose
//! install path already exists is left alone.

use crate::extract::extract;
use crate::fetch::Fetcher;
use crate::locate::locate;
use relaykit_common::{config::ExtractMode, Dependency, InstallError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Result of [`Installer::ensure_installed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyPresent,
    Installed,
}

/// Installs release binaries into the work directory
pub struct Installer {
    fetcher: Fetcher,
    work_dir: PathBuf,
    extract_mode: ExtractMode,
}

impl Installer {
    pub fn new(fetcher: Fetcher, work_dir: impl Into<PathBuf>, extract_mode: ExtractMode) -> Self {
        Self {
            fetcher,
            work_dir: work_dir.into(),
            extract_mode,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Install each dependency in order, stopping at the first failure
    pub async fn install_all(&self, deps: &[Dependency]) -> Result<(), InstallError> {
        for dep in deps {
            self.ensure_installed(dep).await?;
        }
        Ok(())
    }

    /// Install `dep` unless its install path already exists
    pub async fn ensure_installed(&self, dep: &Dependency) -> Result<InstallOutcome, InstallError> {
        if fs::try_exists(&dep.install_path).await? {
            debug!("{} already installed at {:?}", dep.name, dep.install_path);
            return Ok(InstallOutcome::AlreadyPresent);
        }

        fs::create_dir_all(&self.work_dir).await?;

        let archive = self.work_dir.join(dep.archive_file_name());
        info!("Downloading {} from {}", dep.name, dep.url);
        self.fetcher
            .fetch(&dep.url, &archive)
            .await
            .map_err(|source| InstallError::Fetch {
                dependency: dep.name.clone(),
                source,
            })?;

        let staging = self.work_dir.join(dep.staging_dir_name());
        let placed = self.unpack_and_place(dep, &archive, &staging).await;

        // scratch files go whether or not the binary made it out
        if let Err(e) = fs::remove_file(&archive).await {
            warn!("Could not remove {:?}: {}", archive, e);
        }
        if fs::try_exists(&staging).await.unwrap_or(false) {
            if let Err(e) = fs::remove_dir_all(&staging).await {
                warn!("Could not remove {:?}: {}", staging, e);
            }
        }

        placed?;
        info!("Installed {} at {:?}", dep.name, dep.install_path);
        Ok(InstallOutcome::Installed)
    }

    async fn unpack_and_place(
        &self,
        dep: &Dependency,
        archive: &Path,
        staging: &Path,
    ) -> Result<(), InstallError> {
        if fs::try_exists(staging).await? {
            fs::remove_dir_all(staging).await?;
        }
        fs::create_dir_all(staging).await?;

        extract(archive, dep.format, staging, self.extract_mode)
            .await
            .map_err(|source| InstallError::Extract {
                dependency: dep.name.clone(),
                source,
            })?;

        let found = {
            let root = staging.to_path_buf();
            let pattern = dep.binary_pattern.clone();
            let exclude = dep.exclude_suffix.clone();
            tokio::task::spawn_blocking(move || locate(&root, &pattern, exclude.as_deref()))
                .await
                .map_err(|e| InstallError::Io(std::io::Error::other(e)))?
        };

        let Some(found) = found else {
            return Err(InstallError::BinaryNotFound {
                dependency: dep.name.clone(),
                pattern: dep.binary_pattern.clone(),
                dir: staging.to_path_buf(),
            });
        };

        debug!("Found {} executable at {:?}", dep.name, found);
        fs::rename(&found, &dep.install_path).await?;
        make_executable(&dep.install_path).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locate::MIN_BINARY_SIZE;
    use axum::{extract::State, routing::get, Router};
    use relaykit_common::config::ArchiveFormat;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn zip_with(name: &str, len: usize) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        zip.start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(&vec![0u8; len]).unwrap();
        zip.finish().unwrap().into_inner()
    }

    /// Serves `archive` at /archive and counts requests
    async fn origin(archive: Vec<u8>) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let body = Arc::new(archive);
        let app = Router::new()
            .route(
                "/archive",
                get(
                    |State((hits, body)): State<(Arc<AtomicUsize>, Arc<Vec<u8>>)>| async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        body.as_ref().clone()
                    },
                ),
            )
            .with_state((hits.clone(), body));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://127.0.0.1:{}/archive", port), hits)
    }

    fn dependency(url: String, work_dir: &Path) -> Dependency {
        Dependency {
            name: "mytool".to_string(),
            url,
            format: ArchiveFormat::Zip,
            binary_pattern: "mytool".to_string(),
            exclude_suffix: None,
            install_path: work_dir.join("renamed-tool"),
        }
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let archive = zip_with("mytool-v2/mytool", MIN_BINARY_SIZE as usize + 16);
        let (url, hits) = origin(archive).await;
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(Fetcher::new().unwrap(), dir.path(), ExtractMode::Builtin);
        let dep = dependency(url, dir.path());

        assert_eq!(
            installer.ensure_installed(&dep).await.unwrap(),
            InstallOutcome::Installed
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dep.install_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        assert!(!dir.path().join("mytool_temp.zip").exists());
        assert!(!dir.path().join(".staging-mytool").exists());

        assert_eq!(
            installer.ensure_installed(&dep).await.unwrap(),
            InstallOutcome::AlreadyPresent
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_binary_not_found() {
        // too small to count as the real executable
        let archive = zip_with("mytool", 1024);
        let (url, _) = origin(archive).await;
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(Fetcher::new().unwrap(), dir.path(), ExtractMode::Builtin);
        let dep = dependency(url, dir.path());

        let err = installer.ensure_installed(&dep).await.unwrap_err();
        assert!(matches!(err, InstallError::BinaryNotFound { .. }));
        assert!(!dep.install_path.exists());
        assert!(!dir.path().join("mytool_temp.zip").exists());
        assert!(!dir.path().join(".staging-mytool").exists());
    }

    #[tokio::test]
    async fn test_extract_failure_cleans_up() {
        let (url, _) = origin(b"not a zip".to_vec()).await;
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(Fetcher::new().unwrap(), dir.path(), ExtractMode::Builtin);
        let dep = dependency(url, dir.path());

        let err = installer.ensure_installed(&dep).await.unwrap_err();
        assert!(matches!(err, InstallError::Extract { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    fn tar_gz_with(name: &str, len: usize) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::fast(),
        ));
        let data = vec![0u8; len];
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_slice()).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_with_external_tar() {
        if std::process::Command::new("tar").arg("--version").output().is_err() {
            eprintln!("tar not installed, skipping");
            return;
        }
        let archive = tar_gz_with(
            "sing-box-1.9.0-linux-amd64/sing-box",
            MIN_BINARY_SIZE as usize + 16,
        );
        let (url, hits) = origin(archive).await;
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(Fetcher::new().unwrap(), dir.path(), ExtractMode::External);
        let dep = Dependency {
            name: "singbox".to_string(),
            url,
            format: ArchiveFormat::TarGz,
            binary_pattern: "sing-box".to_string(),
            exclude_suffix: Some(".tar.gz".to_string()),
            install_path: dir.path().join("sing-box"),
        };

        assert_eq!(
            installer.ensure_installed(&dep).await.unwrap(),
            InstallOutcome::Installed
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&dep.install_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, ["sing-box"]);
    }

    #[tokio::test]
    async fn test_download_failure_aborts_sequence() {
        let (url, _) = origin(Vec::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(Fetcher::new().unwrap(), dir.path(), ExtractMode::Builtin);

        let broken = dependency(url.replace("/archive", "/missing"), dir.path());
        let mut second = dependency(url, dir.path());
        second.install_path = dir.path().join("second");

        let err = installer.install_all(&[broken, second.clone()]).await.unwrap_err();
        assert!(matches!(err, InstallError::Fetch { .. }));
        assert!(!second.install_path.exists());
    }
}
