//! Archive extraction
//!
//! Either shells out to `unzip`/`tar` or unpacks in-process. Neither path
//! blocks the runtime: the tools run as async child processes and the
//! in-process unpacker runs on the blocking pool.

use flate2::read::GzDecoder;
use relaykit_common::{
    config::{ArchiveFormat, ExtractMode},
    ExtractError,
};
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info};

/// Unpack `archive` into `dest`
pub async fn extract(
    archive: &Path,
    format: ArchiveFormat,
    dest: &Path,
    mode: ExtractMode,
) -> Result<(), ExtractError> {
    info!("Extracting {:?} into {:?} ({:?})", archive, dest, mode);
    match mode {
        ExtractMode::External => extract_external(archive, format, dest).await,
        ExtractMode::Builtin => {
            let archive = archive.to_path_buf();
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || match format {
                ArchiveFormat::Zip => unpack_zip(&archive, &dest),
                ArchiveFormat::TarGz => unpack_tar_gz(&archive, &dest),
            })
            .await
            .map_err(|e| ExtractError::Join(e.to_string()))?
        }
    }
}

/// Command line for the external tool
pub fn external_command(archive: &Path, format: ArchiveFormat, dest: &Path) -> (&'static str, Vec<String>) {
    let archive = archive.to_string_lossy().to_string();
    let dest = dest.to_string_lossy().to_string();
    match format {
        ArchiveFormat::Zip => ("unzip", vec!["-o".to_string(), archive, "-d".to_string(), dest]),
        ArchiveFormat::TarGz => ("tar", vec!["-xzf".to_string(), archive, "-C".to_string(), dest]),
    }
}

async fn extract_external(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<(), ExtractError> {
    let (tool, args) = external_command(archive, format, dest);
    debug!("Running {} {}", tool, args.join(" "));

    let output = tokio::process::Command::new(tool)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ExtractError::Command {
            tool: tool.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ExtractError::ToolFailed {
            tool: tool.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn unpack_zip(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| ExtractError::Archive(format!("zip: {}", e)))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| ExtractError::Archive(format!("zip entry: {}", e)))?;

        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ExtractError::PathTraversal(entry.name().to_string()))?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}

fn unpack_tar_gz(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);

    for entry in tar.entries()? {
        let mut entry = entry?;
        let entry_path: PathBuf = entry.path()?.to_path_buf();

        if entry_path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(ExtractError::PathTraversal(entry_path.display().to_string()));
        }

        entry.unpack_in(dest)?;
    }
    Ok(())
}
