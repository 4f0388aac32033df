//! Finding the real executable inside an unpacked release

use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Candidates must be strictly larger than this
pub const MIN_BINARY_SIZE: u64 = 1024 * 1024;

/// Depth-first search of `root` for a regular file whose name contains
/// `pattern`, is larger than [`MIN_BINARY_SIZE`] and does not end with
/// `exclude_suffix`. Entries are visited in file-name order.
pub fn locate(root: &Path, pattern: &str, exclude_suffix: Option<&str>) -> Option<PathBuf> {
    if !root.exists() {
        return None;
    }

    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| {
            let name = entry.file_name().to_string_lossy();
            if !name.contains(pattern) {
                return false;
            }
            if exclude_suffix.is_some_and(|suffix| name.ends_with(suffix)) {
                return false;
            }
            entry
                .metadata()
                .map(|meta| meta.len() > MIN_BINARY_SIZE)
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
}
