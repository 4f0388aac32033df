//! Error types for relaykit
//!
//! Each stage of the startup pipeline has its own error enum; `InstallError`
//! wraps the download and extraction failures so the orchestrator only has
//! to handle one type per dependency.

use std::path::PathBuf;
use thiserror::Error;

/// Download failures
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("download of {url} failed with HTTP status {status}")]
    Status { url: String, status: u16 },

    #[error("download of {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("gave up after {limit} redirects (last url: {url})")]
    TooManyRedirects { url: String, limit: usize },

    #[error("redirect from {url} has no usable Location header")]
    MissingLocation { url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Archive extraction failures
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to run {tool}: {source}")]
    Command {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {code:?}: {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Invalid archive: {0}")]
    Archive(String),

    #[error("Path traversal detected: {0}")]
    PathTraversal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("extraction worker failed: {0}")]
    Join(String),
}

/// Failures while installing one dependency
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("{dependency}: {source}")]
    Fetch {
        dependency: String,
        #[source]
        source: FetchError,
    },

    #[error("{dependency}: {source}")]
    Extract {
        dependency: String,
        #[source]
        source: ExtractError,
    },

    #[error("{dependency}: binary not found after extraction (looked for '{pattern}' in {dir})")]
    BinaryNotFound {
        dependency: String,
        pattern: String,
        dir: PathBuf,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure writing the generated proxy configuration
#[derive(Error, Debug)]
pub enum ConfigWriteError {
    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration loading and validation failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Child process supervision failures
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn {name} ({path}): {source}")]
    Spawn {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} exited with {code:?} before it became ready")]
    ExitedEarly { name: String, code: Option<i32> },

    #[error("launch cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigWriteError),
}

/// Failure of the install-then-launch sequence
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("installation failed: {0}")]
    Install(#[from] InstallError),

    #[error("launch failed: {0}")]
    Launch(#[from] SupervisorError),
}
