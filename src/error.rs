// ABOUTME: Typed error taxonomy for the guard core.
// ABOUTME: Policy violations are AccessResult values, not errors; only exceptional conditions land here.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the guard core.
///
/// Callers match on these to pick a recovery strategy: `LockBusy` is
/// retryable, `ConfigInvalid` is fatal, path errors always reject the
/// operation.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid policy config: {0}")]
    ConfigInvalid(String),

    #[error(
        "state lock at {} still held after {attempts} attempts; run `scopegate unlock` to inspect it",
        path.display()
    )]
    LockBusy { path: PathBuf, attempts: u32 },

    #[error(
        "lock at {} is owned by pid {pid} on {host}; pass --override-owner to remove it",
        path.display()
    )]
    LockOwnedByOther {
        path: PathBuf,
        pid: u32,
        host: String,
    },

    #[error("state corrupted ({code}): {message}")]
    StateCorrupted { code: &'static str, message: String },

    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GuardError>;
