use std::path::PathBuf;
use thiserror::Error;

use crate::status::Errno;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FUSE error: {0}")]
    Fuse(String),

    #[error("Invalid mount arguments: {0}")]
    InvalidMount(String),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Filesystem operation failed: {0}")]
    Status(#[from] Errno),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json(err.to_string())
    }
}
