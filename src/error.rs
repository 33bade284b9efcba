//! Error types for minikv

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for minikv operations
pub type Result<T> = std::result::Result<T, MiniKvError>;

/// Custom error types for minikv
///
/// A missing key is never an error: store operations report it through
/// `Option`/`bool` results.
#[derive(Error, Debug)]
pub enum MiniKvError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Snapshot not found: {}", .0.display())]
    SnapshotNotFound(PathBuf),

    #[error("Malformed snapshot: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Cannot encode snapshot: {0}")]
    Encode(String),

    #[error("Protocol parse error: {0}")]
    Protocol(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Client error: {0}")]
    Client(String),
}

impl From<nom::Err<nom::error::Error<&str>>> for MiniKvError {
    fn from(err: nom::Err<nom::error::Error<&str>>) -> Self {
        MiniKvError::Protocol(format!("Parse error: {:?}", err))
    }
}
