use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

use crate::types::SpaceId;

/// Failure categories surfaced to callers of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EmbeddingUnavailable,
    SpaceNotIndexed,
    IndexSchemaMismatch,
    StorageIO,
    Timeout,
    InvalidConfig,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Space {0} has not been indexed")]
    SpaceNotIndexed(SpaceId),

    #[error("Index schema mismatch: {0}")]
    IndexSchemaMismatch(String),

    #[error("Storage I/O failed: {0}")]
    StorageIO(String),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EmbeddingUnavailable(_) => ErrorKind::EmbeddingUnavailable,
            Error::SpaceNotIndexed(_) => ErrorKind::SpaceNotIndexed,
            Error::IndexSchemaMismatch(_) => ErrorKind::IndexSchemaMismatch,
            Error::StorageIO(_) => ErrorKind::StorageIO,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Whether the caller can reasonably retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::StorageIO | ErrorKind::Timeout | ErrorKind::EmbeddingUnavailable)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageIO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::StorageIO(format!("manifest encoding: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attach context to errors coming out of storage backends (tantivy, lancedb,
/// arrow) that the core cannot implement `From` for.
pub trait ResultExt<T> {
    fn storage(self, context: &str) -> Result<T>;
    fn embedding(self, context: &str) -> Result<T>;
}

impl<T, E: Display> ResultExt<T> for std::result::Result<T, E> {
    fn storage(self, context: &str) -> Result<T> {
        self.map_err(|e| Error::StorageIO(format!("{context}: {e}")))
    }

    fn embedding(self, context: &str) -> Result<T> {
        self.map_err(|e| Error::EmbeddingUnavailable(format!("{context}: {e}")))
    }
}
