//! Error types for chunk loading, caching and persistence.

use crate::types::ChunkId;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for chunkcull operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk content could not be resolved.
    #[error("load error: {0}")]
    Load(#[from] LoadError),

    /// Snapshot persistence failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A cache status listener failed.
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),
}

/// Errors surfaced by a chunk's content resolution.
///
/// Stored in the chunk state as `last_error`, hence `Clone` and `PartialEq`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Resolution did not settle within the configured timeout.
    #[error("chunk {chunk_id} timed out after {timeout:?}")]
    Timeout { chunk_id: ChunkId, timeout: Duration },

    /// The resolver returned an error.
    #[error("chunk {chunk_id} failed to load: {reason}")]
    Failure { chunk_id: ChunkId, reason: String },
}

impl LoadError {
    /// The chunk this error belongs to.
    pub fn chunk_id(&self) -> &str {
        match self {
            LoadError::Timeout { chunk_id, .. } | LoadError::Failure { chunk_id, .. } => chunk_id,
        }
    }

    /// Whether this error was produced by the timeout race.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LoadError::Timeout { .. })
    }
}

/// Snapshot read/write errors.
///
/// These never reach the owner of a chunk: the persistence adapter logs them
/// and degrades to an empty cache (read) or leaves memory untouched (write).
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The snapshot could not be read from storage.
    #[error("snapshot read failed: {0}")]
    Read(String),

    /// The snapshot is older than the cache duration.
    #[error("snapshot is stale: age {age_ms}ms, max {max_age_ms}ms")]
    Stale { age_ms: u64, max_age_ms: u64 },

    /// The snapshot could not be decoded, decompressed or parsed.
    #[error("snapshot corrupt: {0}")]
    Corrupt(String),

    /// The payload checksum did not match the stored one.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The snapshot could not be serialized or written.
    #[error("snapshot write failed: {0}")]
    Write(String),

    /// I/O error from a file-backed store.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Corrupt(e.to_string())
    }
}

impl From<base64::DecodeError> for PersistenceError {
    fn from(e: base64::DecodeError) -> Self {
        PersistenceError::Corrupt(format!("base64: {}", e))
    }
}

/// A cache status subscriber failed while handling an update.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// The listener returned an error.
    #[error("listener {id} failed: {reason}")]
    Failed { id: u64, reason: String },

    /// The listener panicked.
    #[error("listener {id} panicked: {reason}")]
    Panicked { id: u64, reason: String },
}

impl ListenerError {
    /// Build a failure from a listener's own error message.
    pub fn failed(reason: impl Into<String>) -> Self {
        ListenerError::Failed {
            id: 0,
            reason: reason.into(),
        }
    }

    pub(crate) fn with_id(self, id: u64) -> Self {
        match self {
            ListenerError::Failed { reason, .. } => ListenerError::Failed { id, reason },
            ListenerError::Panicked { reason, .. } => ListenerError::Panicked { id, reason },
        }
    }
}
