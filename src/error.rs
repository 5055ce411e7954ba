//! WAL error types.

use thiserror::Error;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record corrupted at offset {offset}: CRC mismatch (expected {expected:#x}, got {actual:#x})")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("corruption at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("invalid record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("segment not found: {0}")]
    SegmentMissing(u64),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("metadata source error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("WAL is closed")]
    Closed,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WalError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalError::Io(_))
    }
}

/// Errors reported by a [`MetadataSource`](crate::metadata::MetadataSource).
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata service unavailable: {0}")]
    Unavailable(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),
}
