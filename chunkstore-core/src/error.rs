//! Error types for chunkstore operations

use thiserror::Error;

/// Chunkstore error types
#[derive(Error, Debug)]
pub enum ChunkStoreError {
    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Chunk {chunk_id} not fully read ({bytes_read} of {declared} bytes)")]
    ChunkNotFullyRead {
        chunk_id: String,
        bytes_read: u64,
        declared: u64,
    },

    #[error("Source truncated in chunk {chunk_id}: expected {expected} bytes, got {actual}")]
    TruncatedSource {
        chunk_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Chunking incomplete: {consumed} of {total} source bytes consumed")]
    ChunksRemaining { consumed: u64, total: u64 },

    #[error("Checksum mismatch for {object_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        object_id: String,
        expected: String,
        actual: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("Reserved name: {0} looks like a chunk or manifest object")]
    ReservedName(String),
}

/// Result type for chunkstore operations
pub type Result<T> = std::result::Result<T, ChunkStoreError>;

impl ChunkStoreError {
    pub(crate) fn lock_poisoned() -> Self {
        ChunkStoreError::Io(std::io::Error::other("Lock poisoned"))
    }

    /// Whether a retry of the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ChunkStoreError::Transient(_))
    }

    /// Wrap this error so it can travel through `std::io::Read` implementations.
    pub(crate) fn into_io(self) -> std::io::Error {
        let kind = match &self {
            ChunkStoreError::TruncatedSource { .. } => std::io::ErrorKind::UnexpectedEof,
            ChunkStoreError::ChecksumMismatch { .. } => std::io::ErrorKind::InvalidData,
            ChunkStoreError::NotFound(_) => std::io::ErrorKind::NotFound,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, self)
    }
}

impl From<std::io::Error> for ChunkStoreError {
    fn from(e: std::io::Error) -> Self {
        // Errors raised inside our own Read impls come back out as themselves
        if !e.get_ref().is_some_and(|inner| inner.is::<ChunkStoreError>()) {
            return ChunkStoreError::Io(e);
        }
        let kind = e.kind();
        match e.into_inner().map(|inner| inner.downcast::<ChunkStoreError>()) {
            Some(Ok(err)) => *err,
            Some(Err(other)) => ChunkStoreError::Io(std::io::Error::new(kind, other)),
            None => ChunkStoreError::Io(kind.into()),
        }
    }
}

impl From<serde_json::Error> for ChunkStoreError {
    fn from(e: serde_json::Error) -> Self {
        ChunkStoreError::Serialization(e.to_string())
    }
}

impl From<globset::Error> for ChunkStoreError {
    fn from(e: globset::Error) -> Self {
        ChunkStoreError::Filter(e.to_string())
    }
}

impl From<walkdir::Error> for ChunkStoreError {
    fn from(e: walkdir::Error) -> Self {
        ChunkStoreError::Io(e.into())
    }
}
