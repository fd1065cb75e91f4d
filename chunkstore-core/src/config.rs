//! Chunker and sync settings, with JSON loading for sync configs

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::buffer::validate_chunk_size;
use crate::storage::RetryPolicy;
use crate::{ChunkStoreError, Result, DEFAULT_MAX_CHUNK_SIZE};

/// Parse a chunk size such as `1024`, `64K`, `100M` or `1G`.
///
/// Units are powers of 1024 and case-insensitive. The result must be a
/// multiple of 1 KiB.
pub fn parse_chunk_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = || {
        ChunkStoreError::InvalidConfiguration(format!(
            "invalid chunk size {:?}: expected digits with an optional K, M or G suffix",
            input
        ))
    };

    let (digits, multiplier) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_uppercase() {
                'K' => 1024,
                'M' => 1024 * 1024,
                'G' => 1024 * 1024 * 1024,
                _ => return Err(invalid()),
            };
            (&trimmed[..trimmed.len() - 1], multiplier)
        }
        _ => (trimmed, 1),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let size = digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(invalid)?;

    validate_chunk_size(size)?;
    Ok(size)
}

/// Settings for bulk chunking of a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Files larger than this are chunked
    pub max_chunk_size: u64,
    /// Skip files larger than `max_chunk_size` instead of chunking them
    pub ignore_large_files: bool,
    /// Record a digest per chunk in the manifest
    pub include_chunk_digests: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            ignore_large_files: false,
            include_chunk_digests: true,
        }
    }
}

impl ChunkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_chunk_size(mut self, size: u64) -> Self {
        self.max_chunk_size = size;
        self
    }

    pub fn with_ignore_large_files(mut self, ignore: bool) -> Self {
        self.ignore_large_files = ignore;
        self
    }

    pub fn with_chunk_digests(mut self, include: bool) -> Self {
        self.include_chunk_digests = include;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.max_chunk_size)
    }
}

/// Settings for the chunk-aware sync endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Files larger than this are stored as chunks
    pub max_chunk_size: u64,
    /// When off, every file is stored as a single object
    pub chunking_enabled: bool,
    /// Remove remote content when the local file disappears
    pub sync_deletes: bool,
    pub include_chunk_digests: bool,
    /// Size of the sync worker pool
    pub worker_threads: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            chunking_enabled: true,
            sync_deletes: false,
            include_chunk_digests: true,
            worker_threads: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let config: SyncConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_chunk_size(mut self, size: u64) -> Self {
        self.max_chunk_size = size;
        self
    }

    pub fn with_chunking(mut self, enabled: bool) -> Self {
        self.chunking_enabled = enabled;
        self
    }

    pub fn with_sync_deletes(mut self, enabled: bool) -> Self {
        self.sync_deletes = enabled;
        self
    }

    pub fn with_chunk_digests(mut self, include: bool) -> Self {
        self.include_chunk_digests = include;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.max_chunk_size)?;
        if self.worker_threads == 0 {
            return Err(ChunkStoreError::InvalidConfiguration(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
