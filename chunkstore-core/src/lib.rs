//! Chunkstore - chunked storage of large files in object stores
//!
//! Files larger than a configured size are split into fixed-size chunks, each
//! stored as its own object, plus a manifest describing how to put them back
//! together. Small files are stored whole. Listings, sync and restore hide the
//! difference from the user.

pub mod buffer;
pub mod checksum;
pub mod chunker;
pub mod config;
pub mod error;
pub mod file_chunker;
pub mod filter;
pub mod listing;
pub mod manifest;
pub mod naming;
pub mod report;
pub mod restore;
pub mod storage;
pub mod sync;
pub mod upload;

pub use buffer::{compute_buffer_size, validate_chunk_size};
pub use checksum::{compute_md5, read_checksum_list, ChecksumReader};
pub use chunker::{ChunkReader, ChunkStreamState, ChunkableContent};
pub use config::{parse_chunk_size, ChunkerConfig, SyncConfig};
pub use error::{ChunkStoreError, Result};
pub use file_chunker::FileChunker;
pub use filter::FileFilter;
pub use listing::{list_content, ContentListing, StoredArtifacts};
pub use manifest::{ChunkEntry, ChunkManifest, ManifestBuilder};
pub use naming::{chunk_id, classify, manifest_id, ObjectKind};
pub use report::{ChunkReport, ReportEntry, ReportState};
pub use restore::{restore_content, ChunkedContentReader};
pub use storage::{
    FilesystemBackend, MemoryBackend, RetryPolicy, RetryingBackend, StorageBackend, WriteOptions,
};
pub use sync::{ChunkingSyncEndpoint, ContentLocks, SyncOutcome, SyncRequest, SyncWorkerPool};
pub use upload::ContentWriter;

/// Chunkstore version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound for the read buffer used while chunking (in bytes)
pub const MAX_BUFFER_SIZE: usize = 8 * 1024; // 8 KB

/// Default chunk size (in bytes)
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 1024 * 1024 * 1024; // 1 GB

/// Known file extensions and the mimetype stored with them
pub const MIMETYPES: &[(&str, &str)] = &[
    // Text
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("xml", "text/xml"),
    ("md", "text/markdown"),
    ("json", "application/json"),
    // Documents
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("iso", "application/x-iso9660-image"),
    // Images
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    // Audio / video
    ("mp3", "audio/mpeg"),
    ("wav", "audio/x-wav"),
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("mkv", "video/x-matroska"),
];

/// Mimetype for a file extension, `application/octet-stream` if unknown
pub fn mimetype_for_extension(ext: &str) -> &'static str {
    let ext = ext.to_lowercase();
    MIMETYPES
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mimetype)| *mimetype)
        .unwrap_or(storage::DEFAULT_MIMETYPE)
}

/// Mimetype for a path, judged by its extension
pub fn mimetype_for_path(path: &std::path::Path) -> &'static str {
    path.extension()
        .map(|ext| mimetype_for_extension(&ext.to_string_lossy()))
        .unwrap_or(storage::DEFAULT_MIMETYPE)
}
