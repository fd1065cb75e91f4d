//! Storage backend contract
//!
//! Everything above this layer talks to object storage through
//! [`StorageBackend`]: write, read, delete and list objects inside a named
//! space. Calls block the calling thread; implementations must be shareable
//! across worker threads.

mod filesystem;
mod memory;
mod retry;

pub use filesystem::FilesystemBackend;
pub use memory::MemoryBackend;
pub use retry::{RetryPolicy, RetryingBackend};

use std::collections::HashMap;
use std::io::Read;

use crate::Result;

/// Lazily produced object ids, in the backend's native order
pub type ObjectListing<'a> = Box<dyn Iterator<Item = Result<String>> + Send + 'a>;

/// Default mimetype for content whose type is unknown
pub const DEFAULT_MIMETYPE: &str = "application/octet-stream";

/// Per-write metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    pub mimetype: String,
    /// When set, the write fails with `ChecksumMismatch` unless the stored
    /// bytes hash to this hex MD5
    pub expected_digest: Option<String>,
    pub properties: HashMap<String, String>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            mimetype: DEFAULT_MIMETYPE.to_string(),
            expected_digest: None,
            properties: HashMap::new(),
        }
    }
}

impl WriteOptions {
    pub fn new(mimetype: impl Into<String>) -> Self {
        Self {
            mimetype: mimetype.into(),
            ..Self::default()
        }
    }

    pub fn with_expected_digest(mut self, digest: Option<String>) -> Self {
        self.expected_digest = digest;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Object storage as consumed by the chunker and the sync endpoint
pub trait StorageBackend: Send + Sync {
    /// Create a space; succeeds if it already exists
    fn create_space(&self, space_id: &str) -> Result<()>;

    fn space_exists(&self, space_id: &str) -> Result<bool>;

    /// Store `byte_size` bytes from `stream` under `object_id`, replacing any
    /// existing object. Returns the hex MD5 of the stored bytes.
    ///
    /// Fails with `NotFound` if the space does not exist, `TruncatedSource`
    /// if the stream ends early and `ChecksumMismatch` if
    /// `options.expected_digest` disagrees with the stored bytes.
    fn write(
        &self,
        space_id: &str,
        object_id: &str,
        stream: &mut dyn Read,
        byte_size: u64,
        options: &WriteOptions,
    ) -> Result<String>;

    /// Open an object for reading. Fails with `NotFound`.
    fn read(&self, space_id: &str, object_id: &str) -> Result<Box<dyn Read + Send>>;

    /// Properties stored alongside an object. Fails with `NotFound`.
    fn properties(&self, space_id: &str, object_id: &str) -> Result<HashMap<String, String>>;

    /// Remove an object. Fails with `NotFound` if absent.
    fn delete(&self, space_id: &str, object_id: &str) -> Result<()>;

    /// Object ids in the space, optionally restricted to those starting with
    /// `prefix`. Not guaranteed to be alphabetic.
    fn list(&self, space_id: &str, prefix: Option<&str>) -> Result<ObjectListing<'_>>;
}

impl<B: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<B> {
    fn create_space(&self, space_id: &str) -> Result<()> {
        (**self).create_space(space_id)
    }

    fn space_exists(&self, space_id: &str) -> Result<bool> {
        (**self).space_exists(space_id)
    }

    fn write(
        &self,
        space_id: &str,
        object_id: &str,
        stream: &mut dyn Read,
        byte_size: u64,
        options: &WriteOptions,
    ) -> Result<String> {
        (**self).write(space_id, object_id, stream, byte_size, options)
    }

    fn read(&self, space_id: &str, object_id: &str) -> Result<Box<dyn Read + Send>> {
        (**self).read(space_id, object_id)
    }

    fn properties(&self, space_id: &str, object_id: &str) -> Result<HashMap<String, String>> {
        (**self).properties(space_id, object_id)
    }

    fn delete(&self, space_id: &str, object_id: &str) -> Result<()> {
        (**self).delete(space_id, object_id)
    }

    fn list(&self, space_id: &str, prefix: Option<&str>) -> Result<ObjectListing<'_>> {
        (**self).list(space_id, prefix)
    }
}

/// Collect a full listing, stopping at the first error
pub fn list_all(
    backend: &dyn StorageBackend,
    space_id: &str,
    prefix: Option<&str>,
) -> Result<Vec<String>> {
    backend.list(space_id, prefix)?.collect()
}
