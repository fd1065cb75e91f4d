//! In-process storage backend

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::RwLock;

use super::{ObjectListing, StorageBackend, WriteOptions};
use crate::checksum::compute_md5;
use crate::{ChunkStoreError, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    mimetype: String,
    properties: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct MemorySpace {
    /// Insertion order, used for listings
    order: Vec<String>,
    objects: HashMap<String, StoredObject>,
}

/// Spaces and objects held in memory. Listings follow insertion order.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    spaces: RwLock<HashMap<String, MemorySpace>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of an object, if present
    pub fn get(&self, space_id: &str, object_id: &str) -> Option<Vec<u8>> {
        let spaces = self.spaces.read().ok()?;
        spaces
            .get(space_id)?
            .objects
            .get(object_id)
            .map(|o| o.data.clone())
    }

    pub fn mimetype(&self, space_id: &str, object_id: &str) -> Option<String> {
        let spaces = self.spaces.read().ok()?;
        spaces
            .get(space_id)?
            .objects
            .get(object_id)
            .map(|o| o.mimetype.clone())
    }

    /// Number of objects in a space (0 for a missing space)
    pub fn object_count(&self, space_id: &str) -> usize {
        self.spaces
            .read()
            .ok()
            .and_then(|spaces| spaces.get(space_id).map(|s| s.objects.len()))
            .unwrap_or(0)
    }
}

impl StorageBackend for MemoryBackend {
    fn create_space(&self, space_id: &str) -> Result<()> {
        let mut spaces = self
            .spaces
            .write()
            .map_err(|_| ChunkStoreError::lock_poisoned())?;
        spaces.entry(space_id.to_string()).or_default();
        Ok(())
    }

    fn space_exists(&self, space_id: &str) -> Result<bool> {
        let spaces = self
            .spaces
            .read()
            .map_err(|_| ChunkStoreError::lock_poisoned())?;
        Ok(spaces.contains_key(space_id))
    }

    fn write(
        &self,
        space_id: &str,
        object_id: &str,
        stream: &mut dyn Read,
        byte_size: u64,
        options: &WriteOptions,
    ) -> Result<String> {
        if !self.space_exists(space_id)? {
            return Err(ChunkStoreError::NotFound(format!("space {}", space_id)));
        }

        // Read outside the lock; the stream may be slow
        let mut data = Vec::with_capacity(byte_size.min(64 * 1024 * 1024) as usize);
        stream.take(byte_size).read_to_end(&mut data)?;
        if (data.len() as u64) < byte_size {
            return Err(ChunkStoreError::TruncatedSource {
                chunk_id: object_id.to_string(),
                expected: byte_size,
                actual: data.len() as u64,
            });
        }

        let digest = compute_md5(&data);
        if let Some(expected) = &options.expected_digest {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(ChunkStoreError::ChecksumMismatch {
                    object_id: object_id.to_string(),
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }

        let mut spaces = self
            .spaces
            .write()
            .map_err(|_| ChunkStoreError::lock_poisoned())?;
        let space = spaces
            .get_mut(space_id)
            .ok_or_else(|| ChunkStoreError::NotFound(format!("space {}", space_id)))?;

        let object = StoredObject {
            data,
            mimetype: options.mimetype.clone(),
            properties: options.properties.clone(),
        };
        if space.objects.insert(object_id.to_string(), object).is_none() {
            space.order.push(object_id.to_string());
        }
        Ok(digest)
    }

    fn read(&self, space_id: &str, object_id: &str) -> Result<Box<dyn Read + Send>> {
        self.get(space_id, object_id)
            .map(|data| Box::new(Cursor::new(data)) as Box<dyn Read + Send>)
            .ok_or_else(|| ChunkStoreError::NotFound(format!("{}/{}", space_id, object_id)))
    }

    fn properties(&self, space_id: &str, object_id: &str) -> Result<HashMap<String, String>> {
        let spaces = self
            .spaces
            .read()
            .map_err(|_| ChunkStoreError::lock_poisoned())?;
        spaces
            .get(space_id)
            .and_then(|s| s.objects.get(object_id))
            .map(|o| o.properties.clone())
            .ok_or_else(|| ChunkStoreError::NotFound(format!("{}/{}", space_id, object_id)))
    }

    fn delete(&self, space_id: &str, object_id: &str) -> Result<()> {
        let mut spaces = self
            .spaces
            .write()
            .map_err(|_| ChunkStoreError::lock_poisoned())?;
        let space = spaces
            .get_mut(space_id)
            .ok_or_else(|| ChunkStoreError::NotFound(format!("space {}", space_id)))?;
        if space.objects.remove(object_id).is_none() {
            return Err(ChunkStoreError::NotFound(format!("{}/{}", space_id, object_id)));
        }
        space.order.retain(|id| id != object_id);
        Ok(())
    }

    fn list(&self, space_id: &str, prefix: Option<&str>) -> Result<ObjectListing<'_>> {
        let spaces = self
            .spaces
            .read()
            .map_err(|_| ChunkStoreError::lock_poisoned())?;
        let space = spaces
            .get(space_id)
            .ok_or_else(|| ChunkStoreError::NotFound(format!("space {}", space_id)))?;

        let ids: Vec<String> = space
            .order
            .iter()
            .filter(|id| prefix.map_or(true, |p| id.starts_with(p)))
            .cloned()
            .collect();
        Ok(Box::new(ids.into_iter().map(Ok)))
    }
}
