//! Chunk manifest - the reassembly record of a chunked content item
//!
//! A manifest is built incrementally by [`ManifestBuilder`] while chunks are
//! read, then frozen into an immutable [`ChunkManifest`] once the whole-source
//! digest is known. Only frozen manifests are ever serialized.
//!
//! Serialized form (`application/json`):
//!
//! ```text
//! {
//!   "format_version": "1",
//!   "header": { "source_content_id", "source_mimetype",
//!               "source_byte_size", "source_digest" },
//!   "chunks": [ { "index", "chunk_id", "digest"?, "byte_size" }, ... ]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::naming::{self, ObjectKind};
use crate::{ChunkStoreError, Result};

/// Manifest wire-format version
pub const MANIFEST_FORMAT_VERSION: &str = "1";

/// Mimetype under which manifests are stored
pub const MANIFEST_MIMETYPE: &str = "application/json";

/// One chunk of the source, in read order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Position of the chunk, starting at 0
    pub index: u32,
    /// Object id the chunk is stored under
    pub chunk_id: String,
    /// Hex MD5 of the chunk bytes, absent when per-chunk digests are disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Number of bytes in the chunk
    pub byte_size: u64,
}

/// Facts about the original, unchunked content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub source_content_id: String,
    pub source_mimetype: String,
    pub source_byte_size: u64,
    pub source_digest: String,
}

/// Finalized, immutable manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    format_version: String,
    header: ManifestHeader,
    chunks: Vec<ChunkEntry>,
}

impl ChunkManifest {
    pub fn header(&self) -> &ManifestHeader {
        &self.header
    }

    pub fn source_content_id(&self) -> &str {
        &self.header.source_content_id
    }

    pub fn source_mimetype(&self) -> &str {
        &self.header.source_mimetype
    }

    pub fn source_byte_size(&self) -> u64 {
        self.header.source_byte_size
    }

    pub fn source_digest(&self) -> &str {
        &self.header.source_digest
    }

    pub fn format_version(&self) -> &str {
        &self.format_version
    }

    /// Entries in chunk order
    pub fn entries(&self) -> &[ChunkEntry] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Object id this manifest is stored under
    pub fn manifest_id(&self) -> String {
        naming::manifest_id(&self.header.source_content_id)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a serialized manifest
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let manifest: ChunkManifest = serde_json::from_slice(data)?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(ChunkStoreError::InvalidManifest(format!(
                "unsupported manifest version {}",
                manifest.format_version
            )));
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the structural invariants: contiguous ids from 0 and sizes
    /// summing to the source size.
    pub fn validate(&self) -> Result<()> {
        let content_id = &self.header.source_content_id;

        if self.chunks.is_empty() {
            return Err(ChunkStoreError::InvalidManifest(format!(
                "manifest for {} has no chunks",
                content_id
            )));
        }
        if self.header.source_digest.is_empty() {
            return Err(ChunkStoreError::InvalidManifest(format!(
                "manifest for {} has no source digest",
                content_id
            )));
        }

        for (position, entry) in self.chunks.iter().enumerate() {
            let expected = ObjectKind::Chunk {
                content_id: content_id.clone(),
                index: position as u32,
            };
            if entry.index as usize != position || naming::classify(&entry.chunk_id) != expected {
                return Err(ChunkStoreError::InvalidManifest(format!(
                    "chunk {} at position {} is out of sequence",
                    entry.chunk_id, position
                )));
            }
        }

        let total: u64 = self.chunks.iter().map(|c| c.byte_size).sum();
        if total != self.header.source_byte_size {
            return Err(ChunkStoreError::InvalidManifest(format!(
                "chunk sizes of {} sum to {}, source size is {}",
                content_id, total, self.header.source_byte_size
            )));
        }

        Ok(())
    }
}

/// Accumulates chunk entries while a source is being chunked
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    content_id: String,
    mimetype: String,
    byte_size: u64,
    entries: Vec<ChunkEntry>,
}

impl ManifestBuilder {
    pub fn new(content_id: impl Into<String>, mimetype: impl Into<String>, byte_size: u64) -> Self {
        Self {
            content_id: content_id.into(),
            mimetype: mimetype.into(),
            byte_size,
            entries: Vec::new(),
        }
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    /// Id of the next chunk to be appended
    pub fn next_chunk_id(&self) -> Result<String> {
        naming::chunk_id(&self.content_id, self.entries.len() as u32)
    }

    /// Append the entry for a completed chunk
    pub fn push_entry(&mut self, chunk_id: String, digest: Option<String>, byte_size: u64) {
        let index = self.entries.len() as u32;
        self.entries.push(ChunkEntry {
            index,
            chunk_id,
            digest,
            byte_size,
        });
    }

    pub fn entries(&self) -> &[ChunkEntry] {
        &self.entries
    }

    /// Freeze into a manifest carrying the whole-source digest
    pub fn finalize(self, source_digest: impl Into<String>) -> Result<ChunkManifest> {
        let manifest = ChunkManifest {
            format_version: MANIFEST_FORMAT_VERSION.to_string(),
            header: ManifestHeader {
                source_content_id: self.content_id,
                source_mimetype: self.mimetype,
                source_byte_size: self.byte_size,
                source_digest: source_digest.into(),
            },
            chunks: self.entries,
        };
        manifest.validate()?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(sizes: &[u64]) -> ChunkManifest {
        let total = sizes.iter().sum();
        let mut builder = ManifestBuilder::new("videos/big.mov", "video/quicktime", total);
        for (i, size) in sizes.iter().enumerate() {
            let id = builder.next_chunk_id().unwrap();
            builder.push_entry(id, Some(format!("{:032x}", i)), *size);
        }
        builder.finalize("0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn test_builder_allocates_sequential_ids() {
        let manifest = build(&[1024, 1024, 512]);
        let ids: Vec<_> = manifest.entries().iter().map(|e| e.chunk_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "videos/big.mov.000000.cs-chunk",
                "videos/big.mov.000001.cs-chunk",
                "videos/big.mov.000002.cs-chunk",
            ]
        );
        assert_eq!(manifest.manifest_id(), "videos/big.mov.cs-manifest");
    }

    #[test]
    fn test_json_round_trip() {
        for sizes in [vec![10], vec![1024, 1024, 1024], vec![2048, 2048, 7]] {
            let manifest = build(&sizes);
            let json = manifest.to_json().unwrap();
            let parsed = ChunkManifest::from_json(json.as_bytes()).unwrap();
            assert_eq!(parsed, manifest);
        }
    }

    #[test]
    fn test_round_trip_without_chunk_digests() {
        let mut builder = ManifestBuilder::new("a", "text/plain", 5);
        let id = builder.next_chunk_id().unwrap();
        builder.push_entry(id, None, 5);
        let manifest = builder.finalize("5d41402abc4b2a76b9719d911017c592").unwrap();

        let json = manifest.to_json().unwrap();
        assert!(!json.contains("\"digest\""));
        assert_eq!(ChunkManifest::from_json(json.as_bytes()).unwrap(), manifest);
    }

    #[test]
    fn test_finalize_rejects_size_mismatch() {
        let mut builder = ManifestBuilder::new("a", "text/plain", 100);
        let id = builder.next_chunk_id().unwrap();
        builder.push_entry(id, None, 99);
        assert!(matches!(
            builder.finalize("d"),
            Err(ChunkStoreError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_finalize_rejects_empty() {
        let builder = ManifestBuilder::new("a", "text/plain", 0);
        assert!(builder.finalize("d").is_err());
    }

    #[test]
    fn test_parse_rejects_reordered_chunks() {
        let manifest = build(&[1024, 1024]);
        let json = manifest.to_json().unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["chunks"].as_array_mut().unwrap().swap(0, 1);
        let tampered = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            ChunkManifest::from_json(&tampered),
            Err(ChunkStoreError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let manifest = build(&[1024]);
        let json = manifest.to_json().unwrap().replace("\"1\"", "\"99\"");
        assert!(ChunkManifest::from_json(json.as_bytes()).is_err());
    }
}
