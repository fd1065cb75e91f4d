//! Writing one content item to a space, whole or as chunks

use std::io::Read;
use tracing::{debug, info, warn};

use crate::chunker::ChunkableContent;
use crate::manifest::{ChunkManifest, MANIFEST_MIMETYPE};
use crate::storage::{StorageBackend, WriteOptions, DEFAULT_MIMETYPE};
use crate::{ChunkStoreError, Result};

/// Property recorded on manifests naming the content they describe
pub const SOURCE_CONTENT_ID_PROPERTY: &str = "source-content-id";

/// Writes content items into one space
pub struct ContentWriter<'a> {
    backend: &'a dyn StorageBackend,
    space_id: &'a str,
    max_chunk_size: u64,
    include_chunk_digests: bool,
}

impl<'a> ContentWriter<'a> {
    pub fn new(backend: &'a dyn StorageBackend, space_id: &'a str, max_chunk_size: u64) -> Self {
        Self {
            backend,
            space_id,
            max_chunk_size,
            include_chunk_digests: true,
        }
    }

    pub fn with_chunk_digests(mut self, include: bool) -> Self {
        self.include_chunk_digests = include;
        self
    }

    /// Whether content of this size must be chunked
    pub fn needs_chunking(&self, byte_size: u64) -> bool {
        byte_size > self.max_chunk_size
    }

    /// Store `source` as a single object under `content_id`
    pub fn write_single(
        &self,
        content_id: &str,
        mimetype: &str,
        source: &mut dyn Read,
        byte_size: u64,
        expected_digest: Option<&str>,
    ) -> Result<String> {
        let options =
            WriteOptions::new(mimetype).with_expected_digest(expected_digest.map(str::to_string));
        let digest = self
            .backend
            .write(self.space_id, content_id, source, byte_size, &options)?;
        debug!(space_id = self.space_id, content_id, bytes = byte_size, "stored unchunked");
        Ok(digest)
    }

    /// Store `source` as a chunk set plus manifest.
    ///
    /// If anything fails after chunks were written (including a whole-source
    /// digest that disagrees with `expected_digest`) the manifest is not
    /// written and the chunks of this attempt are deleted again.
    pub fn write_chunked<R: Read>(
        &self,
        content_id: &str,
        mimetype: &str,
        source: R,
        byte_size: u64,
        expected_digest: Option<&str>,
    ) -> Result<ChunkManifest> {
        let mut written = Vec::new();
        let result = self.write_chunks_and_manifest(
            content_id,
            mimetype,
            source,
            byte_size,
            expected_digest,
            &mut written,
        );

        if let Err(e) = &result {
            warn!(
                space_id = self.space_id,
                content_id,
                chunks = written.len(),
                "chunked write failed, removing chunks of this attempt: {}",
                e
            );
            self.delete_quietly(&written);
        }
        result
    }

    fn write_chunks_and_manifest<R: Read>(
        &self,
        content_id: &str,
        mimetype: &str,
        source: R,
        byte_size: u64,
        expected_digest: Option<&str>,
        written: &mut Vec<String>,
    ) -> Result<ChunkManifest> {
        let mut content =
            ChunkableContent::new(content_id, mimetype, source, byte_size, self.max_chunk_size)?
                .with_chunk_digests(self.include_chunk_digests);
        let chunk_options = WriteOptions::new(DEFAULT_MIMETYPE);

        while let Some(mut chunk) = content.next_chunk()? {
            let chunk_id = chunk.chunk_id().to_string();
            let declared = chunk.declared_length();
            let stored_digest =
                self.backend
                    .write(self.space_id, &chunk_id, &mut chunk, declared, &chunk_options)?;
            written.push(chunk_id.clone());

            if let Some(local) = chunk.digest() {
                if !local.eq_ignore_ascii_case(&stored_digest) {
                    return Err(ChunkStoreError::ChecksumMismatch {
                        object_id: chunk_id,
                        expected: local,
                        actual: stored_digest,
                    });
                }
            }
            debug!(space_id = self.space_id, chunk_id = %chunk_id, bytes = declared, "stored chunk");
        }

        let manifest = content.finalize()?;
        if let Some(expected) = expected_digest {
            if !expected.eq_ignore_ascii_case(manifest.source_digest()) {
                return Err(ChunkStoreError::ChecksumMismatch {
                    object_id: content_id.to_string(),
                    expected: expected.to_string(),
                    actual: manifest.source_digest().to_string(),
                });
            }
        }

        let json = manifest.to_json()?;
        let manifest_options = WriteOptions::new(MANIFEST_MIMETYPE)
            .with_property(SOURCE_CONTENT_ID_PROPERTY, content_id);
        self.backend.write(
            self.space_id,
            &manifest.manifest_id(),
            &mut json.as_bytes(),
            json.len() as u64,
            &manifest_options,
        )?;

        info!(
            space_id = self.space_id,
            content_id,
            chunks = manifest.chunk_count(),
            bytes = byte_size,
            "stored chunked content"
        );
        Ok(manifest)
    }

    /// Best-effort delete; failures are logged, not returned
    pub fn delete_quietly(&self, object_ids: &[String]) {
        for object_id in object_ids {
            match self.backend.delete(self.space_id, object_id) {
                Ok(()) | Err(ChunkStoreError::NotFound(_)) => {}
                Err(e) => warn!(space_id = self.space_id, object_id = %object_id, "cleanup failed: {}", e),
            }
        }
    }
}
