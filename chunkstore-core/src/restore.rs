//! Reading stored content back, whether it was chunked or not

use md5::{Digest, Md5};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::checksum::ChecksumReader;
use crate::listing::StoredArtifacts;
use crate::manifest::{ChunkEntry, ChunkManifest};
use crate::naming::manifest_id;
use crate::storage::StorageBackend;
use crate::{ChunkStoreError, Result};

/// Fetch and parse the manifest for `content_id`
pub fn read_manifest(
    backend: &dyn StorageBackend,
    space_id: &str,
    content_id: &str,
) -> Result<ChunkManifest> {
    let mut data = Vec::new();
    backend
        .read(space_id, &manifest_id(content_id))?
        .read_to_end(&mut data)?;
    ChunkManifest::from_json(&data)
}

struct OpenChunk {
    entry: ChunkEntry,
    reader: ChecksumReader<Box<dyn Read + Send>>,
}

/// Streams the chunks of a manifest back as one continuous source.
///
/// Each chunk's size and digest are checked when it ends, the whole-source
/// digest when the last chunk ends. Failures surface as read errors carrying
/// the underlying [`ChunkStoreError`].
pub struct ChunkedContentReader<'a> {
    backend: &'a dyn StorageBackend,
    space_id: String,
    manifest: ChunkManifest,
    next_entry: usize,
    current: Option<OpenChunk>,
    whole: Md5,
    verified: bool,
}

impl<'a> ChunkedContentReader<'a> {
    pub fn open(backend: &'a dyn StorageBackend, space_id: &str, content_id: &str) -> Result<Self> {
        let manifest = read_manifest(backend, space_id, content_id)?;
        Ok(Self::from_manifest(backend, space_id, manifest))
    }

    pub fn from_manifest(
        backend: &'a dyn StorageBackend,
        space_id: &str,
        manifest: ChunkManifest,
    ) -> Self {
        Self {
            backend,
            space_id: space_id.to_string(),
            manifest,
            next_entry: 0,
            current: None,
            whole: Md5::new(),
            verified: false,
        }
    }

    pub fn manifest(&self) -> &ChunkManifest {
        &self.manifest
    }

    fn open_next(&mut self) -> Result<bool> {
        let Some(entry) = self.manifest.entries().get(self.next_entry).cloned() else {
            return Ok(false);
        };
        self.next_entry += 1;
        let stream = self.backend.read(&self.space_id, &entry.chunk_id)?;
        debug!(chunk_id = %entry.chunk_id, bytes = entry.byte_size, "reading chunk");
        self.current = Some(OpenChunk {
            entry,
            reader: ChecksumReader::new(stream),
        });
        Ok(true)
    }

    fn finish_chunk(chunk: OpenChunk) -> Result<()> {
        let OpenChunk { entry, reader } = chunk;
        if reader.bytes_read() != entry.byte_size {
            return Err(ChunkStoreError::TruncatedSource {
                chunk_id: entry.chunk_id,
                expected: entry.byte_size,
                actual: reader.bytes_read(),
            });
        }
        if let Some(expected) = entry.digest {
            let actual = reader.hex_digest();
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(ChunkStoreError::ChecksumMismatch {
                    object_id: entry.chunk_id,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn verify_source(&mut self) -> Result<()> {
        let actual = hex::encode(self.whole.clone().finalize());
        self.verified = true;
        let expected = self.manifest.source_digest();
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(ChunkStoreError::ChecksumMismatch {
                object_id: self.manifest.source_content_id().to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if let Some(chunk) = self.current.as_mut() {
                let remaining = chunk.entry.byte_size.saturating_sub(chunk.reader.bytes_read());
                // Ask for one extra byte past the declared size to catch
                // chunks longer than the manifest says
                let limit = buf.len().min(remaining as usize + 1);
                let n = chunk.reader.read(&mut buf[..limit])?;
                if n > 0 {
                    if chunk.reader.bytes_read() > chunk.entry.byte_size {
                        let chunk_id = chunk.entry.chunk_id.clone();
                        return Err(ChunkStoreError::InvalidManifest(format!(
                            "chunk {} is longer than its manifest entry",
                            chunk_id
                        )));
                    }
                    self.whole.update(&buf[..n]);
                    return Ok(n);
                }
                if let Some(done) = self.current.take() {
                    Self::finish_chunk(done)?;
                }
            }

            if !self.open_next()? {
                if !self.verified {
                    self.verify_source()?;
                }
                return Ok(0);
            }
        }
    }
}

impl Read for ChunkedContentReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.read_inner(buf).map_err(ChunkStoreError::into_io)
    }
}

/// How a content id is currently stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredForm {
    Unchunked,
    Chunked(ChunkManifest),
}

/// Open stored content as one stream, resolving chunked storage
pub fn open_content<'a>(
    backend: &'a dyn StorageBackend,
    space_id: &str,
    content_id: &str,
) -> Result<(StoredForm, Box<dyn Read + 'a>)> {
    let artifacts = StoredArtifacts::discover(backend, space_id, content_id)?;
    if artifacts.manifest {
        let reader = ChunkedContentReader::open(backend, space_id, content_id)?;
        let form = StoredForm::Chunked(reader.manifest().clone());
        return Ok((form, Box::new(reader)));
    }
    if artifacts.plain {
        return Ok((StoredForm::Unchunked, Box::new(backend.read(space_id, content_id)?)));
    }
    Err(ChunkStoreError::NotFound(format!("{}/{}", space_id, content_id)))
}

/// Write stored content to `dest_path`. The file only appears once every
/// byte has been read and verified; on failure nothing is left behind.
/// Returns the number of bytes written.
pub fn restore_content(
    backend: &dyn StorageBackend,
    space_id: &str,
    content_id: &str,
    dest_path: &Path,
) -> Result<u64> {
    let parent = match dest_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    fs::create_dir_all(&parent)?;

    let (form, mut source) = open_content(backend, space_id, content_id)?;
    let mut temp = NamedTempFile::new_in(&parent)?;
    let written = io::copy(&mut source, temp.as_file_mut())?;
    temp.as_file_mut().flush()?;
    temp.persist(dest_path).map_err(|e| ChunkStoreError::Io(e.error))?;

    info!(
        space_id,
        content_id,
        bytes = written,
        chunked = matches!(form, StoredForm::Chunked(_)),
        "restored content to {:?}",
        dest_path
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_md5;
    use crate::naming::chunk_id;
    use crate::storage::{MemoryBackend, WriteOptions};
    use crate::upload::ContentWriter;
    use tempfile::TempDir;

    fn stored(len: usize) -> (MemoryBackend, Vec<u8>) {
        let backend = MemoryBackend::new();
        backend.create_space("s").unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let writer = ContentWriter::new(&backend, "s", 1024);
        if writer.needs_chunking(len as u64) {
            writer
                .write_chunked("item", "application/x-test", &data[..], len as u64, None)
                .unwrap();
        } else {
            writer
                .write_single("item", "application/x-test", &mut &data[..], len as u64, None)
                .unwrap();
        }
        (backend, data)
    }

    #[test]
    fn test_chunked_reader_reassembles() {
        let (backend, data) = stored(3584);
        let mut reader = ChunkedContentReader::open(&backend, "s", "item").unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.manifest().source_digest(), compute_md5(&data));
    }

    #[test]
    fn test_corrupted_chunk_detected() {
        let (backend, _) = stored(3072);
        let id = chunk_id("item", 1).unwrap();
        backend
            .write("s", &id, &mut &vec![0u8; 1024][..], 1024, &WriteOptions::default())
            .unwrap();

        let mut reader = ChunkedContentReader::open(&backend, "s", "item").unwrap();
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        let err = ChunkStoreError::from(err);
        assert!(matches!(err, ChunkStoreError::ChecksumMismatch { object_id, .. } if object_id == id));
    }

    #[test]
    fn test_short_chunk_detected() {
        let (backend, _) = stored(3072);
        let id = chunk_id("item", 2).unwrap();
        backend
            .write("s", &id, &mut &[1u8; 10][..], 10, &WriteOptions::default())
            .unwrap();

        let mut reader = ChunkedContentReader::open(&backend, "s", "item").unwrap();
        let err = ChunkStoreError::from(reader.read_to_end(&mut Vec::new()).unwrap_err());
        assert!(matches!(err, ChunkStoreError::TruncatedSource { actual: 10, .. }));
    }

    #[test]
    fn test_restore_chunked_and_unchunked() {
        let dir = TempDir::new().unwrap();
        for len in [700, 4000] {
            let (backend, data) = stored(len);
            let dest = dir.path().join(format!("out-{len}"));
            let written = restore_content(&backend, "s", "item", &dest).unwrap();
            assert_eq!(written, len as u64);
            assert_eq!(fs::read(&dest).unwrap(), data);
        }
    }

    #[test]
    fn test_failed_restore_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let (backend, _) = stored(3072);
        backend.delete("s", &chunk_id("item", 1).unwrap()).unwrap();

        let dest = dir.path().join("out");
        let err = restore_content(&backend, "s", "item", &dest).unwrap_err();
        assert!(matches!(err, ChunkStoreError::NotFound(_)));
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_restore_missing_content() {
        let dir = TempDir::new().unwrap();
        let (backend, _) = stored(10);
        let err = restore_content(&backend, "s", "other", &dir.path().join("x")).unwrap_err();
        assert!(matches!(err, ChunkStoreError::NotFound(_)));
    }
}
