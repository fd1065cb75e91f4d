//! Fixed-size chunking of a large stream
//!
//! [`ChunkableContent`] owns the source stream and hands out one bounded
//! [`ChunkReader`] at a time. A chunk's size and digest are only known once the
//! caller has drained it, so its manifest entry is recorded when the *next*
//! chunk is requested (or at [`ChunkableContent::finalize`]).
//!
//! ```no_run
//! use chunkstore_core::chunker::ChunkableContent;
//! # fn main() -> chunkstore_core::Result<()> {
//! let file = std::fs::File::open("big.iso")?;
//! let size = file.metadata()?.len();
//! let mut content = ChunkableContent::new("big.iso", "application/octet-stream", file, size, 1 << 30)?;
//! while let Some(mut chunk) = content.next_chunk()? {
//!     std::io::copy(&mut chunk, &mut std::io::sink())?;
//! }
//! let manifest = content.finalize()?;
//! # Ok(())
//! # }
//! ```

use md5::{Digest, Md5};
use std::io::{self, BufReader, Read};
use tracing::debug;

use crate::buffer::compute_buffer_size;
use crate::checksum::ChecksumReader;
use crate::manifest::{ChunkEntry, ChunkManifest, ManifestBuilder};
use crate::{ChunkStoreError, Result};

/// Progress of a single chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStreamState {
    NotStarted,
    Reading,
    FullyRead,
}

/// Bookkeeping for the chunk currently handed out
#[derive(Debug)]
struct ChunkState {
    chunk_id: String,
    declared: u64,
    bytes_read: u64,
    hasher: Option<Md5>,
}

impl ChunkState {
    fn new(chunk_id: String, declared: u64, compute_digest: bool) -> Self {
        Self {
            chunk_id,
            declared,
            bytes_read: 0,
            hasher: compute_digest.then(Md5::new),
        }
    }

    fn state(&self) -> ChunkStreamState {
        if self.bytes_read == self.declared {
            ChunkStreamState::FullyRead
        } else if self.bytes_read == 0 {
            ChunkStreamState::NotStarted
        } else {
            ChunkStreamState::Reading
        }
    }

    fn is_fully_read(&self) -> bool {
        self.bytes_read == self.declared
    }

    fn digest(&self) -> Option<String> {
        if !self.is_fully_read() {
            return None;
        }
        self.hasher
            .as_ref()
            .map(|h| hex::encode(h.clone().finalize()))
    }
}

type SourceReader<R> = ChecksumReader<BufReader<R>>;

/// A bounded view onto the shared source: yields exactly its declared length
/// and then end-of-stream.
pub struct ChunkReader<'a, R> {
    source: &'a mut SourceReader<R>,
    state: &'a mut ChunkState,
}

impl<R: Read> ChunkReader<'_, R> {
    pub fn chunk_id(&self) -> &str {
        &self.state.chunk_id
    }

    pub fn declared_length(&self) -> u64 {
        self.state.declared
    }

    pub fn bytes_read(&self) -> u64 {
        self.state.bytes_read
    }

    pub fn state(&self) -> ChunkStreamState {
        self.state.state()
    }

    pub fn is_fully_read(&self) -> bool {
        self.state.is_fully_read()
    }

    /// Hex MD5 of this chunk; `None` until fully read or when chunk digests
    /// are disabled.
    pub fn digest(&self) -> Option<String> {
        self.state.digest()
    }
}

impl<R: Read> Read for ChunkReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.state.declared - self.state.bytes_read;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let want = remaining.min(buf.len() as u64) as usize;
        let n = self.source.read(&mut buf[..want])?;
        if n == 0 {
            return Err(ChunkStoreError::TruncatedSource {
                chunk_id: self.state.chunk_id.clone(),
                expected: self.state.declared,
                actual: self.state.bytes_read,
            }
            .into_io());
        }

        if let Some(hasher) = self.state.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        self.state.bytes_read += n as u64;
        Ok(n)
    }
}

/// Splits one source stream into chunks of at most `max_chunk_size` bytes.
///
/// Single-threaded: one instance must only be driven by one thread at a time.
pub struct ChunkableContent<R> {
    source: SourceReader<R>,
    manifest: ManifestBuilder,
    source_byte_size: u64,
    max_chunk_size: u64,
    buffer_size: usize,
    include_chunk_digests: bool,
    total_bytes_read: u64,
    started: bool,
    current: Option<ChunkState>,
}

impl<R: Read> ChunkableContent<R> {
    /// Prepare `source` for chunking. Fails with `InvalidConfiguration` before
    /// any byte is read if `max_chunk_size` is not 1 KiB aligned.
    pub fn new(
        content_id: impl Into<String>,
        mimetype: impl Into<String>,
        source: R,
        source_byte_size: u64,
        max_chunk_size: u64,
    ) -> Result<Self> {
        let buffer_size = compute_buffer_size(max_chunk_size)?;
        Ok(Self {
            source: ChecksumReader::new(BufReader::with_capacity(buffer_size, source)),
            manifest: ManifestBuilder::new(content_id, mimetype, source_byte_size),
            source_byte_size,
            max_chunk_size,
            buffer_size,
            include_chunk_digests: true,
            total_bytes_read: 0,
            started: false,
            current: None,
        })
    }

    /// Compute a digest per chunk (default: on)
    pub fn with_chunk_digests(mut self, include: bool) -> Self {
        self.include_chunk_digests = include;
        self
    }

    pub fn content_id(&self) -> &str {
        self.manifest.content_id()
    }

    pub fn source_byte_size(&self) -> u64 {
        self.source_byte_size
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes of all recorded chunks, excluding the one in flight
    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }

    /// Entries recorded so far (one behind the chunk in flight)
    pub fn recorded_entries(&self) -> &[ChunkEntry] {
        self.manifest.entries()
    }

    /// Number of chunks the source will be split into
    pub fn expected_chunk_count(&self) -> u64 {
        self.source_byte_size.div_ceil(self.max_chunk_size).max(1)
    }

    /// Whether another chunk remains to be handed out
    pub fn has_next(&self) -> bool {
        if !self.started {
            return true;
        }
        let in_flight = self.current.as_ref().map_or(0, |c| c.bytes_read);
        self.total_bytes_read + in_flight < self.source_byte_size
    }

    /// Record the previous chunk and hand out the next one, or `None` once the
    /// source is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<ChunkReader<'_, R>>> {
        self.record_pending()?;
        if !self.has_next() {
            return Ok(None);
        }
        self.issue_next().map(Some)
    }

    /// Move the chunk in flight into the manifest. Fails with
    /// `ChunkNotFullyRead` if the caller has not drained it.
    pub fn record_pending(&mut self) -> Result<()> {
        let Some(state) = self.current.take() else {
            return Ok(());
        };

        if !state.is_fully_read() {
            let err = ChunkStoreError::ChunkNotFullyRead {
                chunk_id: state.chunk_id.clone(),
                bytes_read: state.bytes_read,
                declared: state.declared,
            };
            self.current = Some(state);
            return Err(err);
        }

        let digest = state.digest();
        debug!(
            chunk_id = %state.chunk_id,
            bytes = state.bytes_read,
            "recorded chunk"
        );
        self.total_bytes_read += state.bytes_read;
        self.manifest.push_entry(state.chunk_id, digest, state.bytes_read);
        Ok(())
    }

    fn issue_next(&mut self) -> Result<ChunkReader<'_, R>> {
        let remaining = self.source_byte_size - self.total_bytes_read;
        let length = self.max_chunk_size.min(remaining);
        let chunk_id = self.manifest.next_chunk_id()?;
        self.started = true;

        let state = self
            .current
            .insert(ChunkState::new(chunk_id, length, self.include_chunk_digests));
        Ok(ChunkReader {
            source: &mut self.source,
            state,
        })
    }

    /// Drive every chunk through `handle`, then finalize.
    ///
    /// `handle` must drain the chunk it is given.
    pub fn chunk_all<F>(mut self, mut handle: F) -> Result<ChunkManifest>
    where
        F: FnMut(&mut ChunkReader<'_, R>) -> Result<()>,
    {
        while let Some(mut chunk) = self.next_chunk()? {
            handle(&mut chunk)?;
        }
        self.finalize()
    }

    /// Record the last chunk, release the source and freeze the manifest with
    /// the whole-source digest.
    pub fn finalize(mut self) -> Result<ChunkManifest> {
        self.record_pending()?;
        if self.has_next() {
            return Err(ChunkStoreError::ChunksRemaining {
                consumed: self.total_bytes_read,
                total: self.source_byte_size,
            });
        }

        let (_, digest) = self.source.into_parts();
        let manifest = self.manifest.finalize(digest)?;
        debug!(
            content_id = %manifest.source_content_id(),
            chunks = manifest.chunk_count(),
            "finalized manifest"
        );
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::compute_md5;
    use crate::naming::{classify, ObjectKind};

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    fn chunk_sizes(data: &[u8], max: u64) -> (Vec<Vec<u8>>, ChunkManifest) {
        let content =
            ChunkableContent::new("data.bin", "application/octet-stream", data, data.len() as u64, max)
                .unwrap();
        let mut chunks = Vec::new();
        let manifest = content
            .chunk_all(|chunk| {
                let mut buf = Vec::new();
                chunk.read_to_end(&mut buf)?;
                chunks.push(buf);
                Ok(())
            })
            .unwrap();
        (chunks, manifest)
    }

    #[test]
    fn test_exact_multiple() {
        let data = sample(3 * 1024);
        let (chunks, manifest) = chunk_sizes(&data, 1024);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 1024));
        assert_eq!(manifest.chunk_count(), 3);
        assert_eq!(manifest.entries().iter().map(|e| e.byte_size).sum::<u64>(), 3072);
    }

    #[test]
    fn test_short_final_chunk() {
        let data = sample(3 * 1024 + 512);
        let (chunks, manifest) = chunk_sizes(&data, 1024);
        let sizes: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![1024, 1024, 1024, 512]);
        assert_eq!(manifest.entries()[3].byte_size, 512);
    }

    #[test]
    fn test_chunk_count_matches_ceiling() {
        for len in [1usize, 1023, 1024, 1025, 5000, 8192, 10_000] {
            let data = sample(len);
            let (chunks, _) = chunk_sizes(&data, 2048);
            assert_eq!(chunks.len(), len.div_ceil(2048), "len {len}");
        }
    }

    #[test]
    fn test_digests_match_content() {
        let data = sample(5000);
        let (chunks, manifest) = chunk_sizes(&data, 2048);

        assert_eq!(manifest.source_digest(), compute_md5(&data));
        assert_eq!(chunks.concat(), data);
        for (entry, bytes) in manifest.entries().iter().zip(&chunks) {
            assert_eq!(entry.digest.as_deref(), Some(compute_md5(bytes).as_str()));
        }
    }

    #[test]
    fn test_chunk_ids_are_contiguous() {
        let data = sample(10_000);
        let (_, manifest) = chunk_sizes(&data, 1024);
        for (i, entry) in manifest.entries().iter().enumerate() {
            assert_eq!(entry.index as usize, i);
            assert_eq!(
                classify(&entry.chunk_id),
                ObjectKind::Chunk {
                    content_id: "data.bin".into(),
                    index: i as u32
                }
            );
        }
    }

    #[test]
    fn test_next_before_fully_read_fails() {
        let data = sample(4096);
        let mut content =
            ChunkableContent::new("a", "text/plain", &data[..], 4096, 1024).unwrap();

        let mut chunk = content.next_chunk().unwrap().unwrap();
        let mut buf = [0u8; 100];
        chunk.read_exact(&mut buf).unwrap();
        assert_eq!(chunk.state(), ChunkStreamState::Reading);

        match content.next_chunk() {
            Err(ChunkStoreError::ChunkNotFullyRead {
                bytes_read,
                declared,
                ..
            }) => {
                assert_eq!(bytes_read, 100);
                assert_eq!(declared, 1024);
            }
            other => panic!("expected ChunkNotFullyRead, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_finalize_before_fully_read_fails() {
        let data = sample(2048);
        let mut content =
            ChunkableContent::new("a", "text/plain", &data[..], 2048, 1024).unwrap();
        let mut chunk = content.next_chunk().unwrap().unwrap();
        io::copy(&mut chunk, &mut io::sink()).unwrap();

        // second chunk never requested
        assert!(matches!(
            content.finalize(),
            Err(ChunkStoreError::ChunksRemaining {
                consumed: 1024,
                total: 2048
            })
        ));
    }

    #[test]
    fn test_truncated_source() {
        let data = sample(1500);
        let mut content =
            ChunkableContent::new("a", "text/plain", &data[..], 4096, 1024).unwrap();

        let mut first = content.next_chunk().unwrap().unwrap();
        io::copy(&mut first, &mut io::sink()).unwrap();

        let mut second = content.next_chunk().unwrap().unwrap();
        let err: ChunkStoreError = io::copy(&mut second, &mut io::sink()).unwrap_err().into();
        assert!(matches!(
            err,
            ChunkStoreError::TruncatedSource {
                expected: 1024,
                actual: 476,
                ..
            }
        ));
    }

    #[test]
    fn test_chunk_caps_reads_at_declared_length() {
        let data = sample(3000);
        let mut content =
            ChunkableContent::new("a", "text/plain", &data[..], 3000, 1024).unwrap();
        let mut chunk = content.next_chunk().unwrap().unwrap();
        let mut big = vec![0u8; 4096];
        let mut total = 0;
        loop {
            let n = chunk.read(&mut big[total..]).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 1024);
        assert_eq!(chunk.state(), ChunkStreamState::FullyRead);
        assert_eq!(chunk.read(&mut big).unwrap(), 0);
    }

    #[test]
    fn test_without_chunk_digests() {
        let data = sample(2500);
        let content = ChunkableContent::new("a", "text/plain", &data[..], 2500, 1024)
            .unwrap()
            .with_chunk_digests(false);
        let manifest = content
            .chunk_all(|chunk| {
                io::copy(chunk, &mut io::sink())?;
                assert!(chunk.digest().is_none());
                Ok(())
            })
            .unwrap();
        assert!(manifest.entries().iter().all(|e| e.digest.is_none()));
        assert_eq!(manifest.source_digest(), compute_md5(&data));
    }

    #[test]
    fn test_empty_source_yields_single_empty_chunk() {
        let mut content = ChunkableContent::new("a", "text/plain", &b""[..], 0, 1024).unwrap();
        assert!(content.has_next());
        {
            let chunk = content.next_chunk().unwrap().unwrap();
            assert_eq!(chunk.declared_length(), 0);
            assert!(chunk.is_fully_read());
        }
        assert!(!content.has_next());
        assert!(content.next_chunk().unwrap().is_none());
        let manifest = content.finalize().unwrap();
        assert_eq!(manifest.chunk_count(), 1);
        assert_eq!(manifest.source_digest(), compute_md5(b""));
    }

    #[test]
    fn test_entries_recorded_one_behind() {
        let data = sample(3072);
        let mut content =
            ChunkableContent::new("a", "text/plain", &data[..], 3072, 1024).unwrap();

        let mut chunk = content.next_chunk().unwrap().unwrap();
        io::copy(&mut chunk, &mut io::sink()).unwrap();
        assert!(content.recorded_entries().is_empty());

        let mut chunk = content.next_chunk().unwrap().unwrap();
        io::copy(&mut chunk, &mut io::sink()).unwrap();
        assert_eq!(content.recorded_entries().len(), 1);
        assert_eq!(content.total_bytes_read(), 1024);
    }

    #[test]
    fn test_rejects_unaligned_chunk_size() {
        assert!(matches!(
            ChunkableContent::new("a", "text/plain", &b"abc"[..], 3, 1000),
            Err(ChunkStoreError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_expected_chunk_count() {
        let content = ChunkableContent::new("a", "t", &b""[..], 3584, 1024).unwrap();
        assert_eq!(content.expected_chunk_count(), 4);
        assert_eq!(content.buffer_size(), 1024);
    }
}
