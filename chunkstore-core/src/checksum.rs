//! MD5 digests as a side effect of reading
//!
//! `ChecksumReader` wraps any reader and feeds every delivered byte into a
//! running MD5 digest. The digest only covers the whole stream once the
//! reader has been drained to end-of-stream.

use md5::{Digest, Md5};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use crate::{ChunkStoreError, Result};

/// Hex-encoded MD5 of an in-memory buffer
pub fn compute_md5(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Drain a reader and return its hex MD5 and byte count
pub fn md5_of_reader<R: Read>(reader: R) -> io::Result<(String, u64)> {
    let mut reader = ChecksumReader::new(reader);
    io::copy(&mut reader, &mut io::sink())?;
    Ok((reader.hex_digest(), reader.bytes_read()))
}

/// Parse an md5sum-style listing (`<digest>  <path>` or `<digest> *<path>`)
/// into a map from content id to lowercase digest. A leading `./` on paths
/// is dropped so keys line up with content ids.
pub fn parse_checksum_list(text: &str) -> Result<HashMap<String, String>> {
    let mut digests = HashMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = || {
            ChunkStoreError::InvalidConfiguration(format!(
                "checksum list line {}: expected '<md5>  <path>'",
                lineno + 1
            ))
        };

        let (digest, rest) = line.split_once(' ').ok_or_else(malformed)?;
        if digest.len() != 32 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed());
        }
        let path = rest.trim_start_matches(' ').trim_start_matches('*');
        let path = path.strip_prefix("./").unwrap_or(path);
        if path.is_empty() {
            return Err(malformed());
        }
        digests.insert(path.replace('\\', "/"), digest.to_ascii_lowercase());
    }
    Ok(digests)
}

/// Load a checksum listing from disk
pub fn read_checksum_list(path: &Path) -> Result<HashMap<String, String>> {
    let text = fs::read_to_string(path)?;
    parse_checksum_list(&text)
}

/// Reader decorator computing a running MD5 digest
pub struct ChecksumReader<R> {
    inner: R,
    hasher: Md5,
    bytes_read: u64,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
            bytes_read: 0,
        }
    }

    /// Digest of every byte delivered so far
    pub fn hex_digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Release the wrapped reader, returning it with the final digest
    pub fn into_parts(self) -> (R, String) {
        let digest = hex::encode(self.hasher.finalize());
        (self.inner, digest)
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}
