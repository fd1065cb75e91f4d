//! Read-buffer sizing for chunked reads
//!
//! The buffer handed to the source reader must divide the chunk size evenly so
//! that no read ever straddles a chunk boundary.

use crate::{ChunkStoreError, Result, MAX_BUFFER_SIZE};

/// Chunk sizes must be a whole number of KiB
pub const CHUNK_SIZE_ALIGNMENT: u64 = 1024;

/// Derive the I/O buffer size for a given maximum chunk size.
///
/// Returns the largest divisor of `max_chunk_size` that does not exceed
/// [`MAX_BUFFER_SIZE`]. Fails with `InvalidConfiguration` unless the chunk
/// size is a non-zero multiple of 1 KiB.
pub fn compute_buffer_size(max_chunk_size: u64) -> Result<usize> {
    validate_chunk_size(max_chunk_size)?;

    let mut divisor = 1u64;
    loop {
        if max_chunk_size % divisor == 0 {
            let candidate = max_chunk_size / divisor;
            if candidate <= MAX_BUFFER_SIZE as u64 {
                return Ok(candidate as usize);
            }
        }
        divisor += 1;
    }
}

/// Check the 1 KiB alignment rule without computing anything else
pub fn validate_chunk_size(max_chunk_size: u64) -> Result<()> {
    if max_chunk_size == 0 || max_chunk_size % CHUNK_SIZE_ALIGNMENT != 0 {
        return Err(ChunkStoreError::InvalidConfiguration(format!(
            "max chunk size must be a non-zero multiple of {} bytes, got {}",
            CHUNK_SIZE_ALIGNMENT, max_chunk_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_chunk_uses_whole_chunk() {
        assert_eq!(compute_buffer_size(1024).unwrap(), 1024);
        assert_eq!(compute_buffer_size(8192).unwrap(), 8192);
    }

    #[test]
    fn test_large_chunk_is_capped() {
        assert_eq!(compute_buffer_size(1024 * 1024).unwrap(), 8192);
        assert_eq!(compute_buffer_size(1024 * 1024 * 1024).unwrap(), 8192);
    }

    #[test]
    fn test_odd_multiple() {
        // 9216 / 2 = 4608 is the first candidate under the cap
        assert_eq!(compute_buffer_size(9 * 1024).unwrap(), 4608);
        assert_eq!(compute_buffer_size(11 * 1024).unwrap(), 5632);
        // 7 * 1024 fits as-is
        assert_eq!(compute_buffer_size(7 * 1024).unwrap(), 7168);
    }

    #[test]
    fn test_divisibility_property() {
        for kib in 1..=600u64 {
            let chunk = kib * 1024;
            let buffer = compute_buffer_size(chunk).unwrap() as u64;
            assert_eq!(chunk % buffer, 0, "chunk {chunk} buffer {buffer}");
            assert!(buffer <= MAX_BUFFER_SIZE as u64);
        }
    }

    #[test]
    fn test_unaligned_rejected() {
        assert!(matches!(
            compute_buffer_size(1000),
            Err(ChunkStoreError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            compute_buffer_size(0),
            Err(ChunkStoreError::InvalidConfiguration(_))
        ));
    }
}
