//! Object naming convention for chunks and manifests
//!
//! Other tools read these names straight out of space listings, so the tokens
//! below are part of the wire format:
//!
//! ```text
//! <content-id>                      plain object
//! <content-id>.<NNNNNN>.cs-chunk    chunk NNNNNN of <content-id>
//! <content-id>.cs-manifest          manifest for <content-id>
//! ```

use crate::{ChunkStoreError, Result};

/// Suffix marking a chunk object
pub const CHUNK_SUFFIX: &str = ".cs-chunk";

/// Suffix marking a manifest object
pub const MANIFEST_SUFFIX: &str = ".cs-manifest";

/// Zero-padding width of the chunk index
pub const CHUNK_INDEX_WIDTH: usize = 6;

/// Highest chunk index representable in [`CHUNK_INDEX_WIDTH`] digits
pub const MAX_CHUNK_INDEX: u32 = 999_999;

/// Id of chunk `index` of `content_id`
pub fn chunk_id(content_id: &str, index: u32) -> Result<String> {
    if index > MAX_CHUNK_INDEX {
        return Err(ChunkStoreError::InvalidConfiguration(format!(
            "chunk index {} of {} exceeds the {}-digit naming limit",
            index, content_id, CHUNK_INDEX_WIDTH
        )));
    }
    Ok(format!(
        "{}.{:0width$}{}",
        content_id,
        index,
        CHUNK_SUFFIX,
        width = CHUNK_INDEX_WIDTH
    ))
}

/// Id of the manifest object of `content_id`
pub fn manifest_id(content_id: &str) -> String {
    format!("{}{}", content_id, MANIFEST_SUFFIX)
}

/// What a listed object name represents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    /// An ordinary, unchunked content item
    Plain { content_id: String },
    /// One chunk of a chunked content item
    Chunk { content_id: String, index: u32 },
    /// The manifest of a chunked content item
    Manifest { content_id: String },
}

impl ObjectKind {
    /// The logical content id this object belongs to
    pub fn content_id(&self) -> &str {
        match self {
            ObjectKind::Plain { content_id }
            | ObjectKind::Chunk { content_id, .. }
            | ObjectKind::Manifest { content_id } => content_id,
        }
    }
}

/// Classify a listed object id.
///
/// Names that carry a chunk suffix without a well-formed index are treated as
/// plain objects.
pub fn classify(object_id: &str) -> ObjectKind {
    if let Some(content_id) = object_id.strip_suffix(MANIFEST_SUFFIX) {
        if !content_id.is_empty() {
            return ObjectKind::Manifest {
                content_id: content_id.to_string(),
            };
        }
    }

    if let Some(rest) = object_id.strip_suffix(CHUNK_SUFFIX) {
        if let Some((content_id, digits)) = rest.rsplit_once('.') {
            if !content_id.is_empty()
                && digits.len() == CHUNK_INDEX_WIDTH
                && digits.bytes().all(|b| b.is_ascii_digit())
            {
                if let Ok(index) = digits.parse::<u32>() {
                    return ObjectKind::Chunk {
                        content_id: content_id.to_string(),
                        index,
                    };
                }
            }
        }
    }

    ObjectKind::Plain {
        content_id: object_id.to_string(),
    }
}

/// Whether `object_id` is a chunk or manifest, i.e. not user-visible content
pub fn is_chunk_artifact(object_id: &str) -> bool {
    !matches!(classify(object_id), ObjectKind::Plain { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_format() {
        assert_eq!(chunk_id("dir/a.bin", 0).unwrap(), "dir/a.bin.000000.cs-chunk");
        assert_eq!(chunk_id("a", 42).unwrap(), "a.000042.cs-chunk");
        assert!(chunk_id("a", MAX_CHUNK_INDEX + 1).is_err());
    }

    #[test]
    fn test_manifest_id_format() {
        assert_eq!(manifest_id("dir/a.bin"), "dir/a.bin.cs-manifest");
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("a.bin.000003.cs-chunk"),
            ObjectKind::Chunk {
                content_id: "a.bin".into(),
                index: 3
            }
        );
        assert_eq!(
            classify("a.bin.cs-manifest"),
            ObjectKind::Manifest {
                content_id: "a.bin".into()
            }
        );
        assert_eq!(
            classify("a.bin"),
            ObjectKind::Plain {
                content_id: "a.bin".into()
            }
        );
    }

    #[test]
    fn test_classify_malformed_chunk_is_plain() {
        assert!(matches!(classify("a.12.cs-chunk"), ObjectKind::Plain { .. }));
        assert!(matches!(classify("a.abcdef.cs-chunk"), ObjectKind::Plain { .. }));
        assert!(matches!(classify(".000001.cs-chunk"), ObjectKind::Plain { .. }));
        assert!(matches!(classify(".cs-manifest"), ObjectKind::Plain { .. }));
    }

    #[test]
    fn test_classify_round_trips_generated_ids() {
        let id = chunk_id("x/y.tar", 17).unwrap();
        assert_eq!(classify(&id).content_id(), "x/y.tar");
        assert_eq!(classify(&manifest_id("x/y.tar")).content_id(), "x/y.tar");
        assert!(is_chunk_artifact(&id));
        assert!(!is_chunk_artifact("x/y.tar"));
    }
}
