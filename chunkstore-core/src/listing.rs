//! Chunk-aware views over raw space listings
//!
//! A raw listing mixes plain objects, chunks and manifests. [`ContentListing`]
//! turns it into the list of logical content ids a user expects to see, and
//! [`StoredArtifacts`] answers "what is stored for this content id right now".

use crate::naming::{classify, ObjectKind};
use crate::storage::StorageBackend;
use crate::Result;

/// Filters a raw listing down to logical content ids: manifests are surfaced
/// as their content id, chunks are dropped, order is preserved.
pub struct ContentListing<I> {
    inner: I,
}

impl<I> ContentListing<I>
where
    I: Iterator<Item = Result<String>>,
{
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I> Iterator for ContentListing<I>
where
    I: Iterator<Item = Result<String>>,
{
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = match self.inner.next()? {
                Ok(id) => id,
                Err(e) => return Some(Err(e)),
            };
            match classify(&id) {
                ObjectKind::Chunk { .. } => continue,
                ObjectKind::Manifest { content_id } | ObjectKind::Plain { content_id } => {
                    return Some(Ok(content_id))
                }
            }
        }
    }
}

/// Chunk-aware listing of a space
pub fn list_content<'a>(
    backend: &'a dyn StorageBackend,
    space_id: &str,
    prefix: Option<&str>,
) -> Result<ContentListing<crate::storage::ObjectListing<'a>>> {
    Ok(ContentListing::new(backend.list(space_id, prefix)?))
}

/// Objects currently stored for one content id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredArtifacts {
    pub content_id: String,
    /// An unchunked object exists under the content id itself
    pub plain: bool,
    /// A manifest object exists
    pub manifest: bool,
    /// Chunk object ids, ordered by index
    pub chunk_ids: Vec<String>,
}

impl StoredArtifacts {
    /// List everything stored under `content_id` and classify it. Objects of
    /// other content ids sharing the prefix are ignored.
    pub fn discover(backend: &dyn StorageBackend, space_id: &str, content_id: &str) -> Result<Self> {
        let mut artifacts = StoredArtifacts {
            content_id: content_id.to_string(),
            ..Self::default()
        };
        let mut chunks: Vec<(u32, String)> = Vec::new();

        for id in backend.list(space_id, Some(content_id))? {
            let id = id?;
            match classify(&id) {
                ObjectKind::Plain { content_id: c } if c == content_id => artifacts.plain = true,
                ObjectKind::Manifest { content_id: c } if c == content_id => {
                    artifacts.manifest = true
                }
                ObjectKind::Chunk {
                    content_id: c,
                    index,
                } if c == content_id => chunks.push((index, id)),
                _ => {}
            }
        }

        chunks.sort_by_key(|(index, _)| *index);
        artifacts.chunk_ids = chunks.into_iter().map(|(_, id)| id).collect();
        Ok(artifacts)
    }

    pub fn is_absent(&self) -> bool {
        !self.plain && !self.manifest && self.chunk_ids.is_empty()
    }

    /// Whether any chunk or manifest object exists
    pub fn has_chunk_artifacts(&self) -> bool {
        self.manifest || !self.chunk_ids.is_empty()
    }
}
