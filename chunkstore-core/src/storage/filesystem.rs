//! Local filesystem storage backend
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/
//! ├── <space>/<object-id>                    # object bytes, '/' in ids nests
//! ├── .meta/<space>/<object-id>.json         # mimetype, digest, properties
//! └── .staging/                              # in-progress writes
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use super::{ObjectListing, StorageBackend, WriteOptions};
use crate::checksum::ChecksumReader;
use crate::{ChunkStoreError, Result};

const STAGING_DIR: &str = ".staging";
const META_DIR: &str = ".meta";

/// Sidecar metadata kept next to each object
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMetadata {
    mimetype: String,
    digest: String,
    #[serde(default)]
    properties: HashMap<String, String>,
}

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Open (and create if needed) a store rooted at `root`
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(STAGING_DIR))?;
        fs::create_dir_all(root.join(META_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of all spaces under the root
    pub fn spaces(&self) -> Result<Vec<String>> {
        let mut spaces = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                spaces.push(name);
            }
        }
        spaces.sort();
        Ok(spaces)
    }

    fn space_dir(&self, space_id: &str) -> Result<PathBuf> {
        if space_id.is_empty()
            || space_id.starts_with('.')
            || space_id.contains(['/', '\\'])
        {
            return Err(ChunkStoreError::InvalidConfiguration(format!(
                "invalid space id: {:?}",
                space_id
            )));
        }
        Ok(self.root.join(space_id))
    }

    fn existing_space_dir(&self, space_id: &str) -> Result<PathBuf> {
        let dir = self.space_dir(space_id)?;
        if !dir.is_dir() {
            return Err(ChunkStoreError::NotFound(format!("space {}", space_id)));
        }
        Ok(dir)
    }

    /// Relative path for an object id, rejecting anything that could escape
    /// the space directory.
    fn object_rel_path(object_id: &str) -> Result<PathBuf> {
        let invalid = || {
            ChunkStoreError::InvalidConfiguration(format!("invalid object id: {:?}", object_id))
        };

        if object_id.is_empty() || object_id.contains('\\') {
            return Err(invalid());
        }
        let rel = PathBuf::from(object_id);
        if object_id
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
            || !rel.components().all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(invalid());
        }
        Ok(rel)
    }

    fn object_path(&self, space_id: &str, object_id: &str) -> Result<PathBuf> {
        Ok(self
            .existing_space_dir(space_id)?
            .join(Self::object_rel_path(object_id)?))
    }

    fn meta_path(&self, space_id: &str, object_id: &str) -> Result<PathBuf> {
        let mut path = self
            .root
            .join(META_DIR)
            .join(space_id)
            .join(Self::object_rel_path(object_id)?);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".json");
        path.set_file_name(name);
        Ok(path)
    }

    fn not_found(space_id: &str, object_id: &str, e: io::Error) -> ChunkStoreError {
        if e.kind() == io::ErrorKind::NotFound {
            ChunkStoreError::NotFound(format!("{}/{}", space_id, object_id))
        } else {
            ChunkStoreError::Io(e)
        }
    }

    /// Remove now-empty directories between `path` and `stop`
    fn prune_empty_parents(path: &Path, stop: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == stop || !dir.starts_with(stop) || fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

impl StorageBackend for FilesystemBackend {
    fn create_space(&self, space_id: &str) -> Result<()> {
        fs::create_dir_all(self.space_dir(space_id)?)?;
        Ok(())
    }

    fn space_exists(&self, space_id: &str) -> Result<bool> {
        Ok(self.space_dir(space_id)?.is_dir())
    }

    fn write(
        &self,
        space_id: &str,
        object_id: &str,
        stream: &mut dyn Read,
        byte_size: u64,
        options: &WriteOptions,
    ) -> Result<String> {
        let target = self.object_path(space_id, object_id)?;

        // Dropping the staging file on any early return removes it
        let mut staging = NamedTempFile::new_in(self.root.join(STAGING_DIR))?;
        let mut reader = ChecksumReader::new(stream.take(byte_size));
        let copied = io::copy(&mut reader, &mut staging)?;
        if copied < byte_size {
            return Err(ChunkStoreError::TruncatedSource {
                chunk_id: object_id.to_string(),
                expected: byte_size,
                actual: copied,
            });
        }

        let digest = reader.hex_digest();
        if let Some(expected) = &options.expected_digest {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(ChunkStoreError::ChecksumMismatch {
                    object_id: object_id.to_string(),
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }

        staging.as_file().sync_all()?;
        create_parent(&target)?;
        // A concurrent delete may prune the parent before the rename lands
        if let Err(e) = staging.persist(&target) {
            if e.error.kind() != io::ErrorKind::NotFound {
                return Err(ChunkStoreError::Io(e.error));
            }
            create_parent(&target)?;
            e.file
                .persist(&target)
                .map_err(|e| ChunkStoreError::Io(e.error))?;
        }

        let meta_path = self.meta_path(space_id, object_id)?;
        let metadata = serde_json::to_vec(&ObjectMetadata {
            mimetype: options.mimetype.clone(),
            digest: digest.clone(),
            properties: options.properties.clone(),
        })?;
        create_parent(&meta_path)?;
        if let Err(e) = fs::write(&meta_path, &metadata) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
            create_parent(&meta_path)?;
            fs::write(&meta_path, &metadata)?;
        }

        debug!(space_id, object_id, bytes = copied, "stored object");
        Ok(digest)
    }

    fn read(&self, space_id: &str, object_id: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.object_path(space_id, object_id)?;
        let file = File::open(&path).map_err(|e| Self::not_found(space_id, object_id, e))?;
        Ok(Box::new(file))
    }

    fn properties(&self, space_id: &str, object_id: &str) -> Result<HashMap<String, String>> {
        let path = self.object_path(space_id, object_id)?;
        if !path.is_file() {
            return Err(ChunkStoreError::NotFound(format!("{}/{}", space_id, object_id)));
        }
        match fs::read(self.meta_path(space_id, object_id)?) {
            Ok(data) => {
                let metadata: ObjectMetadata = serde_json::from_slice(&data)?;
                Ok(metadata.properties)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, space_id: &str, object_id: &str) -> Result<()> {
        let space_dir = self.existing_space_dir(space_id)?;
        let path = self.object_path(space_id, object_id)?;
        if path.is_dir() {
            return Err(ChunkStoreError::NotFound(format!("{}/{}", space_id, object_id)));
        }
        fs::remove_file(&path).map_err(|e| Self::not_found(space_id, object_id, e))?;
        Self::prune_empty_parents(&path, &space_dir);

        let meta_path = self.meta_path(space_id, object_id)?;
        if fs::remove_file(&meta_path).is_ok() {
            Self::prune_empty_parents(&meta_path, &self.root.join(META_DIR));
        }

        debug!(space_id, object_id, "deleted object");
        Ok(())
    }

    fn list(&self, space_id: &str, prefix: Option<&str>) -> Result<ObjectListing<'_>> {
        let space_dir = self.existing_space_dir(space_id)?;
        let prefix = prefix.map(str::to_string);

        let listing = WalkDir::new(&space_dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    // Removed by a concurrent delete while walking
                    Err(e)
                        if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) =>
                    {
                        return None
                    }
                    Err(e) => return Some(Err(ChunkStoreError::from(e))),
                };
                if !entry.file_type().is_file() {
                    return None;
                }
                let rel = entry.path().strip_prefix(&space_dir).ok()?;
                let id = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                match &prefix {
                    Some(p) if !id.starts_with(p.as_str()) => None,
                    _ => Some(Ok(id)),
                }
            });
        Ok(Box::new(listing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::list_all;
    use tempfile::TempDir;

    fn backend() -> (TempDir, FilesystemBackend) {
        let dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(dir.path()).unwrap();
        backend.create_space("photos").unwrap();
        (dir, backend)
    }

    #[test]
    fn test_write_and_read_nested_id() {
        let (_dir, backend) = backend();
        let digest = backend
            .write(
                "photos",
                "2024/trip/a.jpg",
                &mut &b"hello"[..],
                5,
                &WriteOptions::new("image/jpeg"),
            )
            .unwrap();
        assert_eq!(digest, "5d41402abc4b2a76b9719d911017c592");

        let mut data = Vec::new();
        backend
            .read("photos", "2024/trip/a.jpg")
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(list_all(&backend, "photos", None).unwrap(), vec!["2024/trip/a.jpg"]);
    }

    #[test]
    fn test_mismatch_leaves_nothing_behind() {
        let (dir, backend) = backend();
        let options = WriteOptions::default().with_expected_digest(Some("f".repeat(32)));
        let err = backend
            .write("photos", "a.jpg", &mut &b"hello"[..], 5, &options)
            .unwrap_err();
        assert!(matches!(err, ChunkStoreError::ChecksumMismatch { .. }));
        assert!(list_all(&backend, "photos", None).unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_traversal() {
        let (_dir, backend) = backend();
        for id in ["../escape", "/abs", "a//b", "a/./b", ""] {
            assert!(
                backend
                    .write("photos", id, &mut &b"x"[..], 1, &WriteOptions::default())
                    .is_err(),
                "{id:?} accepted"
            );
        }
        assert!(backend.create_space("../up").is_err());
    }

    #[test]
    fn test_delete_prunes_and_reports_missing() {
        let (dir, backend) = backend();
        backend
            .write("photos", "a/b/c.txt", &mut &b"x"[..], 1, &WriteOptions::default())
            .unwrap();
        backend.delete("photos", "a/b/c.txt").unwrap();
        assert!(!dir.path().join("photos/a").exists());
        assert!(matches!(
            backend.delete("photos", "a/b/c.txt"),
            Err(ChunkStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_listing_prefix_and_missing_space() {
        let (_dir, backend) = backend();
        for id in ["b.txt", "a.txt", "a.txt.000000.cs-chunk"] {
            backend
                .write("photos", id, &mut &b"x"[..], 1, &WriteOptions::default())
                .unwrap();
        }
        assert_eq!(
            list_all(&backend, "photos", Some("a.txt")).unwrap(),
            vec!["a.txt", "a.txt.000000.cs-chunk"]
        );
        assert!(matches!(
            backend.list("missing", None).map(|_| ()),
            Err(ChunkStoreError::NotFound(_))
        ));
        assert_eq!(backend.spaces().unwrap(), vec!["photos"]);
    }

    #[test]
    fn test_properties_round_trip() {
        let (_dir, backend) = backend();
        let options = WriteOptions::default().with_property("owner", "ops");
        backend
            .write("photos", "x/y", &mut &b"x"[..], 1, &options)
            .unwrap();
        let props = backend.properties("photos", "x/y").unwrap();
        assert_eq!(props.get("owner").map(String::as_str), Some("ops"));
        assert!(backend.properties("photos", "missing").is_err());
    }
}
