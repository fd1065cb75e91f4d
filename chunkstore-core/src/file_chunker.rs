//! Bulk ingestion of a directory tree
//!
//! Walks every file under a root and stores each one in a space: small files
//! as single objects, large files as chunk sets with a manifest. Each file is
//! handled independently; a failure is logged and recorded in the report and
//! the walk carries on.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::config::ChunkerConfig;
use crate::filter::FileFilter;
use crate::naming::is_chunk_artifact;
use crate::report::{ChunkReport, ReportEntry, ReportState};
use crate::storage::StorageBackend;
use crate::upload::ContentWriter;
use crate::{mimetype_for_path, ChunkStoreError, Result};

/// Content id of `path` relative to `root`: `/`-separated, no leading
/// separator. Paths whose id would read as a chunk or manifest are refused.
pub fn content_id_for(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        ChunkStoreError::InvalidConfiguration(format!(
            "{} is not under {}",
            path.display(),
            root.display()
        ))
    })?;

    let id = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().replace('\\', "/"))
        .collect::<Vec<_>>()
        .join("/");
    let id = id.trim_start_matches('/').to_string();

    if id.is_empty() {
        return Err(ChunkStoreError::InvalidConfiguration(format!(
            "{} has no path below {}",
            path.display(),
            root.display()
        )));
    }
    if is_chunk_artifact(&id) {
        return Err(ChunkStoreError::ReservedName(id));
    }
    Ok(id)
}

/// Fail early if `dir` is not a readable directory
pub fn ensure_readable_dir(dir: &Path) -> Result<()> {
    let metadata = fs::metadata(dir)?;
    if !metadata.is_dir() {
        return Err(ChunkStoreError::InvalidConfiguration(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    fs::read_dir(dir)?;
    Ok(())
}

/// Stores files from local directories into a backend space
pub struct FileChunker<'a> {
    backend: &'a dyn StorageBackend,
    config: ChunkerConfig,
    filter: FileFilter,
    expected_digests: HashMap<String, String>,
    stop: Arc<AtomicBool>,
}

impl<'a> FileChunker<'a> {
    pub fn new(backend: &'a dyn StorageBackend, config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            filter: FileFilter::new(),
            expected_digests: HashMap::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_filter(mut self, filter: FileFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Expected whole-file digests keyed by content id
    pub fn with_expected_digests(mut self, digests: HashMap<String, String>) -> Self {
        self.expected_digests = digests;
        self
    }

    /// Setting the returned flag stops the run before the next file
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Store every accepted file under `root` into `space_id`
    pub fn add_content_dir(&self, space_id: &str, root: &Path) -> Result<ChunkReport> {
        ensure_readable_dir(root)?;
        if !self.backend.space_exists(space_id)? {
            self.backend.create_space(space_id)?;
        }

        info!("Chunking directory {:?} into space {}", root, space_id);
        let mut report = ChunkReport::new();

        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            if self.stop.load(Ordering::SeqCst) {
                warn!("Stop requested, ending run early");
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.filter.accepts_path(entry.path()) {
                continue;
            }

            report.record(self.add_file(space_id, root, entry.path()));
        }

        let summary = report.summary();
        info!(
            "Processed {} files: {} stored, {} ignored, {} failed",
            report.entries().len(),
            summary.succeeded,
            summary.ignored,
            summary.failed
        );
        Ok(report)
    }

    /// Store one file, turning any failure into a report entry
    pub fn add_file(&self, space_id: &str, root: &Path, path: &Path) -> ReportEntry {
        let content_id = match content_id_for(root, path) {
            Ok(id) => id,
            Err(e) => {
                error!("Cannot derive content id for {:?}: {}", path, e);
                let content_id = match &e {
                    ChunkStoreError::ReservedName(id) => id.clone(),
                    _ => path.display().to_string(),
                };
                return ReportEntry {
                    space_id: space_id.to_string(),
                    content_id,
                    digest: None,
                    byte_size: 0,
                    state: ReportState::Failed(e.to_string()),
                };
            }
        };

        let byte_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let (digest, state) = match self.store_file(space_id, &content_id, path) {
            Ok(Some(digest)) => (Some(digest), ReportState::Success),
            Ok(None) => (None, ReportState::Ignored),
            Err(e) => {
                error!(
                    space_id,
                    content_id = %content_id,
                    path = %path.display(),
                    "Failed to store file: {}",
                    e
                );
                (None, ReportState::Failed(e.to_string()))
            }
        };

        ReportEntry {
            space_id: space_id.to_string(),
            content_id,
            digest,
            byte_size,
            state,
        }
    }

    /// Returns the stored digest, or `None` if the file was ignored
    fn store_file(&self, space_id: &str, content_id: &str, path: &Path) -> Result<Option<String>> {
        let mut file = File::open(path)?;
        let byte_size = file.metadata()?.len();
        let mimetype = mimetype_for_path(path);
        let expected = self.expected_digests.get(content_id).map(String::as_str);

        let writer = ContentWriter::new(self.backend, space_id, self.config.max_chunk_size)
            .with_chunk_digests(self.config.include_chunk_digests);

        if !writer.needs_chunking(byte_size) {
            let digest = writer.write_single(content_id, mimetype, &mut file, byte_size, expected)?;
            return Ok(Some(digest));
        }

        if self.config.ignore_large_files {
            info!(
                content_id,
                bytes = byte_size,
                "Ignoring file larger than {} bytes",
                self.config.max_chunk_size
            );
            return Ok(None);
        }

        let manifest = writer.write_chunked(content_id, mimetype, file, byte_size, expected)?;
        Ok(Some(manifest.source_digest().to_string()))
    }
}
