//! Chunk-aware sync endpoint
//!
//! Keeps the objects stored for a content id consistent with one local file
//! as it is created, updated or removed. The endpoint chooses chunked or
//! unchunked storage per sync and removes whatever the previous
//! representation left behind: the new representation is written first, then
//! stale objects are deleted.
//!
//! Syncs of the same content id are serialized through [`ContentLocks`];
//! different content ids run fully in parallel on the [`SyncWorkerPool`].

use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::SyncConfig;
use crate::file_chunker::{content_id_for, ensure_readable_dir};
use crate::listing::StoredArtifacts;
use crate::naming::{classify, manifest_id, ObjectKind};
use crate::report::{ChunkReport, ReportEntry, ReportState};
use crate::storage::{list_all, StorageBackend};
use crate::upload::ContentWriter;
use crate::{mimetype_for_path, ChunkStoreError, Result};

/// Registry of content ids currently being synced
#[derive(Debug, Default)]
pub struct ContentLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl ContentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other guard exists for `content_id`, then take one
    pub fn acquire(&self, content_id: &str) -> Result<ContentLockGuard<'_>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| ChunkStoreError::lock_poisoned())?;
        while held.contains(content_id) {
            held = self
                .released
                .wait(held)
                .map_err(|_| ChunkStoreError::lock_poisoned())?;
        }
        held.insert(content_id.to_string());
        Ok(ContentLockGuard {
            locks: self,
            content_id: content_id.to_string(),
        })
    }

    pub fn is_locked(&self, content_id: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(content_id))
            .unwrap_or(false)
    }
}

/// Releases its content id on drop
#[derive(Debug)]
pub struct ContentLockGuard<'a> {
    locks: &'a ContentLocks,
    content_id: String,
}

impl ContentLockGuard<'_> {
    pub fn content_id(&self) -> &str {
        &self.content_id
    }
}

impl Drop for ContentLockGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.content_id);
        }
        self.locks.released.notify_all();
    }
}

/// What a single sync did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    StoredUnchunked { digest: String },
    StoredChunked { chunks: usize, digest: String },
    Deleted,
    /// Nothing to do, e.g. deleting content that is not stored
    Skipped,
}

impl SyncOutcome {
    pub fn digest(&self) -> Option<&str> {
        match self {
            SyncOutcome::StoredUnchunked { digest } | SyncOutcome::StoredChunked { digest, .. } => {
                Some(digest)
            }
            SyncOutcome::Deleted | SyncOutcome::Skipped => None,
        }
    }
}

/// One unit of work for the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// Local file under `root` was created or changed
    Update { root: PathBuf, path: PathBuf },
    /// Local file for this content id disappeared
    Delete { content_id: String },
}

/// Reconciles one backend space with local files
pub struct ChunkingSyncEndpoint {
    backend: Arc<dyn StorageBackend>,
    space_id: String,
    config: SyncConfig,
    locks: ContentLocks,
}

impl ChunkingSyncEndpoint {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        space_id: impl Into<String>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            space_id: space_id.into(),
            config,
            locks: ContentLocks::new(),
        })
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Create the space if it does not exist yet
    pub fn ensure_space(&self) -> Result<()> {
        if !self.backend.space_exists(&self.space_id)? {
            self.backend.create_space(&self.space_id)?;
        }
        Ok(())
    }

    /// Store the current contents of `path` under its content id, replacing
    /// whatever representation was stored before.
    pub fn sync_file(&self, root: &Path, path: &Path) -> Result<SyncOutcome> {
        let content_id = content_id_for(root, path)?;
        let _guard = self.locks.acquire(&content_id)?;

        let existing = StoredArtifacts::discover(self.backend(), &self.space_id, &content_id)?;
        let mut file = File::open(path)?;
        let byte_size = file.metadata()?.len();
        let mimetype = mimetype_for_path(path);

        let writer = ContentWriter::new(self.backend(), &self.space_id, self.config.max_chunk_size)
            .with_chunk_digests(self.config.include_chunk_digests);

        if !self.config.chunking_enabled || !writer.needs_chunking(byte_size) {
            let digest = writer.write_single(&content_id, mimetype, &mut file, byte_size, None)?;

            let mut stale = Vec::new();
            if existing.manifest {
                stale.push(manifest_id(&content_id));
            }
            stale.extend(existing.chunk_ids.iter().cloned());
            self.remove_objects(&content_id, &stale)?;

            debug!(content_id = %content_id, bytes = byte_size, "synced unchunked");
            return Ok(SyncOutcome::StoredUnchunked { digest });
        }

        let manifest = match writer.write_chunked(&content_id, mimetype, file, byte_size, None) {
            Ok(manifest) => manifest,
            Err(e) => {
                // The failed attempt may have overwritten chunks the old
                // manifest points at, so that manifest can no longer be trusted.
                if existing.has_chunk_artifacts() {
                    let mut broken = vec![manifest_id(&content_id)];
                    broken.extend(existing.chunk_ids.iter().cloned());
                    warn!(
                        content_id = %content_id,
                        "removing previous chunked representation after failed re-chunk"
                    );
                    writer.delete_quietly(&broken);
                }
                return Err(e);
            }
        };

        let chunks = manifest.chunk_count();
        let mut stale = Vec::new();
        if existing.plain {
            stale.push(content_id.clone());
        }
        stale.extend(existing.chunk_ids.iter().filter(|id| {
            matches!(classify(id), ObjectKind::Chunk { index, .. } if index as usize >= chunks)
        }).cloned());
        self.remove_objects(&content_id, &stale)?;

        debug!(content_id = %content_id, chunks, bytes = byte_size, "synced chunked");
        Ok(SyncOutcome::StoredChunked {
            chunks,
            digest: manifest.source_digest().to_string(),
        })
    }

    /// Remove every object stored for `content_id`. A no-op unless delete
    /// syncing is enabled.
    pub fn sync_deleted(&self, content_id: &str) -> Result<SyncOutcome> {
        if !self.config.sync_deletes {
            debug!(content_id, "delete sync disabled, keeping remote content");
            return Ok(SyncOutcome::Skipped);
        }

        let _guard = self.locks.acquire(content_id)?;
        let existing = StoredArtifacts::discover(self.backend(), &self.space_id, content_id)?;
        if existing.is_absent() {
            return Ok(SyncOutcome::Skipped);
        }

        // Manifest before chunks so a listing never shows content whose
        // chunks are already gone
        let mut doomed = Vec::new();
        if existing.plain {
            doomed.push(content_id.to_string());
        }
        if existing.manifest {
            doomed.push(manifest_id(content_id));
        }
        doomed.extend(existing.chunk_ids.iter().cloned());
        self.remove_objects(content_id, &doomed)?;

        info!(content_id, objects = doomed.len(), "deleted remote content");
        Ok(SyncOutcome::Deleted)
    }

    /// Run one request, turning the result into a report entry
    pub fn process(&self, request: &SyncRequest) -> ReportEntry {
        let (content_id, byte_size, result) = match request {
            SyncRequest::Update { root, path } => {
                let content_id = match content_id_for(root, path) {
                    Ok(id) | Err(ChunkStoreError::ReservedName(id)) => id,
                    Err(_) => path.display().to_string(),
                };
                let byte_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                (content_id, byte_size, self.sync_file(root, path))
            }
            SyncRequest::Delete { content_id } => {
                (content_id.clone(), 0, self.sync_deleted(content_id))
            }
        };

        let (digest, state) = match result {
            Ok(SyncOutcome::Skipped) => (None, ReportState::Ignored),
            Ok(outcome) => (outcome.digest().map(str::to_string), ReportState::Success),
            Err(e) => {
                error!(
                    space_id = %self.space_id,
                    content_id = %content_id,
                    "Sync failed: {}",
                    e
                );
                (None, ReportState::Failed(e.to_string()))
            }
        };

        ReportEntry {
            space_id: self.space_id.clone(),
            content_id,
            digest,
            byte_size,
            state,
        }
    }

    /// Delete objects, treating already-missing ones as deleted
    fn remove_objects(&self, content_id: &str, object_ids: &[String]) -> Result<()> {
        for object_id in object_ids {
            match self.backend.delete(&self.space_id, object_id) {
                Ok(()) => debug!(content_id, object_id = %object_id, "removed stale object"),
                Err(ChunkStoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Fixed-size pool of workers driving [`ChunkingSyncEndpoint`]
pub struct SyncWorkerPool {
    endpoint: Arc<ChunkingSyncEndpoint>,
    pool: rayon::ThreadPool,
    stop: Arc<AtomicBool>,
}

impl SyncWorkerPool {
    pub fn new(endpoint: Arc<ChunkingSyncEndpoint>) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(endpoint.config().worker_threads)
            .thread_name(|i| format!("sync-worker-{}", i))
            .build()
            .map_err(|e| ChunkStoreError::InvalidConfiguration(e.to_string()))?;
        Ok(Self {
            endpoint,
            pool,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn endpoint(&self) -> &ChunkingSyncEndpoint {
        &self.endpoint
    }

    /// Setting the returned flag stops the pool from starting further files
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run all requests in parallel; entries come back in request order.
    /// Requests not started before a stop are left out of the report.
    pub fn sync_all(&self, requests: &[SyncRequest]) -> ChunkReport {
        let endpoint = &self.endpoint;
        let stop = &self.stop;
        let entries: Vec<Option<ReportEntry>> = self.pool.install(|| {
            requests
                .par_iter()
                .map(|request| {
                    if stop.load(Ordering::SeqCst) {
                        return None;
                    }
                    Some(endpoint.process(request))
                })
                .collect()
        });

        let mut report = ChunkReport::new();
        for entry in entries.into_iter().flatten() {
            report.record(entry);
        }
        if stop.load(Ordering::SeqCst) {
            warn!("Stop requested, {} of {} requests processed", report.entries().len(), requests.len());
        }
        report
    }

    /// Sync every file under `root`. With delete syncing enabled, content
    /// ids stored remotely but missing locally are deleted as well.
    pub fn sync_directory(&self, root: &Path) -> Result<ChunkReport> {
        ensure_readable_dir(root)?;
        self.endpoint.ensure_space()?;

        let mut requests = Vec::new();
        let mut local_ids = HashSet::new();
        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(id) = content_id_for(root, entry.path()) {
                local_ids.insert(id);
            }
            requests.push(SyncRequest::Update {
                root: root.to_path_buf(),
                path: entry.into_path(),
            });
        }

        if self.endpoint.config().sync_deletes {
            // Raw listing so chunk sets left without a manifest are swept too
            let endpoint = &self.endpoint;
            let stored: BTreeSet<String> = list_all(endpoint.backend(), endpoint.space_id(), None)?
                .iter()
                .map(|object_id| classify(object_id).content_id().to_string())
                .collect();
            for content_id in stored {
                if !local_ids.contains(&content_id) {
                    requests.push(SyncRequest::Delete { content_id });
                }
            }
        }

        info!(
            "Syncing {} requests from {:?} into space {} with {} workers",
            requests.len(),
            root,
            self.endpoint.space_id(),
            self.endpoint.config().worker_threads
        );
        let report = self.sync_all(&requests);
        let summary = report.summary();
        info!(
            "Sync finished: {} succeeded, {} skipped, {} failed",
            summary.succeeded, summary.ignored, summary.failed
        );
        Ok(report)
    }
}
