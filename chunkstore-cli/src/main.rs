//! Chunkstore CLI - store large files as chunks in an object store
//!
//! Usage:
//!   chunkstore chunk <source-dir> <dest> --space <id> [--max-chunk-size 1G]
//!   chunkstore sync <source-dir> <dest> --space <id> [--sync-deletes]
//!   chunkstore list <dest> --space <id> [--raw]
//!   chunkstore restore <dest> --space <id> <content-id> <output>

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use chunkstore_core::storage::list_all;
use chunkstore_core::{
    list_content, parse_chunk_size, read_checksum_list, restore_content, ChunkReport,
    ChunkerConfig, ChunkingSyncEndpoint, FileChunker, FileFilter, FilesystemBackend, ReportState,
    RetryPolicy, RetryingBackend, StorageBackend, SyncConfig, SyncWorkerPool,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chunkstore")]
#[command(about = "Chunkstore - chunked storage of large files", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Retries for transient storage failures
    #[arg(long, global = true)]
    retries: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Store every file of a directory, chunking the large ones
    Chunk {
        /// Source directory to walk
        source: PathBuf,

        /// Destination store root
        dest: PathBuf,

        /// Space to store content in
        #[arg(short, long)]
        space: String,

        /// Largest object size before chunking (digits with K, M or G)
        #[arg(short = 'm', long, default_value = "1G")]
        max_chunk_size: String,

        /// File of name patterns to include, one per line
        #[arg(long)]
        include: Option<PathBuf>,

        /// File of name patterns to exclude, one per line
        #[arg(long)]
        exclude: Option<PathBuf>,

        /// Leave per-chunk digests out of manifests
        #[arg(long)]
        no_chunk_digests: bool,

        /// Skip files larger than the chunk size instead of chunking them
        #[arg(long)]
        ignore_large: bool,

        /// md5sum-style list of expected digests
        #[arg(long)]
        checksums: Option<PathBuf>,

        /// Write a tab-separated report here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Bring a space in line with a local directory
    Sync {
        /// Source directory to sync
        source: PathBuf,

        /// Destination store root
        dest: PathBuf,

        /// Space to sync into
        #[arg(short, long)]
        space: String,

        /// JSON sync configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Largest object size before chunking (overrides config)
        #[arg(short = 'm', long)]
        max_chunk_size: Option<String>,

        /// Store every file whole
        #[arg(long)]
        no_chunking: bool,

        /// Delete remote content whose local file is gone
        #[arg(long)]
        sync_deletes: bool,

        /// Number of worker threads (overrides config)
        #[arg(short = 'j', long)]
        threads: Option<usize>,

        /// Write a tab-separated report here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List content of a space
    List {
        /// Store root
        dest: PathBuf,

        /// Space to list
        #[arg(short, long)]
        space: String,

        /// Show chunk and manifest objects as stored
        #[arg(long)]
        raw: bool,
    },

    /// Write stored content back to a local file
    Restore {
        /// Store root
        dest: PathBuf,

        /// Space holding the content
        #[arg(short, long)]
        space: String,

        /// Content id to restore
        content_id: String,

        /// Output file path
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let retries = cli.retries;
    match cli.command {
        Commands::Chunk {
            source,
            dest,
            space,
            max_chunk_size,
            include,
            exclude,
            no_chunk_digests,
            ignore_large,
            checksums,
            report,
        } => {
            let config = ChunkerConfig::new()
                .with_max_chunk_size(parse_chunk_size(&max_chunk_size)?)
                .with_ignore_large_files(ignore_large)
                .with_chunk_digests(!no_chunk_digests);
            let filter = FileFilter::from_files(include.as_deref(), exclude.as_deref())
                .context("Failed to load filter patterns")?;
            let policy = RetryPolicy::new().with_max_attempts(retries.unwrap_or(2).saturating_add(1));
            chunk_dir(
                &source,
                &dest,
                &space,
                config,
                filter,
                checksums.as_deref(),
                report.as_deref(),
                policy,
            )
        }
        Commands::Sync {
            source,
            dest,
            space,
            config,
            max_chunk_size,
            no_chunking,
            sync_deletes,
            threads,
            report,
        } => {
            let mut sync_config = match config {
                Some(path) => SyncConfig::from_json_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => SyncConfig::new(),
            };
            if let Some(size) = max_chunk_size {
                sync_config.max_chunk_size = parse_chunk_size(&size)?;
            }
            if no_chunking {
                sync_config.chunking_enabled = false;
            }
            if sync_deletes {
                sync_config.sync_deletes = true;
            }
            if let Some(threads) = threads {
                sync_config.worker_threads = threads;
            }
            if let Some(retries) = retries {
                sync_config.retry.max_attempts = retries.saturating_add(1);
            }
            sync_dir(&source, &dest, &space, sync_config, report.as_deref())
        }
        Commands::List { dest, space, raw } => list_space(&dest, &space, raw, retries),
        Commands::Restore {
            dest,
            space,
            content_id,
            output,
        } => restore(&dest, &space, &content_id, &output, retries),
    }
}

/// Source must be a readable directory
fn check_source(source: &Path) -> Result<()> {
    fs::read_dir(source)
        .with_context(|| format!("Cannot read source directory {}", source.display()))?;
    Ok(())
}

/// Open the destination store, creating its root if needed
fn open_store(dest: &Path, policy: RetryPolicy) -> Result<Arc<dyn StorageBackend>> {
    let backend = FilesystemBackend::new(dest)
        .with_context(|| format!("Cannot open destination {}", dest.display()))?;
    debug!("Opened store {:?} with up to {} attempts per call", dest, policy.max_attempts);
    Ok(Arc::new(RetryingBackend::new(backend, policy)))
}

/// Open an existing destination store for reading
fn open_existing_store(dest: &Path, retries: Option<u32>) -> Result<Arc<dyn StorageBackend>> {
    if !dest.is_dir() {
        bail!("Destination {} does not exist", dest.display());
    }
    let policy = RetryPolicy::new().with_max_attempts(retries.unwrap_or(2).saturating_add(1));
    open_store(dest, policy)
}

#[allow(clippy::too_many_arguments)]
fn chunk_dir(
    source: &Path,
    dest: &Path,
    space: &str,
    config: ChunkerConfig,
    filter: FileFilter,
    checksums: Option<&Path>,
    report_path: Option<&Path>,
    policy: RetryPolicy,
) -> Result<()> {
    check_source(source)?;
    let backend = open_store(dest, policy)?;

    let expected = match checksums {
        Some(path) => {
            let digests = read_checksum_list(path)
                .with_context(|| format!("Failed to read checksum list {}", path.display()))?;
            info!("Loaded {} expected checksums from {:?}", digests.len(), path);
            digests
        }
        None => Default::default(),
    };

    println!("Chunking content...");
    println!("  Source:     {}", source.display());
    println!("  Dest:       {}", dest.display());
    println!("  Space:      {}", space);
    println!("  Chunk size: {}", format_size(config.max_chunk_size));
    println!();

    let start = Instant::now();
    let chunker = FileChunker::new(backend.as_ref(), config)?
        .with_filter(filter)
        .with_expected_digests(expected);
    let report = chunker
        .add_content_dir(space, source)
        .context("Failed to chunk directory")?;

    finish(&report, report_path, start)
}

fn sync_dir(
    source: &Path,
    dest: &Path,
    space: &str,
    config: SyncConfig,
    report_path: Option<&Path>,
) -> Result<()> {
    check_source(source)?;
    let backend = open_store(dest, config.retry.clone())?;

    println!("Syncing content...");
    println!("  Source:  {}", source.display());
    println!("  Dest:    {}", dest.display());
    println!("  Space:   {}", space);
    println!(
        "  Chunks:  {}",
        if config.chunking_enabled {
            format_size(config.max_chunk_size)
        } else {
            "disabled".to_string()
        }
    );
    println!("  Deletes: {}", if config.sync_deletes { "yes" } else { "no" });
    println!("  Threads: {}", config.worker_threads);
    println!();

    let start = Instant::now();
    let endpoint = ChunkingSyncEndpoint::new(backend, space, config)?;
    let pool = SyncWorkerPool::new(Arc::new(endpoint))?;
    let report = pool
        .sync_directory(source)
        .context("Failed to sync directory")?;

    finish(&report, report_path, start)
}

/// Print the summary, write the report and fail if any file failed
fn finish(report: &ChunkReport, report_path: Option<&Path>, start: Instant) -> Result<()> {
    if let Some(path) = report_path {
        report
            .write_to(path)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!("Report written to {:?}", path);
    }

    let summary = report.summary();
    println!();
    println!("Done in {:.2}s", start.elapsed().as_secs_f64());
    println!("  Succeeded: {}", summary.succeeded);
    println!("  Ignored:   {}", summary.ignored);
    println!("  Failed:    {}", summary.failed);

    if report.has_failures() {
        for entry in report.entries() {
            if let ReportState::Failed(reason) = &entry.state {
                error!("{}: {}", entry.content_id, reason);
            }
        }
        bail!("{} files failed", summary.failed);
    }
    Ok(())
}

fn list_space(dest: &Path, space: &str, raw: bool, retries: Option<u32>) -> Result<()> {
    let backend = open_existing_store(dest, retries)?;
    if !backend.space_exists(space)? {
        bail!("Space {} does not exist", space);
    }

    if raw {
        for id in list_all(backend.as_ref(), space, None)? {
            println!("{}", id);
        }
        return Ok(());
    }

    for id in list_content(backend.as_ref(), space, None)? {
        println!("{}", id.context("Failed to list space")?);
    }
    Ok(())
}

fn restore(
    dest: &Path,
    space: &str,
    content_id: &str,
    output: &Path,
    retries: Option<u32>,
) -> Result<()> {
    let backend = open_existing_store(dest, retries)?;
    let bytes = restore_content(backend.as_ref(), space, content_id, output)
        .with_context(|| format!("Failed to restore {}", content_id))?;
    println!("Restored {} ({}) to {}", content_id, format_size(bytes), output.display());
    Ok(())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0)
    } else {
        format!("{:.2} GB", bytes as f64 / 1024.0 / 1024.0 / 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_chunk_command() {
        let cli = Cli::try_parse_from([
            "chunkstore",
            "chunk",
            "src",
            "dst",
            "--space",
            "media",
            "--max-chunk-size",
            "100M",
            "--ignore-large",
            "--no-chunk-digests",
        ])
        .unwrap();

        match cli.command {
            Commands::Chunk {
                space,
                max_chunk_size,
                ignore_large,
                no_chunk_digests,
                include,
                ..
            } => {
                assert_eq!(space, "media");
                assert_eq!(max_chunk_size, "100M");
                assert!(ignore_large);
                assert!(no_chunk_digests);
                assert!(include.is_none());
            }
            _ => panic!("expected chunk command"),
        }
    }

    #[test]
    fn test_chunk_defaults() {
        let cli = Cli::try_parse_from(["chunkstore", "chunk", "a", "b", "-s", "x"]).unwrap();
        match cli.command {
            Commands::Chunk { max_chunk_size, .. } => assert_eq!(max_chunk_size, "1G"),
            _ => panic!("expected chunk command"),
        }
        assert!(!cli.verbose);
        assert!(cli.retries.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "chunkstore", "sync", "a", "b", "-s", "x", "--verbose", "--retries", "5", "-j", "8",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.retries, Some(5));
        match cli.command {
            Commands::Sync { threads, .. } => assert_eq!(threads, Some(8)),
            _ => panic!("expected sync command"),
        }
    }

    #[test]
    fn test_missing_space_is_rejected() {
        assert!(Cli::try_parse_from(["chunkstore", "chunk", "a", "b"]).is_err());
        assert!(Cli::try_parse_from(["chunkstore", "frobnicate"]).is_err());
    }

    #[test]
    fn test_unreadable_source_fails_before_processing() {
        let dest = TempDir::new().unwrap();
        let err = chunk_dir(
            Path::new("/no/such/source"),
            dest.path(),
            "space",
            ChunkerConfig::new(),
            FileFilter::new(),
            None,
            None,
            RetryPolicy::none(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Cannot read source directory"));
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_chunk_then_list_and_restore() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        fs::write(source.path().join("big.bin"), &data).unwrap();
        fs::write(source.path().join("small.txt"), b"small").unwrap();

        chunk_dir(
            source.path(),
            dest.path(),
            "space",
            ChunkerConfig::new().with_max_chunk_size(2048),
            FileFilter::new(),
            None,
            None,
            RetryPolicy::none(),
        )
        .unwrap();

        let backend = open_existing_store(dest.path(), Some(0)).unwrap();
        let ids: Vec<String> = list_content(backend.as_ref(), "space", None)
            .unwrap()
            .collect::<chunkstore_core::Result<_>>()
            .unwrap();
        assert_eq!(ids, vec!["big.bin", "small.txt"]);

        let out = dest.path().join("restored.bin");
        restore(dest.path(), "space", "big.bin", &out, Some(0)).unwrap();
        assert_eq!(fs::read(out).unwrap(), data);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.00 GB");
    }
}
