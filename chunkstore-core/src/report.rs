//! Per-file outcome report for bulk runs
//!
//! Purely observational: nothing reads the report back to make decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::Result;

/// Outcome of processing one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportState {
    Success,
    /// Skipped on purpose, e.g. too large with large files ignored
    Ignored,
    Failed(String),
}

impl fmt::Display for ReportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportState::Success => write!(f, "SUCCESS"),
            ReportState::Ignored => write!(f, "IGNORED"),
            ReportState::Failed(reason) => write!(f, "FAILED: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub space_id: String,
    pub content_id: String,
    pub digest: Option<String>,
    pub byte_size: u64,
    pub state: ReportState,
}

/// Counts per outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub succeeded: usize,
    pub ignored: usize,
    pub failed: usize,
}

/// Cumulative report of a bulk run
#[derive(Debug, Clone)]
pub struct ChunkReport {
    started_at: DateTime<Utc>,
    entries: Vec<ReportEntry>,
}

impl Default for ChunkReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record(&mut self, entry: ReportEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// Entry for a content id, if it was processed
    pub fn entry(&self, content_id: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.content_id == content_id)
    }

    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for entry in &self.entries {
            match entry.state {
                ReportState::Success => summary.succeeded += 1,
                ReportState::Ignored => summary.ignored += 1,
                ReportState::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn has_failures(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.state, ReportState::Failed(_)))
    }

    /// Write the report as tab-separated lines
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_tsv(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn write_tsv<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "# chunkstore report, started {}", self.started_at.to_rfc3339())?;
        writeln!(out, "space-id\tcontent-id\tmd5\tsize\tstate")?;
        for entry in &self.entries {
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}",
                entry.space_id,
                entry.content_id,
                entry.digest.as_deref().unwrap_or("-"),
                entry.byte_size,
                entry.state
            )?;
        }
        Ok(())
    }
}
