//! Include/exclude filtering of files by name
//!
//! Pattern files are newline-delimited glob patterns matched against the file
//! name (not the full path). Blank lines and lines starting with `#` are
//! skipped.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::Path;

use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl FileFilter {
    /// A filter accepting every file
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pattern lists. An empty include list admits everything;
    /// exclusion always wins over inclusion.
    pub fn from_patterns<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self> {
        Ok(Self {
            include: build_optional_globset(include)?,
            exclude: build_optional_globset(exclude)?,
        })
    }

    /// Build from optional include/exclude pattern files
    pub fn from_files(include: Option<&Path>, exclude: Option<&Path>) -> Result<Self> {
        let include = match include {
            Some(path) => read_patterns(path)?,
            None => Vec::new(),
        };
        let exclude = match exclude {
            Some(path) => read_patterns(path)?,
            None => Vec::new(),
        };
        Self::from_patterns(&include, &exclude)
    }

    /// Whether a file with this name should be processed
    pub fn accepts(&self, file_name: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(file_name) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(file_name),
            None => true,
        }
    }

    pub fn accepts_path(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.accepts(&name.to_string_lossy()))
            .unwrap_or(false)
    }
}

/// Read a newline-delimited pattern file
pub fn read_patterns(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Build a GlobSet from a slice of pattern strings
pub fn build_globset<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern.as_ref())?);
    }
    Ok(builder.build()?)
}

fn build_optional_globset<S: AsRef<str>>(patterns: &[S]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    build_globset(patterns).map(Some)
}
