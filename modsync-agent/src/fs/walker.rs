//! Directory traversal for local manifest scans.
//!
//! Hidden entries (dot-prefixed files and directories, which also covers the
//! agent's own cache, pointer and backup files) and in-progress transfer
//! artifacts are never reported.

use crate::fs::is_transfer_artifact;
use crate::fs::metadata::FileStat;
use crate::sync::path::to_key;
use std::io;
use std::path::Path;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// A regular file found under the scan root.
#[derive(Debug, Clone)]
pub struct LocalFile {
    /// Manifest key relative to the root
    pub key: String,
    pub stat: FileStat,
}

impl LocalFile {
    /// Symlinks resolve to their target; links to directories, broken links
    /// and non UTF-8 paths yield `None`.
    fn from_entry(entry: &DirEntry, root: &Path) -> io::Result<Option<Self>> {
        let path = entry.path();
        let Some(key) = path.strip_prefix(root).ok().and_then(to_key) else {
            debug!("Skipping non UTF-8 or unrelated path {}", path.display());
            return Ok(None);
        };

        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(path) {
                Ok(resolved) if resolved.is_file() => resolved,
                _ => return Ok(None),
            }
        } else {
            entry.metadata().map_err(io::Error::from)?
        };

        Ok(Some(Self {
            key,
            stat: FileStat::from_metadata(&metadata),
        }))
    }
}

/// Collect every visible regular file under `root`, ordered by key.
///
/// A missing root yields an empty list.
pub fn scan_files(root: &Path) -> io::Result<Vec<LocalFile>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let entries = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let artifact = is_transfer_artifact(&entry.file_name().to_string_lossy());
        if entry.file_type().is_dir() || artifact {
            continue;
        }
        if let Some(file) = LocalFile::from_entry(&entry, root)? {
            files.push(file);
        }
    }
    Ok(files)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}
