//! File metadata and disk space queries.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Size and modification time of a local file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (fractional seconds since Unix epoch)
    pub modified: f64,
}

impl FileStat {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        Self {
            size: metadata.len(),
            modified,
        }
    }
}

/// Size of `path` if it is an existing regular file.
pub fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

/// Free bytes available to unprivileged users on the filesystem holding `path`.
///
/// Walks up to the nearest existing ancestor, so `path` itself may not exist
/// yet. Returns `None` when the platform offers no way to ask.
pub fn available_space(path: &Path) -> Option<u64> {
    let existing = path.ancestors().find(|p| p.exists())?;
    query_available_space(existing)
}

#[cfg(unix)]
fn query_available_space(path: &Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    Some((stat.fragment_size() as u64).saturating_mul(stat.blocks_available() as u64))
}

#[cfg(not(unix))]
fn query_available_space(_path: &Path) -> Option<u64> {
    None
}
