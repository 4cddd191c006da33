//! Pre-image snapshots of the files a pass is about to delete or overwrite.
//!
//! Layout under the backups directory (default `<root>/.modsync_backups`):
//!
//! ```text
//! 2024-05-01_12-30-00/
//!     backup_manifest.json
//!     mods/a.jar
//!     mods/a-copy.jar      (hard link to mods/a.jar, same content)
//! ```
//!
//! Content that is already stored, in this snapshot or in a retained older
//! one, is hard-linked instead of copied again. The sync root holds a pointer
//! file naming the most recent snapshot.

use crate::fs::hash::hash_file;
use crate::fs::metadata::{available_space, file_size};
use crate::sync::path::resolve;
use crate::transfer::progress::format_bytes;
use crate::{Result, SyncError};
use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const BACKUPS_DIR: &str = ".modsync_backups";
pub const LAST_BACKUP_FILE: &str = ".modsync_last_backup.txt";
pub const SNAPSHOT_MANIFEST: &str = "backup_manifest.json";

const STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const STAMP_LEN: usize = 19;

/// One stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub relative_path: String,
    pub size: u64,
    pub content_hash: String,
}

/// Manifest of one snapshot directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub timestamp: DateTime<Local>,
    pub source_root: PathBuf,
    pub entries: Vec<SnapshotEntry>,
    pub deduped_by_hash: bool,
    /// Affected paths that did not exist when the snapshot was taken;
    /// rollback removes them.
    #[serde(default)]
    pub absent: Vec<String>,
    /// Directory holding this snapshot; not persisted.
    #[serde(skip)]
    pub dir: PathBuf,
}

impl BackupSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Load the manifest of the snapshot stored in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let data = fs::read(dir.join(SNAPSHOT_MANIFEST))?;
        let mut snapshot: BackupSnapshot = serde_json::from_slice(&data)?;
        snapshot.dir = dir.to_path_buf();
        Ok(snapshot)
    }
}

/// Outcome of restoring a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    pub total: usize,
    /// Files the pass had created that were removed again
    pub removed: usize,
    pub failed: Vec<String>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.restored == self.total
    }

    /// `Ok` when every file came back, else `PartialRestoreFailure`.
    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(SyncError::PartialRestoreFailure {
                restored: self.restored,
                total: self.total,
            })
        }
    }
}

/// Vault settings
#[derive(Debug, Clone)]
pub struct VaultOptions {
    /// Backups directory; `None` means `<root>/.modsync_backups`
    pub dir: Option<PathBuf>,
    /// Snapshots kept after each new one
    pub max_backups: usize,
    /// Extra free space required on top of 120% of the affected size
    pub safety_margin: u64,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            dir: None,
            max_backups: 5,
            safety_margin: 100 * 1024 * 1024,
        }
    }
}

/// Owns snapshot storage for sync roots.
#[derive(Debug, Clone, Default)]
pub struct BackupVault {
    options: VaultOptions,
}

impl BackupVault {
    pub fn new(options: VaultOptions) -> Self {
        Self { options }
    }

    pub fn backups_dir(&self, root: &Path) -> PathBuf {
        self.options.dir.clone().unwrap_or_else(|| root.join(BACKUPS_DIR))
    }

    /// Snapshot the files among `affected` that exist under `root`.
    ///
    /// Fails with `InsufficientSpace` before writing anything when the
    /// backups filesystem cannot hold 120% of the affected size plus the
    /// safety margin.
    pub fn snapshot(&self, root: &Path, affected: &[String]) -> Result<BackupSnapshot> {
        let mut present = Vec::new();
        let mut absent = Vec::new();
        for key in affected {
            match file_size(&resolve(root, key)) {
                Some(size) => present.push((key.clone(), size)),
                None => absent.push(key.clone()),
            }
        }

        let total: u64 = present.iter().map(|(_, size)| size).sum();
        let backups_dir = self.backups_dir(root);
        self.check_space(&backups_dir, total)?;

        // Group by content so each distinct file is stored once
        let mut groups: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
        for (key, size) in present {
            let hash = hash_file(&resolve(root, &key))?;
            groups.entry(hash).or_default().push((key, size));
        }

        let known = self.stored_content(&backups_dir);
        let timestamp = Local::now();
        let dir = unique_snapshot_dir(&backups_dir, &timestamp)?;

        let mut entries = Vec::new();
        let mut linked = 0usize;
        for (hash, files) in groups {
            let mut stored: Option<PathBuf> = None;
            for (key, size) in files {
                let dst = resolve(&dir, &key);
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }

                let reused = stored.as_deref().or_else(|| known.get(&hash).map(PathBuf::as_path));
                match reused {
                    Some(existing) if link_or_copy(existing, &dst).is_ok() => linked += 1,
                    _ => {
                        fs::copy(resolve(root, &key), &dst)?;
                    }
                }
                stored.get_or_insert(dst);

                entries.push(SnapshotEntry {
                    relative_path: key,
                    size,
                    content_hash: hash.clone(),
                });
            }
        }

        let snapshot = BackupSnapshot {
            timestamp,
            source_root: root.to_path_buf(),
            entries,
            deduped_by_hash: true,
            absent,
            dir: dir.clone(),
        };
        fs::write(dir.join(SNAPSHOT_MANIFEST), serde_json::to_vec_pretty(&snapshot)?)?;

        if let Err(e) = fs::write(root.join(LAST_BACKUP_FILE), dir.to_string_lossy().as_bytes()) {
            error!("Failed to record last backup pointer: {}", e);
        }

        info!(
            "Created backup {}: {} files, {} ({} deduplicated)",
            dir.display(),
            snapshot.entries.len(),
            format_bytes(total),
            linked
        );

        self.prune(&backups_dir);
        Ok(snapshot)
    }

    fn check_space(&self, backups_dir: &Path, total: u64) -> Result<()> {
        let required = total
            .saturating_add(total / 5)
            .saturating_add(self.options.safety_margin);
        match available_space(backups_dir) {
            Some(available) if available < required => {
                warn!(
                    "Not enough space for backup: need {}, have {}",
                    format_bytes(required),
                    format_bytes(available)
                );
                Err(SyncError::InsufficientSpace { required, available })
            }
            Some(_) => Ok(()),
            None => {
                warn!("Cannot determine free space at {}, continuing", backups_dir.display());
                Ok(())
            }
        }
    }

    /// Content hash → stored file, across all retained snapshots.
    fn stored_content(&self, backups_dir: &Path) -> BTreeMap<String, PathBuf> {
        let mut known = BTreeMap::new();
        for dir in list_snapshots(backups_dir) {
            let Ok(snapshot) = BackupSnapshot::load(&dir) else {
                continue;
            };
            for entry in snapshot.entries {
                let path = resolve(&dir, &entry.relative_path);
                if file_size(&path) == Some(entry.size) {
                    known.entry(entry.content_hash).or_insert(path);
                }
            }
        }
        known
    }

    /// Delete all but the newest `max_backups` snapshots.
    pub fn prune(&self, backups_dir: &Path) -> usize {
        let keep = self.options.max_backups.max(1);
        let snapshots = list_snapshots(backups_dir);
        let excess = snapshots.len().saturating_sub(keep);

        let mut removed = 0;
        for old in snapshots.into_iter().take(excess) {
            match fs::remove_dir_all(&old) {
                Ok(()) => {
                    debug!("Removed old backup {}", old.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove old backup {}: {}", old.display(), e),
            }
        }
        removed
    }

    /// Snapshot named by the root's pointer file, else the newest one in the
    /// backups directory.
    pub fn latest_snapshot(&self, root: &Path) -> Option<PathBuf> {
        if let Ok(pointer) = fs::read_to_string(root.join(LAST_BACKUP_FILE)) {
            let dir = PathBuf::from(pointer.trim());
            if dir.join(SNAPSHOT_MANIFEST).is_file() {
                return Some(dir);
            }
            warn!("Last backup pointer {} is stale", dir.display());
        }
        list_snapshots(&self.backups_dir(root)).pop()
    }

    /// Restore the most recent snapshot of `root`.
    pub fn rollback(&self, root: &Path) -> Result<RestoreReport> {
        let dir = self
            .latest_snapshot(root)
            .ok_or_else(|| SyncError::NoSnapshot(root.display().to_string()))?;
        let snapshot = BackupSnapshot::load(&dir)?;
        Ok(self.restore(root, &snapshot))
    }

    /// Copy every stored file back and remove the files the pass created.
    /// Individual failures are recorded, never fatal.
    pub fn restore(&self, root: &Path, snapshot: &BackupSnapshot) -> RestoreReport {
        if snapshot.source_root.file_name() != root.file_name() {
            warn!(
                "Backup was taken for a different folder ({} vs {})",
                snapshot.source_root.display(),
                root.display()
            );
        }

        let mut report = RestoreReport {
            total: snapshot.entries.len(),
            ..Default::default()
        };

        for entry in &snapshot.entries {
            let src = resolve(&snapshot.dir, &entry.relative_path);
            let dst = resolve(root, &entry.relative_path);
            match restore_file(&src, &dst) {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    error!("Failed to restore {}: {}", entry.relative_path, e);
                    report.failed.push(entry.relative_path.clone());
                }
            }
        }

        for key in &snapshot.absent {
            match fs::remove_file(resolve(root, key)) {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!("Failed to remove {} created by the failed pass: {}", key, e);
                    report.failed.push(key.clone());
                }
            }
        }

        info!(
            "Restored {}/{} files from {} ({} created files removed)",
            report.restored,
            report.total,
            snapshot.dir.display(),
            report.removed
        );
        report
    }
}

fn restore_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    // Break any hard link so the stored copy is never written through
    if dst.exists() {
        fs::remove_file(dst)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("Hard link {} failed ({}), copying", dst.display(), e);
            fs::copy(src, dst).map(|_| ())
        }
    }
}

fn parse_stamp(name: &str) -> Option<NaiveDateTime> {
    let stamp = name.get(..STAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()
}

/// Snapshot directories oldest first, ordered by the timestamp in their name.
/// Directories whose name does not carry a timestamp are ignored.
fn list_snapshots(backups_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(backups_dir) else {
        return Vec::new();
    };

    let mut snapshots: Vec<(NaiveDateTime, String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let stamp = parse_stamp(&name)?;
            Some((stamp, name, e.path()))
        })
        .collect();

    snapshots.sort_by(|a, b| (a.0, suffix_number(&a.1)).cmp(&(b.0, suffix_number(&b.1))));
    snapshots.into_iter().map(|(_, _, path)| path).collect()
}

fn suffix_number(name: &str) -> u32 {
    name.get(STAMP_LEN..)
        .and_then(|s| s.strip_prefix('_'))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn unique_snapshot_dir(backups_dir: &Path, timestamp: &DateTime<Local>) -> Result<PathBuf> {
    let stamp = timestamp.format(STAMP_FORMAT).to_string();
    let mut dir = backups_dir.join(&stamp);
    let mut n = 1;
    while dir.exists() {
        dir = backups_dir.join(format!("{}_{}", stamp, n));
        n += 1;
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
