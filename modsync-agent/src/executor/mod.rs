//! Sync pass orchestration.
//!
//! One pass walks `Idle → ManifestFetched → Diffed → Snapshotting → Deleting
//! → Fetching → Verifying → Committed`. A failure or cancellation once the
//! filesystem has been touched goes through `RollingBack → Failed` instead,
//! restoring the snapshot taken for this pass. Errors before the first
//! mutation are returned as `Err` and need no rollback.
//!
//! Fetches run in one bounded pool per size tier; the pools run concurrently
//! and the pass waits for all of them to drain.

use crate::backup::{BackupSnapshot, BackupVault, RestoreReport};
use crate::cancel::CancelHandle;
use crate::config::Config;
use crate::fs::hash::verify_file;
use crate::fs::metadata::file_size;
use crate::sync::diff::{diff_with, DiffOptions, DiffResult};
use crate::sync::manifest::{Manifest, ManifestService};
use crate::sync::path::resolve;
use crate::sync::LocalHashCache;
use crate::transfer::progress::{format_bytes, format_duration, EventSink, SyncEvent};
use crate::transfer::speed::measure_connection;
use crate::transfer::strategy::{FileDistribution, SizeTier, StrategyProfile};
use crate::transfer::{RemoteClient, TransferOutcome, TransferTask, Transporter};
use crate::{Result, SyncError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a pass currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Idle,
    ManifestFetched,
    Diffed,
    Snapshotting,
    Deleting,
    Fetching,
    Verifying,
    Committed,
    RollingBack,
    Failed,
}

/// Terminal classification of a pass that got past the read-only phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Every change applied and verified; hash cache persisted.
    Completed,
    /// Diff only; nothing touched.
    DryRun,
    /// Stopped on request; anything already changed was restored.
    Cancelled,
    /// A file failed; the pass was undone completely.
    RolledBack,
    /// Failed or cancelled, and the undo itself was incomplete (or there was
    /// no snapshot to undo from).
    RollbackIncomplete,
}

/// Result of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub deleted_count: usize,
    pub downloaded_count: usize,
    pub total_bytes_downloaded: u64,
    pub unchanged_count: usize,
    /// Fetch candidates that were already correct on disk
    pub skipped_count: usize,
    pub diff: DiffResult,
    pub profile: Option<String>,
    pub duration: Duration,
    pub restore: Option<RestoreReport>,
    pub error: Option<String>,
}

impl SyncReport {
    fn new(outcome: SyncOutcome, diff: DiffResult) -> Self {
        Self {
            outcome,
            deleted_count: 0,
            downloaded_count: 0,
            total_bytes_downloaded: 0,
            unchanged_count: diff.unchanged.len(),
            skipped_count: 0,
            diff,
            profile: None,
            duration: Duration::ZERO,
            restore: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SyncOutcome::Completed | SyncOutcome::DryRun)
    }
}

/// Why the mutating phase stopped.
enum Abort {
    Cancelled,
    Failed(SyncError),
}

/// Per-file results of the fetch phase.
#[derive(Default)]
struct FetchSummary {
    downloaded: usize,
    skipped: usize,
    bytes: u64,
    /// key → verified hash (None for entries the server did not hash)
    hashes: BTreeMap<String, Option<String>>,
}

/// Drives sync passes against one file server.
pub struct SyncOrchestrator {
    config: Config,
    client: RemoteClient,
    manifests: ManifestService,
    vault: BackupVault,
    cancel: CancelHandle,
    state: Mutex<PassState>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(config: Config) -> Result<Self> {
        let client = RemoteClient::new(
            &config.server.url,
            config.request_timeout(),
            config.stream_timeout(),
        )?;
        let manifests = ManifestService::new(
            client.clone(),
            config.manifest_ttl(),
            config.sync.hash_size_limit,
        );
        let vault = BackupVault::new(config.vault_options());
        Ok(Self {
            config,
            client,
            manifests,
            vault,
            cancel: CancelHandle::new(),
            state: Mutex::new(PassState::Idle),
            pass_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manifests(&self) -> &ManifestService {
        &self.manifests
    }

    pub fn vault(&self) -> &BackupVault {
        &self.vault
    }

    /// Handle that cancels whichever pass is running.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Request cooperative cancellation of the pass in flight.
    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn state(&self) -> PassState {
        self.state.lock().map(|s| *s).unwrap_or(PassState::Failed)
    }

    fn set_state(&self, next: PassState) {
        if let Ok(mut state) = self.state.lock() {
            debug!("Pass state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Restore the most recent snapshot of `root` outside of any pass.
    pub async fn rollback(&self, root: &Path) -> Result<RestoreReport> {
        let _pass = self.pass_lock.lock().await;
        let vault = self.vault.clone();
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || vault.rollback(&root))
            .await
            .map_err(join_error)?
    }

    /// Run one pass over `root`. Passes on the same orchestrator are serialized.
    pub async fn sync(&self, root: &Path, dry_run: bool, events: EventSink) -> Result<SyncReport> {
        let _pass = self.pass_lock.lock().await;
        let token = self.cancel.reset();
        let started = Instant::now();
        self.set_state(PassState::Idle);
        info!("Starting sync of {} (dry run: {})", root.display(), dry_run);

        let prepared = match self.prepare(root).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Sync aborted before any change: {}", e);
                self.set_state(PassState::Failed);
                events.emit(SyncEvent::PassFailed {
                    error: e.to_string(),
                    cancelled: false,
                });
                return Err(e);
            }
        };
        let Prepared { remote, local, cache, diff } = prepared;

        info!(
            "Diff: {} to delete, {} to fetch ({}), {} unchanged",
            diff.to_delete.len(),
            diff.to_fetch.len(),
            format_bytes(diff.fetch_bytes(&remote)),
            diff.unchanged.len()
        );

        if dry_run {
            let mut report = SyncReport::new(SyncOutcome::DryRun, diff);
            report.duration = started.elapsed();
            return Ok(report);
        }

        if token.is_cancelled() {
            info!("Sync cancelled before any change");
            self.set_state(PassState::Failed);
            events.emit(SyncEvent::PassFailed {
                error: SyncError::Cancelled.to_string(),
                cancelled: true,
            });
            let mut report = SyncReport::new(SyncOutcome::Cancelled, diff);
            report.duration = started.elapsed();
            return Ok(report);
        }

        if diff.is_noop() {
            self.commit_cache(root, &cache, &remote, &local, &diff, &BTreeMap::new()).await;
            self.set_state(PassState::Committed);
            events.emit(SyncEvent::PassCompleted {
                deleted: 0,
                downloaded: 0,
                bytes: 0,
            });
            info!("Already in sync");
            let mut report = SyncReport::new(SyncOutcome::Completed, diff);
            report.duration = started.elapsed();
            return Ok(report);
        }

        let profile = Arc::new(self.select_profile(&remote, &diff).await);
        info!(
            "Using strategy {} ({} workers, tiers {:?})",
            profile.name, profile.max_concurrent_workers, profile.tier_workers
        );

        tokio::fs::create_dir_all(root).await?;
        let snapshot = if self.config.backup.enabled {
            self.set_state(PassState::Snapshotting);
            match self.snapshot(root, &diff).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    error!("Backup failed, nothing was changed: {}", e);
                    self.set_state(PassState::Failed);
                    events.emit(SyncEvent::PassFailed {
                        error: e.to_string(),
                        cancelled: false,
                    });
                    return Err(e);
                }
            }
        } else {
            None
        };

        events.emit(SyncEvent::PassStarted {
            total_bytes: diff.fetch_bytes(&remote),
            files_to_fetch: diff.to_fetch.len(),
            files_to_delete: diff.to_delete.len(),
        });

        let mut report = SyncReport::new(SyncOutcome::Completed, diff.clone());
        report.profile = Some(profile.name.clone());

        let applied = self
            .apply(root, &remote, &diff, profile, &token, &events, &mut report)
            .await;

        match applied {
            Ok(summary) => {
                self.commit_cache(root, &cache, &remote, &local, &diff, &summary.hashes)
                    .await;
                self.set_state(PassState::Committed);
                events.emit(SyncEvent::PassCompleted {
                    deleted: report.deleted_count,
                    downloaded: report.downloaded_count,
                    bytes: report.total_bytes_downloaded,
                });
                report.duration = started.elapsed();
                info!(
                    "Sync completed: {} deleted, {} downloaded ({}), {} skipped, {} unchanged \
                     in {}",
                    report.deleted_count,
                    report.downloaded_count,
                    format_bytes(report.total_bytes_downloaded),
                    report.skipped_count,
                    report.unchanged_count,
                    format_duration(report.duration.as_secs())
                );
                Ok(report)
            }
            Err(abort) => {
                let (cancelled, message) = match &abort {
                    Abort::Cancelled => (true, SyncError::Cancelled.to_string()),
                    Abort::Failed(e) => (false, e.to_string()),
                };
                if cancelled {
                    warn!("Sync cancelled, rolling back");
                } else {
                    error!("Sync failed, rolling back: {}", message);
                }

                self.set_state(PassState::RollingBack);
                let restore = self.roll_back(root, snapshot).await;
                self.set_state(PassState::Failed);

                report.outcome = abort_outcome(&abort, restore.as_ref());
                report.restore = restore;
                report.error = Some(message.clone());
                report.duration = started.elapsed();
                events.emit(SyncEvent::PassFailed {
                    error: message,
                    cancelled,
                });
                Ok(report)
            }
        }
    }

    async fn prepare(&self, root: &Path) -> Result<Prepared> {
        let remote = self.manifests.fetch_remote_manifest().await?;
        self.set_state(PassState::ManifestFetched);

        let mut local = self.manifests.scan_local(root).await?;
        let cache_root = root.to_path_buf();
        let cache = tokio::task::spawn_blocking(move || LocalHashCache::load(&cache_root))
            .await
            .map_err(join_error)?;
        self.manifests
            .hydrate_hashes(root, &mut local, &remote, &cache)
            .await?;

        let options = DiffOptions {
            delete_unmatched: self.config.sync.delete_unmatched,
        };
        let diff = diff_with(&local, &remote, &cache, options);
        self.set_state(PassState::Diffed);

        Ok(Prepared { remote, local, cache, diff })
    }

    async fn select_profile(&self, remote: &Manifest, diff: &DiffResult) -> StrategyProfile {
        let quality = match self.config.strategy.connection_quality {
            Some(quality) => quality,
            None => measure_connection(&self.client, &self.config.strategy.probe_paths).await,
        };
        let sizes = diff.to_fetch.iter().filter_map(|k| remote.get(k)).map(|r| r.size);
        let distribution = FileDistribution::from_sizes(sizes);
        StrategyProfile::select(
            self.config.strategy.mode,
            quality,
            &distribution,
            self.config.custom_profile_params(),
        )
    }

    async fn snapshot(&self, root: &Path, diff: &DiffResult) -> Result<BackupSnapshot> {
        let affected: Vec<String> = diff.to_delete.iter().chain(&diff.to_fetch).cloned().collect();
        let vault = self.vault.clone();
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || vault.snapshot(&root, &affected))
            .await
            .map_err(join_error)?
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        root: &Path,
        remote: &Manifest,
        diff: &DiffResult,
        profile: Arc<StrategyProfile>,
        token: &CancellationToken,
        events: &EventSink,
        report: &mut SyncReport,
    ) -> std::result::Result<FetchSummary, Abort> {
        self.set_state(PassState::Deleting);
        report.deleted_count = self.delete_all(root, diff, token, events).await?;

        self.set_state(PassState::Fetching);
        let summary = self.fetch_all(root, remote, diff, profile, token, events).await?;
        report.downloaded_count = summary.downloaded;
        report.skipped_count = summary.skipped;
        report.total_bytes_downloaded = summary.bytes;

        self.set_state(PassState::Verifying);
        self.verify_all(root, remote, diff).await?;
        if token.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        Ok(summary)
    }

    /// Delete every `to_delete` path; all of them finish before any fetch.
    async fn delete_all(
        &self,
        root: &Path,
        diff: &DiffResult,
        token: &CancellationToken,
        events: &EventSink,
    ) -> std::result::Result<usize, Abort> {
        let mut deleted = 0;
        for key in &diff.to_delete {
            if token.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            match tokio::fs::remove_file(resolve(root, key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => debug!("{} already gone", key),
                Err(e) => {
                    error!("Failed to delete {}: {}", key, e);
                    return Err(Abort::Failed(SyncError::Io(e)));
                }
            }
            info!("Deleted {}", key);
            events.emit(SyncEvent::FileDeleted { path: key.clone() });
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Fetch every `to_fetch` entry through per-tier pools.
    async fn fetch_all(
        &self,
        root: &Path,
        remote: &Manifest,
        diff: &DiffResult,
        profile: Arc<StrategyProfile>,
        token: &CancellationToken,
        events: &EventSink,
    ) -> std::result::Result<FetchSummary, Abort> {
        // Workers stop on user cancel and on the first failed file
        let abort = token.child_token();
        let transporter = Transporter::new(
            self.client.clone(),
            Arc::clone(&profile),
            abort.clone(),
            events.clone(),
        )
        .with_pass_counter(Arc::new(AtomicU64::new(0)));

        let pools: HashMap<SizeTier, Arc<Semaphore>> = SizeTier::ALL
            .iter()
            .map(|&tier| (tier, Arc::new(Semaphore::new(profile.workers_for(tier)))))
            .collect();

        let mut tasks: Vec<TransferTask> = diff
            .to_fetch
            .iter()
            .filter_map(|key| remote.get(key))
            .map(|record| TransferTask::new(root, record))
            .collect();
        tasks.sort_by_key(|t| t.expected_size);

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let pool = Arc::clone(&pools[&SizeTier::of(task.expected_size)]);
            let transporter = transporter.clone();
            let abort = abort.clone();

            handles.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    permit = pool.acquire_owned() => permit,
                    _ = abort.cancelled() => {
                        return (task.relative_path, Ok(TransferOutcome::Cancelled));
                    }
                };
                let Ok(_permit) = permit else {
                    return (task.relative_path, Ok(TransferOutcome::Cancelled));
                };

                let result = transporter.transfer(&task).await;
                if let Err(e) = &result {
                    error!("Failed to fetch {}: {}", task.relative_path, e);
                    abort.cancel();
                }
                (task.relative_path, result)
            }));
        }

        let mut summary = FetchSummary::default();
        let mut failure: Option<SyncError> = None;
        let mut cancelled = false;

        for handle in handles {
            match handle.await {
                Ok((key, Ok(TransferOutcome::Downloaded { bytes, hash, mode, attempts }))) => {
                    info!(
                        "Downloaded {} ({}, {:?}, {} attempt(s))",
                        key,
                        format_bytes(bytes),
                        mode,
                        attempts
                    );
                    summary.downloaded += 1;
                    summary.bytes += bytes;
                    summary.hashes.insert(key, hash);
                }
                Ok((key, Ok(TransferOutcome::AlreadyComplete { hash }))) => {
                    summary.skipped += 1;
                    summary.hashes.insert(key, hash);
                }
                Ok((_, Ok(TransferOutcome::Cancelled))) => cancelled = true,
                Ok((_, Err(e))) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!("Fetch task panicked: {}", e);
                    failure.get_or_insert(join_error(e));
                }
            }
        }

        if token.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        if let Some(e) = failure {
            return Err(Abort::Failed(e));
        }
        if cancelled {
            return Err(Abort::Cancelled);
        }
        Ok(summary)
    }

    /// Re-check every fetched destination against the remote manifest.
    async fn verify_all(
        &self,
        root: &Path,
        remote: &Manifest,
        diff: &DiffResult,
    ) -> std::result::Result<(), Abort> {
        let checks: Vec<(String, PathBuf, u64, Option<String>)> = diff
            .to_fetch
            .iter()
            .filter_map(|key| remote.get(key))
            .map(|r| {
                let path = resolve(root, &r.relative_path);
                (r.relative_path.clone(), path, r.size, r.content_hash.clone())
            })
            .collect();

        let failed = tokio::task::spawn_blocking(move || {
            checks
                .into_iter()
                .find(|(_, path, size, hash)| {
                    file_size(path) != Some(*size)
                        || hash.as_deref().is_some_and(|h| !verify_file(path, h))
                })
                .map(|(key, ..)| key)
        })
        .await
        .map_err(|e| Abort::Failed(join_error(e)))?;

        match failed {
            Some(key) => Err(Abort::Failed(SyncError::integrity(
                key,
                "destination changed after download",
            ))),
            None => Ok(()),
        }
    }

    async fn roll_back(
        &self,
        root: &Path,
        snapshot: Option<BackupSnapshot>,
    ) -> Option<RestoreReport> {
        let Some(snapshot) = snapshot else {
            warn!("Backups are disabled, nothing to roll back to");
            return None;
        };
        let vault = self.vault.clone();
        let root = root.to_path_buf();
        match tokio::task::spawn_blocking(move || vault.restore(&root, &snapshot)).await {
            Ok(report) => {
                if !report.is_complete() {
                    error!(
                        "Rollback incomplete: {}/{} files restored, failed: {:?}",
                        report.restored, report.total, report.failed
                    );
                }
                Some(report)
            }
            Err(e) => {
                error!("Rollback task panicked: {}", e);
                None
            }
        }
    }

    async fn commit_cache(
        &self,
        root: &Path,
        previous: &LocalHashCache,
        remote: &Manifest,
        local: &Manifest,
        diff: &DiffResult,
        fetched: &BTreeMap<String, Option<String>>,
    ) {
        let next = next_cache(previous, remote, local, diff, fetched);
        if &next == previous {
            return;
        }
        let root = root.to_path_buf();
        match tokio::task::spawn_blocking(move || next.save(&root)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to save hash cache: {}", e),
            Err(e) => warn!("Hash cache task panicked: {}", e),
        }
    }
}

struct Prepared {
    remote: Arc<Manifest>,
    local: Manifest,
    cache: LocalHashCache,
    diff: DiffResult,
}

/// Cache contents after a fully verified pass: verified hashes of fetched
/// files, fresh hashes of unchanged files that match the remote, and nothing
/// for paths that no longer exist.
fn next_cache(
    previous: &LocalHashCache,
    remote: &Manifest,
    local: &Manifest,
    diff: &DiffResult,
    fetched: &BTreeMap<String, Option<String>>,
) -> LocalHashCache {
    let mut cache = previous.clone();
    cache.retain(|key| remote.contains(key) && !diff.to_delete.contains(key));

    for key in &diff.unchanged {
        let fresh = local.get(key).and_then(|r| r.content_hash.as_deref());
        let expected = remote.get(key).and_then(|r| r.content_hash.as_deref());
        if let (Some(fresh), Some(expected)) = (fresh, expected) {
            if fresh.eq_ignore_ascii_case(expected) {
                cache.insert(key.clone(), fresh);
            }
        }
    }

    for (key, hash) in fetched {
        match hash {
            Some(hash) => cache.insert(key.clone(), hash.clone()),
            None => {
                cache.remove(key);
            }
        }
    }
    cache
}

/// An incomplete restore outranks the reason the pass stopped.
fn abort_outcome(abort: &Abort, restore: Option<&RestoreReport>) -> SyncOutcome {
    match (abort, restore) {
        (_, Some(r)) if !r.is_complete() => SyncOutcome::RollbackIncomplete,
        (_, None) => SyncOutcome::RollbackIncomplete,
        (Abort::Cancelled, Some(_)) => SyncOutcome::Cancelled,
        (Abort::Failed(_), Some(_)) => SyncOutcome::RolledBack,
    }
}

fn join_error(e: tokio::task::JoinError) -> SyncError {
    SyncError::Io(io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::manifest::FileRecord;
    use std::collections::BTreeSet;

    fn rec(path: &str, size: u64, hash: Option<&str>) -> FileRecord {
        FileRecord {
            relative_path: path.to_string(),
            size,
            content_hash: hash.map(str::to_string),
            modified_time: 0.0,
        }
    }

    fn set(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_next_cache() {
        let h1 = "1".repeat(64);
        let h2 = "2".repeat(64);
        let h3 = "3".repeat(64);
        let remote = Manifest::from_records([
            rec("a.jar", 1, Some(&h1)),
            rec("b.jar", 1, Some(&h2)),
            rec("c.jar", 1, Some(&h3)),
            rec("big.bin", 9, None),
        ]);
        let local = Manifest::from_records([rec("a.jar", 1, Some(&h1)), rec("c.jar", 1, None)]);

        let mut previous = LocalHashCache::new();
        previous.insert("c.jar", h3.clone());
        previous.insert("gone.jar", "f".repeat(64));

        let diff = DiffResult {
            to_delete: set(&["gone.jar"]),
            to_fetch: set(&["b.jar", "big.bin"]),
            unchanged: set(&["a.jar", "c.jar"]),
        };
        let mut fetched = BTreeMap::new();
        fetched.insert("b.jar".to_string(), Some(h2.clone()));
        fetched.insert("big.bin".to_string(), None);

        let next = next_cache(&previous, &remote, &local, &diff, &fetched);
        assert_eq!(next.get("a.jar"), Some(h1.as_str()));
        assert_eq!(next.get("b.jar"), Some(h2.as_str()));
        assert_eq!(next.get("c.jar"), Some(h3.as_str()));
        assert_eq!(next.get("big.bin"), None);
        assert_eq!(next.get("gone.jar"), None);
        assert_eq!(next.len(), 3);
    }

    #[test]
    fn test_report_success_classification() {
        assert!(SyncReport::new(SyncOutcome::Completed, DiffResult::default()).is_success());
        assert!(SyncReport::new(SyncOutcome::DryRun, DiffResult::default()).is_success());
        assert!(!SyncReport::new(SyncOutcome::Cancelled, DiffResult::default()).is_success());
        assert!(!SyncReport::new(SyncOutcome::RolledBack, DiffResult::default()).is_success());
    }

    #[test]
    fn test_incomplete_restore_outranks_cancel() {
        let complete = RestoreReport { restored: 2, total: 2, removed: 1, failed: vec![] };
        let partial = RestoreReport {
            restored: 1,
            total: 2,
            removed: 0,
            failed: vec!["b.jar".to_string()],
        };
        let failed = || Abort::Failed(SyncError::integrity("b.jar", "short"));

        assert_eq!(abort_outcome(&Abort::Cancelled, Some(&complete)), SyncOutcome::Cancelled);
        assert_eq!(abort_outcome(&failed(), Some(&complete)), SyncOutcome::RolledBack);
        let incomplete = SyncOutcome::RollbackIncomplete;
        assert_eq!(abort_outcome(&Abort::Cancelled, Some(&partial)), incomplete);
        assert_eq!(abort_outcome(&failed(), Some(&partial)), incomplete);
        assert_eq!(abort_outcome(&Abort::Cancelled, None), incomplete);
        assert_eq!(abort_outcome(&failed(), None), incomplete);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_before_mutation() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.jar"), b"x").unwrap();

        let mut config = Config::default();
        config.server.url = "http://127.0.0.1:9".to_string();
        config.sync.timeout_secs = 1;
        let orchestrator = SyncOrchestrator::new(config).unwrap();

        let (sink, mut rx) = EventSink::channel();
        let result = orchestrator.sync(dir.path(), false, sink).await;
        assert!(matches!(result, Err(SyncError::RemoteUnavailable(_))));
        assert_eq!(orchestrator.state(), PassState::Failed);
        assert!(dir.path().join("keep.jar").exists());
        assert!(matches!(rx.recv().await, Some(SyncEvent::PassFailed { cancelled: false, .. })));
    }
}
