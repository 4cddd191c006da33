//! Single-file transfer: download into a same-directory temp file, verify,
//! then atomically rename into place.
//!
//! Every mode shares one retry loop. Network failures back off linearly;
//! a download that completes but fails verification has its temp file
//! discarded and backs off exponentially. Before each retry the server is
//! probed with a HEAD request and the attempt is skipped if it is down.

use crate::fs::hash::{hash_file, hashes_equal, is_valid_hash};
use crate::fs::metadata::file_size;
use crate::fs::{PART_MARKER, TEMP_SUFFIX};
use crate::sync::manifest::FileRecord;
use crate::sync::path::resolve;
use crate::transfer::client::{served_range_start, ByteRange, FileHead, RemoteClient};
use crate::transfer::progress::{EventSink, SyncEvent};
use crate::transfer::progress_stream::ProgressStream;
use crate::transfer::retry::{Backoff, RetryPolicy};
use crate::transfer::strategy::{
    needs_range_probe, range_parts, select_mode, split_ranges, StrategyProfile, TransferMode,
};
use crate::{Result, SyncError};
use futures_util::future::try_join_all;
use futures_util::StreamExt;
use reqwest::{Response, StatusCode};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One file to bring in line with the remote manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub relative_path: String,
    pub expected_size: u64,
    pub expected_hash: Option<String>,
    pub destination: PathBuf,
}

impl TransferTask {
    pub fn new(root: &Path, record: &FileRecord) -> Self {
        Self {
            relative_path: record.relative_path.clone(),
            expected_size: record.size,
            expected_hash: record.content_hash.clone(),
            destination: resolve(root, &record.relative_path),
        }
    }

    /// Same-directory temp file the download streams into.
    pub fn temp_path(&self) -> PathBuf {
        with_suffix(&self.destination, TEMP_SUFFIX)
    }

    fn part_path(&self, index: usize) -> PathBuf {
        with_suffix(&self.destination, &format!("{}{}", PART_MARKER, index))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Terminal result of a transfer that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Downloaded, verified and renamed into place.
    Downloaded {
        bytes: u64,
        hash: Option<String>,
        mode: TransferMode,
        attempts: u32,
    },
    /// The destination already matched; nothing was written.
    AlreadyComplete { hash: Option<String> },
    /// Cancellation was observed; partial output has been removed.
    Cancelled,
}

/// Why one attempt ended early.
#[derive(Debug)]
enum AttemptError {
    Cancelled,
    /// A ranged part came back without a matching 206.
    RangeUnsupported,
    Failed(SyncError),
}

impl From<SyncError> for AttemptError {
    fn from(e: SyncError) -> Self {
        AttemptError::Failed(e)
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(e: std::io::Error) -> Self {
        AttemptError::Failed(SyncError::Io(e))
    }
}

type AttemptResult<T> = std::result::Result<T, AttemptError>;

/// Executes transfers for one pass under one strategy profile.
#[derive(Clone)]
pub struct Transporter {
    client: RemoteClient,
    profile: Arc<StrategyProfile>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    events: EventSink,
    pass_bytes: Arc<AtomicU64>,
}

impl Transporter {
    pub fn new(
        client: RemoteClient,
        profile: Arc<StrategyProfile>,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Self {
        let retry = RetryPolicy::new(profile.retry_count, profile.retry_base_delay);
        Self {
            client,
            profile,
            retry,
            cancel,
            events,
            pass_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Share an aggregate byte counter across transporters of one pass.
    pub fn with_pass_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.pass_bytes = counter;
        self
    }

    /// Bytes received over the wire by every transfer sharing the counter.
    pub fn pass_bytes(&self) -> u64 {
        self.pass_bytes.load(Ordering::Relaxed)
    }

    /// Run `task` to a terminal state. `Err` means the retry budget was
    /// exhausted or the failure was not retryable; no partial file is left.
    pub async fn transfer(&self, task: &TransferTask) -> Result<TransferOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(TransferOutcome::Cancelled);
        }

        if let Some(hash) = self.already_complete(task).await {
            debug!("{} already matches, skipping", task.relative_path);
            return Ok(TransferOutcome::AlreadyComplete { hash });
        }

        if let Some(parent) = task.destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let (mode, head) = self.choose_mode(task).await;
        let result = match expected_hash(task, head.as_ref()) {
            Ok(hash) => {
                self.events.emit(SyncEvent::FileStarted {
                    path: task.relative_path.clone(),
                    size: task.expected_size,
                });
                debug!(
                    "Fetching {} ({} bytes) as {:?}",
                    task.relative_path, task.expected_size, mode
                );
                self.run_attempts(task, mode, hash.as_deref()).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(TransferOutcome::Cancelled) => {
                remove_partials(task).await;
                info!("Transfer of {} cancelled", task.relative_path);
                Ok(TransferOutcome::Cancelled)
            }
            Ok(outcome) => {
                if let TransferOutcome::Downloaded { bytes, .. } = &outcome {
                    self.events.emit(SyncEvent::FileCompleted {
                        path: task.relative_path.clone(),
                        bytes: *bytes,
                    });
                }
                Ok(outcome)
            }
            Err(e) => {
                remove_partials(task).await;
                self.events.emit(SyncEvent::FileFailed {
                    path: task.relative_path.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Hash of the destination if it already holds the expected content.
    /// Size is the first gate; the hash is checked whenever one is known.
    async fn already_complete(&self, task: &TransferTask) -> Option<Option<String>> {
        if file_size(&task.destination)? != task.expected_size {
            return None;
        }
        let Some(expected) = task.expected_hash.clone() else {
            return Some(None);
        };

        let dest = task.destination.clone();
        let actual = tokio::task::spawn_blocking(move || hash_file(&dest)).await.ok()?.ok()?;
        hashes_equal(&actual, &expected).then_some(Some(expected))
    }

    /// Mode for `task`, plus the HEAD response when the size called for a probe.
    async fn choose_mode(&self, task: &TransferTask) -> (TransferMode, Option<FileHead>) {
        let head = if needs_range_probe(task.expected_size) {
            match self.client.head_file(&task.relative_path).await {
                Ok(head) => Some(head),
                Err(e) => {
                    debug!("Range probe for {} failed: {}", task.relative_path, e);
                    None
                }
            }
        } else {
            None
        };
        let ranges_supported = head.as_ref().is_some_and(|h| h.accepts_ranges);
        (select_mode(task.expected_size, || ranges_supported), head)
    }

    async fn run_attempts(
        &self,
        task: &TransferTask,
        mut mode: TransferMode,
        expected_hash: Option<&str>,
    ) -> Result<TransferOutcome> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let result = if attempt > 1 && !self.client.is_reachable(&task.relative_path).await {
                Err(AttemptError::Failed(SyncError::RemoteUnavailable(format!(
                    "server unreachable before retry of {}",
                    task.relative_path
                ))))
            } else {
                self.attempt(task, mode).await
            };

            let (error, backoff) = match result {
                Ok(()) => match self.finalize(task, expected_hash).await {
                    Ok(hash) => {
                        return Ok(TransferOutcome::Downloaded {
                            bytes: task.expected_size,
                            hash,
                            mode,
                            attempts: attempt,
                        })
                    }
                    Err(e) => {
                        // Bad bytes must not seed the next resume
                        let _ = fs::remove_file(task.temp_path()).await;
                        let backoff = backoff_for(&e);
                        (e, backoff)
                    }
                },
                Err(AttemptError::Cancelled) => return Ok(TransferOutcome::Cancelled),
                Err(AttemptError::RangeUnsupported) => {
                    warn!(
                        "Server did not honor ranged parts for {}, falling back to resumable",
                        task.relative_path
                    );
                    remove_parts(task).await;
                    mode = TransferMode::Resumable;
                    attempt -= 1;
                    continue;
                }
                Err(AttemptError::Failed(e)) => {
                    let integrity = matches!(e, SyncError::IntegrityMismatch { .. });
                    // A resumable temp file survives plain network failures only
                    if mode != TransferMode::Resumable || integrity {
                        remove_partials(task).await;
                    }
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    let backoff = backoff_for(&e);
                    (e, backoff)
                }
            };

            if !self.retry.should_retry(attempt) {
                warn!("Giving up on {} after {} attempts: {}", task.relative_path, attempt, error);
                return Err(error);
            }
            if self.cancel.is_cancelled() {
                return Ok(TransferOutcome::Cancelled);
            }

            let delay = self.retry.delay(attempt, backoff);
            warn!(
                "Attempt {}/{} for {} failed: {}; retrying in {:?}",
                attempt, self.retry.max_attempts, task.relative_path, error, delay
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(TransferOutcome::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, task: &TransferTask, mode: TransferMode) -> AttemptResult<()> {
        match mode {
            TransferMode::Simple => self.fetch_simple(task).await,
            TransferMode::Resumable => self.fetch_resumable(task).await,
            TransferMode::ParallelRanged => self.fetch_parallel(task).await,
        }
    }

    async fn fetch_simple(&self, task: &TransferTask) -> AttemptResult<()> {
        let resp = self.client.get_file(&task.relative_path, None).await?;
        let file_bytes = Arc::new(AtomicU64::new(0));
        self.stream_body(task, resp, &task.temp_path(), false, task.expected_size, &file_bytes)
            .await?;
        Ok(())
    }

    async fn fetch_resumable(&self, task: &TransferTask) -> AttemptResult<()> {
        let temp = task.temp_path();
        let mut existing = if self.profile.resume_enabled {
            file_size(&temp).unwrap_or(0)
        } else {
            0
        };

        if existing > task.expected_size {
            debug!("Temp file for {} is oversized, restarting", task.relative_path);
            fs::remove_file(&temp).await?;
            existing = 0;
        } else if existing > 0 && existing == task.expected_size {
            // Complete from a previous attempt; verification decides
            return Ok(());
        }

        let range = (existing > 0).then(|| ByteRange::from(existing));
        let resp = self.client.get_file(&task.relative_path, range).await?;

        let resumed = resp.status() == StatusCode::PARTIAL_CONTENT
            && served_range_start(&resp) == Some(existing);
        let offset = match range {
            Some(_) if resumed => {
                info!("Resuming {} from byte {}", task.relative_path, existing);
                existing
            }
            Some(_) => {
                debug!(
                    "Server answered {} to resume of {}, restarting from zero",
                    resp.status(),
                    task.relative_path
                );
                0
            }
            None => 0,
        };

        let file_bytes = Arc::new(AtomicU64::new(offset));
        self.stream_body(task, resp, &temp, offset > 0, task.expected_size - offset, &file_bytes)
            .await?;
        Ok(())
    }

    async fn fetch_parallel(&self, task: &TransferTask) -> AttemptResult<()> {
        let parts = range_parts(task.expected_size, self.profile.max_concurrent_workers);
        let ranges = split_ranges(task.expected_size, parts);
        debug!("Fetching {} in {} ranged parts", task.relative_path, ranges.len());

        let file_bytes = Arc::new(AtomicU64::new(0));
        let fetches = ranges
            .iter()
            .enumerate()
            .map(|(i, &(start, end))| self.fetch_part(task, i, start, end, &file_bytes));
        let part_paths = try_join_all(fetches).await?;

        // Reassemble by offset, not completion order
        let temp = task.temp_path();
        let mut out = File::create(&temp).await?;
        for part in &part_paths {
            if self.cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
            let mut input = File::open(part).await?;
            tokio::io::copy(&mut input, &mut out).await?;
        }
        out.flush().await?;
        remove_parts(task).await;
        Ok(())
    }

    async fn fetch_part(
        &self,
        task: &TransferTask,
        index: usize,
        start: u64,
        end: u64,
        file_bytes: &Arc<AtomicU64>,
    ) -> AttemptResult<PathBuf> {
        let resp = self
            .client
            .get_file(&task.relative_path, Some(ByteRange::span(start, end)))
            .await?;
        let honored = resp.status() == StatusCode::PARTIAL_CONTENT
            && served_range_start(&resp) == Some(start);
        if !honored {
            return Err(AttemptError::RangeUnsupported);
        }

        let path = task.part_path(index);
        let expected = end - start + 1;
        let written = self.stream_body(task, resp, &path, false, expected, file_bytes).await?;
        if written != expected {
            return Err(AttemptError::Failed(SyncError::integrity(
                task.relative_path.clone(),
                format!("part {} got {} of {} bytes", index, written, expected),
            )));
        }
        Ok(path)
    }

    /// Stream `resp` into `path`, truncating unless `append`. Fails if more
    /// than `limit` bytes arrive or the body stalls for longer than the
    /// profile timeout. Returns the bytes written by this call.
    async fn stream_body(
        &self,
        task: &TransferTask,
        resp: Response,
        path: &Path,
        append: bool,
        limit: u64,
        file_bytes: &Arc<AtomicU64>,
    ) -> AttemptResult<u64> {
        let file = if append {
            OpenOptions::new().append(true).open(path).await?
        } else {
            File::create(path).await?
        };
        let mut writer = BufWriter::with_capacity(self.profile.chunk_size, file);

        let events = self.events.clone();
        let rel = task.relative_path.clone();
        let total = task.expected_size;
        let cb_file_bytes = Arc::clone(file_bytes);
        let cb_pass_bytes = Arc::clone(&self.pass_bytes);
        let callback = Arc::new(move |_: u64| {
            events.emit(SyncEvent::FileProgress {
                path: rel.clone(),
                transferred: cb_file_bytes.load(Ordering::Relaxed),
                total,
                pass_bytes: cb_pass_bytes.load(Ordering::Relaxed),
            });
        });

        let mut stream = ProgressStream::new(Box::pin(resp.bytes_stream()), callback)
            .with_counter(Arc::clone(file_bytes))
            .with_counter(Arc::clone(&self.pass_bytes));

        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
                next = tokio::time::timeout(self.profile.timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(AttemptError::Failed(SyncError::RemoteUnavailable(format!(
                        "{} stalled for {:?}",
                        task.relative_path, self.profile.timeout
                    ))))
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(AttemptError::Failed(SyncError::Http(e))),
                Ok(Some(Ok(chunk))) => chunk,
            };

            written += chunk.len() as u64;
            if written > limit {
                return Err(AttemptError::Failed(SyncError::integrity(
                    task.relative_path.clone(),
                    format!("server sent more than {} bytes", limit),
                )));
            }
            writer.write_all(&chunk).await?;
        }

        writer.flush().await?;
        Ok(written)
    }

    /// Promote the temp file if its size and hash match, returning the hash.
    async fn finalize(
        &self,
        task: &TransferTask,
        expected_hash: Option<&str>,
    ) -> Result<Option<String>> {
        let temp = task.temp_path();
        let actual_size = file_size(&temp).unwrap_or(0);
        if actual_size != task.expected_size {
            return Err(SyncError::integrity(
                task.relative_path.clone(),
                format!("got {} of {} bytes", actual_size, task.expected_size),
            ));
        }

        let hash = match expected_hash {
            Some(expected) => {
                let temp_owned = temp.clone();
                let actual = tokio::task::spawn_blocking(move || hash_file(&temp_owned))
                    .await
                    .map_err(|e| SyncError::Io(std::io::Error::other(e)))??;
                if !hashes_equal(&actual, expected) {
                    return Err(SyncError::integrity(
                        task.relative_path.clone(),
                        format!("hash {} does not match {}", actual, expected),
                    ));
                }
                Some(actual)
            }
            None => None,
        };

        fs::rename(&temp, &task.destination).await?;
        debug!("Placed {}", task.destination.display());
        Ok(hash)
    }
}

/// Hash a download is checked against: the manifest's, else the one the
/// server advertised on HEAD. A HEAD length that contradicts the manifest
/// fails the file before anything is fetched.
fn expected_hash(task: &TransferTask, head: Option<&FileHead>) -> Result<Option<String>> {
    if let Some(length) = head.and_then(|h| h.content_length) {
        if length != task.expected_size {
            return Err(SyncError::integrity(
                task.relative_path.clone(),
                format!("server reports {} bytes, manifest lists {}", length, task.expected_size),
            ));
        }
    }
    let advertised = head
        .and_then(|h| h.hash.clone())
        .filter(|h| is_valid_hash(h));
    Ok(task.expected_hash.clone().or(advertised))
}

/// Downloads that arrive but fail verification back off exponentially;
/// everything else backs off linearly.
fn backoff_for(error: &SyncError) -> Backoff {
    match error {
        SyncError::IntegrityMismatch { .. } => Backoff::Exponential,
        _ => Backoff::Linear,
    }
}

async fn remove_parts(task: &TransferTask) {
    let Some(parent) = task.destination.parent() else {
        return;
    };
    let Some(name) = task.destination.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let prefix = format!("{}{}", name, PART_MARKER);

    let Ok(mut entries) = fs::read_dir(parent).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            let _ = fs::remove_file(entry.path()).await;
        }
    }
}

/// Remove the temp file and any part files left by `task`.
async fn remove_partials(task: &TransferTask) {
    let _ = fs::remove_file(task.temp_path()).await;
    remove_parts(task).await;
}
