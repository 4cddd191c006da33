//! Progress reporting for sync passes.
//!
//! Workers never call into front-end code. They post [`SyncEvent`]s to an
//! unbounded channel through an [`EventSink`]; the caller owns the receiver
//! and drains it on its own thread. [`ProgressTracker`] turns the event stream
//! back into totals, speed and ETA for display.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Events emitted during a sync pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum SyncEvent {
    /// Diff done; `total_bytes` is what the fetch phase will download
    #[serde(rename = "sync:started")]
    PassStarted {
        total_bytes: u64,
        files_to_fetch: usize,
        files_to_delete: usize,
    },

    #[serde(rename = "file:started")]
    FileStarted { path: String, size: u64 },

    /// `pass_bytes` is the aggregate across all workers
    #[serde(rename = "file:progress")]
    FileProgress {
        path: String,
        transferred: u64,
        total: u64,
        pass_bytes: u64,
    },

    #[serde(rename = "file:completed")]
    FileCompleted { path: String, bytes: u64 },

    #[serde(rename = "file:failed")]
    FileFailed { path: String, error: String },

    #[serde(rename = "file:deleted")]
    FileDeleted { path: String },

    #[serde(rename = "sync:completed")]
    PassCompleted {
        deleted: usize,
        downloaded: usize,
        bytes: u64,
    },

    #[serde(rename = "sync:failed")]
    PassFailed { error: String, cancelled: bool },
}

/// Cloneable sending half; a sink with no receiver silently drops events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver the caller drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is listening any more
            let _ = tx.send(event);
        }
    }
}

/// Window the displayed speed is averaged over.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Running view of one pass, rebuilt from its events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassProgress {
    /// Bytes the fetch phase will download
    pub fetch_bytes: u64,
    /// Bytes received so far across all workers
    pub received_bytes: u64,
    pub files_total: usize,
    pub files_done: usize,
    pub files_failed: usize,
    pub deleted: usize,
    /// Bytes per second over the last few seconds
    pub speed: u64,
    pub eta_secs: Option<u64>,
    /// Most recently started file
    pub current_file: Option<String>,
}

impl PassProgress {
    pub fn percent(&self) -> f64 {
        if self.fetch_bytes == 0 {
            return 100.0;
        }
        (self.received_bytes as f64 * 100.0 / self.fetch_bytes as f64).min(100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.files_done + self.files_failed >= self.files_total
            && self.received_bytes >= self.fetch_bytes
    }
}

/// Folds [`SyncEvent`]s into a [`PassProgress`].
pub struct ProgressTracker {
    started: Instant,
    samples: VecDeque<(Instant, u64)>,
    progress: PassProgress,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            samples: VecDeque::new(),
            progress: PassProgress::default(),
        }
    }

    /// Apply one event.
    pub fn apply(&mut self, event: &SyncEvent) -> &PassProgress {
        match event {
            SyncEvent::PassStarted { total_bytes, files_to_fetch, .. } => {
                self.started = Instant::now();
                self.progress = PassProgress {
                    fetch_bytes: *total_bytes,
                    files_total: *files_to_fetch,
                    ..PassProgress::default()
                };
                self.samples.clear();
                self.samples.push_back((self.started, 0));
            }
            SyncEvent::FileStarted { path, .. } => self.progress.current_file = Some(path.clone()),
            SyncEvent::FileProgress { pass_bytes, .. } => self.record(*pass_bytes, Instant::now()),
            SyncEvent::FileCompleted { .. } => self.progress.files_done += 1,
            SyncEvent::FileFailed { .. } => self.progress.files_failed += 1,
            SyncEvent::FileDeleted { .. } => self.progress.deleted += 1,
            SyncEvent::PassCompleted { .. } | SyncEvent::PassFailed { .. } => {
                self.progress.current_file = None
            }
        }
        &self.progress
    }

    fn record(&mut self, received: u64, at: Instant) {
        self.samples.push_back((at, received));
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(&(t, _)) if at.duration_since(t) > SPEED_WINDOW => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        if let (Some(&(t0, b0)), Some(&(t1, b1))) = (self.samples.front(), self.samples.back()) {
            let secs = t1.duration_since(t0).as_secs_f64();
            if secs > 0.0 {
                self.progress.speed = (b1.saturating_sub(b0) as f64 / secs) as u64;
            }
        }

        self.progress.received_bytes = received;
        self.progress.eta_secs = (self.progress.speed > 0)
            .then(|| self.progress.fetch_bytes.saturating_sub(received) / self.progress.speed);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Mean speed since the pass started
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            (self.progress.received_bytes as f64 / secs) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &PassProgress {
        &self.progress
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// `1536` → `"1.50 KB"`; plain bytes are printed without decimals.
pub fn format_bytes(bytes: u64) -> String {
    let exp = if bytes == 0 {
        0
    } else {
        ((63 - bytes.leading_zeros()) / 10).min(UNITS.len() as u32 - 1) as usize
    };
    if exp == 0 {
        return format!("{} B", bytes);
    }
    format!("{:.2} {}", bytes as f64 / (1u64 << (10 * exp)) as f64, UNITS[exp])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// `90` → `"1m 30s"`, `3665` → `"1h 01m"`.
pub fn format_duration(seconds: u64) -> String {
    match seconds {
        0..=59 => format!("{}s", seconds),
        60..=3599 => format!("{}m {}s", seconds / 60, seconds % 60),
        _ => format!("{}h {:02}m", seconds / 3600, (seconds % 3600) / 60),
    }
}
