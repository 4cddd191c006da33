//! Progress-tracking stream wrapper for download bodies.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Callback for progress updates
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Stream wrapper that counts bytes and calls a throttled progress callback.
///
/// Every chunk is added to the shared counters immediately; only the callback
/// is rate limited.
pub struct ProgressStream<S> {
    inner: S,
    bytes_transferred: u64,
    last_update: Instant,
    update_interval: Duration,
    counters: Vec<Arc<AtomicU64>>,
    callback: ProgressCallback,
}

impl<S, E> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    /// Create a new progress stream
    pub fn new(inner: S, callback: ProgressCallback) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
            last_update: Instant::now(),
            update_interval: Duration::from_millis(250), // 4 updates per second
            counters: Vec::new(),
            callback,
        }
    }

    /// Also add every chunk's length to `counter`.
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.counters.push(counter);
        self
    }

    /// Get total bytes transferred
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}

impl<S, E> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let chunk_size = bytes.len() as u64;
                self.bytes_transferred += chunk_size;
                for counter in &self.counters {
                    counter.fetch_add(chunk_size, Ordering::Relaxed);
                }

                // Call progress callback if enough time has passed
                let now = Instant::now();
                if now.duration_since(self.last_update) >= self.update_interval {
                    (self.callback)(self.bytes_transferred);
                    self.last_update = now;
                }

                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                // Final update on completion
                (self.callback)(self.bytes_transferred);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
