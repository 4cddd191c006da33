//! Moving bytes from the file server to disk.

pub mod client;
pub mod progress;
pub mod progress_stream;
pub mod retry;
pub mod speed;
pub mod strategy;
pub mod transporter;

pub use client::RemoteClient;
pub use progress::{EventSink, SyncEvent};
pub use strategy::{ConnectionQuality, StrategyMode, StrategyProfile, TransferMode};
pub use transporter::{TransferOutcome, TransferTask, Transporter};
