//! ModSync Agent Library
//!
//! Keeps a local mod folder identical to a remote reference file set:
//! deletes what the server no longer lists, downloads what is missing or
//! stale with hash-verified, resumable transfers, and rolls the folder back
//! from a backup snapshot when a pass cannot complete.

pub mod backup;
pub mod cancel;
pub mod config;
pub mod executor;
pub mod fs;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{PassState, SyncOrchestrator, SyncOutcome, SyncReport};
pub use transfer::progress::{EventSink, SyncEvent};
pub use utils::errors::{Result, SyncError};
