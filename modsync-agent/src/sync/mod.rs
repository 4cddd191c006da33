//! Deciding what a pass has to change.

pub mod cache;
pub mod diff;
pub mod manifest;
pub mod path;

pub use cache::LocalHashCache;
pub use diff::{diff, diff_with, DiffOptions, DiffResult};
pub use manifest::{FileRecord, Manifest, ManifestService};
