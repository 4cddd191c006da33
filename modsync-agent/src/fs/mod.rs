//! Local filesystem access: traversal, metadata and content hashing.

pub mod hash;
pub mod metadata;
pub mod walker;

/// Suffix of the single-stream temporary file a transfer writes into.
pub const TEMP_SUFFIX: &str = ".modsync.tmp";

/// Infix of per-range part files written by parallel transfers (`.modsync.part{i}`).
pub const PART_MARKER: &str = ".modsync.part";

/// Prefix shared by the cache, backup and pointer entries at the sync root.
pub const RESERVED_PREFIX: &str = ".modsync";

/// Whether a file name belongs to an in-progress transfer.
pub fn is_transfer_artifact(file_name: &str) -> bool {
    file_name.ends_with(TEMP_SUFFIX) || file_name.contains(PART_MARKER)
}

/// Whether a normalized key would land on one of the agent's own files.
pub fn is_reserved_key(key: &str) -> bool {
    let first = key.split('/').next().unwrap_or(key);
    let name = key.rsplit('/').next().unwrap_or(key);
    first.starts_with(RESERVED_PREFIX) || is_transfer_artifact(name)
}
