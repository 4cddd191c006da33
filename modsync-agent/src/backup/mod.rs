//! Rollback storage.

pub mod vault;

pub use vault::{BackupSnapshot, BackupVault, RestoreReport, VaultOptions};
