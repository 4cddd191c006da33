//! Last-known-good hash cache.
//!
//! Maps manifest keys to the content hash each file had after the last fully
//! verified pass. Stored as `.modsync_cache.json` in the sync root, with the
//! previous version kept as `.modsync_cache.json.bak`.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CACHE_FILE: &str = ".modsync_cache.json";
const CACHE_BACKUP_FILE: &str = ".modsync_cache.json.bak";
const CACHE_TEMP_FILE: &str = ".modsync_cache.json.new";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalHashCache {
    entries: BTreeMap<String, String>,
}

impl LocalHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cache for `root`.
    ///
    /// A missing or corrupt cache falls back to the backup copy, then to an
    /// empty cache. Never fails.
    pub fn load(root: &Path) -> Self {
        let primary = root.join(CACHE_FILE);
        match read_cache(&primary) {
            Some(Ok(cache)) => return cache,
            Some(Err(e)) => warn!("Hash cache {} is unreadable: {}", primary.display(), e),
            None => debug!("No hash cache at {}", primary.display()),
        }

        let backup = root.join(CACHE_BACKUP_FILE);
        match read_cache(&backup) {
            Some(Ok(cache)) => {
                warn!("Recovered hash cache from {}", backup.display());
                cache
            }
            Some(Err(e)) => {
                warn!("Hash cache backup {} is unreadable: {}", backup.display(), e);
                Self::new()
            }
            None => Self::new(),
        }
    }

    /// Persist the cache, keeping the previous file as a backup.
    pub fn save(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;
        let primary = root.join(CACHE_FILE);
        if primary.exists() {
            if let Err(e) = fs::copy(&primary, root.join(CACHE_BACKUP_FILE)) {
                warn!("Failed to back up hash cache: {}", e);
            }
        }

        let temp = root.join(CACHE_TEMP_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(&temp, json)?;
        fs::rename(&temp, &primary)?;
        debug!("Saved hash cache with {} entries", self.entries.len());
        Ok(())
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(CACHE_FILE)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, hash: impl Into<String>) {
        self.entries.insert(key.into(), hash.into().to_ascii_lowercase());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Drop every entry whose key fails `keep`.
    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|k, _| keep(k));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_cache(path: &Path) -> Option<std::result::Result<LocalHashCache, String>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => return Some(Err(e.to_string())),
    };
    Some(serde_json::from_slice(&data).map_err(|e| e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_cache_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(LocalHashCache::load(dir.path()).is_empty());
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = TempDir::new()?;
        let mut cache = LocalHashCache::new();
        cache.insert("a.jar", "ABCDEF");
        cache.save(dir.path())?;

        let loaded = LocalHashCache::load(dir.path());
        assert_eq!(loaded.get("a.jar"), Some("abcdef"));
        assert_eq!(loaded, cache);
        Ok(())
    }

    #[test]
    fn test_corrupt_cache_falls_back_to_backup() -> Result<()> {
        let dir = TempDir::new()?;
        let mut first = LocalHashCache::new();
        first.insert("a.jar", "11");
        first.save(dir.path())?;

        // Second save moves the first version into the backup slot
        let mut second = LocalHashCache::new();
        second.insert("b.jar", "22");
        second.save(dir.path())?;

        fs::write(dir.path().join(CACHE_FILE), b"{ not json")?;
        let loaded = LocalHashCache::load(dir.path());
        assert_eq!(loaded.get("a.jar"), Some("11"));
        assert_eq!(loaded.get("b.jar"), None);
        Ok(())
    }

    #[test]
    fn test_corrupt_cache_without_backup_is_empty() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join(CACHE_FILE), b"[1, 2, 3]")?;
        assert!(LocalHashCache::load(dir.path()).is_empty());
        Ok(())
    }
}
