//! Manifests: the remote reference file set and local directory scans.
//!
//! The remote manifest is authoritative and immutable for one pass. The
//! service caches it for a short TTL so repeated small operations do not
//! refetch it. Local scans always carry size and mtime; hashes are filled in
//! lazily and only for files below the configured size limit.

use crate::fs::hash::{hash_file, is_valid_hash};
use crate::fs::is_reserved_key;
use crate::fs::walker::scan_files;
use crate::sync::cache::LocalHashCache;
use crate::sync::path::{normalize, resolve};
use crate::transfer::client::RemoteClient;
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One file, identified by its relative path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub relative_path: String,
    pub size: u64,
    /// Lowercase hex SHA-256; absent for large local files and for remote
    /// entries the server did not hash.
    pub content_hash: Option<String>,
    /// Seconds since the Unix epoch; 0 for remote entries.
    pub modified_time: f64,
}

/// Mapping from relative path to file metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    files: BTreeMap<String, FileRecord>,
}

/// Wire form of one remote manifest entry.
#[derive(Debug, Deserialize)]
struct RemoteEntry {
    size: u64,
    #[serde(default)]
    hash: Option<String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I: IntoIterator<Item = FileRecord>>(records: I) -> Self {
        Self {
            files: records
                .into_iter()
                .map(|r| (r.relative_path.clone(), r))
                .collect(),
        }
    }

    /// Parse a `GET /manifest` body.
    ///
    /// Anything other than an object of `path -> {size, hash}` with safe
    /// relative paths and hex SHA-256 hashes is `InvalidManifest`. Keys that
    /// would overwrite the agent's cache, backups or temp files are rejected.
    pub fn from_remote_json(body: &[u8]) -> Result<Self> {
        let raw: BTreeMap<String, RemoteEntry> = serde_json::from_slice(body)
            .map_err(|e| {
                SyncError::InvalidManifest(format!("not a path -> metadata object: {}", e))
            })?;

        let mut files = BTreeMap::new();
        for (raw_path, entry) in raw {
            let key = normalize(&raw_path)
                .ok_or_else(|| SyncError::InvalidManifest(format!("unsafe path {:?}", raw_path)))?;
            if is_reserved_key(&key) {
                return Err(SyncError::InvalidManifest(format!("reserved path {:?}", raw_path)));
            }

            let hash = match entry.hash {
                Some(h) if is_valid_hash(&h) => Some(h.to_ascii_lowercase()),
                Some(h) => {
                    return Err(SyncError::InvalidManifest(format!(
                        "bad hash {:?} for {}",
                        h, key
                    )))
                }
                None => None,
            };

            let record = FileRecord {
                relative_path: key.clone(),
                size: entry.size,
                content_hash: hash,
                modified_time: 0.0,
            };
            if files.insert(key.clone(), record).is_some() {
                return Err(SyncError::InvalidManifest(format!("duplicate path {}", key)));
            }
        }

        Ok(Self { files })
    }

    pub fn insert(&mut self, record: FileRecord) {
        self.files.insert(record.relative_path.clone(), record);
    }

    pub fn get(&self, key: &str) -> Option<&FileRecord> {
        self.files.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut FileRecord> {
        self.files.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.files.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }
}

struct CachedManifest {
    fetched_at: Instant,
    manifest: Arc<Manifest>,
}

/// Owns the remote manifest cache and builds local listings.
pub struct ManifestService {
    client: RemoteClient,
    ttl: Duration,
    hash_size_limit: u64,
    cached: Mutex<Option<CachedManifest>>,
}

impl ManifestService {
    pub fn new(client: RemoteClient, ttl: Duration, hash_size_limit: u64) -> Self {
        Self {
            client,
            ttl,
            hash_size_limit,
            cached: Mutex::new(None),
        }
    }

    /// Remote manifest, served from cache while younger than the TTL.
    pub async fn fetch_remote_manifest(&self) -> Result<Arc<Manifest>> {
        if let Some(manifest) = self.cached_manifest() {
            debug!("Using cached manifest ({} files)", manifest.len());
            return Ok(manifest);
        }
        self.refresh().await
    }

    /// Fetch the manifest from the server, bypassing and replacing the cache.
    pub async fn refresh(&self) -> Result<Arc<Manifest>> {
        let body = self.client.fetch_manifest().await?;
        let manifest = Arc::new(Manifest::from_remote_json(&body)?);
        info!(
            "Fetched manifest: {} files, {} bytes",
            manifest.len(),
            manifest.total_bytes()
        );

        if let Ok(mut slot) = self.cached.lock() {
            *slot = Some(CachedManifest {
                fetched_at: Instant::now(),
                manifest: Arc::clone(&manifest),
            });
        }
        Ok(manifest)
    }

    /// Drop the cached manifest so the next fetch hits the server.
    pub fn invalidate(&self) {
        if let Ok(mut slot) = self.cached.lock() {
            *slot = None;
        }
    }

    fn cached_manifest(&self) -> Option<Arc<Manifest>> {
        let slot = self.cached.lock().ok()?;
        let cached = slot.as_ref()?;
        (cached.fetched_at.elapsed() < self.ttl).then(|| Arc::clone(&cached.manifest))
    }

    /// Walk `root` into a manifest without hashes.
    pub async fn scan_local(&self, root: &Path) -> Result<Manifest> {
        let root_owned = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || scan_files(&root_owned))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))??;

        let manifest = Manifest::from_records(files.into_iter().map(|f| FileRecord {
            relative_path: f.key,
            size: f.stat.size,
            content_hash: None,
            modified_time: f.stat.modified,
        }));
        debug!("Scanned {}: {} files", root.display(), manifest.len());
        Ok(manifest)
    }

    /// Hash the local files whose classification depends on their content:
    /// present on both sides with equal size, a remote hash to compare
    /// against, no cached hash vouching for it, and at most the size limit.
    ///
    /// Returns the number of files hashed.
    pub async fn hydrate_hashes(
        &self,
        root: &Path,
        local: &mut Manifest,
        remote: &Manifest,
        cache: &LocalHashCache,
    ) -> Result<usize> {
        let candidates: Vec<String> = local
            .iter()
            .filter(|l| l.content_hash.is_none() && l.size <= self.hash_size_limit)
            .filter(|l| match remote.get(&l.relative_path) {
                Some(r) => match &r.content_hash {
                    Some(remote_hash) => {
                        r.size == l.size
                            && cache.get(&l.relative_path) != Some(remote_hash.as_str())
                    }
                    None => false,
                },
                None => false,
            })
            .map(|l| l.relative_path.clone())
            .collect();

        if candidates.is_empty() {
            return Ok(0);
        }

        let root_owned = root.to_path_buf();
        let hashed = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .filter_map(|key| match hash_file(&resolve(&root_owned, &key)) {
                    Ok(hash) => Some((key, hash)),
                    Err(e) => {
                        warn!("Failed to hash {}: {}", key, e);
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;

        let count = hashed.len();
        for (key, hash) in hashed {
            if let Some(record) = local.get_mut(&key) {
                record.content_hash = Some(hash);
            }
        }
        debug!("Hashed {} local files for comparison", count);
        Ok(count)
    }
}
