//! Local vs remote manifest comparison.

use crate::sync::cache::LocalHashCache;
use crate::sync::manifest::Manifest;
use serde::Serialize;
use std::collections::BTreeSet;

/// Three disjoint path sets covering every local and remote path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    /// Present locally, absent remotely
    pub to_delete: BTreeSet<String>,
    /// Remote entries that are missing or stale locally
    pub to_fetch: BTreeSet<String>,
    /// Everything else
    pub unchanged: BTreeSet<String>,
}

impl DiffResult {
    /// Whether applying this diff would touch the filesystem.
    pub fn is_noop(&self) -> bool {
        self.to_delete.is_empty() && self.to_fetch.is_empty()
    }

    /// Total bytes the fetch set will download, per the remote manifest.
    pub fn fetch_bytes(&self, remote: &Manifest) -> u64 {
        self.to_fetch
            .iter()
            .filter_map(|k| remote.get(k))
            .map(|r| r.size)
            .sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    /// When false, local files absent remotely are kept (classified unchanged).
    pub delete_unmatched: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self { delete_unmatched: true }
    }
}

/// Classify every path. Remote presence always wins over local state.
///
/// A remote file is fetched when it is absent locally, its size differs, or
/// its known local hash differs from the remote hash. The local hash is the
/// freshly computed one when the scan produced it, else the cached
/// last-known-good hash. A remote file with a hash but no local evidence
/// either way is fetched; the transporter re-verifies it in place before
/// downloading anything. Remote entries without a hash compare by size only.
pub fn diff(local: &Manifest, remote: &Manifest, cached: &LocalHashCache) -> DiffResult {
    diff_with(local, remote, cached, DiffOptions::default())
}

pub fn diff_with(
    local: &Manifest,
    remote: &Manifest,
    cached: &LocalHashCache,
    options: DiffOptions,
) -> DiffResult {
    let mut result = DiffResult::default();

    for r in remote.iter() {
        let key = r.relative_path.clone();
        let Some(l) = local.get(&key) else {
            result.to_fetch.insert(key);
            continue;
        };

        if l.size != r.size {
            result.to_fetch.insert(key);
            continue;
        }

        let stale = match &r.content_hash {
            None => false,
            Some(remote_hash) => {
                let local_hash = l.content_hash.as_deref().or_else(|| cached.get(&key));
                match local_hash {
                    Some(h) => !h.eq_ignore_ascii_case(remote_hash),
                    None => true,
                }
            }
        };

        if stale {
            result.to_fetch.insert(key);
        } else {
            result.unchanged.insert(key);
        }
    }

    for key in local.keys().filter(|k| !remote.contains(k)) {
        if options.delete_unmatched {
            result.to_delete.insert(key.to_string());
        } else {
            result.unchanged.insert(key.to_string());
        }
    }

    result
}
