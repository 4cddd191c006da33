//! Relative path handling.
//!
//! Manifest keys are POSIX-style relative paths: forward slashes, no empty or
//! `.` segments, never `..`, never absolute.

use std::path::{Component, Path, PathBuf};

/// Normalize a manifest key. Backslashes are treated as separators.
///
/// Returns `None` for absolute paths, `..` segments, drive prefixes or empty
/// input.
pub fn normalize(raw: &str) -> Option<String> {
    if raw.starts_with('/') || raw.starts_with('\\') {
        return None;
    }
    let mut segments = Vec::new();
    for seg in raw.split(|c| c == '/' || c == '\\') {
        match seg {
            "" | "." => continue,
            ".." => return None,
            s if s.contains(':') => return None,
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Convert a path relative to the sync root into its manifest key.
pub fn to_key(relative: &Path) -> Option<String> {
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(s) => segments.push(s.to_str()?.to_string()),
            Component::CurDir => continue,
            _ => return None,
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Resolve a manifest key against the sync root.
pub fn resolve(root: &Path, key: &str) -> PathBuf {
    key.split('/').fold(root.to_path_buf(), |acc, seg| acc.join(seg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("mods/a.jar").as_deref(), Some("mods/a.jar"));
        assert_eq!(normalize("mods//./a.jar").as_deref(), Some("mods/a.jar"));
        assert_eq!(normalize("mods\\sub\\a.jar").as_deref(), Some("mods/sub/a.jar"));
    }

    #[test]
    fn test_normalize_rejects_escapes() {
        assert_eq!(normalize("../a.jar"), None);
        assert_eq!(normalize("mods/../../a.jar"), None);
        assert_eq!(normalize("/etc/passwd"), None);
        assert_eq!(normalize("C:/a.jar"), None);
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("./"), None);
    }

    #[test]
    fn test_key_roundtrip_through_root() {
        let root = Path::new("/srv/mods");
        let full = resolve(root, "config/x.toml");
        assert_eq!(full, PathBuf::from("/srv/mods/config/x.toml"));
        let rel = full.strip_prefix(root).unwrap();
        assert_eq!(to_key(rel).as_deref(), Some("config/x.toml"));
    }
}
