//! Streaming SHA-256 content hashing.
//!
//! Files are read in fixed-size blocks so memory use does not depend on file
//! size. Digests are lowercase hex; comparisons ignore case.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Read block size for hashing (64 KiB)
const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Hex length of a SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

/// Compute the hex SHA-256 digest of a file.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    hash_reader(file)
}

/// Compute the hex SHA-256 digest of everything `reader` yields.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 digest of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Recompute the hash of `path` and compare it to `expected`.
///
/// Returns `false` (never an error) when the file is missing, unreadable or
/// does not match.
pub fn verify_file(path: &Path, expected: &str) -> bool {
    match hash_file(path) {
        Ok(actual) => hashes_equal(&actual, expected),
        Err(_) => false,
    }
}

/// Case-insensitive digest comparison.
pub fn hashes_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Whether `s` looks like a hex SHA-256 digest.
pub fn is_valid_hash(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}
