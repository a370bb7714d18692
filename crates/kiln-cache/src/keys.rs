//! Cache key generation utilities.

use sha2::{Digest, Sha256};
use std::path::Path;

/// The inputs a cache key is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFingerprint {
    pub os: String,
    pub toolchain: String,
    pub lock_hash: String,
}

impl CacheFingerprint {
    /// Fingerprint a runtime target, a toolchain identity and a set of lock
    /// files resolved against `base_dir`.
    pub fn compute<P: AsRef<Path>>(
        os: &str,
        toolchain: Option<&str>,
        base_dir: &Path,
        lock_files: &[P],
    ) -> Self {
        Self {
            os: os.to_string(),
            toolchain: toolchain.unwrap_or("default").to_string(),
            lock_hash: hash_files(base_dir, lock_files),
        }
    }

    /// `prefix-os-toolchain-hash`, safe for use as a file name.
    pub fn key(&self, prefix: &str) -> String {
        sanitize_key(&format!(
            "{}-{}-{}-{}",
            prefix, self.os, self.toolchain, self.lock_hash
        ))
    }
}

/// SHA-256 over the named files, truncated to 16 bytes of hex.
///
/// Each file contributes its relative name and length before its contents,
/// and a missing file contributes a marker, so adding or removing a lock
/// file changes the hash.
pub fn hash_files<P: AsRef<Path>>(base_dir: &Path, files: &[P]) -> String {
    let mut hasher = Sha256::new();

    for file in files {
        let rel = file.as_ref();
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        match std::fs::read(base_dir.join(rel)) {
            Ok(contents) => {
                hasher.update((contents.len() as u64).to_le_bytes());
                hasher.update(&contents);
            }
            Err(_) => hasher.update(b"<missing>"),
        }
    }

    let hash = hasher.finalize();
    hex::encode(&hash[..16])
}

/// Check if a key matches a prefix pattern.
pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}

/// Sanitize a key for use in filenames.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            _ => c,
        })
        .collect()
}
