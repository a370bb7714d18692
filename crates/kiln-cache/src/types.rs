//! Cache types and requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Request to restore a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRestoreRequest {
    /// Primary cache key.
    pub key: String,
    /// Fallback key prefixes to try if the primary misses.
    #[serde(default)]
    pub restore_keys: Vec<String>,
    /// Directory the archive is unpacked into.
    pub destination: PathBuf,
}

/// Request to save a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSaveRequest {
    /// Cache key.
    pub key: String,
    /// Paths to cache, relative to `base_dir`.
    pub paths: Vec<PathBuf>,
    pub base_dir: PathBuf,
    /// Compression algorithm.
    #[serde(default)]
    pub compression: CompressionType,
}

/// Compression algorithm.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Zstd,
}

impl CompressionType {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None => "tar",
            CompressionType::Zstd => "tar.zst",
        }
    }
}

/// A cached entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key.
    pub key: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// When the entry was last written.
    pub created_at: DateTime<Utc>,
    /// Compression used.
    pub compression: CompressionType,
}

/// Result of a cache restore operation.
#[derive(Debug, Clone)]
pub struct RestoreResult {
    /// The matched cache entry, if any.
    pub entry: Option<CacheEntry>,
    /// The key that matched (may come from a restore key).
    pub matched_key: Option<String>,
    /// Whether it was an exact match.
    pub exact_match: bool,
    /// Time taken to restore in milliseconds.
    pub duration_ms: u64,
}

impl RestoreResult {
    pub fn is_hit(&self) -> bool {
        self.entry.is_some()
    }
}

/// Result of a cache save operation.
#[derive(Debug, Clone)]
pub struct SaveResult {
    /// The saved cache entry.
    pub entry: CacheEntry,
    /// Time taken to save in milliseconds.
    pub duration_ms: u64,
}
