//! Content-addressed cache store for kiln.
//!
//! Entries are tar archives (optionally zstd-compressed) keyed by a
//! fingerprint of the runtime target, the toolchain and the lock files.

pub mod archiver;
pub mod keys;
pub mod provider;
pub mod types;

pub use keys::{CacheFingerprint, hash_files, matches_prefix, sanitize_key};
pub use provider::{CacheProvider, FilesystemProvider};
pub use types::{
    CacheEntry, CacheRestoreRequest, CacheSaveRequest, CompressionType, RestoreResult, SaveResult,
};
