//! Cache storage provider trait and implementations.

use crate::archiver::{create_archive, extract_archive};
use crate::keys::sanitize_key;
use crate::types::{
    CacheEntry, CacheRestoreRequest, CacheSaveRequest, CompressionType, RestoreResult, SaveResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::{Error, Result};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Trait for cache storage backends.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Restore a cache entry. A miss is not an error.
    async fn restore(&self, request: &CacheRestoreRequest) -> Result<RestoreResult>;

    /// Save a cache entry. Concurrent saves to one key are safe; the last
    /// writer wins and readers never see a partial entry.
    async fn save(&self, request: &CacheSaveRequest) -> Result<SaveResult>;

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a cache entry.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List entries matching a prefix, newest first.
    async fn list(&self, prefix: &str) -> Result<Vec<CacheEntry>>;

    /// Delete every entry matching a prefix; returns how many were removed.
    async fn clear(&self, prefix: &str) -> Result<usize> {
        let entries = self.list(prefix).await?;
        for entry in &entries {
            self.delete(&entry.key).await?;
        }
        Ok(entries.len())
    }
}

/// Filesystem-based cache provider: one archive file per key.
pub struct FilesystemProvider {
    root_dir: PathBuf,
}

impl FilesystemProvider {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn key_path(&self, key: &str, compression: CompressionType) -> PathBuf {
        self.root_dir
            .join(format!("{}.{}", sanitize_key(key), compression.extension()))
    }

    /// Locate the stored archive for a key, whichever compression it used.
    fn find(&self, key: &str) -> Option<(PathBuf, CompressionType)> {
        [CompressionType::Zstd, CompressionType::None]
            .into_iter()
            .map(|c| (self.key_path(key, c), c))
            .find(|(path, _)| path.is_file())
    }

    async fn entry_for(&self, key: &str, path: &Path, compression: CompressionType) -> Result<CacheEntry> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::Cache(format!("Failed to read cache metadata: {}", e)))?;
        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(CacheEntry {
            key: key.to_string(),
            size_bytes: metadata.len(),
            created_at,
            compression,
        })
    }

    async fn unpack(&self, path: PathBuf, destination: PathBuf, compression: CompressionType) -> Result<()> {
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path)
                .map_err(|e| Error::Cache(format!("Failed to open cache entry: {}", e)))?;
            extract_archive(BufReader::new(file), &destination, compression)
        })
        .await
        .map_err(|e| Error::Internal(format!("Cache restore task failed: {}", e)))?
    }
}

/// Archive into a unique temp file next to the target, then rename over it.
fn write_atomically(request: &CacheSaveRequest, root_dir: &Path, target: &Path) -> Result<()> {
    let temp = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(root_dir)
        .map_err(|e| Error::Cache(format!("Failed to create temp file: {}", e)))?;

    {
        let mut writer = BufWriter::new(temp.as_file());
        create_archive(
            &mut writer,
            &request.paths,
            &request.base_dir,
            request.compression,
        )?;
        writer
            .flush()
            .map_err(|e| Error::Cache(format!("Failed to write cache: {}", e)))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|e| Error::Cache(format!("Failed to sync cache: {}", e)))?;

    temp.persist(target)
        .map_err(|e| Error::Cache(format!("Failed to publish cache entry: {}", e.error)))?;
    Ok(())
}

#[async_trait]
impl CacheProvider for FilesystemProvider {
    async fn restore(&self, request: &CacheRestoreRequest) -> Result<RestoreResult> {
        let start = Instant::now();

        // Try exact key match first
        if let Some((path, compression)) = self.find(&request.key) {
            let entry = self.entry_for(&request.key, &path, compression).await?;
            self.unpack(path, request.destination.clone(), compression)
                .await?;
            info!(key = %request.key, size_bytes = entry.size_bytes, "Cache restored");

            return Ok(RestoreResult {
                entry: Some(entry),
                matched_key: Some(request.key.clone()),
                exact_match: true,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        // Try restore keys
        for restore_key in &request.restore_keys {
            let entries = self.list(restore_key).await?;
            if let Some(entry) = entries.into_iter().next()
                && let Some((path, compression)) = self.find(&entry.key)
            {
                self.unpack(path, request.destination.clone(), compression)
                    .await?;
                info!(key = %entry.key, prefix = %restore_key, "Cache restored from prefix");

                return Ok(RestoreResult {
                    matched_key: Some(entry.key.clone()),
                    entry: Some(entry),
                    exact_match: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
        }

        debug!(key = %request.key, "Cache miss");
        Ok(RestoreResult {
            entry: None,
            matched_key: None,
            exact_match: false,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn save(&self, request: &CacheSaveRequest) -> Result<SaveResult> {
        let start = Instant::now();

        tokio::fs::create_dir_all(&self.root_dir)
            .await
            .map_err(|e| Error::Cache(format!("Failed to create cache dir: {}", e)))?;

        let target = self.key_path(&request.key, request.compression);
        let root_dir = self.root_dir.clone();
        let owned = request.clone();
        let target_path = target.clone();
        tokio::task::spawn_blocking(move || write_atomically(&owned, &root_dir, &target_path))
            .await
            .map_err(|e| Error::Internal(format!("Cache save task failed: {}", e)))??;

        let entry = self
            .entry_for(&request.key, &target, request.compression)
            .await?;
        info!(key = %request.key, size_bytes = entry.size_bytes, "Cache saved");

        Ok(SaveResult {
            entry,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.find(key).is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        while let Some((path, _)) = self.find(key) {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| Error::Cache(format!("Failed to delete cache: {}", e)))?;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<CacheEntry>> {
        if !self.root_dir.exists() {
            return Ok(vec![]);
        }

        let mut entries = vec![];
        let sanitized_prefix = sanitize_key(prefix);

        let mut read_dir = tokio::fs::read_dir(&self.root_dir)
            .await
            .map_err(|e| Error::Cache(format!("Failed to read cache dir: {}", e)))?;

        while let Some(dir_entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| Error::Cache(format!("Failed to read entry: {}", e)))?
        {
            let name = dir_entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }

            let parsed = [CompressionType::Zstd, CompressionType::None]
                .into_iter()
                .find_map(|c| {
                    name.strip_suffix(&format!(".{}", c.extension()))
                        .map(|key| (key.to_string(), c))
                });

            if let Some((key, compression)) = parsed
                && key.starts_with(&sanitized_prefix)
            {
                entries.push(self.entry_for(&key, &dir_entry.path(), compression).await?);
            }
        }

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.key.cmp(&b.key)));

        Ok(entries)
    }
}
