use super::{Capability, CapabilityCall, CapabilityOutput};
use async_trait::async_trait;
use kiln_cache::{CacheProvider, CacheRestoreRequest, CacheSaveRequest, CompressionType};
use kiln_core::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// `cache`: explicit restore or save of workspace paths.
///
/// Inputs: `key` (required), `paths` (required for save), `restore-keys`
/// and `method` (`restore`, the default, or `save`). Sets the `cache-hit`
/// output on restore.
pub struct CacheCapability {
    provider: Arc<dyn CacheProvider>,
}

impl CacheCapability {
    pub fn new(provider: Arc<dyn CacheProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Capability for CacheCapability {
    fn name(&self) -> &str {
        "cache"
    }

    async fn invoke(&self, call: &CapabilityCall) -> Result<CapabilityOutput> {
        let Some(key) = call.input("key") else {
            return Ok(CapabilityOutput::failure("Missing 'key' input"));
        };

        match call.input("method").unwrap_or("restore") {
            "restore" => {
                info!(key, "Restoring cache");
                let request = CacheRestoreRequest {
                    key: key.to_string(),
                    restore_keys: call.list_input("restore-keys"),
                    destination: call.workspace.clone(),
                };
                let result = self.provider.restore(&request).await?;
                Ok(CapabilityOutput::success()
                    .with_output("cache-hit", result.exact_match.to_string())
                    .with_output("cache-matched-key", result.matched_key.unwrap_or_default()))
            }
            "save" => {
                let paths: Vec<PathBuf> = call
                    .list_input("paths")
                    .into_iter()
                    .map(PathBuf::from)
                    .collect();
                if paths.is_empty() {
                    return Ok(CapabilityOutput::failure("Missing 'paths' input"));
                }

                info!(key, "Saving cache");
                let request = CacheSaveRequest {
                    key: key.to_string(),
                    paths,
                    base_dir: call.workspace.clone(),
                    compression: CompressionType::Zstd,
                };
                self.provider.save(&request).await?;
                Ok(CapabilityOutput::success())
            }
            other => Ok(CapabilityOutput::failure(format!("Unknown method: {}", other))),
        }
    }
}
