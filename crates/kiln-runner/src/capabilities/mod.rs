//! Built-in and registered capabilities that `uses:` steps resolve to.

mod cache;
mod checkout;

pub use cache::CacheCapability;
pub use checkout::CheckoutCapability;

use crate::workspace::WorkspaceSource;
use async_trait::async_trait;
use kiln_cache::CacheProvider;
use kiln_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A named operation a step can invoke instead of a shell command.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Get the capability name.
    fn name(&self) -> &str;

    /// Execute the capability.
    async fn invoke(&self, call: &CapabilityCall) -> Result<CapabilityOutput>;
}

/// Input handed to a capability.
#[derive(Debug, Clone)]
pub struct CapabilityCall {
    pub reference: CapabilityRef,
    /// `with:` values from the step.
    pub inputs: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub workspace: PathBuf,
    pub step_name: String,
    pub runs_on: String,
}

impl CapabilityCall {
    pub fn input(&self, key: &str) -> Option<&str> {
        self.inputs
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// A list input, one entry per line or comma.
    pub fn list_input(&self, key: &str) -> Vec<String> {
        self.input(key)
            .map(|raw| {
                raw.split(['\n', ','])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Output from capability execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityOutput {
    /// Whether execution succeeded.
    pub success: bool,
    /// Exit code (0 for success).
    pub exit_code: i32,
    /// Output values set by the capability.
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    /// Error message if failed.
    pub error: Option<String>,
}

impl CapabilityOutput {
    pub fn success() -> Self {
        Self {
            success: true,
            exit_code: 0,
            outputs: HashMap::new(),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: 1,
            outputs: HashMap::new(),
            error: Some(message.into()),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

/// Reference to a capability (e.g., `kiln/checkout@v1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRef {
    pub name: String,
    pub version: Option<String>,
}

impl CapabilityRef {
    /// Parse a reference; the optional `kiln/` namespace is dropped.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let (name, version) = match s.split_once('@') {
            Some((name, version)) => (name, Some(version.to_string())),
            None => (s, None),
        };
        Self {
            name: name.strip_prefix("kiln/").unwrap_or(name).to_string(),
            version,
        }
    }

    /// Get the full reference string.
    pub fn full_name(&self) -> String {
        match &self.version {
            Some(v) => format!("{}@{}", self.name, v),
            None => self.name.clone(),
        }
    }
}

/// Step resolution table for `uses:` references.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    entries: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in `checkout` and `cache` capabilities.
    pub fn with_builtins(source: WorkspaceSource, cache: Arc<dyn CacheProvider>) -> Self {
        let mut table = Self::new();
        table.register(Arc::new(CheckoutCapability::new(source)));
        table.register(Arc::new(CacheCapability::new(cache)));
        table
    }

    /// Register a capability, replacing any with the same name.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.entries
            .insert(capability.name().to_string(), capability);
    }

    pub fn resolve(&self, reference: &str) -> Option<(CapabilityRef, Arc<dyn Capability>)> {
        let parsed = CapabilityRef::parse(reference);
        self.entries
            .get(&parsed.name)
            .cloned()
            .map(|capability| (parsed, capability))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
