use super::{Capability, CapabilityCall, CapabilityOutput};
use crate::workspace::WorkspaceSource;
use async_trait::async_trait;
use kiln_core::Result;
use std::path::{Component, Path};
use tracing::info;

/// `checkout`: populate the workspace (or a sub-path of it) from a source.
///
/// The instance workspace is already populated from the run's source when
/// it is acquired, so a plain `uses: checkout` is a no-op. Inputs:
/// `repository` clones another repository, `ref` picks a revision, and
/// `path` selects a sub-directory of the workspace.
pub struct CheckoutCapability {
    source: WorkspaceSource,
}

impl CheckoutCapability {
    pub fn new(source: WorkspaceSource) -> Self {
        Self { source }
    }

    fn resolve_source(&self, call: &CapabilityCall) -> WorkspaceSource {
        let revision = call.input("ref").map(str::to_string);
        match (call.input("repository"), &self.source) {
            (Some(repository), _) => WorkspaceSource::Git {
                repository: repository.to_string(),
                revision,
            },
            (None, WorkspaceSource::Git { repository, revision: default_rev }) => {
                WorkspaceSource::Git {
                    repository: repository.clone(),
                    revision: revision.or_else(|| default_rev.clone()),
                }
            }
            (None, other) => other.clone(),
        }
    }
}

/// A checkout path must name a location inside the workspace.
fn stays_in_workspace(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[async_trait]
impl Capability for CheckoutCapability {
    fn name(&self) -> &str {
        "checkout"
    }

    async fn invoke(&self, call: &CapabilityCall) -> Result<CapabilityOutput> {
        let path = call.input("path").unwrap_or(".");
        let explicit = call.input("repository").is_some() || call.input("ref").is_some();

        if path == "." && !explicit {
            info!(source = %self.source, "Workspace already checked out");
            return Ok(CapabilityOutput::success().with_output("path", "."));
        }

        let source = self.resolve_source(call);
        if source == WorkspaceSource::Empty {
            return Ok(CapabilityOutput::failure("No checkout source configured"));
        }

        if path == "." {
            return Ok(CapabilityOutput::failure(
                "Checking out a different source requires a 'path' input",
            ));
        }
        if !stays_in_workspace(Path::new(path)) {
            return Ok(CapabilityOutput::failure(format!(
                "Checkout path '{}' leaves the workspace",
                path
            )));
        }
        let target = call.workspace.join(path);
        tokio::fs::create_dir_all(&target).await?;
        if tokio::fs::read_dir(&target).await?.next_entry().await?.is_some() {
            return Ok(CapabilityOutput::failure(format!(
                "Checkout path '{}' is not empty",
                path
            )));
        }

        info!(%source, path, "Checking out");
        source.populate(&target).await?;

        Ok(CapabilityOutput::success().with_output("path", path))
    }
}
