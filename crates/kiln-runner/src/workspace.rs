//! Isolated per-instance workspaces.

use kiln_core::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Where a fresh workspace gets its contents from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WorkspaceSource {
    /// Start empty.
    #[default]
    Empty,
    /// Copy a local directory.
    Directory(PathBuf),
    /// Clone a repository and check out a revision.
    Git {
        repository: String,
        revision: Option<String>,
    },
}

impl WorkspaceSource {
    /// Interpret a `--source` argument.
    ///
    /// `none` means empty; URLs and `*.git` paths are cloned; a local
    /// directory is cloned when a revision is requested and it is a git
    /// repository, otherwise copied.
    pub fn parse(spec: &str, revision: Option<String>) -> Self {
        let spec = spec.trim();
        if spec.is_empty() || spec.eq_ignore_ascii_case("none") {
            return WorkspaceSource::Empty;
        }

        let looks_remote = spec.contains("://") || spec.starts_with("git@") || spec.ends_with(".git");
        let path = PathBuf::from(spec);
        if looks_remote || (revision.is_some() && path.join(".git").exists()) {
            return WorkspaceSource::Git {
                repository: spec.to_string(),
                revision,
            };
        }

        WorkspaceSource::Directory(path)
    }

    /// Fill `dest` (an existing, empty directory).
    pub async fn populate(&self, dest: &Path) -> Result<()> {
        match self {
            WorkspaceSource::Empty => Ok(()),
            WorkspaceSource::Directory(src) => {
                debug!(src = %src.display(), dest = %dest.display(), "Copying source directory");
                let src = src.clone();
                let dest = dest.to_path_buf();
                tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
                    .await
                    .map_err(|e| Error::Internal(format!("Copy task failed: {}", e)))?
            }
            WorkspaceSource::Git {
                repository,
                revision,
            } => {
                debug!(%repository, ?revision, dest = %dest.display(), "Cloning source repository");
                let dest_arg = dest.to_string_lossy().to_string();
                git(&["clone", "--quiet", repository.as_str(), dest_arg.as_str()], None).await?;
                if let Some(rev) = revision {
                    git(&["checkout", "--quiet", "--detach", rev.as_str()], Some(dest)).await?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for WorkspaceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceSource::Empty => f.write_str("none"),
            WorkspaceSource::Directory(path) => write!(f, "{}", path.display()),
            WorkspaceSource::Git {
                repository,
                revision: Some(rev),
            } => write!(f, "{}@{}", repository, rev),
            WorkspaceSource::Git { repository, .. } => f.write_str(repository),
        }
    }
}

async fn git(args: &[&str], cwd: Option<&Path>) -> Result<()> {
    let mut command = Command::new("git");
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command
        .output()
        .await
        .map_err(|e| Error::Workspace(format!("Failed to execute git: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Workspace(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Recursive copy that never descends into `dest` itself.
fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let src = src
        .canonicalize()
        .map_err(|e| Error::Workspace(format!("Source {} is not accessible: {}", src.display(), e)))?;
    let dest_canonical = dest.canonicalize()?;
    copy_dir(&src, dest, &dest_canonical)
}

fn copy_dir(src: &Path, dest: &Path, skip: &Path) -> Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        if from == skip {
            continue;
        }
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            std::fs::create_dir_all(&to)?;
            copy_dir(&from, &to, skip)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = std::fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    if from.is_dir() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    Ok(())
}

/// A workspace directory that is removed when dropped, however the
/// instance ended.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    keep: bool,
}

impl Workspace {
    /// Create a fresh directory under `root` and populate it.
    pub async fn acquire(root: &Path, label: &str, source: &WorkspaceSource, keep: bool) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| Error::Workspace(format!("Failed to create workspace root: {}", e)))?;

        let dir_name = format!("{}-{}", dir_label(label), uuid::Uuid::new_v4().simple());
        let path = root.join(dir_name);
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| Error::Workspace(format!("Failed to create workspace: {}", e)))?;

        // Guard first so a failed populate still cleans up.
        let workspace = Self { path, keep };
        source.populate(&workspace.path).await?;

        info!(path = %workspace.path.display(), %source, "Workspace ready");
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.keep {
            info!(path = %self.path.display(), "Keeping workspace");
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to cleanup workspace");
        } else {
            debug!(path = %self.path.display(), "Workspace removed");
        }
    }
}

fn dir_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    let short: String = trimmed.chars().take(40).collect();
    if short.is_empty() { "instance".to_string() } else { short }
}
