//! Locating and loading pipeline files.

use anyhow::{Context, Result};
use kiln_core::Error;
use kiln_core::pipeline::PipelineDefinition;
use std::path::{Path, PathBuf};

/// Files tried, in order, when no pipeline file is given.
pub const PIPELINE_FILES: &[&str] = &[
    ".kiln/pipeline.yaml",
    ".kiln/pipeline.yml",
    "kiln.yaml",
    "kiln.yml",
];

/// Resolve the pipeline file: `file` when given, otherwise the first
/// well-known file under `dir`.
pub fn resolve(file: Option<&Path>, dir: &Path) -> Result<PathBuf, Error> {
    match file {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => Err(Error::PipelineNotFound(path.display().to_string())),
        None => PIPELINE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                Error::PipelineNotFound(format!(
                    "none of {} in {}",
                    PIPELINE_FILES.join(", "),
                    dir.display()
                ))
            }),
    }
}

/// Read and parse the pipeline file.
pub fn load(file: Option<&Path>, dir: &Path) -> Result<(PathBuf, PipelineDefinition)> {
    let path = resolve(file, dir)?;
    let source = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let definition = PipelineDefinition::from_yaml(&source)
        .with_context(|| format!("Invalid pipeline {}", path.display()))?;
    Ok((path, definition))
}
