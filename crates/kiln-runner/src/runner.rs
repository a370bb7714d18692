//! Core runner trait and types.

use async_trait::async_trait;
use kiln_core::Result;
use kiln_core::pipeline::{Shell, StepDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Result of step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration_ms: u64,
}

/// Context for step execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workspace: PathBuf,
    /// Fully layered environment for this step.
    pub env: HashMap<String, String>,
    pub step: StepDefinition,
}

impl StepContext {
    /// The step's working directory, resolved against the workspace.
    pub fn working_dir(&self) -> PathBuf {
        match &self.step.working_directory {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        }
    }
}

/// Trait for step execution.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute a step, streaming output to the provided channel.
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult>;

    /// Check if this runner can handle the given step.
    fn can_handle(&self, step: &StepDefinition) -> bool;
}

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Shell used when a step names none.
    pub default_shell: Shell,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_shell: Shell::platform_default(),
        }
    }
}
