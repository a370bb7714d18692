//! Error types for kiln.

use crate::run::JobStatus;
use thiserror::Error;

/// Problems with a pipeline definition. All of these are detected before
/// any job instance executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Pipeline '{0}' defines no jobs")]
    EmptyPipeline(String),

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Job '{job}' needs unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("Job '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Dependency cycle detected involving job '{0}'")]
    CycleDetected(String),

    #[error("Malformed matrix in job '{job}': {reason}")]
    MalformedMatrix { job: String, reason: String },

    #[error("Invalid step {index} in job '{job}': {reason}")]
    InvalidStep {
        job: String,
        index: usize,
        reason: String,
    },

    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Unknown shell: {0}")]
    UnknownShell(String),
}

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Pipeline file not found: {0}")]
    PipelineNotFound(String),

    // Run bookkeeping
    #[error("Invalid status transition for {instance}: {from} -> {to}")]
    InvalidTransition {
        instance: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Outcome already recorded for {0}")]
    DuplicateOutcome(String),

    // Execution environment
    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Step execution failed: {0}")]
    Execution(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Configuration errors abort a run before anything executes.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Yaml(err.to_string())
    }
}
