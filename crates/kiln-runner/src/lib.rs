//! Execution context for kiln job instances.
//!
//! Each instance gets a fresh workspace, an optional cache restore, its
//! steps run in order through the step resolution table, and a cache save
//! on success. The workspace is released when the instance ends.

pub mod capabilities;
pub mod executor;
pub mod runner;
pub mod shell;
pub mod workspace;

pub use capabilities::{
    CacheCapability, Capability, CapabilityCall, CapabilityOutput, CapabilityRef, CapabilityTable,
    CheckoutCapability,
};
pub use executor::{ExecutionContext, ExecutorConfig};
pub use runner::{OutputLine, OutputStream, RunnerConfig, StepContext, StepResult, StepRunner};
pub use shell::ShellRunner;
pub use workspace::{Workspace, WorkspaceSource};
