//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and the
//! adapters that actually run work.

use crate::Result;
use crate::instance::JobInstance;
use crate::run::{ExecutionReport, RunContext};
use async_trait::async_trait;

/// Runs one job instance to completion.
///
/// Step failures are reported inside the returned [`ExecutionReport`]. An
/// `Err` means the environment itself could not be prepared (workspace,
/// checkout, cache) and is recorded as an environment failure.
#[async_trait]
pub trait InstanceExecutor: Send + Sync {
    async fn execute(&self, instance: &JobInstance, run: &RunContext) -> Result<ExecutionReport>;
}
