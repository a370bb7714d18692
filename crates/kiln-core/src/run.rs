//! Run and execution types.

use crate::error::{Error, Result};
use crate::event::{RunDecision, TriggerEvent};
use crate::ids::{InstanceId, RunId};
use crate::instance::{JobInstance, MatrixBinding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }

    /// `pending -> running -> {succeeded, failed}` and
    /// `pending -> {skipped, cancelled}`; nothing else.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Skipped)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    StepFailed {
        step: String,
        index: usize,
        exit_code: Option<i32>,
    },
    Timeout {
        after_secs: u64,
    },
    Environment {
        message: String,
    },
    DependencyFailed {
        job: String,
    },
    FailFast {
        failed: String,
    },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::StepFailed {
                step,
                exit_code: Some(code),
                ..
            } => write!(f, "step '{step}' exited with {code}"),
            FailureCause::StepFailed { step, .. } => write!(f, "step '{step}' failed"),
            FailureCause::Timeout { after_secs } => write!(f, "timed out after {after_secs}s"),
            FailureCause::Environment { message } => write!(f, "environment: {message}"),
            FailureCause::DependencyFailed { job } => write!(f, "needed job '{job}' did not succeed"),
            FailureCause::FailFast { failed } => write!(f, "cancelled after '{failed}' failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheReport {
    pub key: String,
    pub restored: bool,
    pub saved: bool,
}

/// What an executor reports back for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub steps: Vec<StepReport>,
    pub cache: Option<CacheReport>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.failed_step().is_none()
    }

    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }
}

/// The single record an instance leaves behind.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceOutcome {
    pub instance: InstanceId,
    pub job: String,
    pub display_name: String,
    pub binding: MatrixBinding,
    pub stage: usize,
    pub status: JobStatus,
    pub cause: Option<FailureCause>,
    pub continue_on_error: bool,
    pub duration_ms: u64,
    pub steps: Vec<StepReport>,
    pub cache: Option<CacheReport>,
}

impl InstanceOutcome {
    pub fn pending(instance: &JobInstance) -> Self {
        Self {
            instance: instance.id,
            job: instance.job.clone(),
            display_name: instance.display_name.clone(),
            binding: instance.binding.clone(),
            stage: instance.stage,
            status: JobStatus::Pending,
            cause: None,
            continue_on_error: instance.continue_on_error,
            duration_ms: 0,
            steps: Vec::new(),
            cache: None,
        }
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                instance: self.display_name.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record a terminal status together with its cause.
    pub fn finish(&mut self, next: JobStatus, cause: Option<FailureCause>) -> Result<()> {
        self.transition(next)?;
        self.cause = cause;
        Ok(())
    }

    /// Failed, but the job tolerates failures.
    pub fn is_allowed_failure(&self) -> bool {
        self.status == JobStatus::Failed && self.continue_on_error
    }

    /// Whether jobs that need this one must be skipped.
    pub fn blocks_dependents(&self) -> bool {
        match self.status {
            JobStatus::Failed => !self.continue_on_error,
            JobStatus::Skipped | JobStatus::Cancelled => true,
            _ => false,
        }
    }

    pub fn failed_step(&self) -> Option<&str> {
        match &self.cause {
            Some(FailureCause::StepFailed { step, .. }) => Some(step),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => f.write_str("succeeded"),
            RunStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Read-only facts about the run handed to every executor call.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub pipeline: String,
    pub event: TriggerEvent,
}

/// Append-only log of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: RunId,
    pub pipeline: String,
    pub event: TriggerEvent,
    pub decision: RunDecision,
    outcomes: Vec<InstanceOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
}

impl RunRecord {
    pub fn new(pipeline: impl Into<String>, event: TriggerEvent, decision: RunDecision) -> Self {
        Self {
            id: RunId::new(),
            pipeline: pipeline.into(),
            event,
            decision,
            outcomes: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            status: None,
        }
    }

    pub fn context(&self) -> RunContext {
        RunContext {
            run_id: self.id,
            pipeline: self.pipeline.clone(),
            event: self.event.clone(),
        }
    }

    /// Each instance appends exactly one terminal outcome.
    pub fn append(&mut self, outcome: InstanceOutcome) -> Result<()> {
        if !outcome.status.is_terminal() {
            return Err(Error::Internal(format!(
                "outcome for {} is not terminal ({})",
                outcome.display_name, outcome.status
            )));
        }
        if self.outcomes.iter().any(|o| o.instance == outcome.instance) {
            return Err(Error::DuplicateOutcome(outcome.display_name));
        }
        self.outcomes.push(outcome);
        Ok(())
    }

    pub fn outcomes(&self) -> &[InstanceOutcome] {
        &self.outcomes
    }

    pub fn outcome(&self, id: InstanceId) -> Option<&InstanceOutcome> {
        self.outcomes.iter().find(|o| o.instance == id)
    }

    /// True when any recorded instance of `job` failed without being an
    /// allowed failure, or was skipped or cancelled.
    pub fn job_blocks_dependents(&self, job: &str) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.job == job && o.blocks_dependents())
    }

    pub fn complete(&mut self, status: RunStatus) {
        self.status = Some(status);
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}
