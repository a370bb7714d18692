//! Triggering events and the decision to run.

use crate::pipeline::EventKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An occurrence that may start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerEvent {
    pub kind: EventKind,
    /// Branch ref, either `refs/heads/main` or plain `main`. For pull
    /// requests this is the target branch.
    #[serde(default)]
    pub branch_ref: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
    /// Set when the pipeline is invoked from another pipeline.
    #[serde(default)]
    pub is_reusable_call: bool,
}

impl TriggerEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            branch_ref: None,
            sha: None,
            is_reusable_call: kind == EventKind::WorkflowCall,
        }
    }

    pub fn push(branch: impl Into<String>) -> Self {
        Self::new(EventKind::Push).with_branch(branch)
    }

    pub fn pull_request(target_branch: impl Into<String>) -> Self {
        Self::new(EventKind::PullRequest).with_branch(target_branch)
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_ref = Some(branch.into());
        self
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    pub fn reusable(mut self) -> Self {
        self.is_reusable_call = true;
        self
    }

    /// Branch name with any `refs/heads/` prefix removed.
    pub fn branch(&self) -> Option<&str> {
        self.branch_ref
            .as_deref()
            .map(|r| r.strip_prefix("refs/heads/").unwrap_or(r))
    }
}

/// Produced by the trigger evaluator when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunDecision {
    /// Index of the matching rule in the definition's `on` list.
    pub rule_index: usize,
    pub matched: EventKind,
    /// The run was requested as a reusable sub-pipeline invocation.
    pub reusable: bool,
}
