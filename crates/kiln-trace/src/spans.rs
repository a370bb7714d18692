//! Span creation for pipeline operations.

use tracing::{Level, Span, span};

/// CI span attributes shared by the span helpers.
#[derive(Debug, Clone, Default)]
pub struct CiAttributes {
    pub pipeline_name: Option<String>,
    pub run_id: Option<String>,
    pub event: Option<String>,
    pub git_ref: Option<String>,
    pub git_sha: Option<String>,
    pub stage_index: Option<usize>,
    pub job_name: Option<String>,
    pub instance_name: Option<String>,
    pub runs_on: Option<String>,
    pub step_name: Option<String>,
    pub step_index: Option<usize>,
}

impl CiAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = Some(name.into());
        self
    }

    pub fn run(mut self, id: impl Into<String>, event: impl Into<String>) -> Self {
        self.run_id = Some(id.into());
        self.event = Some(event.into());
        self
    }

    pub fn vcs(mut self, git_ref: Option<String>, sha: Option<String>) -> Self {
        self.git_ref = git_ref;
        self.git_sha = sha;
        self
    }

    pub fn stage(mut self, index: usize) -> Self {
        self.stage_index = Some(index);
        self
    }

    pub fn instance(
        mut self,
        job: impl Into<String>,
        name: impl Into<String>,
        runs_on: impl Into<String>,
    ) -> Self {
        self.job_name = Some(job.into());
        self.instance_name = Some(name.into());
        self.runs_on = Some(runs_on.into());
        self
    }

    pub fn step(mut self, index: usize, name: impl Into<String>) -> Self {
        self.step_index = Some(index);
        self.step_name = Some(name.into());
        self
    }
}

/// Create a span for a pipeline run.
pub fn run_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "run.execute",
        ci.pipeline.name = attrs.pipeline_name.as_deref().unwrap_or(""),
        ci.run.id = attrs.run_id.as_deref().unwrap_or(""),
        ci.event = attrs.event.as_deref().unwrap_or(""),
        vcs.git_ref = attrs.git_ref.as_deref().unwrap_or(""),
        vcs.sha = attrs.git_sha.as_deref().unwrap_or(""),
    )
}

/// Create a span for a stage.
pub fn stage_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "stage.execute",
        ci.run.id = attrs.run_id.as_deref().unwrap_or(""),
        ci.stage.index = attrs.stage_index.unwrap_or(0) as u64,
    )
}

/// Create a span for one job instance.
pub fn instance_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "instance.execute",
        ci.run.id = attrs.run_id.as_deref().unwrap_or(""),
        ci.stage.index = attrs.stage_index.unwrap_or(0) as u64,
        ci.job.name = attrs.job_name.as_deref().unwrap_or(""),
        ci.instance.name = attrs.instance_name.as_deref().unwrap_or(""),
        ci.runs_on = attrs.runs_on.as_deref().unwrap_or(""),
    )
}

/// Create a span for a step.
pub fn step_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "step.execute",
        ci.instance.name = attrs.instance_name.as_deref().unwrap_or(""),
        ci.step.index = attrs.step_index.unwrap_or(0) as u64,
        ci.step.name = attrs.step_name.as_deref().unwrap_or(""),
    )
}

/// Create a span for cache operations.
pub fn cache_span(operation: &str, key: &str) -> Span {
    span!(
        Level::DEBUG,
        "cache.operation",
        operation = operation,
        cache.key = key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ci_attributes_builder() {
        let attrs = CiAttributes::new()
            .pipeline("ci")
            .run("run_456", "push")
            .vcs(Some("refs/heads/main".into()), None)
            .stage(1)
            .instance("test", "test (ubuntu-latest)", "ubuntu-latest")
            .step(2, "cargo test");

        assert_eq!(attrs.pipeline_name.as_deref(), Some("ci"));
        assert_eq!(attrs.event.as_deref(), Some("push"));
        assert_eq!(attrs.stage_index, Some(1));
        assert_eq!(attrs.instance_name.as_deref(), Some("test (ubuntu-latest)"));
        assert_eq!(attrs.step_index, Some(2));
        assert!(attrs.git_sha.is_none());
    }

    #[test]
    fn test_spans_build_without_subscriber() {
        let attrs = CiAttributes::new().pipeline("ci").stage(0);
        let _run = run_span(&attrs).entered();
        let _stage = stage_span(&attrs).entered();
        let _cache = cache_span("restore", "linux-stable-abc");
    }
}
