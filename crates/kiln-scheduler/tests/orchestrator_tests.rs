//! End-to-end orchestration against a scripted executor.

use async_trait::async_trait;
use kiln_core::event::TriggerEvent;
use kiln_core::instance::JobInstance;
use kiln_core::pipeline::{EventKind, PipelineDefinition};
use kiln_core::ports::InstanceExecutor;
use kiln_core::run::{
    ExecutionReport, FailureCause, JobStatus, RunContext, RunStatus, StepReport, StepStatus,
};
use kiln_core::{ConfigError, Error, Result};
use kiln_scheduler::{Orchestrator, RunReport, SchedulerConfig};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

/// Runs each step "successfully" unless its script contains `exit 1`, or the
/// instance runs on an OS listed in `broken_os`.
#[derive(Default)]
struct ScriptedExecutor {
    started: Mutex<Vec<String>>,
    broken_os: Vec<String>,
}

impl ScriptedExecutor {
    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstanceExecutor for ScriptedExecutor {
    async fn execute(&self, instance: &JobInstance, _run: &RunContext) -> Result<ExecutionReport> {
        self.started
            .lock()
            .unwrap()
            .push(instance.display_name.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut steps = Vec::new();
        let mut failed = false;
        for (index, step) in instance.steps.iter().enumerate() {
            let status = if failed {
                StepStatus::Skipped
            } else if step.run.as_deref().is_some_and(|r| r.contains("exit 1"))
                || (index == 1 && self.broken_os.contains(&instance.runs_on))
            {
                failed = true;
                StepStatus::Failed
            } else {
                StepStatus::Succeeded
            };
            steps.push(StepReport {
                index,
                name: step.label(),
                status,
                exit_code: match status {
                    StepStatus::Succeeded => Some(0),
                    StepStatus::Failed => Some(1),
                    StepStatus::Skipped => None,
                },
                duration_ms: 1,
                error: None,
            });
        }
        Ok(ExecutionReport { steps, cache: None })
    }
}

const THREE_OS: &str = r#"
name: ci
on:
  - event: pull_request
    branches: [main]
  - event: workflow_call
jobs:
  - name: test
    runs-on: ${{ matrix.os }}
    matrix:
      axes:
        os: [A, B, C]
    steps:
      - uses: checkout
      - name: build
        run: cargo build
      - name: test
        run: cargo test
"#;

fn orchestrator(executor: Arc<ScriptedExecutor>, limit: Option<usize>) -> Orchestrator {
    Orchestrator::new(
        executor,
        SchedulerConfig {
            concurrency_limit: limit,
            default_timeout: Duration::from_secs(10),
        },
    )
}

fn row<'a>(report: &'a RunReport, name: &str) -> &'a kiln_scheduler::ReportRow {
    report
        .rows
        .iter()
        .find(|r| r.name == name)
        .unwrap_or_else(|| panic!("no row named {name}"))
}

#[tokio::test]
async fn three_os_matrix_succeeds() {
    let executor = Arc::new(ScriptedExecutor::default());
    let definition = PipelineDefinition::from_yaml(THREE_OS).unwrap();

    let report = assert_ok!(
        orchestrator(executor.clone(), None)
            .execute(&definition, TriggerEvent::pull_request("refs/heads/main"))
            .await
    )
    .expect("pull request to main matches");

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.exit_code, 0);
    let names: Vec<_> = report.rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["test (A)", "test (B)", "test (C)"]);
    assert!(report.rows.iter().all(|r| r.status == JobStatus::Succeeded));
    assert_eq!(executor.started().len(), 3);
}

#[tokio::test]
async fn middle_step_failure_on_one_instance() {
    let executor = Arc::new(ScriptedExecutor {
        broken_os: vec!["B".into()],
        ..Default::default()
    });
    let mut definition = PipelineDefinition::from_yaml(THREE_OS).unwrap();
    if let Some(matrix) = definition.jobs[0].matrix.as_mut() {
        matrix.fail_fast = false;
    }

    let report = orchestrator(executor.clone(), None)
        .execute(&definition, TriggerEvent::new(EventKind::WorkflowCall))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code, 1);
    assert_eq!(row(&report, "test (A)").status, JobStatus::Succeeded);
    assert_eq!(row(&report, "test (C)").status, JobStatus::Succeeded);

    let b = row(&report, "test (B)");
    assert_eq!(b.status, JobStatus::Failed);
    assert_eq!(b.failed_step.as_deref(), Some("build"));
}

#[tokio::test]
async fn fail_fast_cancels_siblings_that_have_not_started() {
    let executor = Arc::new(ScriptedExecutor {
        broken_os: vec!["A".into()],
        ..Default::default()
    });
    let definition = PipelineDefinition::from_yaml(THREE_OS).unwrap();

    let report = orchestrator(executor.clone(), Some(1))
        .execute(&definition, TriggerEvent::pull_request("main"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(executor.started(), vec!["test (A)"]);
    assert_eq!(row(&report, "test (A)").status, JobStatus::Failed);
    for name in ["test (B)", "test (C)"] {
        let r = row(&report, name);
        assert_eq!(r.status, JobStatus::Cancelled);
        assert_eq!(r.cause.as_deref(), Some("cancelled after 'test (A)' failed"));
    }
    assert_eq!(report.status, RunStatus::Failed);
}

#[tokio::test]
async fn unmatched_branch_runs_nothing() {
    let executor = Arc::new(ScriptedExecutor::default());
    let definition = PipelineDefinition::from_yaml(THREE_OS).unwrap();

    let report = orchestrator(executor.clone(), None)
        .execute(&definition, TriggerEvent::pull_request("feature/x"))
        .await
        .unwrap();

    assert!(report.is_none());
    assert!(executor.started().is_empty());
}

#[tokio::test]
async fn cycle_is_rejected_before_anything_runs() {
    let executor = Arc::new(ScriptedExecutor::default());
    let yaml = r#"
name: cyclic
jobs:
  - name: a
    needs: [b]
    steps: [{ run: make a }]
  - name: b
    needs: [a]
    steps: [{ run: make b }]
  - name: independent
    steps: [{ run: make c }]
"#;
    // Parsing validates the jobs themselves; the cycle surfaces when planning.
    let definition = PipelineDefinition::from_yaml(yaml).unwrap();

    let err = assert_err!(
        orchestrator(executor.clone(), None)
            .execute(&definition, TriggerEvent::push("main"))
            .await
    );
    assert!(matches!(
        err,
        Error::Configuration(ConfigError::CycleDetected(_))
    ));
    assert!(err.is_configuration());
    assert!(executor.started().is_empty());
}

#[tokio::test]
async fn dependents_of_a_failed_job_are_skipped() {
    let executor = Arc::new(ScriptedExecutor::default());
    let yaml = r#"
name: staged
jobs:
  - name: fmt
    steps: [{ run: exit 1 }]
  - name: docs
    steps: [{ run: cargo doc }]
  - name: test
    needs: [fmt]
    matrix:
      axes:
        os: [A, B]
    steps: [{ run: cargo test }]
  - name: publish
    needs: [docs, test]
    steps: [{ run: cargo publish }]
"#;
    let definition = PipelineDefinition::from_yaml(yaml).unwrap();

    let report = orchestrator(executor.clone(), None)
        .execute(&definition, TriggerEvent::push("main"))
        .await
        .unwrap()
        .unwrap();

    let statuses: Vec<_> = report
        .rows
        .iter()
        .map(|r| (r.name.as_str(), r.stage, r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("fmt", 0, JobStatus::Failed),
            ("docs", 0, JobStatus::Succeeded),
            ("test (A)", 1, JobStatus::Skipped),
            ("test (B)", 1, JobStatus::Skipped),
            ("publish", 2, JobStatus::Skipped),
        ]
    );
    assert_eq!(
        row(&report, "publish").cause.as_deref(),
        Some(FailureCause::DependencyFailed { job: "test".into() }.to_string().as_str())
    );

    let mut started = executor.started();
    started.sort();
    assert_eq!(started, vec!["docs", "fmt"]);
}

#[tokio::test]
async fn allowed_failures_do_not_block_dependents() {
    let executor = Arc::new(ScriptedExecutor::default());
    let yaml = r#"
name: lenient
jobs:
  - name: semver
    continue-on-error: true
    steps: [{ run: exit 1 }]
  - name: release
    needs: [semver]
    steps: [{ run: make release }]
"#;
    let definition = PipelineDefinition::from_yaml(yaml).unwrap();

    let report = orchestrator(executor, None)
        .execute(&definition, TriggerEvent::push("main"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(row(&report, "semver").allowed_failure);
    assert_eq!(row(&report, "release").status, JobStatus::Succeeded);
}

#[test]
fn plan_expands_every_instance_without_running() {
    let executor = Arc::new(ScriptedExecutor::default());
    let yaml = r#"
name: wide
jobs:
  - name: build
    steps: [{ run: make }]
  - name: test
    needs: [build]
    matrix:
      axes:
        os: [linux, macos, windows]
        rust: [stable, beta]
        features: [default, all]
      exclude:
        - os: windows
          rust: beta
    steps: [{ run: cargo test }]
"#;
    let definition = PipelineDefinition::from_yaml(yaml).unwrap();
    let plan = orchestrator(executor.clone(), None)
        .plan(&definition, &TriggerEvent::push("main"))
        .unwrap();

    assert_eq!(plan.stages.len(), 2);
    // 3 × 2 × 2, minus the two windows/beta combinations
    assert_eq!(plan.stages[1].instances().count(), 10);
    assert_eq!(plan.instance_count(), 11);
    assert!(executor.started().is_empty());

    let summary = serde_json::to_value(plan.summary()).unwrap();
    assert_eq!(
        summary["stages"][1]["jobs"][0]["instances"][0]["display_name"],
        "test (linux, stable, default)"
    );
}
