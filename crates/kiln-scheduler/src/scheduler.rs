//! Stage-by-stage dispatch of job instances.

use kiln_core::instance::JobInstance;
use kiln_core::ports::InstanceExecutor;
use kiln_core::run::{FailureCause, InstanceOutcome, JobStatus, RunContext, RunRecord};
use kiln_core::{Error, Result};
use kiln_trace::{CiAttributes, instance_span, stage_span};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

/// Engine-wide scheduling limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Instances running at once across the whole run. `None` is unbounded.
    pub concurrency_limit: Option<usize>,
    /// Applied to templates that do not set `timeout-minutes`.
    pub default_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            default_timeout: Duration::from_secs(360 * 60),
        }
    }
}

/// The instances of one template within a stage. Fail-fast is scoped to a
/// group.
#[derive(Debug, Clone)]
pub struct MatrixGroup {
    pub job: String,
    pub needs: Vec<String>,
    pub fail_fast: bool,
    pub max_parallel: Option<usize>,
    pub instances: Vec<JobInstance>,
}

/// One ready set of the job graph.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub index: usize,
    pub groups: Vec<MatrixGroup>,
}

impl StagePlan {
    pub fn instances(&self) -> impl Iterator<Item = &JobInstance> {
        self.groups.iter().flat_map(|g| g.instances.iter())
    }
}

/// State shared by every task of one run.
#[derive(Clone)]
struct Dispatch {
    executor: Arc<dyn InstanceExecutor>,
    record: Arc<Mutex<RunRecord>>,
    run: Arc<RunContext>,
    global: Option<Arc<Semaphore>>,
    default_timeout: Duration,
}

/// Fail-fast state of one matrix group.
#[derive(Clone)]
struct GroupControl {
    fail_fast: bool,
    token: CancellationToken,
    first_failure: Arc<OnceLock<String>>,
}

/// Runs stages strictly in order, dispatching the instances of a stage
/// concurrently.
pub struct JobScheduler {
    executor: Arc<dyn InstanceExecutor>,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(executor: Arc<dyn InstanceExecutor>, config: SchedulerConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every stage and return the record with one outcome per instance.
    pub async fn run(&self, stages: Vec<StagePlan>, record: RunRecord) -> Result<RunRecord> {
        let dispatch = Dispatch {
            executor: self.executor.clone(),
            run: Arc::new(record.context()),
            record: Arc::new(Mutex::new(record)),
            global: self
                .config
                .concurrency_limit
                .map(|limit| Arc::new(Semaphore::new(limit.max(1)))),
            default_timeout: self.config.default_timeout,
        };

        for stage in stages {
            let attrs = CiAttributes::new()
                .run(dispatch.run.run_id.to_string(), dispatch.run.event.kind.as_str())
                .stage(stage.index);
            self.run_stage(stage, &dispatch)
                .instrument(stage_span(&attrs))
                .await?;
        }

        let Dispatch { record, .. } = dispatch;
        let record = Arc::try_unwrap(record)
            .map_err(|_| Error::Internal("run record is still shared after the last stage".into()))?
            .into_inner();
        Ok(record)
    }

    async fn run_stage(&self, stage: StagePlan, dispatch: &Dispatch) -> Result<()> {
        info!(
            stage = stage.index,
            jobs = stage.groups.len(),
            instances = stage.instances().count(),
            "Starting stage"
        );

        let mut groups = JoinSet::new();
        for group in stage.groups {
            let blocked_by = {
                let record = dispatch.record.lock().await;
                group
                    .needs
                    .iter()
                    .find(|job| record.job_blocks_dependents(job))
                    .cloned()
            };

            if let Some(job) = blocked_by {
                warn!(job = %group.job, needs = %job, "Skipping job: needed job did not succeed");
                let mut record = dispatch.record.lock().await;
                for instance in &group.instances {
                    let mut outcome = InstanceOutcome::pending(instance);
                    outcome.finish(
                        JobStatus::Skipped,
                        Some(FailureCause::DependencyFailed { job: job.clone() }),
                    )?;
                    record.append(outcome)?;
                }
                continue;
            }

            groups.spawn(dispatch_group(group, dispatch.clone()));
        }

        while let Some(joined) = groups.join_next().await {
            joined.map_err(|e| Error::Internal(format!("Dispatcher task failed: {}", e)))??;
        }

        info!(stage = stage.index, "Stage complete");
        Ok(())
    }
}

/// Start the group's instances in declaration order, honouring its
/// `max-parallel` and the global limit. The cancellation token is checked
/// only once both permits are held, right before an instance would start.
async fn dispatch_group(group: MatrixGroup, dispatch: Dispatch) -> Result<()> {
    let local = group.max_parallel.map(|limit| Arc::new(Semaphore::new(limit.max(1))));
    let control = GroupControl {
        fail_fast: group.fail_fast,
        token: CancellationToken::new(),
        first_failure: Arc::new(OnceLock::new()),
    };

    let mut tasks = JoinSet::new();
    for instance in group.instances {
        let local_permit = acquire(local.as_ref()).await?;
        let global_permit = acquire(dispatch.global.as_ref()).await?;

        if control.token.is_cancelled() {
            let failed = control.first_failure.get().cloned().unwrap_or_default();
            info!(instance = %instance.display_name, %failed, "Cancelled by fail-fast");
            let mut outcome = InstanceOutcome::pending(&instance);
            outcome.finish(JobStatus::Cancelled, Some(FailureCause::FailFast { failed }))?;
            dispatch.record.lock().await.append(outcome)?;
            continue;
        }

        tasks.spawn(run_instance(
            instance,
            dispatch.clone(),
            control.clone(),
            [local_permit, global_permit],
        ));
    }

    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|e| Error::Internal(format!("Instance task failed: {}", e)))??;
    }
    Ok(())
}

async fn acquire(semaphore: Option<&Arc<Semaphore>>) -> Result<Option<OwnedSemaphorePermit>> {
    match semaphore {
        Some(semaphore) => semaphore
            .clone()
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| Error::Internal("Concurrency semaphore closed".into())),
        None => Ok(None),
    }
}

/// Execute one instance and append its outcome. The permits are held until
/// the outcome is recorded.
async fn run_instance(
    instance: JobInstance,
    dispatch: Dispatch,
    control: GroupControl,
    permits: [Option<OwnedSemaphorePermit>; 2],
) -> Result<()> {
    let mut outcome = InstanceOutcome::pending(&instance);
    outcome.transition(JobStatus::Running)?;

    let limit = instance.timeout.unwrap_or(dispatch.default_timeout);
    let attrs = CiAttributes::new()
        .run(dispatch.run.run_id.to_string(), dispatch.run.event.kind.as_str())
        .stage(instance.stage)
        .instance(&instance.job, &instance.display_name, &instance.runs_on);

    let start = Instant::now();
    let result = tokio::time::timeout(limit, dispatch.executor.execute(&instance, &dispatch.run))
        .instrument(instance_span(&attrs))
        .await;
    outcome.duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(report)) => {
            let cause = report.failed_step().map(|step| FailureCause::StepFailed {
                step: step.name.clone(),
                index: step.index,
                exit_code: step.exit_code,
            });
            let status = if cause.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Succeeded
            };
            outcome.steps = report.steps;
            outcome.cache = report.cache;
            outcome.finish(status, cause)?;
        }
        Ok(Err(e)) => {
            outcome.finish(
                JobStatus::Failed,
                Some(FailureCause::Environment {
                    message: e.to_string(),
                }),
            )?;
        }
        Err(_) => {
            outcome.finish(
                JobStatus::Failed,
                Some(FailureCause::Timeout {
                    after_secs: limit.as_secs(),
                }),
            )?;
        }
    }

    match (&outcome.status, &outcome.cause) {
        (JobStatus::Succeeded, _) => {
            info!(instance = %instance.display_name, duration_ms = outcome.duration_ms, "Instance succeeded")
        }
        (_, Some(cause)) if outcome.continue_on_error => {
            warn!(instance = %instance.display_name, %cause, "Instance failed (allowed)")
        }
        (_, cause) => {
            error!(instance = %instance.display_name, cause = ?cause.as_ref().map(ToString::to_string), "Instance failed")
        }
    }

    if outcome.status == JobStatus::Failed && !outcome.continue_on_error && control.fail_fast {
        let _ = control.first_failure.set(instance.display_name.clone());
        control.token.cancel();
    }

    dispatch.record.lock().await.append(outcome)?;
    drop(permits);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_core::env::EnvLayers;
    use kiln_core::event::{RunDecision, TriggerEvent};
    use kiln_core::ids::InstanceId;
    use kiln_core::instance::MatrixBinding;
    use kiln_core::pipeline::EventKind;
    use kiln_core::run::{ExecutionReport, StepReport, StepStatus};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails instances whose display name contains `fail`, sleeps for those
    /// containing `slow`, and tracks peak concurrency.
    #[derive(Default)]
    struct FakeExecutor {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InstanceExecutor for FakeExecutor {
        async fn execute(&self, instance: &JobInstance, _run: &RunContext) -> Result<ExecutionReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = if instance.display_name.contains("slow") { 200 } else { 20 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if instance.display_name.contains("broken") {
                return Err(Error::Workspace("disk full".into()));
            }
            let failed = instance.display_name.contains("fail");
            Ok(ExecutionReport {
                steps: vec![StepReport {
                    index: 0,
                    name: "run".into(),
                    status: if failed { StepStatus::Failed } else { StepStatus::Succeeded },
                    exit_code: Some(if failed { 1 } else { 0 }),
                    duration_ms: delay,
                    error: None,
                }],
                cache: None,
            })
        }
    }

    fn instance(job: usize, index: usize, name: &str, values: &[&str]) -> JobInstance {
        let binding = values
            .iter()
            .fold(MatrixBinding::new(), |b, v| b.with("axis", *v));
        JobInstance {
            id: InstanceId::new(job, index),
            job: name.into(),
            display_name: binding.display_name(name),
            stage: 0,
            binding,
            runs_on: "local".into(),
            steps: vec![],
            env: EnvLayers::new(),
            timeout: None,
            continue_on_error: false,
            cache: None,
        }
    }

    fn group(job: usize, name: &str, values: &[&str]) -> MatrixGroup {
        MatrixGroup {
            job: name.into(),
            needs: vec![],
            fail_fast: true,
            max_parallel: None,
            instances: values
                .iter()
                .enumerate()
                .map(|(i, v)| instance(job, i, name, &[*v]))
                .collect(),
        }
    }

    fn record() -> RunRecord {
        RunRecord::new(
            "test",
            TriggerEvent::push("main"),
            RunDecision {
                rule_index: 0,
                matched: EventKind::Push,
                reusable: false,
            },
        )
    }

    fn statuses(record: &RunRecord) -> Vec<(String, JobStatus)> {
        let mut rows: Vec<_> = record
            .outcomes()
            .iter()
            .map(|o| (o.display_name.clone(), o.status))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    fn scheduler(executor: Arc<FakeExecutor>, limit: Option<usize>) -> JobScheduler {
        JobScheduler::new(
            executor,
            SchedulerConfig {
                concurrency_limit: limit,
                default_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_unstarted_siblings() {
        let executor = Arc::new(FakeExecutor::default());
        let stages = vec![StagePlan {
            index: 0,
            groups: vec![group(0, "test", &["fail", "b", "c"])],
        }];

        let record = scheduler(executor.clone(), Some(1))
            .run(stages, record())
            .await
            .unwrap();

        assert_eq!(
            statuses(&record),
            vec![
                ("test (b)".to_string(), JobStatus::Cancelled),
                ("test (c)".to_string(), JobStatus::Cancelled),
                ("test (fail)".to_string(), JobStatus::Failed),
            ]
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        let cancelled = record.outcome(InstanceId::new(0, 1)).unwrap();
        assert_eq!(
            cancelled.cause,
            Some(FailureCause::FailFast {
                failed: "test (fail)".into()
            })
        );
    }

    #[tokio::test]
    async fn test_fail_fast_disabled_runs_everything() {
        let executor = Arc::new(FakeExecutor::default());
        let mut g = group(0, "test", &["fail", "b", "c"]);
        g.fail_fast = false;

        let record = scheduler(executor.clone(), Some(1))
            .run(vec![StagePlan { index: 0, groups: vec![g] }], record())
            .await
            .unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            record
                .outcomes()
                .iter()
                .filter(|o| o.status == JobStatus::Succeeded)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_fail_fast_is_scoped_to_its_group() {
        let executor = Arc::new(FakeExecutor::default());
        let mut failing = group(0, "unit", &["fail", "later"]);
        failing.max_parallel = Some(1);
        let mut other = group(1, "docs", &["slow-a", "slow-b"]);
        other.max_parallel = Some(1);

        let record = scheduler(executor.clone(), None)
            .run(
                vec![StagePlan {
                    index: 0,
                    groups: vec![failing, other],
                }],
                record(),
            )
            .await
            .unwrap();

        assert_eq!(
            statuses(&record),
            vec![
                ("docs (slow-a)".to_string(), JobStatus::Succeeded),
                ("docs (slow-b)".to_string(), JobStatus::Succeeded),
                ("unit (fail)".to_string(), JobStatus::Failed),
                ("unit (later)".to_string(), JobStatus::Cancelled),
            ]
        );
    }

    #[tokio::test]
    async fn test_allowed_failure_does_not_trigger_fail_fast() {
        let executor = Arc::new(FakeExecutor::default());
        let mut g = group(0, "test", &["fail", "b"]);
        g.instances[0].continue_on_error = true;

        let record = scheduler(executor, Some(1))
            .run(vec![StagePlan { index: 0, groups: vec![g] }], record())
            .await
            .unwrap();

        let first = record.outcome(InstanceId::new(0, 0)).unwrap();
        assert!(first.is_allowed_failure());
        assert_eq!(
            record.outcome(InstanceId::new(0, 1)).unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_dependents_of_failed_job_are_skipped() {
        let executor = Arc::new(FakeExecutor::default());
        let build = group(0, "build", &["fail"]);
        let mut test = group(1, "test", &["x", "y"]);
        test.needs = vec!["build".into()];
        let lint = group(2, "lint", &["z"]);
        let mut deploy = group(3, "deploy", &["prod"]);
        deploy.needs = vec!["test".into()];

        let stages = vec![
            StagePlan { index: 0, groups: vec![build] },
            StagePlan { index: 1, groups: vec![test, lint] },
            StagePlan { index: 2, groups: vec![deploy] },
        ];
        let record = scheduler(executor.clone(), None)
            .run(stages, record())
            .await
            .unwrap();

        assert_eq!(
            statuses(&record),
            vec![
                ("build (fail)".to_string(), JobStatus::Failed),
                ("deploy (prod)".to_string(), JobStatus::Skipped),
                ("lint (z)".to_string(), JobStatus::Succeeded),
                ("test (x)".to_string(), JobStatus::Skipped),
                ("test (y)".to_string(), JobStatus::Skipped),
            ]
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            record.outcome(InstanceId::new(3, 0)).unwrap().cause,
            Some(FailureCause::DependencyFailed { job: "test".into() })
        );
    }

    #[tokio::test]
    async fn test_concurrency_limits_are_respected() {
        let executor = Arc::new(FakeExecutor::default());
        let g = group(0, "wide", &["a", "b", "c", "d", "e", "f"]);
        scheduler(executor.clone(), Some(2))
            .run(vec![StagePlan { index: 0, groups: vec![g] }], record())
            .await
            .unwrap();
        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);

        let executor = Arc::new(FakeExecutor::default());
        let mut g = group(0, "narrow", &["a", "b", "c", "d"]);
        g.max_parallel = Some(1);
        scheduler(executor.clone(), None)
            .run(vec![StagePlan { index: 0, groups: vec![g] }], record())
            .await
            .unwrap();
        assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_and_environment_failures() {
        let executor = Arc::new(FakeExecutor::default());
        let mut slow = group(0, "slow", &["slow"]);
        slow.instances[0].timeout = Some(Duration::from_millis(50));
        let broken = group(1, "env", &["broken"]);

        let record = scheduler(executor, None)
            .run(
                vec![StagePlan {
                    index: 0,
                    groups: vec![slow, broken],
                }],
                record(),
            )
            .await
            .unwrap();

        assert_eq!(
            record.outcome(InstanceId::new(0, 0)).unwrap().cause,
            Some(FailureCause::Timeout { after_secs: 0 })
        );
        assert!(matches!(
            record.outcome(InstanceId::new(1, 0)).unwrap().cause,
            Some(FailureCause::Environment { .. })
        ));
    }

    #[tokio::test]
    async fn test_step_failure_is_recorded() {
        let executor = Arc::new(FakeExecutor::default());
        let record = scheduler(executor, None)
            .run(
                vec![StagePlan {
                    index: 0,
                    groups: vec![group(0, "test", &["fail"])],
                }],
                record(),
            )
            .await
            .unwrap();

        let outcome = &record.outcomes()[0];
        assert_eq!(outcome.failed_step(), Some("run"));
        assert_eq!(outcome.steps.len(), 1);
    }
}
