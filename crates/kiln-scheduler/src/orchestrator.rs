//! Run orchestration: event to report.

use crate::aggregator::{RunAggregator, RunReport};
use crate::dag::DagBuilder;
use crate::matrix::{ExpansionContext, MatrixExpander};
use crate::scheduler::{JobScheduler, MatrixGroup, SchedulerConfig, StagePlan};
use crate::triggers::TriggerEvaluator;
use kiln_core::Result;
use kiln_core::event::{RunDecision, TriggerEvent};
use kiln_core::instance::JobInstance;
use kiln_core::pipeline::PipelineDefinition;
use kiln_core::ports::InstanceExecutor;
use kiln_core::run::RunRecord;
use kiln_trace::{CiAttributes, run_span};
use serde::Serialize;
use std::sync::Arc;
use tracing::{Instrument, info};

/// Stages and instances of a run, computed before anything executes.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub pipeline: String,
    pub stages: Vec<StagePlan>,
}

impl ExecutionPlan {
    pub fn instances(&self) -> impl Iterator<Item = &JobInstance> {
        self.stages.iter().flat_map(|stage| stage.instances())
    }

    pub fn instance_count(&self) -> usize {
        self.instances().count()
    }

    /// Serializable summary used by `kiln plan`.
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            pipeline: self.pipeline.clone(),
            stages: self
                .stages
                .iter()
                .map(|stage| StageSummary {
                    index: stage.index,
                    jobs: stage
                        .groups
                        .iter()
                        .map(|group| JobSummary {
                            job: group.job.clone(),
                            needs: group.needs.clone(),
                            fail_fast: group.fail_fast,
                            max_parallel: group.max_parallel,
                            instances: group.instances.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub pipeline: String,
    pub stages: Vec<StageSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub index: usize,
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job: String,
    pub needs: Vec<String>,
    pub fail_fast: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    pub instances: Vec<JobInstance>,
}

/// Ties trigger evaluation, planning, scheduling and aggregation together.
pub struct Orchestrator {
    triggers: TriggerEvaluator,
    dag_builder: DagBuilder,
    matrix_expander: MatrixExpander,
    scheduler: JobScheduler,
    aggregator: RunAggregator,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn InstanceExecutor>, config: SchedulerConfig) -> Self {
        Self {
            triggers: TriggerEvaluator::new(),
            dag_builder: DagBuilder::new(),
            matrix_expander: MatrixExpander::new(),
            scheduler: JobScheduler::new(executor, config),
            aggregator: RunAggregator::new(),
        }
    }

    /// Whether `event` starts a run of `definition`.
    pub fn trigger(&self, definition: &PipelineDefinition, event: &TriggerEvent) -> Option<RunDecision> {
        self.triggers.decide(definition, event)
    }

    /// Validate the definition, resolve its stages and expand every
    /// template. Configuration errors surface here, before any execution.
    pub fn plan(&self, definition: &PipelineDefinition, event: &TriggerEvent) -> Result<ExecutionPlan> {
        definition.validate()?;
        let dag = self.dag_builder.build(definition)?;

        let stages = dag
            .stages()
            .into_iter()
            .enumerate()
            .map(|(stage, nodes)| StagePlan {
                index: stage,
                groups: nodes
                    .into_iter()
                    .filter_map(|node| {
                        let template = definition.jobs.get(node.index)?;
                        let context = ExpansionContext {
                            pipeline_env: &definition.env,
                            event,
                            job_index: node.index,
                            stage,
                        };
                        Some(MatrixGroup {
                            job: template.name.clone(),
                            needs: template.needs.clone(),
                            fail_fast: template.fail_fast(),
                            max_parallel: template.max_parallel(),
                            instances: self.matrix_expander.expand(template, &context),
                        })
                    })
                    .collect(),
            })
            .collect();

        Ok(ExecutionPlan {
            pipeline: definition.name.clone(),
            stages,
        })
    }

    /// Evaluate the triggers and, when a rule matches, plan and execute the
    /// run. `Ok(None)` means no rule matched and nothing ran.
    pub async fn execute(
        &self,
        definition: &PipelineDefinition,
        event: TriggerEvent,
    ) -> Result<Option<RunReport>> {
        let Some(decision) = self.trigger(definition, &event) else {
            info!(pipeline = %definition.name, event = %event.kind, "No trigger rule matched");
            return Ok(None);
        };

        let plan = self.plan(definition, &event)?;
        let record = RunRecord::new(&definition.name, event, decision);
        let attrs = CiAttributes::new()
            .pipeline(&definition.name)
            .run(record.id.to_string(), record.event.kind.as_str())
            .vcs(record.event.branch_ref.clone(), record.event.sha.clone());

        self.run_plan(plan, record).instrument(run_span(&attrs)).await.map(Some)
    }

    /// Execute an already computed plan.
    pub async fn run_plan(&self, plan: ExecutionPlan, record: RunRecord) -> Result<RunReport> {
        info!(
            pipeline = %plan.pipeline,
            run_id = %record.id,
            stages = plan.stages.len(),
            instances = plan.instance_count(),
            "Starting run"
        );

        let mut record = self.scheduler.run(plan.stages, record).await?;
        let status = self.aggregator.status(&record);
        record.complete(status);

        let report = self.aggregator.aggregate(&record);
        info!(
            run_id = %report.run_id,
            status = %report.status,
            duration_ms = report.duration_ms.unwrap_or(0),
            "Run complete"
        );
        Ok(report)
    }
}
