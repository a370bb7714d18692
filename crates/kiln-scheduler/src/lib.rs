//! Pipeline scheduling and orchestration for kiln.
//!
//! Data flows leaf-first through the modules here: [`triggers`] decides
//! whether an event starts a run, [`dag`] orders the job templates into
//! stages, [`matrix`] expands each template into instances, [`scheduler`]
//! dispatches them stage by stage and [`aggregator`] folds the outcomes
//! into a report. [`orchestrator`] wires the whole flow together.

pub mod aggregator;
pub mod dag;
pub mod matrix;
pub mod orchestrator;
pub mod scheduler;
pub mod triggers;

pub use aggregator::{ReportRow, RunAggregator, RunReport};
pub use dag::{DagBuilder, DagNode, PipelineDag};
pub use matrix::{ExpansionContext, MatrixExpander};
pub use orchestrator::{ExecutionPlan, JobSummary, Orchestrator, PlanSummary, StageSummary};
pub use scheduler::{JobScheduler, MatrixGroup, SchedulerConfig, StagePlan};
pub use triggers::{TriggerEvaluator, glob_match};
