//! Folding instance outcomes into the final run status and report.

use chrono::{DateTime, Utc};
use kiln_core::RunId;
use kiln_core::instance::MatrixBinding;
use kiln_core::pipeline::EventKind;
use kiln_core::run::{InstanceOutcome, JobStatus, RunRecord, RunStatus};
use serde::Serialize;

/// One line of the run report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub name: String,
    pub job: String,
    pub stage: usize,
    pub index: usize,
    pub binding: MatrixBinding,
    pub status: JobStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub allowed_failure: bool,
}

impl ReportRow {
    fn from_outcome(outcome: &InstanceOutcome) -> Self {
        Self {
            name: outcome.display_name.clone(),
            job: outcome.job.clone(),
            stage: outcome.stage,
            index: outcome.instance.index,
            binding: outcome.binding.clone(),
            status: outcome.status,
            duration_ms: outcome.duration_ms,
            failed_step: outcome.failed_step().map(str::to_string),
            cause: outcome.cause.as_ref().map(ToString::to_string),
            allowed_failure: outcome.is_allowed_failure(),
        }
    }
}

/// Final report of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub event: EventKind,
    pub status: RunStatus,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub rows: Vec<ReportRow>,
}

impl RunReport {
    /// Number of rows with the given status.
    pub fn count(&self, status: JobStatus) -> usize {
        self.rows.iter().filter(|row| row.status == status).count()
    }

    pub fn failed_rows(&self) -> impl Iterator<Item = &ReportRow> {
        self.rows
            .iter()
            .filter(|row| row.status == JobStatus::Failed && !row.allowed_failure)
    }
}

/// Computes the overall status of a run.
pub struct RunAggregator;

impl RunAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Failed when any instance failed without being an allowed failure.
    /// Skipped and cancelled instances alone never fail a run: they always
    /// follow from a failure that already does.
    pub fn status(&self, record: &RunRecord) -> RunStatus {
        let failed = record
            .outcomes()
            .iter()
            .any(|o| o.status == JobStatus::Failed && !o.is_allowed_failure());
        if failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    /// Build the report. Rows are ordered by stage, then job declaration
    /// order, then matrix index.
    pub fn aggregate(&self, record: &RunRecord) -> RunReport {
        let status = record.status.unwrap_or_else(|| self.status(record));

        let mut outcomes: Vec<&InstanceOutcome> = record.outcomes().iter().collect();
        outcomes.sort_by_key(|o| (o.stage, o.instance));

        RunReport {
            run_id: record.id,
            pipeline: record.pipeline.clone(),
            event: record.event.kind,
            status,
            exit_code: status.exit_code(),
            started_at: record.started_at,
            duration_ms: record.duration_ms(),
            rows: outcomes.into_iter().map(ReportRow::from_outcome).collect(),
        }
    }
}

impl Default for RunAggregator {
    fn default() -> Self {
        Self::new()
    }
}
