//! Terminal output formatting.

use console::{Alignment, Emoji, pad_str};
use kiln_cache::CacheEntry;
use kiln_core::run::{JobStatus, RunStatus};
use kiln_scheduler::{ExecutionPlan, ReportRow, RunReport};
use std::fmt::Write;

pub use console::style;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format an instance status for display.
pub fn format_status(status: JobStatus) -> String {
    match status {
        JobStatus::Pending => style("PENDING").dim().to_string(),
        JobStatus::Running => style("RUNNING").yellow().to_string(),
        JobStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        JobStatus::Failed => style("FAILED").red().to_string(),
        JobStatus::Skipped => style("SKIPPED").dim().to_string(),
        JobStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

pub fn format_duration(ms: u64) -> String {
    match ms {
        0..=999 => format!("{}ms", ms),
        1_000..=59_999 => format!("{:.1}s", ms as f64 / 1000.0),
        _ => format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000),
    }
}

fn format_row(row: &ReportRow, name_width: usize) -> String {
    let detail = match (&row.cause, row.allowed_failure) {
        (Some(cause), true) => format!("{} (allowed)", cause),
        (Some(cause), false) => cause.clone(),
        (None, _) => String::new(),
    };
    let status = format_status(row.status);
    format!(
        "  {} {} {:>5}  {:>8}  {}",
        pad_str(&status, 10, Alignment::Left, None),
        pad_str(&row.name, name_width, Alignment::Left, None),
        row.stage,
        format_duration(row.duration_ms),
        style(detail).dim(),
    )
    .trim_end()
    .to_string()
}

/// Human-readable run report: one row per instance, then a summary line.
pub fn format_report(report: &RunReport) -> String {
    let name_width = report
        .rows
        .iter()
        .map(|row| row.name.len())
        .max()
        .unwrap_or(0)
        .max("INSTANCE".len());

    let mut out = String::new();
    let _ = writeln!(
        out,
        "  {} {} {:>5}  {:>8}  {}",
        pad_str("STATUS", 10, Alignment::Left, None),
        pad_str("INSTANCE", name_width, Alignment::Left, None),
        "STAGE",
        "DURATION",
        "DETAIL"
    );
    for row in &report.rows {
        let _ = writeln!(out, "{}", format_row(row, name_width));
    }
    let _ = writeln!(out);

    let icon = match report.status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Failed => CROSS,
    };
    let status = match report.status {
        RunStatus::Succeeded => style("succeeded").green().bold(),
        RunStatus::Failed => style("failed").red().bold(),
    };
    let _ = write!(
        out,
        "{}Run {} of {} {}: {} succeeded, {} failed, {} skipped, {} cancelled",
        icon,
        style(report.run_id.to_string()).dim(),
        style(&report.pipeline).bold(),
        status,
        report.count(JobStatus::Succeeded),
        report.count(JobStatus::Failed),
        report.count(JobStatus::Skipped),
        report.count(JobStatus::Cancelled),
    );
    if let Some(ms) = report.duration_ms {
        let _ = write!(out, " in {}", format_duration(ms));
    }
    out
}

/// Stages, groups and expanded instances of a plan.
pub fn format_plan(plan: &ExecutionPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Pipeline {}: {} stage(s), {} instance(s)",
        style(&plan.pipeline).bold(),
        plan.stages.len(),
        plan.instance_count()
    );

    for stage in &plan.stages {
        let _ = writeln!(out, "{}", style(format!("Stage {}", stage.index)).cyan().bold());
        for group in &stage.groups {
            let mut notes = Vec::new();
            if !group.needs.is_empty() {
                notes.push(format!("needs: {}", group.needs.join(", ")));
            }
            if group.instances.len() > 1 {
                notes.push(if group.fail_fast { "fail-fast" } else { "no fail-fast" }.to_string());
            }
            if let Some(max) = group.max_parallel {
                notes.push(format!("max-parallel {}", max));
            }
            if notes.is_empty() {
                let _ = writeln!(out, "  {}", style(&group.job).bold());
            } else {
                let _ = writeln!(
                    out,
                    "  {} {}",
                    style(&group.job).bold(),
                    style(format!("({})", notes.join("; "))).dim()
                );
            }
            if group.instances.is_empty() {
                let _ = writeln!(out, "    {}", style("(no instances)").dim());
            }
            for instance in &group.instances {
                let _ = writeln!(
                    out,
                    "    - {} {}",
                    instance.display_name,
                    style(format!("on {}", instance.runs_on)).dim()
                );
            }
        }
    }
    out.trim_end().to_string()
}

pub fn format_cache_entry(entry: &CacheEntry) -> String {
    format!(
        "  {}  {:>10}  {}",
        entry.key,
        format_size(entry.size_bytes),
        style(entry.created_at.format("%Y-%m-%d %H:%M:%S")).dim()
    )
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
