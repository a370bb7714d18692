//! Command handlers.

use crate::commands::{EventArgs, OutputFormat, PlanArgs, RunArgs};
use crate::config::EngineConfig;
use crate::output::{self, CHECK, INFO, ROCKET, WARN, style};
use crate::pipeline;
use anyhow::{Context, Result};
use kiln_cache::{CacheProvider, FilesystemProvider};
use kiln_core::event::TriggerEvent;
use kiln_core::pipeline::{EventKind, PipelineDefinition, Shell};
use kiln_core::{ConfigError, Error};
use kiln_runner::{ExecutionContext, ExecutorConfig, WorkspaceSource};
use kiln_scheduler::{Orchestrator, RunReport, SchedulerConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Exit status for a failed command: 2 when the pipeline definition or
/// engine configuration is at fault, 1 otherwise.
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    let configuration = err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || cause.downcast_ref::<Error>().is_some_and(|e| {
                matches!(
                    e,
                    Error::Configuration(_) | Error::PipelineNotFound(_) | Error::Yaml(_)
                )
            })
    });
    if configuration {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to determine the current directory")
}

/// Build the triggering event from command-line flags.
pub fn build_event(args: &EventArgs) -> Result<TriggerEvent> {
    let kind: EventKind = args.event.parse().map_err(Error::from)?;
    let mut event = TriggerEvent::new(kind);
    if let Some(branch) = &args.branch {
        event = event.with_branch(branch.clone());
    }
    if let Some(sha) = &args.sha {
        event = event.with_sha(sha.clone());
    }
    if args.reusable {
        event = event.reusable();
    }
    Ok(event)
}

/// Executor settings for a run: flags first, then engine configuration.
pub fn executor_config(
    config: &EngineConfig,
    definition: &PipelineDefinition,
    args: &RunArgs,
) -> Result<ExecutorConfig> {
    let default_shell = match &args.shell {
        Some(shell) => shell.parse::<Shell>().map_err(Error::from)?,
        None => config.default_shell.unwrap_or_else(Shell::platform_default),
    };
    Ok(ExecutorConfig {
        workspace_root: config.workspace_root.clone(),
        // A git source checks out the triggering commit unless told otherwise.
        source: WorkspaceSource::parse(
            &args.source,
            args.revision.clone().or_else(|| args.event.sha.clone()),
        ),
        default_shell,
        keep_workspaces: args.keep_workspaces || config.keep_workspaces,
        cache_prefix: kiln_cache::sanitize_key(&definition.name),
    })
}

pub fn orchestrator(
    config: &EngineConfig,
    executor_config: ExecutorConfig,
    concurrency: Option<usize>,
) -> Orchestrator {
    let cache: Arc<dyn CacheProvider> = Arc::new(FilesystemProvider::new(config.cache_dir.clone()));
    let executor = Arc::new(ExecutionContext::new(executor_config, cache));
    Orchestrator::new(
        executor,
        SchedulerConfig {
            concurrency_limit: concurrency.or(config.concurrency_limit),
            default_timeout: config.default_timeout(),
        },
    )
}

/// Run the pipeline. `Ok(None)` means no trigger rule matched.
pub async fn execute(
    config: &EngineConfig,
    definition: &PipelineDefinition,
    args: &RunArgs,
) -> Result<Option<RunReport>> {
    let event = build_event(&args.event)?;
    let orchestrator = orchestrator(
        config,
        executor_config(config, definition, args)?,
        args.concurrency,
    );
    Ok(orchestrator.execute(definition, event).await?)
}

pub async fn run(config: &EngineConfig, args: RunArgs) -> Result<ExitCode> {
    let (path, definition) = pipeline::load(args.file.as_deref(), &current_dir()?)?;

    if args.format == OutputFormat::Table {
        println!(
            "{}{} {} ({})",
            ROCKET,
            style("Running").cyan(),
            style(&definition.name).bold(),
            style(path.display()).dim()
        );
    }

    let Some(report) = execute(config, &definition, &args).await? else {
        let notice = format!(
            "{}No trigger rule of {} matches event {} (branch: {}); nothing to run",
            INFO,
            style(&definition.name).bold(),
            style(&args.event.event).bold(),
            args.event.branch.as_deref().unwrap_or("none")
        );
        match args.format {
            OutputFormat::Table => println!("{}", notice),
            OutputFormat::Json => {
                eprintln!("{}", notice);
                println!("{}", serde_json::to_string_pretty(&unmatched_json(&definition, &args.event))?);
            }
        }
        return Ok(ExitCode::SUCCESS);
    };

    match args.format {
        OutputFormat::Table => println!("\n{}", output::format_report(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(report_exit_code(&report))
}

/// Machine-readable result of a run that no trigger rule matched.
pub fn unmatched_json(definition: &PipelineDefinition, event: &EventArgs) -> serde_json::Value {
    serde_json::json!({
        "pipeline": definition.name,
        "event": event.event,
        "branch": event.branch,
        "ran": false,
    })
}

pub fn report_exit_code(report: &RunReport) -> ExitCode {
    u8::try_from(report.exit_code).map_or(ExitCode::FAILURE, ExitCode::from)
}

pub fn validate(config: &EngineConfig, file: Option<&Path>) -> Result<ExitCode> {
    let (path, definition) = pipeline::load(file, &current_dir()?)?;
    let plan = plan_for(config, &definition, &TriggerEvent::new(EventKind::WorkflowDispatch))?;

    println!(
        "{}{} is valid: {} job(s) in {} stage(s), {} instance(s)",
        CHECK,
        style(path.display()).bold(),
        definition.jobs.len(),
        plan.stages.len(),
        plan.instance_count()
    );
    if definition.triggers.is_empty() {
        println!("{}No `on` rules: runs on push and workflow_dispatch", INFO);
    }
    for (index, template) in definition.jobs.iter().enumerate() {
        let groups = plan.stages.iter().flat_map(|stage| &stage.groups);
        if groups.filter(|group| group.job == template.name).all(|group| group.instances.is_empty()) {
            println!(
                "{}Job {} (#{}) expands to no instances",
                WARN,
                style(&template.name).yellow(),
                index
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn plan_for(
    config: &EngineConfig,
    definition: &PipelineDefinition,
    event: &TriggerEvent,
) -> Result<kiln_scheduler::ExecutionPlan> {
    // Planning never touches the executor.
    let orchestrator = orchestrator(config, ExecutorConfig::default(), None);
    Ok(orchestrator.plan(definition, event)?)
}

pub fn plan(config: &EngineConfig, args: PlanArgs) -> Result<ExitCode> {
    let (_, definition) = pipeline::load(args.file.as_deref(), &current_dir()?)?;
    let event = build_event(&args.event)?;
    let plan = plan_for(config, &definition, &event)?;

    match args.format {
        OutputFormat::Table => println!("{}", output::format_plan(&plan)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan.summary())?),
    }
    Ok(ExitCode::SUCCESS)
}

pub fn schema() -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(&PipelineDefinition::json_schema())?);
    Ok(ExitCode::SUCCESS)
}

pub async fn list_cache(config: &EngineConfig, prefix: Option<String>) -> Result<ExitCode> {
    let provider = FilesystemProvider::new(config.cache_dir.clone());
    let entries = provider.list(prefix.as_deref().unwrap_or("")).await?;

    if entries.is_empty() {
        println!("{}No cache entries in {}", INFO, style(config.cache_dir.display()).dim());
        return Ok(ExitCode::SUCCESS);
    }
    for entry in &entries {
        println!("{}", output::format_cache_entry(entry));
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn clear_cache(config: &EngineConfig, prefix: Option<String>) -> Result<ExitCode> {
    let provider = FilesystemProvider::new(config.cache_dir.clone());
    let removed = provider.clear(prefix.as_deref().unwrap_or("")).await?;
    match prefix {
        Some(p) => println!("{}Removed {} entries with prefix {}", CHECK, removed, style(p).bold()),
        None => println!("{}Removed {} entries", CHECK, removed),
    }
    Ok(ExitCode::SUCCESS)
}

pub fn show_config(config: &EngineConfig) -> Result<ExitCode> {
    match EngineConfig::config_path() {
        Ok(path) => println!("{}", style(format!("# {}", path.display())).dim()),
        Err(_) => println!("{}", style("# no config directory").dim()),
    }
    for (key, value) in config.entries() {
        println!("{} = {}", style(key).cyan(), value);
    }
    Ok(ExitCode::SUCCESS)
}

pub fn set_config(key: &str, value: &str) -> Result<ExitCode> {
    let path = EngineConfig::config_path()?;
    let mut config = EngineConfig::load_from(&path)?;
    config.set(key, value)?;
    config.save_to(&path)?;
    println!("{}Set {} = {}", CHECK, key, value);
    Ok(ExitCode::SUCCESS)
}
