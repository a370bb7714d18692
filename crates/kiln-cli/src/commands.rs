//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline locally for a triggering event
    Run(RunArgs),

    /// Validate pipeline configuration
    Validate {
        /// Path to pipeline file (discovered when omitted)
        file: Option<PathBuf>,
    },

    /// Show stages and expanded instances without running anything
    Plan(PlanArgs),

    /// Print the JSON Schema of the pipeline format
    Schema,

    /// Manage the local cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage engine configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cache entries
    List {
        /// Only entries whose key starts with this prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },
    /// Clear cache
    Clear {
        /// Only clear entries matching prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
}

/// Event selection shared by `run` and `plan`.
#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Event kind: push, pull_request, workflow_dispatch or workflow_call
    #[arg(short, long, default_value = "push")]
    pub event: String,

    /// Branch ref (for pull requests, the target branch)
    #[arg(short, long)]
    pub branch: Option<String>,

    /// Commit SHA exposed to steps
    #[arg(long)]
    pub sha: Option<String>,

    /// Mark the event as a call from another pipeline
    #[arg(long)]
    pub reusable: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to pipeline file (discovered when omitted)
    pub file: Option<PathBuf>,

    #[command(flatten)]
    pub event: EventArgs,

    /// Maximum number of concurrently running instances
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Shell for run steps that name none
    #[arg(long)]
    pub shell: Option<String>,

    /// Workspace source: none, a local directory or a git URL
    #[arg(long, default_value = ".")]
    pub source: String,

    /// Revision to check out when the source is a git repository (defaults to --sha)
    #[arg(long)]
    pub revision: Option<String>,

    /// Leave instance workspaces on disk
    #[arg(long)]
    pub keep_workspaces: bool,

    /// Report format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Path to pipeline file (discovered when omitted)
    pub file: Option<PathBuf>,

    #[command(flatten)]
    pub event: EventArgs,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}
