//! kiln CLI entrypoint.

use clap::Parser;
use kiln_trace::{LogFormat, TracingConfig, init_tracing};
use std::process::ExitCode;

mod commands;
mod config;
mod handlers;
mod output;
mod pipeline;


use commands::{CacheCommands, Commands, ConfigCommands};
use config::EngineConfig;
use output::style;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Run CI pipelines locally", long_about = None)]
struct Cli {
    /// Log filter, e.g. `debug` or `kiln=trace` (RUST_LOG wins when set)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match EngineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            return ExitCode::from(2);
        }
    };

    let tracing = TracingConfig {
        level: cli.log_level.clone().unwrap_or_else(|| config.log_level.clone()),
        format: cli.log_format.unwrap_or(config.log_format),
        ..Default::default()
    };
    if let Err(e) = init_tracing(&tracing) {
        eprintln!("{} {}", style("warning:").yellow().bold(), e);
    }

    let result = match cli.command {
        Commands::Run(args) => handlers::run(&config, args).await,
        Commands::Validate { file } => handlers::validate(&config, file.as_deref()),
        Commands::Plan(args) => handlers::plan(&config, args),
        Commands::Schema => handlers::schema(),
        Commands::Cache { command } => match command {
            CacheCommands::List { prefix } => handlers::list_cache(&config, prefix).await,
            CacheCommands::Clear { prefix } => handlers::clear_cache(&config, prefix).await,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config),
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value),
        },
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            handlers::exit_code_for(&e)
        }
    }
}
