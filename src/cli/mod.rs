pub mod run;
pub mod schema;
pub mod validate;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;
use veritas_engine::config::{Config, FailurePolicy};

const DEFAULT_CONFIG: &str = "veritas.yaml";

#[derive(Parser)]
#[command(name = "veritas")]
#[command(
    author,
    version,
    about = "Dependency-ordered research plan execution with retries, quality gates and live events"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose/debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a plan and stream its events
    Run(RunArgs),

    /// Check a plan and print its execution groups
    Validate(ValidateArgs),

    /// Print JSON Schema for the config or plan format
    Schema(SchemaArgs),
}

#[derive(Parser, Clone)]
pub struct RunArgs {
    /// Plan file (JSON or YAML)
    #[arg(value_name = "PLAN")]
    pub plan: PathBuf,

    /// Path to config file (default: veritas.yaml when present)
    #[arg(short, long, env = "VERITAS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the worker pool size
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// What to do after a step fails: halt, skip-dependents or continue
    #[arg(long)]
    pub failure_policy: Option<FailurePolicy>,

    /// Override output directory for summaries
    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    /// Override directory for the plan/transition/event logs
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Print events as JSON lines instead of text
    #[arg(long)]
    pub json_events: bool,

    /// Approve every review request automatically
    #[arg(long)]
    pub auto_approve: bool,

    /// Do not write plan/transition/event logs
    #[arg(long)]
    pub no_persist: bool,

    /// Show execution groups without running anything
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Parser, Clone)]
pub struct ValidateArgs {
    /// Plan file (JSON or YAML)
    #[arg(value_name = "PLAN")]
    pub plan: PathBuf,

    /// Config file; agents referenced by the plan are checked against it
    #[arg(short, long, env = "VERITAS_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Parser, Clone)]
pub struct SchemaArgs {
    /// Which document to describe
    #[arg(value_enum, default_value_t = SchemaTarget::Config)]
    pub target: SchemaTarget,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaTarget {
    Config,
    Plan,
}

/// Load the config from `path`, or from `veritas.yaml` when it exists, or
/// fall back to defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Config::load(path)?
        }
        None if Path::new(DEFAULT_CONFIG).exists() => {
            info!("Loading config from {}", DEFAULT_CONFIG);
            Config::load(Path::new(DEFAULT_CONFIG))?
        }
        None => Config::default(),
    };
    Ok(config)
}
