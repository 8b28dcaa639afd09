//! Switchyard operator CLI.
//!
//! Validates dispatch configuration files and dry-runs routing decisions
//! against them. No backend is ever called.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use switchyard_core::{
    BackendCatalog, DispatchConfig, Requirements, Router, RoutingReason, Task, TaskKind,
};

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Validate Switchyard dispatch configs and dry-run routing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a dispatch config file
    Check {
        /// Path to a YAML or JSON config
        config: PathBuf,
    },

    /// Show where a payload would be routed
    Route {
        /// Path to a YAML or JSON config
        config: PathBuf,

        /// Task payload to classify and route
        payload: String,

        /// Route to this backend, bypassing classification
        #[arg(long)]
        backend: Option<String>,

        /// Require a streaming-capable backend
        #[arg(long)]
        streaming: bool,

        /// Require a backend that accepts code context
        #[arg(long)]
        code_context: bool,

        /// Require at least this many tokens of context window
        #[arg(long)]
        min_tokens: Option<u32>,
    },
}

/// Dry-run result printed by `route`.
#[derive(Debug, Serialize)]
struct RouteReport {
    kind: TaskKind,
    reason: RoutingReason,
    candidates: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            let config = load(&config)?;
            println!("Config OK");
            println!("  default backend: {}", config.routing.default_backend);
            println!("  rules:           {}", config.routing.rules.len());
            println!("  backends:        {}", config.backends.len());
        }
        Commands::Route {
            config,
            payload,
            backend,
            streaming,
            code_context,
            min_tokens,
        } => {
            let config = load(&config)?;
            let mut task = Task::new(payload).with_requirements(Requirements {
                streaming,
                code_context,
                min_context_tokens: min_tokens,
            });
            if let Some(backend) = backend {
                task = task.with_backend(backend);
            }

            let report = route(&config, &task)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn load(path: &Path) -> Result<DispatchConfig> {
    DispatchConfig::from_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))
}

/// Route against the backends declared in `config`, all assumed healthy.
fn route(config: &DispatchConfig, task: &Task) -> Result<RouteReport> {
    let catalog: BackendCatalog = config.descriptors().into_iter().collect();
    let decision = Router::new(config.routing.clone()).route(task, &catalog)?;
    tracing::debug!(task_id = %task.id(), reason = %decision.reason, "Dry-run routed");

    Ok(RouteReport {
        kind: task.kind(),
        reason: decision.reason,
        candidates: decision.ordered_candidates,
    })
}
