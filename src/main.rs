use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod agent;
mod commands;
mod config;
mod conversation;
mod orchestrator;
mod reclaimer;
mod relay;
mod sandbox;
mod store;
mod templates;
mod tools;

use commands::Workspace;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(
    author,
    version,
    about = "Run autonomous coding agents in persistent sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Path to the config file (defaults to ./fleet.toml)
    #[arg(short, long, global = true, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default fleet.toml in the current directory
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Create a task and run the agent on it in a fresh sandbox
    Run {
        /// What the agent should do
        description: String,

        /// Repository clone URL
        #[arg(long)]
        repo: Option<String>,

        /// Display name of the repository
        #[arg(long)]
        repo_name: Option<String>,

        /// Rules file, relative to the repository root
        #[arg(long)]
        rules_file: Option<String>,

        /// Setup script, relative to the repository root
        #[arg(long)]
        setup_script: Option<String>,

        /// Access token used for cloning and pushing
        #[arg(long, env = "GH_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Provision the sandbox without running the agent
        #[arg(long)]
        skip_agent: bool,

        /// Mark the task completed once the run finishes
        #[arg(long)]
        complete: bool,
    },

    /// Send a follow-up message to a task and run the agent again
    Continue {
        /// Task id
        task_id: String,

        /// Follow-up message
        text: String,

        /// Mark the task completed once the run finishes
        #[arg(long)]
        complete: bool,
    },

    /// Pause sandboxes that have been idle too long
    Reclaim {
        /// Keep running and reclaim on the configured interval
        #[arg(long)]
        watch: bool,
    },

    /// Show one task
    Status {
        /// Task id
        task_id: String,
    },

    /// List tasks, newest first
    Tasks,

    /// Print a task's conversation
    Messages {
        /// Task id
        task_id: String,
    },

    /// Mark a task completed
    Complete {
        /// Task id
        task_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.json_logs);

    let config_path = cli.config.as_deref();
    let workspace = || Workspace::open(config_path);

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Run {
            description,
            repo,
            repo_name,
            rules_file,
            setup_script,
            token,
            skip_agent,
            complete,
        } => {
            let options = commands::run::RunOptions {
                description,
                repo,
                repo_name,
                rules_file,
                setup_script,
                token,
                skip_agent,
                complete,
            };
            commands::run::run(&workspace().await?, options).await?;
        }
        Commands::Continue {
            task_id,
            text,
            complete,
        } => {
            commands::resume::run(&workspace().await?, &task_id, &text, complete).await?;
        }
        Commands::Reclaim { watch } => {
            commands::reclaim::run(&workspace().await?, watch).await?;
        }
        Commands::Status { task_id } => {
            commands::status::run(&workspace().await?, &task_id).await?;
        }
        Commands::Tasks => {
            commands::tasks::run(&workspace().await?).await?;
        }
        Commands::Messages { task_id } => {
            commands::messages::run(&workspace().await?, &task_id).await?;
        }
        Commands::Complete { task_id } => {
            commands::complete::run(&workspace().await?, &task_id).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout carries only command output and event frames.
fn init_logging(verbose: bool, json: bool) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("fleet=debug")
        } else {
            EnvFilter::new("fleet=info")
        }
    });
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(writer).with_target(false))
            .init();
    }
    guard
}
