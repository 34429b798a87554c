//! Conductor CLI - Command-line interface for the Conductor orchestration core
//!
//! Replays recorded model transcripts through the run controller, the task
//! orchestrator and the comparison coordinator, and manages configuration.

mod commands;
mod transcript;

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use commands::{compare, config, orchestrate, run};

/// Conductor CLI - bounded agent runs, fan-out and comparison
#[derive(Parser, Debug)]
#[command(name = "conductor", author, version, about = "Conductor - agent orchestration core")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Configuration file (defaults to ~/.conductor/conductor.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show or create configuration
    #[command(subcommand)]
    Config(config::ConfigCommand),

    /// Replay a transcript through one bounded run
    Run {
        /// Transcript file with scripted backend responses
        #[arg(short, long)]
        transcript: PathBuf,

        /// Task for the run
        #[arg(long)]
        task: String,

        /// Backend selector as provider/model
        #[arg(short, long, default_value = transcript::DEFAULT_SELECTOR)]
        selector: String,

        /// Output the run as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decompose a task, run the subtasks and synthesize one answer
    Orchestrate {
        /// Transcript file with scripted backend responses
        #[arg(short, long)]
        transcript: PathBuf,

        /// Master task
        #[arg(long)]
        task: String,

        /// Backend selector used for decomposition, subtasks and synthesis
        #[arg(short, long, default_value = transcript::DEFAULT_SELECTOR)]
        selector: String,

        /// Output the session as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one prompt against up to three backends
    Compare {
        /// Transcript file with scripted backend responses
        #[arg(short, long)]
        transcript: PathBuf,

        /// Prompt sent to every slot
        #[arg(long)]
        prompt: String,

        /// Backend selector per slot (repeat for each slot)
        #[arg(long = "slot", required = true)]
        slots: Vec<String>,

        /// Output the comparison as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing; RUST_LOG wins over --log-level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).without_time().with_target(false))
        .init();

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Config(cmd) => config::execute(cmd, args.config)?,
        Command::Run { transcript, task, selector, json } => {
            run::execute(args.config, transcript, task, selector, json).await?;
        }
        Command::Orchestrate { transcript, task, selector, json } => {
            orchestrate::execute(args.config, transcript, task, selector, json).await?;
        }
        Command::Compare { transcript, prompt, slots, json } => {
            compare::execute(args.config, transcript, prompt, slots, json).await?;
        }
    }

    Ok(())
}
