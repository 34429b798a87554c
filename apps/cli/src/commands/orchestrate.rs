//! Orchestrate command implementation.
//!
//! Decomposes a task with a replayed backend, runs the subtasks concurrently
//! and prints the synthesized answer.

use colored::Colorize;
use conductor_orchestrator::TaskOrchestrator;
use std::path::PathBuf;
use std::sync::Arc;

use super::{paint_aggregate_status, paint_run_status};
use crate::transcript::{self, Transcript};

pub async fn execute(
    config_path: Option<PathBuf>,
    transcript_path: PathBuf,
    task: String,
    selector: String,
    json: bool,
) -> anyhow::Result<()> {
    let config = transcript::load_config(config_path)?;
    let selector = transcript::parse_selector(&selector)?;
    let backend = Arc::new(Transcript::load(&transcript_path)?.into_backend()?);

    let orchestrator = TaskOrchestrator::new(
        backend,
        transcript::registry(&config),
        transcript::externalizer(&config),
        config,
    );
    let session = orchestrator.decompose_and_execute(&task, selector).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    println!("{}", "conductor orchestrate".bold().cyan());
    println!();
    println!("  Plan: {}", session.summary.dimmed());
    for subtask in &session.subtasks {
        let status = session
            .result_for(&subtask.id)
            .map_or_else(|| "missing".red(), |r| paint_run_status(r.outcome.status));
        println!("  {}. {} [{}]", subtask.order_index, subtask.title, status);
    }
    println!();
    if let Some(status) = session.status {
        println!("  Status: {}", paint_aggregate_status(status));
    }
    println!("  Tokens: {}", session.usage.total());
    if let Some(error) = &session.synthesis_error {
        println!("  Synthesis: {}", error.red());
    }
    if let Some(answer) = &session.synthesis {
        println!();
        println!("{answer}");
    }
    Ok(())
}
