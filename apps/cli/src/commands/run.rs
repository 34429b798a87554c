//! Run command implementation.
//!
//! Replays a transcript through a single run controller.

use colored::Colorize;
use conductor_orchestrator::{RunController, RunEvent, RunRequest};
use std::path::PathBuf;
use std::sync::Arc;

use super::paint_run_status;
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

    let controller = RunController::new(
        backend,
        transcript::registry(&config),
        transcript::externalizer(&config),
        config.run.clone(),
    );
    if !json {
        println!("{}", "conductor run".bold().cyan());
        println!();
        controller.subscribe(|event| {
            if let RunEvent::StepComplete { step, .. } = event {
                let tools = step.tool_names().join(", ");
                let marker = if step.has_errors() { "✗".red() } else { "•".dimmed() };
                if step.is_final {
                    println!("  {} Step {}: final answer", marker, step.step_number);
                } else {
                    println!("  {} Step {}: {}", marker, step.step_number, tools.cyan());
                }
            }
        });
    }

    let run = controller.execute(RunRequest::new(task, selector)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!();
    println!("  Status: {}", paint_run_status(run.status));
    println!("  Steps: {}", run.steps.len());
    println!("  Tokens: {}", run.total_tokens());
    if let Some(error) = &run.error {
        println!("  Error: {}", error.red());
    }
    if let Some(answer) = run.final_response() {
        println!();
        println!("{answer}");
    }
    Ok(())
}
