//! Compare command implementation.

use colored::Colorize;
use conductor_orchestrator::{ComparisonCoordinator, ComparisonSlot};
use std::path::PathBuf;
use std::sync::Arc;

use super::{paint_aggregate_status, paint_run_status};
use crate::transcript::{self, Transcript};

pub async fn execute(
    config_path: Option<PathBuf>,
    transcript_path: PathBuf,
    prompt: String,
    slots: Vec<String>,
    json: bool,
) -> anyhow::Result<()> {
    let config = transcript::load_config(config_path)?;
    let slots = slots
        .iter()
        .map(|s| transcript::parse_selector(s).map(ComparisonSlot::new))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let backend = Arc::new(Transcript::load(&transcript_path)?.into_backend()?);

    let coordinator = ComparisonCoordinator::new(
        backend,
        transcript::registry(&config),
        transcript::externalizer(&config),
        config,
    );
    let session = coordinator.compare(&prompt, slots).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    println!("{}", "conductor compare".bold().cyan());
    for result in &session.results {
        println!();
        println!(
            "{} {} [{}]",
            result.slot_id.bold(),
            result.slot.display_label().cyan(),
            paint_run_status(result.outcome.status)
        );
        match (result.outcome.final_response(), &result.outcome.error) {
            (Some(answer), _) => println!("{answer}"),
            (None, Some(error)) => println!("{}", error.red()),
            (None, None) => println!("{}", "(no answer)".dimmed()),
        }
    }
    println!();
    println!("Status: {} in {}ms", paint_aggregate_status(session.status), session.duration_ms);
    Ok(())
}
