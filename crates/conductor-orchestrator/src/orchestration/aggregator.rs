//! Aggregation of sibling run outcomes.
//!
//! Both fan-out coordinators reduce their per-run outcomes to one session
//! status by counting terminal statuses. The task orchestrator additionally
//! builds the synthesis prompt that merges subtask answers into one.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::decomposition::Subtask;
use super::execution::truncate_chars;
use super::run::RunOutcome;

/// Overall outcome of a fan-out session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    /// Every run completed
    Completed,
    /// Some runs completed, some did not
    Partial,
    /// No run completed
    Failed,
}

impl AggregateStatus {
    /// Count outcomes: all completed, none completed, or mixed.
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a RunOutcome>) -> Self {
        let (mut succeeded, mut total) = (0usize, 0usize);
        for outcome in outcomes {
            total += 1;
            if outcome.is_success() {
                succeeded += 1;
            }
        }
        match succeeded {
            0 => Self::Failed,
            n if n == total => Self::Completed,
            _ => Self::Partial,
        }
    }
}

impl fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Instructions sent with the synthesis prompt
pub const SYNTHESIS_INSTRUCTIONS: &str = "You combine the results of parallel subtasks into one answer. \
Use only the results provided. If a subtask failed or produced no answer, say explicitly which part \
is missing instead of filling the gap yourself.";

const MAX_ERROR_CHARS: usize = 1_000;

/// Build the prompt asking for one integrated answer.
///
/// Each subtask is listed with its status and final answer, or its error.
pub fn synthesis_prompt(master_task: &str, subtasks: &[Subtask], outcomes: &[RunOutcome]) -> String {
    let mut prompt = format!("Original task:\n{master_task}\n\nSubtask results:\n");

    for (subtask, outcome) in subtasks.iter().zip(outcomes) {
        prompt.push_str(&format!(
            "\n### Subtask {}: {}\nStatus: {}\n",
            subtask.order_index, subtask.title, outcome.status
        ));
        match (outcome.final_response(), outcome.error.as_deref()) {
            (Some(answer), _) if outcome.is_success() => {
                prompt.push_str(&format!("Result:\n{answer}\n"));
            }
            (_, Some(error)) => {
                let (kept, _) = truncate_chars(error, MAX_ERROR_CHARS);
                prompt.push_str(&format!("Result: MISSING (error: {kept})\n"));
            }
            _ => prompt.push_str("Result: MISSING (no answer produced)\n"),
        }
    }

    prompt.push_str(
        "\nWrite one integrated answer to the original task. \
         Acknowledge any missing subtask results explicitly; do not invent them.",
    );
    prompt
}
