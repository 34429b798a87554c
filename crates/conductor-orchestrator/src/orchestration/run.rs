//! Run and step records.
//!
//! A [`Run`] is owned by the controller that created it while its loop executes
//! and is handed back by value once terminal.

use chrono::{DateTime, Utc};
use conductor_abstraction::{BackendSelector, TokenUsage};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::tool::{ToolCall, ToolResult};

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Loop is executing
    Running,
    /// Model produced a final answer
    Completed,
    /// Loop aborted with an error
    Failed,
    /// Cancellation token fired (manually or by the run timeout)
    Cancelled,
    /// Step or token budget exhausted
    MaxStepsReached,
}

impl RunStatus {
    /// Whether the status is final
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::MaxStepsReached => write!(f, "max_steps_reached"),
        }
    }
}

/// One iteration of the reasoning/acting loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position within the run
    pub step_number: usize,
    /// Reasoning text returned alongside tool calls
    pub thinking: String,
    /// Tool calls requested in this step
    pub tool_calls: Vec<ToolCall>,
    /// One result per call, in call order
    pub tool_results: Vec<ToolResult>,
    /// No further tool calls follow
    pub is_final: bool,
    /// Final answer text, on the final step
    pub response: Option<String>,
    /// Tokens spent by this step's backend call
    pub usage: Option<TokenUsage>,
}

impl Step {
    /// Whether any tool result in this step is an error
    pub fn has_errors(&self) -> bool {
        self.tool_results.iter().any(|r| r.is_error)
    }

    /// Names of the tools called in this step
    pub fn tool_names(&self) -> Vec<&str> {
        self.tool_calls.iter().map(|c| c.name.as_str()).collect()
    }
}

/// One execution of the reasoning/acting loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identity
    pub id: String,
    /// Originating task text
    pub task: String,
    /// Backend the run was executed against
    pub selector: BackendSelector,
    /// Recorded steps, numbered 1..=n
    pub steps: Vec<Step>,
    /// Current status
    pub status: RunStatus,
    /// Cumulative token usage
    pub usage: TokenUsage,
    /// Cumulative cost estimate (USD)
    pub cost_estimate: f64,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Explanation for non-successful terminal states
    pub error: Option<String>,
    /// When the run was created
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub(crate) fn new(id: impl Into<String>, task: impl Into<String>, selector: BackendSelector) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            selector,
            steps: Vec::new(),
            status: RunStatus::Running,
            usage: TokenUsage::default(),
            cost_estimate: 0.0,
            duration_ms: 0,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Next step number to record
    pub fn next_step_number(&self) -> usize {
        self.steps.len() + 1
    }

    /// Final answer, if the run completed
    pub fn final_response(&self) -> Option<&str> {
        self.steps.iter().rev().find(|s| s.is_final).and_then(|s| s.response.as_deref())
    }

    /// Cumulative input + output tokens
    pub fn total_tokens(&self) -> u64 {
        self.usage.total()
    }

    pub(crate) fn record_step(&mut self, step: Step) {
        debug_assert_eq!(step.step_number, self.next_step_number());
        self.steps.push(step);
    }

    /// Set the terminal status. Only the first call has an effect.
    pub(crate) fn finish(&mut self, status: RunStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            debug!(run_id = %self.id, current = %self.status, requested = %status, "Ignoring status change");
            return false;
        }
        self.status = status;
        self.error = error;
        true
    }
}

/// Settled result of one run inside a fan-out session.
///
/// `run` is absent when the run never started: the controller rejected the
/// request, the start was cancelled during its stagger delay, or the task died.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Terminal status of the run
    pub status: RunStatus,
    /// The run record, if one was produced
    pub run: Option<Run>,
    /// Error text for non-successful outcomes
    pub error: Option<String>,
}

impl RunOutcome {
    pub(crate) fn from_run(run: Run) -> Self {
        Self { status: run.status, error: run.error.clone(), run: Some(run) }
    }

    pub(crate) fn not_started(status: RunStatus, error: impl Into<String>) -> Self {
        Self { status, run: None, error: Some(error.into()) }
    }

    /// Whether the run completed with a final answer
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Final answer, if any
    pub fn final_response(&self) -> Option<&str> {
        self.run.as_ref().and_then(Run::final_response)
    }

    /// Token usage of the run, zero if it never started
    pub fn usage(&self) -> TokenUsage {
        self.run.as_ref().map(|r| r.usage).unwrap_or_default()
    }
}
