//! Command implementations for the Conductor CLI.

pub mod compare;
pub mod config;
pub mod orchestrate;
pub mod run;

use colored::{ColoredString, Colorize};
use conductor_orchestrator::{AggregateStatus, RunStatus};

pub(crate) fn paint_run_status(status: RunStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        RunStatus::Completed => label.green(),
        RunStatus::Cancelled | RunStatus::MaxStepsReached => label.yellow(),
        RunStatus::Failed => label.red(),
        RunStatus::Running => label.normal(),
    }
}

pub(crate) fn paint_aggregate_status(status: AggregateStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        AggregateStatus::Completed => label.green(),
        AggregateStatus::Partial => label.yellow(),
        AggregateStatus::Failed => label.red(),
    }
}
