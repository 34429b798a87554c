// Run controller: the bounded reasoning/acting loop
//
// Each run sends the conversation to a tool-capable backend, executes any
// requested tools concurrently, feeds the results back and repeats until the
// model answers without tool calls or a safety rail trips (step budget, token
// budget, cancellation, total timeout).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use conductor_abstraction::{BackendSelector, ChatMessage, ModelBackend, ModelParameters, Role, ToolDefinition};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::RunConfig;
use super::context::ContextExternalizer;
use super::events::{EventBus, RunEvent, SubscriptionId};
use super::execution::truncate_chars;
use super::run::{Run, RunStatus, Step};
use super::tool::ToolResult;
use super::tool_registry::{ToolDispatchRegistry, ToolSnapshot};
use crate::error::{OrchestrationError, Result};

/// Stable identity of the system-instruction message
pub const SYSTEM_MESSAGE_ID: &str = "system-instructions";

/// Stable identity of the rolling progress recitation message
pub const RECITATION_MESSAGE_ID: &str = "progress-recitation";

/// Input for one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Task text sent as the final user message
    pub task: String,
    /// Backend to run against
    pub selector: BackendSelector,
    /// Earlier conversation turns
    pub prior_messages: Vec<ChatMessage>,
    /// System instructions placed first in the conversation
    pub system_instructions: Option<String>,
    /// External cancellation signal
    pub cancel: Option<CancellationToken>,
    /// Caller-chosen run id
    pub run_id: Option<String>,
}

impl RunRequest {
    /// Create a request for `task` against `selector`
    pub fn new(task: impl Into<String>, selector: BackendSelector) -> Self {
        Self {
            task: task.into(),
            selector,
            prior_messages: Vec::new(),
            system_instructions: None,
            cancel: None,
            run_id: None,
        }
    }

    #[must_use]
    pub fn with_prior_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.prior_messages = messages;
        self
    }

    #[must_use]
    pub fn with_system_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.system_instructions = Some(instructions.into());
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Executes runs against one backend, tool registry and context manager
pub struct RunController {
    backend: Arc<dyn ModelBackend>,
    tools: Arc<ToolDispatchRegistry>,
    context: Arc<ContextExternalizer>,
    config: RunConfig,
    events: EventBus<RunEvent>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl RunController {
    /// Create a new controller
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        tools: Arc<ToolDispatchRegistry>,
        context: Arc<ContextExternalizer>,
        config: RunConfig,
    ) -> Self {
        Self {
            backend,
            tools,
            context,
            config,
            events: EventBus::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Run configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Observe run events
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    /// Stop observing run events
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Fire the cancellation token of an in-flight run
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.lock_active().get(run_id) {
            Some(token) => {
                info!(run_id = %run_id, "Cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of runs currently executing
    pub fn active_runs(&self) -> Vec<String> {
        self.lock_active().keys().cloned().collect()
    }

    /// Execute a run to a terminal status
    ///
    /// Only precondition failures are returned as errors: an empty task, a
    /// backend without tool-call support, or no available tools when tools are
    /// required. Everything that goes wrong once the loop starts is reported
    /// through the returned run's status and error text.
    pub async fn execute(&self, request: RunRequest) -> Result<Run> {
        let RunRequest { task, selector, prior_messages, system_instructions, cancel, run_id } = request;

        if task.trim().is_empty() {
            return Err(OrchestrationError::Other("Task must not be empty".to_string()));
        }
        if !self.backend.supports_tool_calls(&selector) {
            return Err(OrchestrationError::CapabilityUnsupported { selector: selector.to_string() });
        }

        self.tools.refresh().await;
        let snapshot = self.tools.snapshot();
        if self.config.require_tools && snapshot.is_empty() {
            return Err(OrchestrationError::NoToolsAvailable);
        }

        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let token = cancel.unwrap_or_else(CancellationToken::new);
        let timed_out = Arc::new(AtomicBool::new(false));
        let started = Instant::now();

        info!(
            run_id = %run_id,
            selector = %selector,
            tools = snapshot.len(),
            max_steps = self.config.max_steps,
            "Starting run"
        );

        self.lock_active().insert(run_id.clone(), token.clone());
        let finalizer = RunFinalizer {
            controller: self,
            run_id: run_id.clone(),
            timer: self.spawn_timer(&run_id, &token, &timed_out),
            cleaned: false,
        };

        let messages = build_messages(system_instructions, prior_messages, &task);
        let mut run = Run::new(run_id.clone(), task, selector);

        let outcome = AssertUnwindSafe(self.run_loop(&mut run, &snapshot, &token, messages))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) if token.is_cancelled() => {
                debug!(run_id = %run_id, error = %e, "Run error after cancellation");
                run.finish(RunStatus::Cancelled, Some(cancel_reason(&timed_out, &self.config)));
            }
            Ok(Err(e)) => {
                warn!(run_id = %run_id, error = %e, "Run failed");
                run.finish(RunStatus::Failed, Some(e.to_string()));
            }
            Err(_) => {
                warn!(run_id = %run_id, "Run loop panicked");
                run.finish(RunStatus::Failed, Some("Run loop panicked".to_string()));
            }
        }

        finalizer.complete().await;
        run.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            run_id = %run.id,
            status = %run.status,
            steps = run.steps.len(),
            tokens = run.total_tokens(),
            duration_ms = run.duration_ms,
            "Run finished"
        );
        self.events.emit(&RunEvent::RunComplete { run_id: run.id.clone(), run: Box::new(run.clone()) });

        Ok(run)
    }

    async fn run_loop(
        &self,
        run: &mut Run,
        snapshot: &ToolSnapshot,
        token: &CancellationToken,
        mut messages: Vec<ChatMessage>,
    ) -> Result<()> {
        let definitions = snapshot.list_available();
        let tools: Option<&[ToolDefinition]> = (!definitions.is_empty()).then_some(definitions.as_slice());
        let parameters = self.config.temperature.map(|t| ModelParameters::default().with_temperature(t));
        let max_steps = self.config.max_steps;

        for step_number in 1..=max_steps {
            if token.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }
            if run.usage.total() >= self.config.max_tokens {
                info!(run_id = %run.id, used = run.usage.total(), budget = self.config.max_tokens, "Token budget exhausted");
                run.finish(
                    RunStatus::MaxStepsReached,
                    Some(format!(
                        "Token budget exhausted: {} of {} tokens used",
                        run.usage.total(),
                        self.config.max_tokens
                    )),
                );
                return Ok(());
            }

            self.events.emit(&RunEvent::StepStarting { run_id: run.id.clone(), step_number });
            debug!(run_id = %run.id, step_number, messages = messages.len(), "Calling backend");

            let response = self.backend.call(&run.selector, &messages, tools, parameters.clone()).await?;
            run.usage += response.usage;
            run.cost_estimate += self.backend.estimate_cost(&run.selector, &response.usage);
            if token.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }

            if !response.has_tool_calls() {
                let step = Step {
                    step_number,
                    thinking: String::new(),
                    tool_calls: Vec::new(),
                    tool_results: Vec::new(),
                    is_final: true,
                    response: Some(response.text),
                    usage: Some(response.usage),
                };
                run.record_step(step.clone());
                run.finish(RunStatus::Completed, None);
                self.events.emit(&RunEvent::StepComplete { run_id: run.id.clone(), step });
                return Ok(());
            }

            let results = snapshot.execute_many(&response.tool_calls).await;
            let results: Vec<ToolResult> =
                futures::future::join_all(results.into_iter().map(|r| self.context.compact(&run.id, r))).await;

            let step = Step {
                step_number,
                thinking: response.text.clone(),
                tool_calls: response.tool_calls.clone(),
                tool_results: results,
                is_final: false,
                response: None,
                usage: Some(response.usage),
            };
            debug!(
                run_id = %run.id,
                step_number,
                tools = ?step.tool_names(),
                errors = step.has_errors(),
                "Step complete"
            );

            messages.push(ChatMessage::assistant_with_tool_calls(response.text, response.tool_calls));
            for result in &step.tool_results {
                messages.push(ChatMessage::tool_result(
                    &result.call_id,
                    self.render_result(result),
                    result.is_error,
                ));
            }

            run.record_step(step.clone());
            self.events.emit(&RunEvent::StepComplete { run_id: run.id.clone(), step });

            if self.config.progress_recitation && run.steps.len() >= 2 {
                messages.retain(|m| m.id.as_deref() != Some(RECITATION_MESSAGE_ID));
                messages.push(ChatMessage::user(recitation(run, max_steps)).with_id(RECITATION_MESSAGE_ID));
            }
        }

        run.finish(
            RunStatus::MaxStepsReached,
            Some(format!("Reached maximum steps ({max_steps}) without a final answer")),
        );
        Ok(())
    }

    fn render_result(&self, result: &ToolResult) -> String {
        if !result.is_error || self.config.preserve_full_errors {
            return result.content.clone();
        }
        match truncate_chars(&result.content, self.config.truncated_error_chars) {
            (kept, 0) => kept.to_string(),
            (kept, _) => format!("{kept}... [truncated]"),
        }
    }

    fn spawn_timer(&self, run_id: &str, token: &CancellationToken, timed_out: &Arc<AtomicBool>) -> JoinHandle<()> {
        let limit = self.config.run_timeout();
        let token = token.clone();
        let timed_out = Arc::clone(timed_out);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(limit) => {
                    warn!(run_id = %run_id, timeout = ?limit, "Run timed out; cancelling");
                    timed_out.store(true, Ordering::SeqCst);
                    token.cancel();
                }
                () = token.cancelled() => {}
            }
        })
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("config", &self.config)
            .field("active_runs", &self.lock_active().len())
            .finish_non_exhaustive()
    }
}

/// Releases per-run resources whichever way the run ends.
struct RunFinalizer<'a> {
    controller: &'a RunController,
    run_id: String,
    timer: JoinHandle<()>,
    cleaned: bool,
}

impl RunFinalizer<'_> {
    async fn complete(mut self) {
        self.timer.abort();
        self.controller.context.cleanup(&self.run_id).await;
        self.cleaned = true;
    }
}

impl Drop for RunFinalizer<'_> {
    fn drop(&mut self) {
        self.timer.abort();
        self.controller.lock_active().remove(&self.run_id);
        if !self.cleaned {
            // Caller dropped the run future; clean up in the background.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let context = Arc::clone(&self.controller.context);
                let run_id = std::mem::take(&mut self.run_id);
                handle.spawn(async move {
                    context.cleanup(&run_id).await;
                });
            }
        }
    }
}

fn cancel_reason(timed_out: &AtomicBool, config: &RunConfig) -> String {
    if timed_out.load(Ordering::SeqCst) {
        format!("Run exceeded total timeout of {}s", config.run_timeout_seconds)
    } else {
        "Run cancelled".to_string()
    }
}

/// System message first, then prior turns, then the task.
///
/// With explicit instructions every prior system message is dropped; otherwise
/// the first prior system message is kept and moved to the front.
fn build_messages(
    system_instructions: Option<String>,
    prior_messages: Vec<ChatMessage>,
    task: &str,
) -> Vec<ChatMessage> {
    let mut system = system_instructions.map(ChatMessage::system);
    let mut rest = Vec::with_capacity(prior_messages.len() + 1);

    for message in prior_messages {
        if message.role == Role::System {
            if system.is_none() {
                system = Some(message);
            }
            continue;
        }
        rest.push(message);
    }

    let mut messages = Vec::with_capacity(rest.len() + 2);
    if let Some(system) = system {
        messages.push(system.with_id(SYSTEM_MESSAGE_ID));
    }
    messages.extend(rest);
    messages.push(ChatMessage::user(task));
    messages
}

fn recitation(run: &Run, max_steps: usize) -> String {
    let mut text = String::from("[Progress so far]\n");
    for step in &run.steps {
        let marker = if step.has_errors() { " [ERROR]" } else { "" };
        text.push_str(&format!("Step {}: {}{}\n", step.step_number, step.tool_names().join(", "), marker));
    }
    text.push_str(&format!(
        "Steps remaining: {} of {}\nOriginal task: {}\nAnswer without calling tools once you have enough information.",
        max_steps.saturating_sub(run.steps.len()),
        max_steps,
        run.task
    ));
    text
}
