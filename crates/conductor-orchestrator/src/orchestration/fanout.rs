// Task decomposition and fan-out orchestrator
//
// idle -> decomposing -> awaiting_configuration -> running_subtasks
//      -> synthesizing -> done(completed | partial | failed)
//
// Decomposed sessions wait in `pending` until `execute` takes them. While
// subtasks run, the session holds a slot in the session gate; cancelling the
// session fires every subtask's token through the session token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use conductor_abstraction::{BackendSelector, ChatMessage, ModelBackend, TokenUsage};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::aggregator::{synthesis_prompt, AggregateStatus, SYNTHESIS_INSTRUCTIONS};
use super::config::{ConductorConfig, FanOutConfig};
use super::context::ContextExternalizer;
use super::decomposition::{decompose, Subtask};
use super::engine::RunRequest;
use super::events::{EventBus, SubscriptionId, TaggedRunEvent};
use super::execution::truncate_chars;
use super::run::RunOutcome;
use super::scheduling::{settle, stagger_delays, RunSpawner, SessionGate};
use super::tool_registry::ToolDispatchRegistry;
use crate::error::{OrchestrationError, Result};

/// Pipeline phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Decomposing,
    AwaitingConfiguration,
    RunningSubtasks,
    Synthesizing,
    Done,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Decomposing => "decomposing",
            Self::AwaitingConfiguration => "awaiting_configuration",
            Self::RunningSubtasks => "running_subtasks",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Settled run of one subtask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    /// Subtask this result answers
    pub subtask_id: String,
    /// How its run ended
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

/// One decompose -> execute -> synthesize pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Master task
    pub task: String,
    /// Backend used for decomposition and synthesis
    pub selector: BackendSelector,
    /// Decomposition summary
    pub summary: String,
    pub subtasks: Vec<Subtask>,
    /// One result per subtask, in subtask order
    pub results: Vec<SubtaskResult>,
    /// Integrated answer
    pub synthesis: Option<String>,
    /// Why synthesis was skipped or failed
    pub synthesis_error: Option<String>,
    pub phase: SessionPhase,
    /// Set once the session is done
    pub status: Option<AggregateStatus>,
    /// Token usage summed over subtask runs
    pub usage: TokenUsage,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Look up a subtask by id
    pub fn subtask(&self, subtask_id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == subtask_id)
    }

    /// Look up a subtask's result by id
    pub fn result_for(&self, subtask_id: &str) -> Option<&SubtaskResult> {
        self.results.iter().find(|r| r.subtask_id == subtask_id)
    }
}

/// Decomposes a task, runs the subtasks concurrently and synthesizes one answer
pub struct TaskOrchestrator {
    backend: Arc<dyn ModelBackend>,
    config: ConductorConfig,
    spawner: RunSpawner,
    gate: SessionGate,
    pending: Mutex<HashMap<String, Session>>,
    events: Arc<EventBus<TaggedRunEvent>>,
}

impl TaskOrchestrator {
    /// Create an orchestrator over shared collaborators
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        tools: Arc<ToolDispatchRegistry>,
        context: Arc<ContextExternalizer>,
        config: ConductorConfig,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let spawner = RunSpawner::new(
            Arc::clone(&backend),
            tools,
            context,
            config.run.clone(),
            Arc::clone(&events),
        );
        Self {
            backend,
            gate: SessionGate::new(config.fan_out.max_concurrent_sessions),
            config,
            spawner,
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Observe subtask run events, tagged with the subtask id
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&TaggedRunEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Split `task` into subtasks using `selector`
    ///
    /// The returned session is kept until `execute` or `cancel_session`.
    pub async fn decompose(&self, task: &str, selector: BackendSelector) -> Result<Session> {
        let id = Uuid::new_v4().to_string();
        info!(session_id = %id, selector = %selector, phase = %SessionPhase::Decomposing, "Decomposing task");

        let decomposition = decompose(self.backend.as_ref(), &selector, task, self.config.tools.clone()).await?;
        let session = Session {
            id: id.clone(),
            task: task.to_string(),
            selector,
            summary: decomposition.summary,
            subtasks: decomposition.subtasks,
            results: Vec::new(),
            synthesis: None,
            synthesis_error: None,
            phase: SessionPhase::AwaitingConfiguration,
            status: None,
            usage: TokenUsage::default(),
            duration_ms: 0,
            created_at: Utc::now(),
        };

        self.lock_pending().insert(id, session.clone());
        Ok(session)
    }

    /// A session awaiting configuration
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.lock_pending().get(session_id).cloned()
    }

    /// Route one subtask to a different backend before execution
    pub fn set_subtask_selector(&self, session_id: &str, subtask_id: &str, selector: BackendSelector) -> Result<()> {
        let mut pending = self.lock_pending();
        let session = pending
            .get_mut(session_id)
            .ok_or_else(|| OrchestrationError::SessionNotFound(session_id.to_string()))?;
        if session.phase != SessionPhase::AwaitingConfiguration {
            return Err(OrchestrationError::InvalidSessionState {
                expected: SessionPhase::AwaitingConfiguration.to_string(),
                actual: session.phase.to_string(),
            });
        }
        let subtask = session
            .subtasks
            .iter_mut()
            .find(|s| s.id == subtask_id)
            .ok_or_else(|| OrchestrationError::SubtaskNotFound(subtask_id.to_string()))?;

        info!(session_id = %session_id, subtask_id = %subtask_id, selector = %selector, "Subtask selector changed");
        subtask.selector = selector;
        Ok(())
    }

    /// Run every subtask concurrently, then synthesize
    ///
    /// Fails fast with `SessionLimitReached` when the concurrent session cap is
    /// hit; the session then stays pending and may be executed later.
    pub async fn execute(&self, session_id: &str) -> Result<Session> {
        let token = CancellationToken::new();
        let (mut session, _permit) = {
            let mut pending = self.lock_pending();
            if !pending.contains_key(session_id) {
                return Err(OrchestrationError::SessionNotFound(session_id.to_string()));
            }
            let permit = self.gate.try_acquire(session_id, token.clone())?;
            let session = pending
                .remove(session_id)
                .ok_or_else(|| OrchestrationError::SessionNotFound(session_id.to_string()))?;
            (session, permit)
        };

        // Dropping this future cancels the subtask runs instead of detaching them.
        let _cancel_on_drop = token.clone().drop_guard();
        let started = Instant::now();
        session.phase = SessionPhase::RunningSubtasks;
        info!(session_id = %session.id, subtasks = session.subtasks.len(), "Running subtasks");

        let delays = stagger_delays(session.subtasks.iter().map(|s| &s.selector), self.config.fan_out.stagger());
        let handles = session
            .subtasks
            .iter()
            .zip(delays)
            .map(|(subtask, delay)| {
                let request = RunRequest::new(subtask_prompt(subtask, &self.config.fan_out), subtask.selector.clone());
                self.spawner.spawn(subtask.id.clone(), request, delay, token.child_token())
            })
            .collect();
        let outcomes = settle(handles).await;

        for outcome in &outcomes {
            session.usage += outcome.usage();
        }
        let status = AggregateStatus::from_outcomes(&outcomes);
        session.results = session
            .subtasks
            .iter()
            .zip(outcomes)
            .map(|(subtask, outcome)| SubtaskResult { subtask_id: subtask.id.clone(), outcome })
            .collect();

        session.status = Some(self.synthesize(&mut session, status, &token).await);
        session.phase = SessionPhase::Done;
        session.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            session_id = %session.id,
            status = ?session.status,
            tokens = session.usage.total(),
            duration_ms = session.duration_ms,
            "Session finished"
        );
        Ok(session)
    }

    /// Decompose and immediately execute with inherited selectors
    pub async fn decompose_and_execute(&self, task: &str, selector: BackendSelector) -> Result<Session> {
        let session = self.decompose(task, selector).await?;
        self.execute(&session.id).await
    }

    /// Cancel a running session's subtasks, or discard a pending session
    pub fn cancel_session(&self, session_id: &str) -> bool {
        let discarded = self.lock_pending().remove(session_id).is_some();
        self.gate.cancel(session_id) || discarded
    }

    /// Ids of sessions currently running subtasks
    pub fn active_sessions(&self) -> Vec<String> {
        self.gate.active_ids()
    }

    async fn synthesize(
        &self,
        session: &mut Session,
        status: AggregateStatus,
        token: &CancellationToken,
    ) -> AggregateStatus {
        if token.is_cancelled() {
            session.synthesis_error = Some("Session cancelled before synthesis".to_string());
            return status;
        }
        if status == AggregateStatus::Failed {
            session.synthesis_error = Some("No subtask completed; nothing to synthesize".to_string());
            return status;
        }

        session.phase = SessionPhase::Synthesizing;
        let outcomes: Vec<RunOutcome> = session.results.iter().map(|r| r.outcome.clone()).collect();
        let messages = [
            ChatMessage::system(SYNTHESIS_INSTRUCTIONS),
            ChatMessage::user(synthesis_prompt(&session.task, &session.subtasks, &outcomes)),
        ];

        match self.spawner.backend().call_plain(&session.selector, &messages).await {
            Ok(answer) => {
                session.synthesis = Some(answer);
                status
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Synthesis failed");
                session.synthesis_error = Some(e.to_string());
                AggregateStatus::Partial
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("config", &self.config)
            .field("active_sessions", &self.gate.active_ids())
            .finish_non_exhaustive()
    }
}

const SUBTASK_FENCE_START: &str = "=== SUBTASK ===";
const SUBTASK_FENCE_END: &str = "=== END SUBTASK ===";

/// Prompt for one subtask run, behind a fenced, length-capped preamble
fn subtask_prompt(subtask: &Subtask, limits: &FanOutConfig) -> String {
    let title_clean = strip_fence_markers(&subtask.title);
    let (title, _) = truncate_chars(&title_clean, limits.max_title_chars);
    let description_clean = strip_fence_markers(&subtask.description);
    let (description, _) = truncate_chars(&description_clean, limits.max_description_chars);
    format!(
        "{SUBTASK_FENCE_START}\n\
         Title: {title}\n\
         Description: {description}\n\
         {SUBTASK_FENCE_END}\n\n\
         You are handling one part of a larger task. Work only on the subtask above, \
         using the available tools as needed, and finish with a concise answer for this part."
    )
}

/// Remove anything that could open or close the subtask fence
fn strip_fence_markers(text: &str) -> String {
    let mut text = text.to_string();
    // Removal can splice a new marker out of nested fragments.
    while text.contains(SUBTASK_FENCE_END) || text.contains(SUBTASK_FENCE_START) {
        text = text.replace(SUBTASK_FENCE_END, "").replace(SUBTASK_FENCE_START, "");
    }
    text
}
