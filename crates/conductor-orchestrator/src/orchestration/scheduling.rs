// Shared plumbing for fan-out sessions
//
// Session admission (a fail-fast cap on concurrently active sessions), the
// same-selector start stagger, and spawning of isolated, event-tagging run
// controllers. Used by both the task orchestrator and the comparison
// coordinator, each with its own gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use conductor_abstraction::{BackendSelector, ModelBackend};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::RunConfig;
use super::context::ContextExternalizer;
use super::engine::{RunController, RunRequest};
use super::events::{EventBus, TaggedRunEvent};
use super::run::{RunOutcome, RunStatus};
use super::tool_registry::ToolDispatchRegistry;
use crate::error::{OrchestrationError, Result};

/// Admission ticket; tells a session apart from a later one reusing its id
type Ticket = u64;

/// Caps concurrently active sessions and holds their cancellation tokens
#[derive(Debug)]
pub(crate) struct SessionGate {
    limit: usize,
    next_ticket: AtomicU64,
    active: Mutex<HashMap<String, (Ticket, CancellationToken)>>,
}

impl SessionGate {
    pub(crate) fn new(limit: usize) -> Self {
        Self { limit, next_ticket: AtomicU64::new(0), active: Mutex::new(HashMap::new()) }
    }

    /// Admit a session or fail immediately when the cap is reached
    pub(crate) fn try_acquire(&self, session_id: &str, token: CancellationToken) -> Result<SessionPermit<'_>> {
        let mut active = self.lock();
        if active.contains_key(session_id) {
            return Err(OrchestrationError::Other(format!("Session {session_id} is already running")));
        }
        if active.len() >= self.limit {
            warn!(session_id = %session_id, limit = self.limit, "Session limit reached");
            return Err(OrchestrationError::SessionLimitReached { limit: self.limit });
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        active.insert(session_id.to_string(), (ticket, token));
        Ok(SessionPermit { gate: self, session_id: session_id.to_string(), ticket })
    }

    /// Fire a session's token and drop it from the active set
    pub(crate) fn cancel(&self, session_id: &str) -> bool {
        let token = self.lock().remove(session_id);
        token.is_some_and(|(_, token)| {
            info!(session_id = %session_id, "Cancelling session");
            token.cancel();
            true
        })
    }

    pub(crate) fn active_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Ticket, CancellationToken)>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a gate slot when dropped
pub(crate) struct SessionPermit<'a> {
    gate: &'a SessionGate,
    session_id: String,
    ticket: Ticket,
}

impl Drop for SessionPermit<'_> {
    fn drop(&mut self) {
        let mut active = self.gate.lock();
        // A cancelled session's id may already belong to a newer admission.
        if active.get(&self.session_id).is_some_and(|(ticket, _)| *ticket == self.ticket) {
            active.remove(&self.session_id);
        }
    }
}

/// Start delay for each selector: its index among earlier items with the same selector times `increment`
pub(crate) fn stagger_delays<'a>(
    selectors: impl IntoIterator<Item = &'a BackendSelector>,
    increment: Duration,
) -> Vec<Duration> {
    let mut seen: HashMap<&BackendSelector, u32> = HashMap::new();
    selectors
        .into_iter()
        .map(|selector| {
            let index = seen.entry(selector).or_insert(0);
            let delay = increment * *index;
            *index += 1;
            delay
        })
        .collect()
}

/// Wait out a stagger delay. Returns `false` if the token fired first.
pub(crate) async fn staggered_start(delay: Duration, token: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => !token.is_cancelled(),
        () = token.cancelled() => false,
    }
}

/// Builds one fresh run controller per spawned run
#[derive(Clone)]
pub(crate) struct RunSpawner {
    backend: Arc<dyn ModelBackend>,
    tools: Arc<ToolDispatchRegistry>,
    context: Arc<ContextExternalizer>,
    config: RunConfig,
    events: Arc<EventBus<TaggedRunEvent>>,
}

impl RunSpawner {
    pub(crate) fn new(
        backend: Arc<dyn ModelBackend>,
        tools: Arc<ToolDispatchRegistry>,
        context: Arc<ContextExternalizer>,
        config: RunConfig,
        events: Arc<EventBus<TaggedRunEvent>>,
    ) -> Self {
        Self { backend, tools, context, config, events }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    /// Spawn one run on its own controller, re-emitting its events tagged with `source_id`
    pub(crate) fn spawn(
        &self,
        source_id: String,
        request: RunRequest,
        delay: Duration,
        token: CancellationToken,
    ) -> JoinHandle<RunOutcome> {
        let controller = RunController::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.tools),
            Arc::clone(&self.context),
            self.config.clone(),
        );
        let events = Arc::clone(&self.events);
        let tag = source_id.clone();
        controller.subscribe(move |event| {
            events.emit(&TaggedRunEvent { source_id: tag.clone(), event: event.clone() });
        });

        tokio::spawn(async move {
            if !staggered_start(delay, &token).await {
                debug!(source_id = %source_id, "Cancelled before start");
                return RunOutcome::not_started(RunStatus::Cancelled, "Cancelled before start");
            }
            match controller.execute(request.with_cancellation(token)).await {
                Ok(run) => RunOutcome::from_run(run),
                Err(e) => {
                    warn!(source_id = %source_id, error = %e, "Run rejected");
                    RunOutcome::not_started(RunStatus::Failed, e.to_string())
                }
            }
        })
    }
}

/// Wait for every spawned run to settle; results keep spawn order
pub(crate) async fn settle(handles: Vec<JoinHandle<RunOutcome>>) -> Vec<RunOutcome> {
    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            joined.unwrap_or_else(|e| {
                warn!(error = %e, "Run task did not complete");
                RunOutcome::not_started(RunStatus::Failed, format!("Run task did not complete: {e}"))
            })
        })
        .collect()
}
