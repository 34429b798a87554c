// Multi-backend comparison
//
// Runs one prompt against 1-3 backend slots concurrently, each on its own run
// controller, and reports the aggregate status. Admission uses a session gate
// separate from the task orchestrator's.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use conductor_abstraction::{BackendSelector, ModelBackend};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::aggregator::AggregateStatus;
use super::config::ConductorConfig;
use super::context::ContextExternalizer;
use super::engine::RunRequest;
use super::events::{EventBus, SubscriptionId, TaggedRunEvent};
use super::run::RunOutcome;
use super::scheduling::{settle, stagger_delays, RunSpawner, SessionGate};
use super::tool_registry::ToolDispatchRegistry;
use crate::error::{OrchestrationError, Result};

/// Most slots one comparison may run
pub const MAX_SLOTS: usize = 3;

/// A backend under comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonSlot {
    pub selector: BackendSelector,
    /// Optional display label
    pub label: Option<String>,
}

impl ComparisonSlot {
    pub fn new(selector: BackendSelector) -> Self {
        Self { selector, label: None }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label if set, otherwise `provider/model`
    pub fn display_label(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.selector.to_string())
    }
}

/// Settled run of one slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotResult {
    /// `slot-1`, `slot-2`, ... in request order; also the event source id
    pub slot_id: String,
    pub slot: ComparisonSlot,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

/// Result of one comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSession {
    pub id: String,
    pub prompt: String,
    /// One result per slot, in request order
    pub results: Vec<SlotResult>,
    pub status: AggregateStatus,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Runs the same prompt against several backends
pub struct ComparisonCoordinator {
    config: ConductorConfig,
    spawner: RunSpawner,
    gate: SessionGate,
    events: Arc<EventBus<TaggedRunEvent>>,
}

impl ComparisonCoordinator {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        tools: Arc<ToolDispatchRegistry>,
        context: Arc<ContextExternalizer>,
        config: ConductorConfig,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let spawner = RunSpawner::new(backend, tools, context, config.run.clone(), Arc::clone(&events));
        Self {
            gate: SessionGate::new(config.fan_out.max_concurrent_sessions),
            config,
            spawner,
            events,
        }
    }

    /// Observe slot run events, tagged with the slot id
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&TaggedRunEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Run `prompt` against every slot and wait for all of them
    ///
    /// The slot count is checked before anything starts.
    pub async fn compare(&self, prompt: &str, slots: Vec<ComparisonSlot>) -> Result<ComparisonSession> {
        self.compare_with_id(Uuid::new_v4().to_string(), prompt, slots).await
    }

    /// Same as [`compare`](Self::compare) with a caller-chosen session id, usable with `cancel_session`
    pub async fn compare_with_id(
        &self,
        session_id: String,
        prompt: &str,
        slots: Vec<ComparisonSlot>,
    ) -> Result<ComparisonSession> {
        if slots.is_empty() || slots.len() > MAX_SLOTS {
            return Err(OrchestrationError::InvalidSlotCount(slots.len()));
        }
        if prompt.trim().is_empty() {
            return Err(OrchestrationError::Other("Prompt must not be empty".to_string()));
        }

        let token = CancellationToken::new();
        let _permit = self.gate.try_acquire(&session_id, token.clone())?;
        // Dropping this future cancels the slot runs instead of detaching them.
        let _cancel_on_drop = token.clone().drop_guard();
        let started = Instant::now();
        let created_at = Utc::now();
        info!(session_id = %session_id, slots = slots.len(), "Starting comparison");

        let delays = stagger_delays(slots.iter().map(|s| &s.selector), self.config.fan_out.stagger());
        let slot_ids: Vec<String> = (1..=slots.len()).map(|n| format!("slot-{n}")).collect();
        let handles = slots
            .iter()
            .zip(&slot_ids)
            .zip(delays)
            .map(|((slot, slot_id), delay)| {
                let request = RunRequest::new(prompt, slot.selector.clone());
                self.spawner.spawn(slot_id.clone(), request, delay, token.child_token())
            })
            .collect();
        let outcomes = settle(handles).await;

        let status = AggregateStatus::from_outcomes(&outcomes);
        let results = slot_ids
            .into_iter()
            .zip(slots)
            .zip(outcomes)
            .map(|((slot_id, slot), outcome)| SlotResult { slot_id, slot, outcome })
            .collect();
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(session_id = %session_id, status = %status, duration_ms, "Comparison finished");
        Ok(ComparisonSession {
            id: session_id,
            prompt: prompt.to_string(),
            results,
            status,
            duration_ms,
            created_at,
        })
    }

    /// Fire every slot's token for a running comparison
    pub fn cancel_session(&self, session_id: &str) -> bool {
        self.gate.cancel(session_id)
    }

    /// Ids of running comparisons
    pub fn active_sessions(&self) -> Vec<String> {
        self.gate.active_ids()
    }
}

impl std::fmt::Debug for ComparisonCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComparisonCoordinator")
            .field("config", &self.config)
            .field("active_sessions", &self.gate.active_ids())
            .finish_non_exhaustive()
    }
}
