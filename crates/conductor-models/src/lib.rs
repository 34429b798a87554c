//! Model backend implementations for Conductor.
//!
//! This crate provides concrete implementations of the `ModelBackend` trait
//! that run in-process.
//!
//! # Backends
//!
//! - **Scripted**: replays queued responses per selector. Used for offline
//!   replay of recorded transcripts and for testing orchestration behavior.

use async_trait::async_trait;
use conductor_abstraction::{
    BackendSelector, ChatMessage, ModelBackend, ModelError, ModelParameters, ModelResponse,
    TokenUsage, ToolDefinition,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// One call observed by a [`ScriptedBackend`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Selector the call was routed to.
    pub selector: BackendSelector,
    /// Messages sent with the call.
    pub messages: Vec<ChatMessage>,
    /// Names of the advertised tools (empty for plain calls).
    pub tool_names: Vec<String>,
    /// Generation parameters, if any.
    pub parameters: Option<ModelParameters>,
    /// Whether this was a `call_plain` invocation.
    pub plain: bool,
}

#[derive(Debug, Default)]
struct ScriptState {
    queues: HashMap<BackendSelector, VecDeque<ModelResponse>>,
    plain: VecDeque<String>,
    calls: Vec<RecordedCall>,
}

/// A backend that replays scripted responses.
///
/// Each selector has its own queue. When a queue runs dry the selector's
/// repeating response is used, if one was configured; otherwise the call fails.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptState>,
    repeating: HashMap<BackendSelector, ModelResponse>,
    failing: HashSet<BackendSelector>,
    without_tools: HashSet<BackendSelector>,
    latency: HashMap<BackendSelector, Duration>,
    cost_per_token: f64,
    estimate_usage: bool,
}

impl ScriptedBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues responses for `selector`, returned in order.
    #[must_use]
    pub fn with_responses(self, selector: &BackendSelector, responses: Vec<ModelResponse>) -> Self {
        self.lock()
            .queues
            .entry(selector.clone())
            .or_default()
            .extend(responses);
        self
    }

    /// Response returned for `selector` once its queue is exhausted.
    #[must_use]
    pub fn with_repeating(mut self, selector: &BackendSelector, response: ModelResponse) -> Self {
        self.repeating.insert(selector.clone(), response);
        self
    }

    /// Every call routed to `selector` fails.
    #[must_use]
    pub fn failing(mut self, selector: &BackendSelector) -> Self {
        self.failing.insert(selector.clone());
        self
    }

    /// `selector` reports no structured tool call support.
    #[must_use]
    pub fn without_tool_support(mut self, selector: &BackendSelector) -> Self {
        self.without_tools.insert(selector.clone());
        self
    }

    /// Delay applied to every call routed to `selector`.
    #[must_use]
    pub fn with_latency(mut self, selector: &BackendSelector, latency: Duration) -> Self {
        self.latency.insert(selector.clone(), latency);
        self
    }

    /// Queues a text answer for the next `call_plain`.
    #[must_use]
    pub fn with_plain_response(self, text: impl Into<String>) -> Self {
        self.lock().plain.push_back(text.into());
        self
    }

    /// Flat per-token price used by `estimate_cost`.
    #[must_use]
    pub fn with_cost_per_token(mut self, cost: f64) -> Self {
        self.cost_per_token = cost;
        self
    }

    /// Fill in zero usage counters with a word-count estimate.
    #[must_use]
    pub fn with_estimated_usage(mut self) -> Self {
        self.estimate_usage = true;
        self
    }

    /// All calls observed so far, in arrival order.
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Calls observed for one selector.
    pub fn calls_for(&self, selector: &BackendSelector) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| &call.selector == selector)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self, selector: &BackendSelector) {
        if let Some(latency) = self.latency.get(selector) {
            tokio::time::sleep(*latency).await;
        }
    }

    fn next_response(&self, selector: &BackendSelector) -> Result<ModelResponse, ModelError> {
        let queued = self.lock().queues.get_mut(selector).and_then(VecDeque::pop_front);
        queued
            .or_else(|| self.repeating.get(selector).cloned())
            .ok_or_else(|| {
                ModelError::ModelResponseError(format!("script exhausted for {selector}"))
            })
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn supports_tool_calls(&self, selector: &BackendSelector) -> bool {
        !self.without_tools.contains(selector)
    }

    async fn call(
        &self,
        selector: &BackendSelector,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        parameters: Option<ModelParameters>,
    ) -> Result<ModelResponse, ModelError> {
        debug!(
            selector = %selector,
            message_count = messages.len(),
            tool_count = tools.map_or(0, <[ToolDefinition]>::len),
            "ScriptedBackend handling call"
        );
        self.lock().calls.push(RecordedCall {
            selector: selector.clone(),
            messages: messages.to_vec(),
            tool_names: tools
                .unwrap_or_default()
                .iter()
                .map(|tool| tool.name.clone())
                .collect(),
            parameters,
            plain: false,
        });
        self.simulate_latency(selector).await;

        if self.failing.contains(selector) {
            return Err(ModelError::RequestError(format!("{selector} is unavailable")));
        }

        let mut response = self.next_response(selector)?;
        if self.estimate_usage && response.usage == TokenUsage::default() {
            let input = messages.iter().map(|m| count_tokens(&m.content)).sum();
            response.usage = TokenUsage::new(input, count_tokens(&response.text));
        }
        Ok(response)
    }

    async fn call_plain(
        &self,
        selector: &BackendSelector,
        messages: &[ChatMessage],
    ) -> Result<String, ModelError> {
        debug!(selector = %selector, message_count = messages.len(), "ScriptedBackend handling plain call");
        self.lock().calls.push(RecordedCall {
            selector: selector.clone(),
            messages: messages.to_vec(),
            tool_names: Vec::new(),
            parameters: None,
            plain: true,
        });
        self.simulate_latency(selector).await;

        if self.failing.contains(selector) {
            return Err(ModelError::RequestError(format!("{selector} is unavailable")));
        }

        self.lock()
            .plain
            .pop_front()
            .ok_or_else(|| ModelError::ModelResponseError("no plain response scripted".to_string()))
    }

    #[allow(clippy::cast_precision_loss)]
    fn estimate_cost(&self, _selector: &BackendSelector, usage: &TokenUsage) -> f64 {
        usage.total() as f64 * self.cost_per_token
    }
}

/// Count tokens in a string (simplified: word count).
///
/// For a real implementation, this would use a proper tokenizer.
pub fn count_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}
