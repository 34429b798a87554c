//! Model backend abstraction layer for Conductor.
//!
//! This module defines the normalized request/response shapes the orchestration
//! core exchanges with a model backend, and the `ModelBackend` trait that any
//! provider integration implements. Provider-specific translation happens on the
//! far side of this boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;
use thiserror::Error;

/// Represents an error that can occur when interacting with a model backend.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelError {
    /// An error occurred during the API request (e.g., network issues, invalid request).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The model returned an error (e.g., invalid input, rate limiting).
    #[error("Model Response Error: {0}")]
    ModelResponseError(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization Error: {0}")]
    SerializationError(String),

    /// The selected backend is not known to the collaborator.
    #[error("Unsupported Model Backend: {0}")]
    UnsupportedBackend(String),

    /// Provider quota exceeded or rate limit hit (hard stop error).
    #[error("Provider '{provider}' quota exceeded{}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    QuotaExceeded {
        /// The provider name (e.g., "openai", "anthropic").
        provider: String,
        /// Optional error message from the provider.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Other unexpected errors.
    #[error("Other Model Error: {0}")]
    Other(String),
}

/// Identifies which model backend a call should be routed to.
///
/// Written as `provider/model` in configuration and on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendSelector {
    /// Provider name (e.g., "anthropic", "openai", "ollama").
    pub provider: String,
    /// Model identifier within that provider.
    pub model: String,
}

impl BackendSelector {
    /// Creates a selector from a provider and model name.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self { provider: provider.into(), model: model.into() }
    }
}

impl fmt::Display for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

impl FromStr for BackendSelector {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((provider, model)) if !provider.trim().is_empty() && !model.trim().is_empty() => {
                Ok(Self::new(provider.trim(), model.trim()))
            }
            _ => Err(ModelError::UnsupportedBackend(format!(
                "expected 'provider/model', got '{s}'"
            ))),
        }
    }
}

/// Role of a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user (or orchestrator-injected) turn.
    User,
    /// Model turn, possibly carrying tool calls.
    Assistant,
    /// Result of one tool call.
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this tool call.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments for the tool. Validated by the tool provider, not here.
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

impl ToolCall {
    /// Creates a tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self { id: id.into(), name: name.into(), arguments }
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Capability advertisement for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (used in tool calls).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema describing accepted arguments.
    pub input_schema: Value,
}

impl ToolDefinition {
    /// Creates a tool definition.
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self { name: name.into(), description: description.into(), input_schema }
    }
}

/// Represents a message in a conversation with a chat model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Stable identity for messages that must keep their slot across turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The role of the message sender.
    pub role: Role,
    /// The content of the message.
    pub content: String,
    /// Tool calls carried by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool turns: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool turns: whether the tool reported a failure.
    #[serde(default)]
    pub is_error: bool,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
        }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    /// Creates an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Creates an assistant message that requests tool calls.
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { tool_calls, ..Self::plain(Role::Assistant, content) }
    }

    /// Creates a tool-result message answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            is_error,
            ..Self::plain(Role::Tool, content)
        }
    }

    /// Attaches a stable identity.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Token counters reported by a backend call, or accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Creates a usage record.
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self { input_tokens, output_tokens }
    }

    /// Input plus output tokens.
    pub const fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens = self.input_tokens.saturating_add(rhs.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(rhs.output_tokens);
    }
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model finished its turn.
    #[default]
    Stop,
    /// The model wants tool results before continuing.
    ToolUse,
}

/// Constrains which tool the backend may call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides.
    Auto,
    /// The model must call the named tool.
    Required(String),
}

/// Parameters for controlling the model's generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Sampling temperature, between 0 and 2.
    pub temperature: Option<f32>,

    /// The maximum number of tokens to generate.
    pub max_tokens: Option<u32>,

    /// Tool selection constraint.
    pub tool_choice: Option<ToolChoice>,
}

impl ModelParameters {
    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Forces the backend to call the named tool.
    #[must_use]
    pub fn require_tool(mut self, name: impl Into<String>) -> Self {
        self.tool_choice = Some(ToolChoice::Required(name.into()));
        self
    }
}

/// Normalized response of a tool-aware backend call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Generated text (reasoning or final answer).
    #[serde(default)]
    pub text: String,

    /// Tool calls requested by the model.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    /// Usage statistics for the request.
    #[serde(default)]
    pub usage: TokenUsage,

    /// Why generation stopped.
    #[serde(default)]
    pub stop_reason: StopReason,
}

impl ModelResponse {
    /// A final text answer with no tool calls.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Self::default() }
    }

    /// A response requesting tool calls.
    pub fn tool_use(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { text: text.into(), tool_calls, stop_reason: StopReason::ToolUse, ..Self::default() }
    }

    /// Attaches usage counters.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Whether the model requests tool execution.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A model backend the orchestration core can call.
///
/// All backends must be `Send + Sync` to allow concurrent use across runs.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Whether the selected backend supports structured tool calls.
    fn supports_tool_calls(&self, selector: &BackendSelector) -> bool;

    /// Tool-aware chat call.
    ///
    /// # Arguments
    /// * `selector` - Which backend to route to
    /// * `messages` - Full conversation history
    /// * `tools` - Tools to advertise, if any
    /// * `parameters` - Optional generation parameters
    ///
    /// # Errors
    /// Returns a `ModelError` if the call fails.
    async fn call(
        &self,
        selector: &BackendSelector,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        parameters: Option<ModelParameters>,
    ) -> Result<ModelResponse, ModelError>;

    /// Non-tool-aware chat call returning plain text.
    ///
    /// # Errors
    /// Returns a `ModelError` if the call fails.
    async fn call_plain(
        &self,
        selector: &BackendSelector,
        messages: &[ChatMessage],
    ) -> Result<String, ModelError>;

    /// Estimated cost in USD for the given usage. Backends without pricing return zero.
    fn estimate_cost(&self, _selector: &BackendSelector, _usage: &TokenUsage) -> f64 {
        0.0
    }
}
