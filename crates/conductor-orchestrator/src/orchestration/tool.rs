// Tool abstractions for orchestration
//
// Built-in tools pair a definition with a handler. Results are normalized into
// `ToolResult`, which answers exactly one `ToolCall`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub use conductor_abstraction::{ToolCall, ToolDefinition};

use crate::error::Result;

/// Arguments passed to tool handler
#[derive(Debug, Clone)]
pub struct ToolArguments {
    /// Parsed arguments as JSON value
    pub args: Value,
}

impl ToolArguments {
    /// Create new tool arguments
    pub fn new(args: Value) -> Self {
        Self { args }
    }

    /// Get argument as string
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.args.get(key)?.as_str().map(str::to_string)
    }
}

/// Output produced by a handler, before it is tied to a call id
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Content returned to the model
    pub content: String,
    /// Whether the tool reported a logical failure
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful text output
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false }
    }

    /// Logical failure reported by the tool
    pub fn error(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: true }
    }
}

/// Render a provider payload as text.
pub(crate) fn stringify_payload(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Result from tool execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call this result answers
    pub call_id: String,
    /// Output, truncated output, or an externalization reference
    pub content: String,
    /// Whether this result represents a failure
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: content.into(), is_error: false }
    }

    /// Create an error result
    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: content.into(), is_error: true }
    }

    /// Tie a handler output to a call
    pub fn from_output(call_id: impl Into<String>, output: ToolOutput) -> Self {
        Self { call_id: call_id.into(), content: output.content, is_error: output.is_error }
    }
}

/// Handler for tool execution
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with given arguments
    ///
    /// Returning `Err` and returning `ToolOutput::error` are both surfaced to the
    /// model as error results; neither aborts the run.
    async fn execute(&self, args: &ToolArguments) -> Result<ToolOutput>;
}

/// Statically registered tool
#[derive(Clone)]
pub struct BuiltinTool {
    /// Advertised definition
    pub definition: ToolDefinition,
    /// Handler for executing the tool
    pub handler: Arc<dyn ToolHandler>,
}

impl BuiltinTool {
    /// Create a new built-in tool
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self { definition: ToolDefinition::new(name, description, input_schema), handler }
    }

    /// Tool name
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

// Implement Debug manually since Arc<dyn ToolHandler> doesn't implement Debug
impl std::fmt::Debug for BuiltinTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinTool")
            .field("definition", &self.definition)
            .field("handler", &"<handler>")
            .finish()
    }
}

/// Build an object schema from `(name, type, description, required)` entries
pub fn object_schema(properties: &[(&str, &str, &str, bool)]) -> Value {
    let mut props = serde_json::Map::new();
    let mut required = Vec::new();
    for (name, property_type, description, is_required) in properties {
        props.insert(
            (*name).to_string(),
            serde_json::json!({ "type": property_type, "description": description }),
        );
        if *is_required {
            required.push(Value::String((*name).to_string()));
        }
    }
    serde_json::json!({ "type": "object", "properties": props, "required": required })
}
