// Task decomposition through a forced structural tool call
//
// The backend sees exactly one tool, `decompose_task`, and is required to call
// it. The tool validates the payload itself; any deviation (no call, another
// tool, wrong shape) fails decomposition with the rule that was broken.

use std::sync::Arc;

use async_trait::async_trait;
use conductor_abstraction::{BackendSelector, ChatMessage, ModelBackend, ModelParameters};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::ToolDispatchConfig;
use super::tool::{BuiltinTool, ToolArguments, ToolHandler, ToolOutput};
use super::tool_registry::ToolDispatchRegistry;
use crate::error::{DecompositionError, OrchestrationError, Result};

/// Name of the structural decomposition tool
pub const DECOMPOSE_TOOL_NAME: &str = "decompose_task";

/// Largest number of subtasks a decomposition may produce
pub const MAX_SUBTASKS: usize = 3;

const DECOMPOSITION_INSTRUCTIONS: &str = "You split a task into between 1 and 3 independent subtasks \
that can be worked on in parallel. Call the decompose_task tool with a short summary and the subtasks. \
Each subtask needs a short title and a self-contained description.";

/// One unit of work produced by decomposition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    /// Generated identity
    pub id: String,
    /// Short title
    pub title: String,
    /// Self-contained description
    pub description: String,
    /// Backend the subtask will run against
    pub selector: BackendSelector,
    /// 1-based position in the decomposition
    pub order_index: usize,
}

/// Accepted decomposition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    /// Model-written summary of the plan
    pub summary: String,
    /// Subtasks in order
    pub subtasks: Vec<Subtask>,
}

#[derive(Debug, Deserialize)]
struct DecompositionPayload {
    summary: String,
    subtasks: Vec<SubtaskDraft>,
}

#[derive(Debug, Deserialize)]
struct SubtaskDraft {
    title: String,
    description: String,
}

impl DecompositionPayload {
    fn parse(args: &Value) -> std::result::Result<Self, String> {
        let payload: Self = serde_json::from_value(args.clone()).map_err(|e| format!("malformed payload: {e}"))?;
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.summary.trim().is_empty() {
            return Err("summary must not be empty".to_string());
        }
        if !(1..=MAX_SUBTASKS).contains(&self.subtasks.len()) {
            return Err(format!(
                "expected between 1 and {MAX_SUBTASKS} subtasks, got {}",
                self.subtasks.len()
            ));
        }
        for (index, draft) in self.subtasks.iter().enumerate() {
            if draft.title.trim().is_empty() {
                return Err(format!("subtask {} is missing a title", index + 1));
            }
            if draft.description.trim().is_empty() {
                return Err(format!("subtask {} is missing a description", index + 1));
            }
        }
        Ok(())
    }
}

struct DecomposeTaskHandler;

#[async_trait]
impl ToolHandler for DecomposeTaskHandler {
    async fn execute(&self, args: &ToolArguments) -> Result<ToolOutput> {
        Ok(match DecompositionPayload::parse(&args.args) {
            Ok(payload) => ToolOutput::text(format!("Accepted {} subtasks", payload.subtasks.len())),
            Err(reason) => ToolOutput::error(reason),
        })
    }
}

/// The structural tool advertised during decomposition
pub fn decomposition_tool() -> BuiltinTool {
    BuiltinTool::new(
        DECOMPOSE_TOOL_NAME,
        "Split the task into 1-3 independent subtasks",
        json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "One or two sentences describing the plan"
                },
                "subtasks": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": MAX_SUBTASKS,
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": {"type": "string", "description": "Short title"},
                            "description": {"type": "string", "description": "Self-contained description"}
                        },
                        "required": ["title", "description"]
                    }
                }
            },
            "required": ["summary", "subtasks"]
        }),
        Arc::new(DecomposeTaskHandler),
    )
}

/// Ask `selector` to split `task` into subtasks.
///
/// Subtasks get generated ids, order indices `1..=n` and inherit `selector`.
pub async fn decompose(
    backend: &dyn ModelBackend,
    selector: &BackendSelector,
    task: &str,
    dispatch: ToolDispatchConfig,
) -> Result<Decomposition> {
    if task.trim().is_empty() {
        return Err(OrchestrationError::Other("Task must not be empty".to_string()));
    }
    if !backend.supports_tool_calls(selector) {
        return Err(OrchestrationError::CapabilityUnsupported { selector: selector.to_string() });
    }

    let registry = ToolDispatchRegistry::new(dispatch).with_builtin(decomposition_tool());
    let tools = registry.list_available();
    let messages = [ChatMessage::system(DECOMPOSITION_INSTRUCTIONS), ChatMessage::user(task)];
    let parameters = ModelParameters::default().require_tool(DECOMPOSE_TOOL_NAME);

    debug!(selector = %selector, "Requesting decomposition");
    let response = backend.call(selector, &messages, Some(tools.as_slice()), Some(parameters)).await?;

    let Some(first) = response.tool_calls.first() else {
        warn!(selector = %selector, "Decomposition response had no tool call");
        return Err(DecompositionError::NoToolCall { expected: DECOMPOSE_TOOL_NAME.to_string() }.into());
    };
    let Some(call) = response.tool_calls.iter().find(|c| c.name == DECOMPOSE_TOOL_NAME) else {
        warn!(selector = %selector, tool = %first.name, "Decomposition called the wrong tool");
        return Err(DecompositionError::WrongTool {
            expected: DECOMPOSE_TOOL_NAME.to_string(),
            actual: first.name.clone(),
        }
        .into());
    };

    let result = registry.execute_one(call).await;
    if result.is_error {
        warn!(selector = %selector, reason = %result.content, "Decomposition payload rejected");
        return Err(DecompositionError::InvalidPayload(result.content).into());
    }

    let payload =
        DecompositionPayload::parse(&call.arguments).map_err(DecompositionError::InvalidPayload)?;
    let subtasks: Vec<Subtask> = payload
        .subtasks
        .into_iter()
        .enumerate()
        .map(|(index, draft)| Subtask {
            id: Uuid::new_v4().to_string(),
            title: draft.title.trim().to_string(),
            description: draft.description.trim().to_string(),
            selector: selector.clone(),
            order_index: index + 1,
        })
        .collect();

    info!(selector = %selector, subtasks = subtasks.len(), "Task decomposed");
    Ok(Decomposition { summary: payload.summary, subtasks })
}
