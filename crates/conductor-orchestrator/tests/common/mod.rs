//! Shared test utilities for conductor-orchestrator integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use conductor_abstraction::{BackendSelector, ModelResponse, TokenUsage};
use conductor_models::ScriptedBackend;
use conductor_orchestrator::error::Result;
use conductor_orchestrator::orchestration::tool::object_schema;
use conductor_orchestrator::{
    BuiltinTool, ContextConfig, ContextExternalizer, Run, RunConfig, RunController, ToolArguments, ToolCall,
    ToolDispatchConfig, ToolDispatchRegistry, ToolHandler, ToolOutput,
};
use std::path::Path;
use std::sync::Arc;

/// Selector for the mock provider.
pub fn selector(model: &str) -> BackendSelector {
    BackendSelector::new("mock", model)
}

pub fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage::new(input, output)
}

pub fn call(id: &str, name: &str) -> ToolCall {
    ToolCall::new(id, name, serde_json::json!({ "text": id }))
}

/// A response requesting one call of `tool`.
pub fn tool_step(id: &str, tool: &str) -> ModelResponse {
    ModelResponse::tool_use(format!("calling {tool}"), vec![call(id, tool)])
}

struct EchoHandler;

#[async_trait]
impl ToolHandler for EchoHandler {
    async fn execute(&self, args: &ToolArguments) -> Result<ToolOutput> {
        Ok(ToolOutput::text(args.get_string("text").unwrap_or_else(|| "ok".to_string())))
    }
}

struct ErrorHandler {
    message: String,
}

#[async_trait]
impl ToolHandler for ErrorHandler {
    async fn execute(&self, _args: &ToolArguments) -> Result<ToolOutput> {
        Ok(ToolOutput::error(self.message.clone()))
    }
}

struct LargeOutputHandler {
    content: String,
}

#[async_trait]
impl ToolHandler for LargeOutputHandler {
    async fn execute(&self, _args: &ToolArguments) -> Result<ToolOutput> {
        Ok(ToolOutput::text(self.content.clone()))
    }
}

fn text_schema() -> serde_json::Value {
    object_schema(&[("text", "string", "Text to echo", false)])
}

/// Echoes its `text` argument.
pub fn echo_tool() -> BuiltinTool {
    BuiltinTool::new("echo", "Echo the input", text_schema(), Arc::new(EchoHandler))
}

/// Always reports `message` as a tool error.
pub fn failing_tool(message: impl Into<String>) -> BuiltinTool {
    BuiltinTool::new("fails", "Always fails", text_schema(), Arc::new(ErrorHandler { message: message.into() }))
}

/// Returns `content` verbatim.
pub fn large_tool(content: impl Into<String>) -> BuiltinTool {
    BuiltinTool::new("dump", "Dump a lot of text", text_schema(), Arc::new(LargeOutputHandler { content: content.into() }))
}

pub fn registry(tools: Vec<BuiltinTool>) -> Arc<ToolDispatchRegistry> {
    let registry = tools
        .into_iter()
        .fold(ToolDispatchRegistry::new(ToolDispatchConfig::default()), ToolDispatchRegistry::with_builtin);
    Arc::new(registry)
}

pub fn externalizer(root: &Path) -> Arc<ContextExternalizer> {
    Arc::new(ContextExternalizer::new(ContextConfig::default().with_storage_root(root)))
}

pub fn controller(
    backend: &Arc<ScriptedBackend>,
    tools: Arc<ToolDispatchRegistry>,
    root: &Path,
    config: RunConfig,
) -> RunController {
    RunController::new(backend.clone(), tools, externalizer(root), config)
}

/// Step numbers are exactly 1..=n.
pub fn assert_gapless(run: &Run) {
    let numbers: Vec<usize> = run.steps.iter().map(|s| s.step_number).collect();
    let expected: Vec<usize> = (1..=run.steps.len()).collect();
    assert_eq!(numbers, expected, "step numbers must be gapless");
}
