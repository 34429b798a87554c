//! Agent orchestration core for Conductor.
//!
//! Drives bounded reason-then-act runs against a tool-capable model backend,
//! dispatches tool calls across built-in and external providers, keeps run
//! context small by externalizing large tool output, and fans a task out into
//! concurrent runs whose results are merged.

pub mod error;
pub mod orchestration;

pub use error::{DecompositionError, OrchestrationError, Result};
pub use orchestration::{
    decompose, AggregateStatus, BuiltinTool, ComparisonCoordinator, ComparisonSession, ComparisonSlot, ConductorConfig,
    ContextConfig, ContextExternalizer, Decomposition, EventBus, ExternalInvocation, ExternalToolInfo,
    FanOutConfig, Run, RunConfig, RunController, RunEvent, RunOutcome, RunRequest, RunStatus, Session,
    SessionPhase, SlotResult, Step, Subtask, SubtaskResult, SubscriptionId, TaggedRunEvent, TaskOrchestrator,
    ToolArguments, ToolCall, ToolDefinition, ToolDispatchConfig, ToolDispatchRegistry, ToolHandler, ToolOutput,
    ToolProvider, ToolResult, ToolSnapshot, DECOMPOSE_TOOL_NAME,
};
