// Orchestration module - bounded agent runs and their fan-out
//
// Leaves first: tool dispatch and context externalization, then the run
// controller, then the decomposition orchestrator and comparison coordinator
// that each drive many isolated run controllers.

pub mod aggregator;
pub mod comparison;
pub mod config;
pub mod context;
pub mod decomposition;
pub mod engine;
pub mod events;
pub mod execution;
pub mod fanout;
pub mod run;
mod scheduling;
pub mod tool;
pub mod tool_registry;

pub use aggregator::AggregateStatus;
pub use comparison::{ComparisonCoordinator, ComparisonSession, ComparisonSlot, SlotResult};
pub use config::{ConductorConfig, ContextConfig, FanOutConfig, RunConfig, ToolDispatchConfig};
pub use context::ContextExternalizer;
pub use decomposition::{decompose, Decomposition, Subtask, DECOMPOSE_TOOL_NAME};
pub use engine::{RunController, RunRequest};
pub use events::{EventBus, RunEvent, SubscriptionId, TaggedRunEvent};
pub use fanout::{Session, SessionPhase, SubtaskResult, TaskOrchestrator};
pub use run::{Run, RunOutcome, RunStatus, Step};
pub use tool::{BuiltinTool, ToolArguments, ToolCall, ToolDefinition, ToolHandler, ToolOutput, ToolResult};
pub use tool_registry::{ExternalInvocation, ExternalToolInfo, ToolDispatchRegistry, ToolProvider, ToolSnapshot};
