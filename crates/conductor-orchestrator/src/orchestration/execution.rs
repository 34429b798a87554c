// Tool execution with per-call timeouts and concurrent fan-out
//
// Every call produces exactly one `ToolResult`. Unknown tools, handler errors,
// provider-reported errors, timeouts and panics all become error results so a
// failing call can never take down its siblings or the run.

use tokio::time::timeout;
use tracing::{debug, warn};

use super::tool::{stringify_payload, ToolArguments, ToolCall, ToolResult};
use super::tool_registry::{ExternalInvocation, ResolvedTool, ToolSnapshot};

/// Execute one call: resolve, race against the per-call timeout, cap the size.
pub async fn execute_tool_call(snapshot: &ToolSnapshot, call: &ToolCall) -> ToolResult {
    let timeout_duration = snapshot.config().timeout();

    match timeout(timeout_duration, dispatch(snapshot, call)).await {
        Ok(result) if result.is_error => result,
        Ok(result) => cap_result(result, snapshot.config().max_result_chars),
        Err(_) => {
            warn!(tool = %call.name, timeout = ?timeout_duration, "Tool call timed out");
            ToolResult::error(
                &call.id,
                format!("Tool '{}' execution timed out after {:?}", call.name, timeout_duration),
            )
        }
    }
}

/// Execute calls concurrently. Results are returned in input order.
///
/// Each call runs on its own task, so a panicking handler only fails its own call.
pub async fn execute_tool_calls(snapshot: &ToolSnapshot, calls: &[ToolCall]) -> Vec<ToolResult> {
    if calls.is_empty() {
        return vec![];
    }

    let handles: Vec<_> = calls
        .iter()
        .map(|call| {
            let snapshot = snapshot.clone();
            let call = call.clone();
            tokio::spawn(async move { execute_tool_call(&snapshot, &call).await })
        })
        .collect();

    let joined = futures::future::join_all(handles).await;
    joined
        .into_iter()
        .zip(calls)
        .map(|(outcome, call)| {
            outcome.unwrap_or_else(|e| {
                warn!(tool = %call.name, error = %e, "Tool task join error");
                ToolResult::error(&call.id, format!("Tool '{}' did not complete: {}", call.name, e))
            })
        })
        .collect()
}

async fn dispatch(snapshot: &ToolSnapshot, call: &ToolCall) -> ToolResult {
    match snapshot.resolve(&call.name) {
        Some(ResolvedTool::Builtin(tool)) => {
            debug!(tool = %call.name, call_id = %call.id, "Executing built-in tool");
            let args = ToolArguments::new(call.arguments.clone());
            match tool.handler.execute(&args).await {
                Ok(output) => ToolResult::from_output(&call.id, output),
                Err(e) => ToolResult::error(
                    &call.id,
                    format!("Tool '{}' execution failed: {}", call.name, e),
                ),
            }
        }
        Some(ResolvedTool::External(route)) => {
            let Some(provider) = snapshot.provider() else {
                return ToolResult::error(
                    &call.id,
                    format!("Tool '{}' has no provider attached", call.name),
                );
            };
            debug!(
                tool = %call.name,
                provider = %route.provider_id,
                call_id = %call.id,
                "Executing external tool"
            );
            match provider.invoke(&route.provider_id, &route.tool_name, call.arguments.clone()).await {
                Ok(ExternalInvocation::Output(value)) => {
                    ToolResult::success(&call.id, stringify_payload(&value))
                }
                Ok(ExternalInvocation::Error(message)) => ToolResult::error(&call.id, message),
                Err(e) => ToolResult::error(
                    &call.id,
                    format!("Tool '{}' execution failed: {}", call.name, e),
                ),
            }
        }
        None => {
            let available = snapshot.names();
            ToolResult::error(
                &call.id,
                format!(
                    "Tool '{}' not found.\n\nAvailable tools ({}): {}",
                    call.name,
                    available.len(),
                    available.join(", ")
                ),
            )
        }
    }
}

fn cap_result(mut result: ToolResult, max_chars: usize) -> ToolResult {
    let (truncated, dropped) = truncate_chars(&result.content, max_chars);
    if dropped > 0 {
        result.content = format!("{truncated}\n\n[... output truncated, {dropped} characters omitted]");
    }
    result
}

/// Keep at most `max_chars` characters. Returns the kept prefix and how many were dropped.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> (&str, usize) {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => (&text[..byte_index], text[byte_index..].chars().count()),
        None => (text, 0),
    }
}
