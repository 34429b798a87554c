//! Integration tests for the run controller loop and its safety rails

mod common;

use async_trait::async_trait;
use common::{
    assert_gapless, call, controller, echo_tool, failing_tool, large_tool, registry, selector, tool_step, usage,
};
use conductor_abstraction::{ChatMessage, ModelResponse, Role};
use conductor_models::ScriptedBackend;
use conductor_orchestrator::error::Result;
use conductor_orchestrator::orchestration::engine::{RECITATION_MESSAGE_ID, SYSTEM_MESSAGE_ID};
use conductor_orchestrator::{
    ContextConfig, ContextExternalizer, ExternalInvocation, ExternalToolInfo, OrchestrationError, RunConfig,
    RunController, RunEvent, RunRequest, RunStatus, ToolDispatchConfig, ToolDispatchRegistry, ToolProvider,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_first_answer_completes_in_one_step() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(
        ScriptedBackend::new().with_responses(&sel, vec![ModelResponse::text("done").with_usage(usage(10, 5))]),
    );
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), RunConfig::default());

    let run = controller.execute(RunRequest::new("say done", sel)).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.steps.len(), 1);
    assert!(run.steps[0].is_final);
    assert_eq!(run.final_response(), Some("done"));
    assert_eq!(run.total_tokens(), 15);
    assert_eq!(run.steps[0].usage, Some(usage(10, 5)));
    assert!(run.error.is_none());
    assert_eq!(backend.recorded_calls()[0].tool_names, vec!["echo"]);
}

#[tokio::test]
async fn test_tool_results_feed_next_turn() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(ScriptedBackend::new().with_responses(
        &sel,
        vec![
            ModelResponse::tool_use("checking", vec![call("c1", "echo"), call("c2", "echo")]),
            ModelResponse::text("both echoed"),
        ],
    ));
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), RunConfig::default());

    let run = controller.execute(RunRequest::new("echo twice", sel)).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_gapless(&run);
    assert_eq!(run.steps[0].thinking, "checking");
    let ids: Vec<&str> = run.steps[0].tool_results.iter().map(|r| r.call_id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2"]);

    let second = &backend.recorded_calls()[1].messages;
    let assistant = second.iter().find(|m| m.role == Role::Assistant).unwrap();
    assert_eq!(assistant.tool_calls.len(), 2);
    let tool_turns: Vec<&ChatMessage> = second.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_turns.len(), 2);
    assert_eq!(tool_turns[0].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(tool_turns[0].content, "c1");
}

#[tokio::test]
async fn test_max_steps_bounds_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(ScriptedBackend::new().with_repeating(&sel, tool_step("c", "echo")));
    let config = RunConfig::default().with_max_steps(3);
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), config);

    let run = controller.execute(RunRequest::new("loop forever", sel)).await.unwrap();

    assert_eq!(run.status, RunStatus::MaxStepsReached);
    assert_eq!(run.steps.len(), 3);
    assert_gapless(&run);
    assert!(run.steps.iter().all(|s| !s.is_final));
    assert!(run.error.unwrap().contains("maximum steps (3)"));
    assert_eq!(backend.recorded_calls().len(), 3);
}

#[tokio::test]
async fn test_token_budget_stops_at_first_check_over_budget() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend =
        Arc::new(ScriptedBackend::new().with_repeating(&sel, tool_step("c", "echo").with_usage(usage(30, 10))));
    let config = RunConfig::default().with_max_steps(10).with_max_tokens(100);
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), config);

    let run = controller.execute(RunRequest::new("spend tokens", sel)).await.unwrap();

    assert_eq!(run.status, RunStatus::MaxStepsReached);
    assert_eq!(run.steps.len(), 3);
    assert_eq!(run.total_tokens(), 120);
    let before_last: u64 = run.steps[..2].iter().filter_map(|s| s.usage).map(|u| u.total()).sum();
    assert!(before_last < 100);
    assert!(run.error.unwrap().contains("Token budget exhausted"));

    // Cumulative usage never decreases across steps.
    let mut running = 0;
    for step in &run.steps {
        let next = running + step.usage.unwrap().total();
        assert!(next >= running);
        running = next;
    }
}

#[tokio::test]
async fn test_progress_recitation_from_second_step() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(ScriptedBackend::new().with_responses(
        &sel,
        vec![tool_step("c1", "echo"), tool_step("c2", "fails"), tool_step("c3", "echo"), ModelResponse::text("done")],
    ));
    let tools = registry(vec![echo_tool(), failing_tool("permission denied")]);
    let controller = controller(&backend, tools, dir.path(), RunConfig::default());

    let run = controller.execute(RunRequest::new("work", sel)).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.steps.len(), 4);

    let calls = backend.recorded_calls();
    let recitations = |i: usize| -> Vec<ChatMessage> {
        calls[i].messages.iter().filter(|m| m.id.as_deref() == Some(RECITATION_MESSAGE_ID)).cloned().collect()
    };

    assert!(recitations(0).is_empty());
    assert!(recitations(1).is_empty());

    let third = recitations(2);
    assert_eq!(third.len(), 1);
    assert!(third[0].content.contains("Step 1: echo\n"));
    assert!(third[0].content.contains("Step 2: fails [ERROR]"));
    assert!(third[0].content.contains("Steps remaining: 3 of 5"));

    let fourth = recitations(3);
    assert_eq!(fourth.len(), 1, "recitation is replaced, not accumulated");
    assert!(fourth[0].content.contains("Step 3: echo"));
    assert!(fourth[0].content.contains("Steps remaining: 2 of 5"));
}

#[tokio::test]
async fn test_progress_recitation_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(ScriptedBackend::new().with_repeating(&sel, tool_step("c", "echo")));
    let config = RunConfig::default().with_max_steps(4).with_progress_recitation(false);
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), config);

    controller.execute(RunRequest::new("work", sel)).await.unwrap();

    assert!(backend
        .recorded_calls()
        .iter()
        .flat_map(|c| c.messages.iter())
        .all(|m| m.id.as_deref() != Some(RECITATION_MESSAGE_ID)));
}

fn long_error() -> String {
    format!("{}\ndiagnostic: stack frame at parser.rs:42", "E".repeat(800))
}

#[tokio::test]
async fn test_full_error_reaches_next_turn() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(
        ScriptedBackend::new().with_responses(&sel, vec![tool_step("c1", "fails"), ModelResponse::text("recovered")]),
    );
    let controller = controller(&backend, registry(vec![failing_tool(long_error())]), dir.path(), RunConfig::default());

    controller.execute(RunRequest::new("try it", sel)).await.unwrap();

    let second = &backend.recorded_calls()[1].messages;
    let tool_turn = second.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_turn.is_error);
    assert_eq!(tool_turn.content, long_error());
}

#[tokio::test]
async fn test_truncated_error_when_preservation_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(
        ScriptedBackend::new().with_responses(&sel, vec![tool_step("c1", "fails"), ModelResponse::text("recovered")]),
    );
    let config = RunConfig::default().with_preserve_full_errors(false);
    let controller = controller(&backend, registry(vec![failing_tool(long_error())]), dir.path(), config);

    let run = controller.execute(RunRequest::new("try it", sel)).await.unwrap();

    let second = &backend.recorded_calls()[1].messages;
    let tool_turn = second.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_turn.content.ends_with("... [truncated]"));
    assert_eq!(tool_turn.content.chars().count(), 500 + "... [truncated]".len());
    assert!(!tool_turn.content.contains("parser.rs:42"));

    // The recorded step keeps the full error.
    assert_eq!(run.steps[0].tool_results[0].content, long_error());
}

#[tokio::test]
async fn test_large_results_are_externalized_and_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let original: String = (0..200).map(|i| format!("row {i:04} of the report\n")).collect();
    let backend = Arc::new(
        ScriptedBackend::new().with_responses(&sel, vec![tool_step("c1", "dump"), ModelResponse::text("summarized")]),
    );
    let context = Arc::new(ContextExternalizer::new(ContextConfig::default().with_storage_root(dir.path())));
    let controller =
        RunController::new(backend.clone(), registry(vec![large_tool(original.clone())]), context.clone(), RunConfig::default());

    // Read the externalized file back while the run is still alive.
    let read_back = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&read_back);
    controller.subscribe(move |event| {
        if let RunEvent::StepComplete { step, .. } = event {
            if let Some(result) = step.tool_results.first() {
                let location = result.content.lines().find_map(|l| l.strip_prefix("Location: ")).map(str::to_string);
                if let Some(location) = location {
                    *sink.lock().unwrap() = std::fs::read_to_string(location).ok();
                }
            }
        }
    });

    let run = controller.execute(RunRequest::new("dump it", sel).with_run_id("run-ext")).await.unwrap();

    let reference = &run.steps[0].tool_results[0].content;
    assert!(reference.starts_with("[Tool output externalized]"));
    assert!(reference.contains(&format!("{} bytes", original.len())));
    assert_eq!(read_back.lock().unwrap().as_deref(), Some(original.as_str()));

    let second = &backend.recorded_calls()[1].messages;
    let tool_turn = second.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(&tool_turn.content, reference);

    assert!(context.tracked_paths("run-ext").is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_cancelled_before_start_records_no_steps() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(ScriptedBackend::new().with_repeating(&sel, ModelResponse::text("never")));
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), RunConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    let run = controller.execute(RunRequest::new("task", sel).with_cancellation(token)).await.unwrap();

    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.steps.is_empty());
    assert!(backend.recorded_calls().is_empty());
    assert!(controller.active_runs().is_empty());
}

#[tokio::test]
async fn test_cancel_by_run_id_during_backend_call() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("slow");
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_repeating(&sel, tool_step("c", "echo"))
            .with_latency(&sel, Duration::from_millis(200)),
    );
    let controller = Arc::new(controller(&backend, registry(vec![echo_tool()]), dir.path(), RunConfig::default()));

    let running = Arc::clone(&controller);
    let handle = tokio::spawn(async move { running.execute(RunRequest::new("task", sel).with_run_id("run-1")).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.active_runs(), vec!["run-1".to_string()]);
    assert!(controller.cancel("run-1"));

    let run = handle.await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.error.as_deref(), Some("Run cancelled"));
    assert!(run.steps.is_empty());
    assert!(controller.active_runs().is_empty());
    assert!(!controller.cancel("run-1"));
}

#[tokio::test]
async fn test_run_timeout_behaves_like_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("slow");
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_repeating(&sel, tool_step("c", "echo"))
            .with_latency(&sel, Duration::from_millis(1_300)),
    );
    let config = RunConfig::default().with_run_timeout(Duration::from_secs(1));
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), config);

    let run = controller.execute(RunRequest::new("task", sel)).await.unwrap();

    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.error.unwrap().contains("timeout"));
}

#[tokio::test]
async fn test_backend_failure_marks_run_failed() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("down");
    let backend = Arc::new(ScriptedBackend::new().failing(&sel));
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), RunConfig::default());

    let run = controller.execute(RunRequest::new("task", sel)).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("unavailable"));
    assert!(run.steps.is_empty());
}

#[tokio::test]
async fn test_precondition_errors_fail_fast() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("plain");
    let backend = Arc::new(ScriptedBackend::new().without_tool_support(&sel));

    let with_tools = controller(&backend, registry(vec![echo_tool()]), dir.path(), RunConfig::default());
    assert!(matches!(
        with_tools.execute(RunRequest::new("task", sel.clone())).await,
        Err(OrchestrationError::CapabilityUnsupported { .. })
    ));

    let capable = selector("capable");
    let no_tools = controller(&backend, registry(vec![]), dir.path(), RunConfig::default());
    assert!(matches!(
        no_tools.execute(RunRequest::new("task", capable.clone())).await,
        Err(OrchestrationError::NoToolsAvailable)
    ));

    assert!(with_tools.execute(RunRequest::new("   ", capable)).await.is_err());
    assert!(backend.recorded_calls().is_empty());
}

#[tokio::test]
async fn test_tool_less_run_when_tools_optional() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(ScriptedBackend::new().with_responses(&sel, vec![ModelResponse::text("plain answer")]));
    let config = RunConfig::default().with_require_tools(false);
    let controller = controller(&backend, registry(vec![]), dir.path(), config);

    let run = controller.execute(RunRequest::new("answer directly", sel)).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(backend.recorded_calls()[0].tool_names.is_empty());
}

#[tokio::test]
async fn test_system_instructions_keep_stable_slot() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(
        ScriptedBackend::new().with_responses(&sel, vec![tool_step("c1", "echo"), ModelResponse::text("done")]),
    );
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), RunConfig::default());

    let request = RunRequest::new("continue", sel)
        .with_prior_messages(vec![ChatMessage::system("stale"), ChatMessage::user("earlier question")])
        .with_system_instructions("be precise");
    controller.execute(request).await.unwrap();

    for recorded in backend.recorded_calls() {
        let first = &recorded.messages[0];
        assert_eq!(first.id.as_deref(), Some(SYSTEM_MESSAGE_ID));
        assert_eq!(first.content, "be precise");
        assert_eq!(recorded.messages.iter().filter(|m| m.role == Role::System).count(), 1);
        assert_eq!(recorded.messages[1].content, "earlier question");
        assert_eq!(recorded.messages[2].content, "continue");
    }
}

#[tokio::test]
async fn test_events_in_order_despite_panicking_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(
        ScriptedBackend::new().with_responses(&sel, vec![tool_step("c1", "echo"), ModelResponse::text("done")]),
    );
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), RunConfig::default());

    controller.subscribe(|_| panic!("subscriber bug"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    controller.subscribe(move |event| {
        let label = match event {
            RunEvent::StepStarting { step_number, .. } => format!("start {step_number}"),
            RunEvent::StepComplete { step, .. } => format!("complete {}", step.step_number),
            RunEvent::RunComplete { run, .. } => format!("run {}", run.status),
        };
        sink.lock().unwrap().push(label);
    });

    let run = controller.execute(RunRequest::new("task", sel)).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["start 1", "complete 1", "start 2", "complete 2", "run completed"]
    );
}

#[tokio::test]
async fn test_cost_estimate_accumulates() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_responses(
                &sel,
                vec![
                    tool_step("c1", "echo").with_usage(usage(60, 40)),
                    ModelResponse::text("done").with_usage(usage(50, 50)),
                ],
            )
            .with_cost_per_token(0.001),
    );
    let controller = controller(&backend, registry(vec![echo_tool()]), dir.path(), RunConfig::default());

    let run = controller.execute(RunRequest::new("task", sel)).await.unwrap();

    assert_eq!(run.total_tokens(), 200);
    assert!((run.cost_estimate - 0.2).abs() < 1e-9);
}

struct WebProvider;

#[async_trait]
impl ToolProvider for WebProvider {
    async fn list_external_tools(&self) -> Result<Vec<ExternalToolInfo>> {
        Ok(vec![ExternalToolInfo {
            provider_id: "web".into(),
            tool_name: "echo".into(),
            description: None,
            input_schema: Value::Null,
        }])
    }

    async fn invoke(&self, provider_id: &str, tool_name: &str, _args: Value) -> Result<ExternalInvocation> {
        Ok(ExternalInvocation::Output(json!({ "provider": provider_id, "tool": tool_name })))
    }
}

#[tokio::test]
async fn test_external_tools_are_refreshed_and_routed() {
    let dir = tempfile::tempdir().unwrap();
    let sel = selector("m");
    let backend = Arc::new(
        ScriptedBackend::new().with_responses(&sel, vec![tool_step("c1", "web__echo"), ModelResponse::text("done")]),
    );
    let tools = Arc::new(
        ToolDispatchRegistry::new(ToolDispatchConfig::default())
            .with_builtin(echo_tool())
            .with_provider(Arc::new(WebProvider)),
    );
    let controller = controller(&backend, tools, dir.path(), RunConfig::default());

    let run = controller.execute(RunRequest::new("task", sel)).await.unwrap();

    assert_eq!(backend.recorded_calls()[0].tool_names, vec!["echo", "web__echo"]);
    let result = &run.steps[0].tool_results[0];
    assert!(!result.is_error);
    let payload: Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(payload, json!({ "provider": "web", "tool": "echo" }));
}
