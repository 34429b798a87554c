//! Integration tests for task decomposition, fan-out execution and synthesis

mod common;

use common::{echo_tool, externalizer, registry, selector};
use conductor_abstraction::{BackendSelector, ModelResponse, ToolChoice};
use conductor_models::ScriptedBackend;
use conductor_orchestrator::{
    decompose, AggregateStatus, ConductorConfig, DecompositionError, FanOutConfig, OrchestrationError, RunEvent,
    RunStatus, SessionPhase, TaskOrchestrator, ToolCall, ToolDispatchConfig, DECOMPOSE_TOOL_NAME,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn decomposition(subtasks: &[(&str, &str)]) -> ModelResponse {
    let items: Vec<Value> = subtasks.iter().map(|(t, d)| json!({ "title": t, "description": d })).collect();
    ModelResponse::tool_use(
        "",
        vec![ToolCall::new("d1", DECOMPOSE_TOOL_NAME, json!({ "summary": "plan", "subtasks": items }))],
    )
}

fn three_parts() -> ModelResponse {
    decomposition(&[
        ("Research", "Collect the facts"),
        ("Draft", "Write the draft"),
        ("Review", "Check the draft"),
    ])
}

fn config(max_sessions: usize) -> ConductorConfig {
    ConductorConfig::default().with_fan_out(
        FanOutConfig::default()
            .with_max_concurrent_sessions(max_sessions)
            .with_stagger(Duration::from_millis(10)),
    )
}

fn orchestrator(backend: &Arc<ScriptedBackend>, root: &Path, config: ConductorConfig) -> TaskOrchestrator {
    TaskOrchestrator::new(backend.clone(), registry(vec![echo_tool()]), externalizer(root), config)
}

#[tokio::test]
async fn test_decomposition_produces_ordered_subtasks() {
    let planner = selector("planner");
    let backend = ScriptedBackend::new().with_responses(&planner, vec![three_parts()]);

    let result = decompose(&backend, &planner, "Write a report", ToolDispatchConfig::default()).await.unwrap();

    assert_eq!(result.summary, "plan");
    assert_eq!(result.subtasks.len(), 3);
    let indices: Vec<usize> = result.subtasks.iter().map(|s| s.order_index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
    assert_eq!(result.subtasks[1].title, "Draft");
    assert!(result.subtasks.iter().all(|s| s.selector == planner && !s.description.is_empty()));
    let ids: HashSet<&str> = result.subtasks.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids.len(), 3);

    let recorded = &backend.recorded_calls()[0];
    assert_eq!(recorded.tool_names, vec![DECOMPOSE_TOOL_NAME]);
    assert_eq!(
        recorded.parameters.as_ref().and_then(|p| p.tool_choice.clone()),
        Some(ToolChoice::Required(DECOMPOSE_TOOL_NAME.to_string()))
    );
}

#[tokio::test]
async fn test_decomposition_without_tool_call_is_rejected() {
    let planner = selector("planner");
    let backend = ScriptedBackend::new().with_responses(&planner, vec![ModelResponse::text("three steps")]);

    let err = decompose(&backend, &planner, "task", ToolDispatchConfig::default()).await.unwrap_err();

    assert!(matches!(
        err,
        OrchestrationError::Decomposition(DecompositionError::NoToolCall { .. })
    ));
}

#[tokio::test]
async fn test_decomposition_with_wrong_tool_is_rejected() {
    let planner = selector("planner");
    let wrong = ModelResponse::tool_use("", vec![ToolCall::new("x", "search", json!({}))]);
    let backend = ScriptedBackend::new().with_responses(&planner, vec![wrong]);

    let err = decompose(&backend, &planner, "task", ToolDispatchConfig::default()).await.unwrap_err();

    match err {
        OrchestrationError::Decomposition(DecompositionError::WrongTool { actual, .. }) => {
            assert_eq!(actual, "search");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_decomposition_with_too_many_subtasks_is_rejected() {
    let planner = selector("planner");
    let four = decomposition(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
    let backend = ScriptedBackend::new().with_responses(&planner, vec![four]);

    let err = decompose(&backend, &planner, "task", ToolDispatchConfig::default()).await.unwrap_err();

    match err {
        OrchestrationError::Decomposition(DecompositionError::InvalidPayload(reason)) => {
            assert!(reason.contains("got 4"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_one_failing_backend_yields_partial_session() {
    let dir = tempfile::tempdir().unwrap();
    let (planner, fast, good, broken) = (selector("planner"), selector("a"), selector("b"), selector("broken"));
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_responses(&planner, vec![three_parts()])
            .with_repeating(&fast, ModelResponse::text("facts collected"))
            .with_repeating(&good, ModelResponse::text("draft written"))
            .failing(&broken)
            .with_plain_response("integrated report"),
    );
    let orchestrator = orchestrator(&backend, dir.path(), config(2));

    let session = orchestrator.decompose("Write a report", planner.clone()).await.unwrap();
    assert_eq!(session.phase, SessionPhase::AwaitingConfiguration);
    let ids: Vec<String> = session.subtasks.iter().map(|s| s.id.clone()).collect();
    orchestrator.set_subtask_selector(&session.id, &ids[0], fast).unwrap();
    orchestrator.set_subtask_selector(&session.id, &ids[1], good).unwrap();
    orchestrator.set_subtask_selector(&session.id, &ids[2], broken).unwrap();

    let done = orchestrator.execute(&session.id).await.unwrap();

    assert_eq!(done.phase, SessionPhase::Done);
    assert_eq!(done.status, Some(AggregateStatus::Partial));
    assert_eq!(done.result_for(&ids[0]).unwrap().outcome.status, RunStatus::Completed);
    assert_eq!(done.result_for(&ids[1]).unwrap().outcome.status, RunStatus::Completed);
    assert_eq!(done.result_for(&ids[2]).unwrap().outcome.status, RunStatus::Failed);
    assert_eq!(done.synthesis.as_deref(), Some("integrated report"));

    let synthesis_call = backend.recorded_calls().into_iter().find(|c| c.plain).unwrap();
    assert_eq!(synthesis_call.selector, planner);
    let prompt = &synthesis_call.messages.last().unwrap().content;
    assert!(prompt.contains("facts collected"));
    assert!(prompt.contains("Status: failed"));
    assert!(prompt.contains("MISSING"));

    assert!(orchestrator.active_sessions().is_empty());
    assert!(orchestrator.session(&session.id).is_none());
}

#[tokio::test]
async fn test_subtask_prompt_is_fenced() {
    let dir = tempfile::tempdir().unwrap();
    let planner = selector("planner");
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_responses(&planner, vec![decomposition(&[("Only part", "Do the thing")])])
            .with_repeating(&planner, ModelResponse::text("done"))
            .with_plain_response("final"),
    );
    let orchestrator = orchestrator(&backend, dir.path(), config(2));

    let done = orchestrator.decompose_and_execute("Master task", planner.clone()).await.unwrap();

    assert_eq!(done.status, Some(AggregateStatus::Completed));
    let subtask_call = &backend.calls_for(&planner)[1];
    let prompt = &subtask_call.messages.last().unwrap().content;
    assert!(prompt.starts_with("=== SUBTASK ===\nTitle: Only part\nDescription: Do the thing\n=== END SUBTASK ==="));
}

#[tokio::test]
async fn test_all_subtasks_failing_skips_synthesis() {
    let dir = tempfile::tempdir().unwrap();
    let (planner, broken) = (selector("planner"), selector("broken"));
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_responses(&planner, vec![decomposition(&[("a", "1"), ("b", "2")])])
            .failing(&broken),
    );
    let orchestrator = orchestrator(&backend, dir.path(), config(2));

    let session = orchestrator.decompose("task", planner).await.unwrap();
    for subtask in &session.subtasks {
        orchestrator.set_subtask_selector(&session.id, &subtask.id, broken.clone()).unwrap();
    }
    let done = orchestrator.execute(&session.id).await.unwrap();

    assert_eq!(done.status, Some(AggregateStatus::Failed));
    assert!(done.synthesis.is_none());
    assert!(done.synthesis_error.is_some());
    assert!(backend.recorded_calls().iter().all(|c| !c.plain));
}

#[tokio::test]
async fn test_synthesis_failure_downgrades_to_partial() {
    let dir = tempfile::tempdir().unwrap();
    let planner = selector("planner");
    // No plain response scripted, so the synthesis call fails.
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_responses(&planner, vec![decomposition(&[("a", "1")])])
            .with_repeating(&planner, ModelResponse::text("done")),
    );
    let orchestrator = orchestrator(&backend, dir.path(), config(2));

    let done = orchestrator.decompose_and_execute("task", planner).await.unwrap();

    assert_eq!(done.results[0].outcome.status, RunStatus::Completed);
    assert_eq!(done.status, Some(AggregateStatus::Partial));
    assert!(done.synthesis_error.is_some());
}

#[tokio::test]
async fn test_configuration_errors() {
    let dir = tempfile::tempdir().unwrap();
    let planner = selector("planner");
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_responses(&planner, vec![decomposition(&[("a", "1")])])
            .with_repeating(&planner, ModelResponse::text("done"))
            .with_plain_response("final"),
    );
    let orchestrator = orchestrator(&backend, dir.path(), config(2));
    let session = orchestrator.decompose("task", planner.clone()).await.unwrap();

    assert!(matches!(
        orchestrator.set_subtask_selector("missing", &session.subtasks[0].id, planner.clone()),
        Err(OrchestrationError::SessionNotFound(_))
    ));
    assert!(matches!(
        orchestrator.set_subtask_selector(&session.id, "missing", planner.clone()),
        Err(OrchestrationError::SubtaskNotFound(_))
    ));

    orchestrator.execute(&session.id).await.unwrap();

    // Selectors are frozen once execution has started.
    assert!(matches!(
        orchestrator.set_subtask_selector(&session.id, &session.subtasks[0].id, planner),
        Err(OrchestrationError::SessionNotFound(_))
    ));
    assert!(matches!(
        orchestrator.execute(&session.id).await,
        Err(OrchestrationError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_session_limit_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let (planner, slow) = (selector("planner"), selector("slow"));
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_responses(&planner, vec![decomposition(&[("a", "1")]), decomposition(&[("b", "2")])])
            .with_repeating(&planner, ModelResponse::text("quick"))
            .with_repeating(&slow, ModelResponse::text("slow"))
            .with_latency(&slow, Duration::from_millis(300))
            .with_plain_response("first")
            .with_plain_response("second"),
    );
    let orchestrator = Arc::new(orchestrator(&backend, dir.path(), config(1)));

    let first = orchestrator.decompose("first", planner.clone()).await.unwrap();
    orchestrator.set_subtask_selector(&first.id, &first.subtasks[0].id, slow).unwrap();
    let second = orchestrator.decompose("second", planner).await.unwrap();

    let running = Arc::clone(&orchestrator);
    let first_id = first.id.clone();
    let handle = tokio::spawn(async move { running.execute(&first_id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(orchestrator.active_sessions(), vec![first.id.clone()]);
    assert!(matches!(
        orchestrator.execute(&second.id).await,
        Err(OrchestrationError::SessionLimitReached { limit: 1 })
    ));
    assert!(orchestrator.session(&second.id).is_some(), "rejected session stays pending");

    handle.await.unwrap().unwrap();
    let done = orchestrator.execute(&second.id).await.unwrap();
    assert_eq!(done.status, Some(AggregateStatus::Completed));
}

#[tokio::test]
async fn test_cancel_session_fires_every_subtask() {
    let dir = tempfile::tempdir().unwrap();
    let (planner, slow) = (selector("planner"), selector("slow"));
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_responses(&planner, vec![decomposition(&[("a", "1"), ("b", "2"), ("c", "3")])])
            .with_repeating(&slow, common::tool_step("c", "echo"))
            .with_latency(&slow, Duration::from_millis(200)),
    );
    let orchestrator = Arc::new(orchestrator(&backend, dir.path(), config(2)));

    let session = orchestrator.decompose("task", planner).await.unwrap();
    for subtask in &session.subtasks {
        orchestrator.set_subtask_selector(&session.id, &subtask.id, slow.clone()).unwrap();
    }

    let running = Arc::clone(&orchestrator);
    let id = session.id.clone();
    let handle = tokio::spawn(async move { running.execute(&id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(orchestrator.cancel_session(&session.id));
    assert!(orchestrator.active_sessions().is_empty());

    let done = handle.await.unwrap().unwrap();
    assert!(done.results.iter().all(|r| r.outcome.status == RunStatus::Cancelled));
    assert_eq!(done.status, Some(AggregateStatus::Failed));
    assert!(done.synthesis.is_none());
}

#[tokio::test]
async fn test_events_are_tagged_with_subtask_id() {
    let dir = tempfile::tempdir().unwrap();
    let planner = selector("planner");
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_responses(&planner, vec![decomposition(&[("a", "1"), ("b", "2")])])
            .with_repeating(&planner, ModelResponse::text("done"))
            .with_plain_response("final"),
    );
    let orchestrator = orchestrator(&backend, dir.path(), config(2));

    let completed = Arc::new(Mutex::new(HashSet::new()));
    let sink = Arc::clone(&completed);
    orchestrator.subscribe(move |tagged| {
        if matches!(tagged.event, RunEvent::RunComplete { .. }) {
            sink.lock().unwrap().insert(tagged.source_id.clone());
        }
    });

    let done = orchestrator.decompose_and_execute("task", planner).await.unwrap();

    let expected: HashSet<String> = done.subtasks.iter().map(|s| s.id.clone()).collect();
    assert_eq!(*completed.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_unsupported_decomposition_backend() {
    let dir = tempfile::tempdir().unwrap();
    let plain = BackendSelector::new("mock", "plain");
    let backend = Arc::new(ScriptedBackend::new().without_tool_support(&plain));
    let orchestrator = orchestrator(&backend, dir.path(), config(2));

    assert!(matches!(
        orchestrator.decompose("task", plain).await,
        Err(OrchestrationError::CapabilityUnsupported { .. })
    ));
}

#[tokio::test]
async fn test_dropped_execute_cancels_subtask_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (planner, slow) = (selector("planner"), selector("slow"));
    let backend = Arc::new(
        ScriptedBackend::new()
            .with_responses(&planner, vec![decomposition(&[("a", "1"), ("b", "2")])])
            .with_repeating(&slow, common::tool_step("c", "echo"))
            .with_latency(&slow, Duration::from_millis(100)),
    );
    let orchestrator = orchestrator(&backend, dir.path(), config(2));

    let session = orchestrator.decompose("task", planner.clone()).await.unwrap();
    for subtask in &session.subtasks {
        orchestrator.set_subtask_selector(&session.id, &subtask.id, slow.clone()).unwrap();
    }

    let abandoned = tokio::time::timeout(Duration::from_millis(50), orchestrator.execute(&session.id)).await;
    assert!(abandoned.is_err());
    assert!(orchestrator.active_sessions().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let settled = backend.calls_for(&slow).len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.calls_for(&slow).len(), settled);
    assert_eq!(settled, 2);
}
