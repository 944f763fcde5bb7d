use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use tessera_agent::{Edge, Node, TokenCounter, WorkflowDefinition, WorkflowEngine, WorkflowGraph};
use tessera_core::config::AppConfig;
use tessera_core::error::TesseraError;
use tessera_core::event::FailureCause;
use tessera_core::types::RunStatus;
use tessera_store::MemoryStore;
use tessera_test_utils::{EchoTool, FailingTool, GatedTool, ScriptedLlm};
use tessera_tools::{FunctionRegistry, ToolRegistry};

struct Fixture {
    engine: Arc<WorkflowEngine>,
    gate: GatedTool,
}

fn fixture(config: AppConfig, functions: FunctionRegistry) -> Fixture {
    let gate = GatedTool::new("gate");
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool::new("echo"));
    tools.register(FailingTool::new("broken", "upstream unavailable"));
    tools.register(gate.clone());
    let engine = WorkflowEngine::new(
        config,
        Arc::new(ScriptedLlm::new()),
        Arc::new(tools),
        Arc::new(MemoryStore::new()),
    )
    .with_functions(functions)
    .with_counter(TokenCounter::heuristic());
    Fixture {
        engine: Arc::new(engine),
        gate,
    }
}

fn counting(name: &str, functions: &mut FunctionRegistry) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    functions.register(name, move |_input: Value| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "calls": n }))
    });
    calls
}

#[tokio::test]
async fn test_loop_runs_body_until_limit() {
    let mut functions = FunctionRegistry::new();
    let body = counting("work", &mut functions);
    counting("prepare", &mut functions);
    counting("finish", &mut functions);
    let fx = fixture(AppConfig::default(), functions);

    let mut graph = WorkflowGraph::new("looping");
    graph.add_node(Node::function("prepare", "prepare")).unwrap();
    graph.add_node(Node::loop_node("repeat", 3)).unwrap();
    graph.add_node(Node::function("work", "work")).unwrap();
    graph.add_node(Node::function("finish", "finish")).unwrap();
    graph.add_edge(Edge::always("prepare", "repeat")).unwrap();
    graph.add_edge(Edge::loop_continue("repeat", "work")).unwrap();
    graph.add_edge(Edge::always("work", "repeat")).unwrap();
    graph.add_edge(Edge::loop_exit("repeat", "finish")).unwrap();

    let report = fx.engine.run(graph, json!({})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(body.load(Ordering::SeqCst), 3);
    assert_eq!(report.context.activations["work"], 3);
    assert_eq!(report.context.activations["repeat"], 4);
    assert_eq!(report.context.activations["finish"], 1);
    assert!(report.context.loop_iterations.is_empty());
    assert_eq!(report.context.node_results["repeat"]["continuing"], false);
}

#[tokio::test]
async fn test_loop_condition_stops_early() {
    let mut functions = FunctionRegistry::new();
    let body = counting("work", &mut functions);
    let fx = fixture(AppConfig::default(), functions);

    let mut graph = WorkflowGraph::new("until-done");
    graph
        .add_node(Node::loop_node("repeat", 10).with_condition("work.status != completed"))
        .unwrap();
    graph.add_node(Node::function("work", "work")).unwrap();
    graph.add_node(Node::tool("done", "echo")).unwrap();
    graph.add_edge(Edge::loop_continue("repeat", "work")).unwrap();
    graph.add_edge(Edge::always("work", "repeat")).unwrap();
    graph.add_edge(Edge::loop_exit("repeat", "done")).unwrap();
    graph.set_entry("repeat").unwrap();

    let report = fx.engine.run(graph, json!({})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(body.load(Ordering::SeqCst), 1);
    assert_eq!(report.context.activations["repeat"], 2);
    assert!(report.context.node_results.contains_key("done"));
}

#[tokio::test]
async fn test_conditional_edges_pick_one_branch() {
    let mut functions = FunctionRegistry::new();
    functions.register("classify", |_input: Value| Ok(json!({"priority": "high"})));
    let fx = fixture(AppConfig::default(), functions);

    let mut graph = WorkflowGraph::new("triage");
    graph.add_node(Node::function("classify", "classify")).unwrap();
    graph.add_node(Node::tool("urgent", "echo")).unwrap();
    graph.add_node(Node::tool("normal", "echo")).unwrap();
    graph
        .add_edge(Edge::conditional("classify", "urgent", "classify.priority == high"))
        .unwrap();
    graph
        .add_edge(Edge::conditional("classify", "normal", "classify.priority != high"))
        .unwrap();

    let report = fx.engine.run(graph, json!({})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert!(report.context.node_results.contains_key("urgent"));
    assert_eq!(report.context.node_status("normal"), "pending");
}

#[tokio::test]
async fn test_on_failure_edge_recovers() {
    let fx = fixture(AppConfig::default(), FunctionRegistry::new());

    let mut graph = WorkflowGraph::new("fallback");
    graph.add_node(Node::tool("primary", "broken")).unwrap();
    graph.add_node(Node::tool("backup", "echo")).unwrap();
    graph.add_node(Node::tool("publish", "echo")).unwrap();
    graph.add_edge(Edge::on_failure("primary", "backup")).unwrap();
    graph.add_edge(Edge::on_success("primary", "publish")).unwrap();

    let report = fx.engine.run(graph, json!({})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert!(report.context.failed_nodes["primary"].contains("upstream unavailable"));
    assert!(report.context.node_results.contains_key("backup"));
    assert!(!report.context.node_results.contains_key("publish"));
}

#[tokio::test]
async fn test_failure_without_handler_fails_run() {
    let fx = fixture(AppConfig::default(), FunctionRegistry::new());

    let mut graph = WorkflowGraph::new("unhandled");
    graph.add_node(Node::tool("primary", "broken")).unwrap();
    graph.add_node(Node::tool("publish", "echo")).unwrap();
    graph.add_edge(Edge::on_success("primary", "publish")).unwrap();

    let report = fx.engine.run(graph, json!({})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Failed);
    let failure = report.context.failure.clone().unwrap();
    assert_eq!(failure.cause, FailureCause::Tool);
    assert!(matches!(
        report.into_result(),
        Err(TesseraError::RunFailed { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_critical_failure_aborts_siblings() {
    let fx = fixture(AppConfig::default(), FunctionRegistry::new());

    let mut graph = WorkflowGraph::new("critical");
    graph.add_node(Node::tool("start", "echo")).unwrap();
    graph
        .add_node(Node::tool("check", "broken").critical())
        .unwrap();
    graph.add_node(Node::tool("slow", "gate")).unwrap();
    graph.add_edge(Edge::always("start", "check")).unwrap();
    graph.add_edge(Edge::always("start", "slow")).unwrap();

    let report = fx.engine.run(graph, json!({})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(fx.gate.finished(), 0);

    let failure = report.context.failure.clone().unwrap();
    assert_eq!(failure.cause, FailureCause::CriticalNode);
    assert_eq!(failure.node_id.as_deref(), Some("check"));
    match report.into_result() {
        Err(TesseraError::CriticalNodeFailure { node_id, seq, .. }) => {
            assert_eq!(node_id, "check");
            assert_eq!(seq, failure.origin_seq);
        }
        other => panic!("expected critical failure, got {:?}", other.map(|r| r.status())),
    }
}

#[tokio::test]
async fn test_no_matching_edge_is_dead_end() {
    let mut functions = FunctionRegistry::new();
    functions.register("score", |_input: Value| Ok(json!({"x": 1})));
    let fx = fixture(AppConfig::default(), functions);

    let mut graph = WorkflowGraph::new("dead-end");
    graph.add_node(Node::function("score", "score")).unwrap();
    graph.add_node(Node::tool("next", "echo")).unwrap();
    graph
        .add_edge(Edge::conditional("score", "next", "score.x == 2"))
        .unwrap();

    let report = fx.engine.run(graph, json!({})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(
        report.context.failure.as_ref().map(|f| f.cause),
        Some(FailureCause::DeadEnd)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_timeout_fails_node() {
    let fx = fixture(AppConfig::default(), FunctionRegistry::new());

    let mut graph = WorkflowGraph::new("slow");
    graph
        .add_node(Node::tool("wait", "gate").with_timeout(1))
        .unwrap();
    graph.add_node(Node::tool("fallback", "echo")).unwrap();
    graph.add_edge(Edge::on_failure("wait", "fallback")).unwrap();

    let report = fx.engine.run(graph, json!({})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert!(report.context.failed_nodes["wait"].contains("timed out"));
    assert!(report.context.node_results.contains_key("fallback"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_deadline_fails_run() {
    let mut config = AppConfig::default();
    config.engine.run_timeout_secs = Some(1);
    config.engine.cancel_grace_secs = 0;
    let fx = fixture(config, FunctionRegistry::new());

    let mut graph = WorkflowGraph::new("deadline");
    graph.add_node(Node::tool("wait", "gate")).unwrap();

    let report = fx.engine.run(graph, json!({})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(
        report.context.failure.as_ref().map(|f| f.cause),
        Some(FailureCause::Timeout)
    );
}

#[tokio::test]
async fn test_human_approval_and_rejection() {
    let fx = fixture(AppConfig::default(), FunctionRegistry::new());

    let mut graph = WorkflowGraph::new("review");
    graph
        .add_node(Node::human_approval("review", "Publish the draft?"))
        .unwrap();
    graph.add_node(Node::tool("publish", "echo")).unwrap();
    graph.add_node(Node::tool("archive", "echo")).unwrap();
    graph.add_edge(Edge::on_success("review", "publish")).unwrap();
    graph.add_edge(Edge::on_failure("review", "archive")).unwrap();

    let waiting = fx.engine.run(graph.clone(), json!({})).await.unwrap();
    let (request_id, pending) = waiting.context.pending_human.iter().next().unwrap();
    assert_eq!(pending.context, "Publish the draft?");
    assert_eq!(pending.options, vec!["approve", "reject"]);
    let approved = fx
        .engine
        .submit_feedback(&waiting.run_id, request_id, json!("approve"))
        .await
        .unwrap();
    assert_eq!(approved.status(), RunStatus::Completed);
    assert!(approved.context.node_results.contains_key("publish"));

    let waiting = fx.engine.run(graph, json!({})).await.unwrap();
    let request_id = waiting.context.pending_human.keys().next().unwrap().clone();
    let rejected = fx
        .engine
        .submit_feedback(&waiting.run_id, &request_id, json!("reject"))
        .await
        .unwrap();
    assert_eq!(rejected.status(), RunStatus::Completed);
    assert!(rejected.context.node_results.contains_key("archive"));
    assert!(rejected.context.failed_nodes.contains_key("review"));

    let err = fx
        .engine
        .submit_feedback(&waiting.run_id, &request_id, json!("approve"))
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::Validation(_)));
}

#[tokio::test]
async fn test_function_node_sees_arguments_and_upstream() {
    let mut functions = FunctionRegistry::new();
    functions.register("total", |input: Value| {
        let base = input["upstream"]["seed"]["value"].as_i64().unwrap_or(0);
        let add = input["arguments"]["add"].as_i64().unwrap_or(0);
        Ok(json!({ "value": base + add }))
    });
    functions.register("seed", |input: Value| {
        Ok(json!({ "value": input["input"]["start"].clone() }))
    });
    let fx = fixture(AppConfig::default(), functions);

    let mut graph = WorkflowGraph::new("sum");
    graph.add_node(Node::function("seed", "seed")).unwrap();
    graph
        .add_node(
            Node::function("total", "total")
                .with_arguments(json!({"add": 5}))
                .with_output_key("sum"),
        )
        .unwrap();
    graph.add_edge(Edge::always("seed", "total")).unwrap();

    let report = fx.engine.run(graph, json!({"start": 10})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.context.variables["sum"], json!({"value": 15}));
}

#[tokio::test]
async fn test_missing_function_fails_node() {
    let fx = fixture(AppConfig::default(), FunctionRegistry::new());
    let mut graph = WorkflowGraph::new("missing");
    graph.add_node(Node::function("f", "nowhere")).unwrap();

    let report = fx.engine.run(graph, json!({})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(
        report.context.failure.as_ref().map(|f| f.cause),
        Some(FailureCause::Function)
    );
}

#[tokio::test]
async fn test_workflow_from_toml_runs() {
    let definition = WorkflowDefinition::from_toml(
        r#"
name = "from-file"

[[nodes]]
id = "first"
kind = "tool"
tool = "echo"

[[nodes]]
id = "second"
kind = "tool"
tool = "echo"
output_key = "last"

[[edges]]
from = "first"
to = "second"
"#,
    )
    .unwrap();
    let graph = definition.build().unwrap();
    let fx = fixture(AppConfig::default(), FunctionRegistry::new());
    fx.engine.register_workflow(graph).unwrap();
    assert_eq!(fx.engine.workflow_names(), vec!["from-file".to_string()]);

    let handle = fx
        .engine
        .start_workflow("from-file", json!({"k": "v"}), tessera_core::event::Emitter::External)
        .await
        .unwrap();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.context.variables["last"]["input"]["k"], "v");
}

#[tokio::test]
async fn test_invalid_graph_is_rejected() {
    let fx = fixture(AppConfig::default(), FunctionRegistry::new());
    let mut graph = WorkflowGraph::new("cyclic");
    graph.add_node(Node::tool("a", "echo")).unwrap();
    graph.add_node(Node::tool("b", "echo")).unwrap();
    graph.add_edge(Edge::always("a", "b")).unwrap();
    graph.add_edge(Edge::always("b", "a")).unwrap();

    assert!(fx.engine.run(graph, json!({})).await.is_err());
    assert!(fx.engine.list_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_loop_node_must_leave_through_loop_edges() {
    let mut functions = FunctionRegistry::new();
    let body = counting("work", &mut functions);
    counting("prepare", &mut functions);
    let fx = fixture(AppConfig::default(), functions);

    let mut graph = WorkflowGraph::new("unbounded");
    graph.add_node(Node::function("prepare", "prepare")).unwrap();
    graph.add_node(Node::loop_node("repeat", 2)).unwrap();
    graph.add_node(Node::function("work", "work")).unwrap();
    graph.add_edge(Edge::always("prepare", "repeat")).unwrap();
    graph.add_edge(Edge::always("repeat", "work")).unwrap();
    graph.add_edge(Edge::always("work", "repeat")).unwrap();

    assert!(matches!(graph.validate(), Err(TesseraError::Validation(_))));
    assert!(fx.engine.run(graph, json!({})).await.is_err());
    assert_eq!(body.load(Ordering::SeqCst), 0);
    assert!(fx.engine.list_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_loop_exit_leading_back_to_loop_is_rejected() {
    let mut functions = FunctionRegistry::new();
    counting("work", &mut functions);
    counting("again", &mut functions);
    let fx = fixture(AppConfig::default(), functions);

    let mut graph = WorkflowGraph::new("restarting");
    graph.add_node(Node::loop_node("repeat", 2)).unwrap();
    graph.add_node(Node::function("work", "work")).unwrap();
    graph.add_node(Node::function("again", "again")).unwrap();
    graph.add_edge(Edge::loop_continue("repeat", "work")).unwrap();
    graph.add_edge(Edge::always("work", "repeat")).unwrap();
    graph.add_edge(Edge::loop_exit("repeat", "again")).unwrap();
    graph.add_edge(Edge::always("again", "repeat")).unwrap();
    graph.set_entry("repeat").unwrap();

    assert!(matches!(
        fx.engine.register_workflow(graph),
        Err(TesseraError::Cycle(_))
    ));
}

#[tokio::test]
async fn test_max_concurrency_bounds_activations() {
    let mut config = AppConfig::default();
    config.engine.max_concurrency = 1;
    let fx = fixture(config, FunctionRegistry::new());

    let mut graph = WorkflowGraph::new("serial");
    graph.add_node(Node::tool("start", "echo")).unwrap();
    graph.add_node(Node::tool("b", "gate")).unwrap();
    graph.add_node(Node::tool("c", "gate")).unwrap();
    graph.add_edge(Edge::always("start", "b")).unwrap();
    graph.add_edge(Edge::always("start", "c")).unwrap();

    let handle = fx.engine.start(graph, json!({})).await.unwrap();
    let run_id = handle.run_id().clone();

    fx.gate.wait_started().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let ctx = fx.engine.context(&run_id).await.unwrap();
    assert_eq!(ctx.current_nodes.len(), 1);
    assert_eq!(ctx.queued.len(), 1);
    assert_eq!(fx.gate.calls(), 1);

    fx.gate.release();
    fx.gate.wait_started().await;
    assert_eq!(fx.gate.calls(), 2);
    assert_eq!(fx.engine.context(&run_id).await.unwrap().current_nodes.len(), 1);
    fx.gate.release();

    let report = handle.wait().await.unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(fx.gate.finished(), 2);
}

#[tokio::test]
async fn test_approval_suspends_only_its_branch() {
    let fx = fixture(AppConfig::default(), FunctionRegistry::new());

    let mut graph = WorkflowGraph::new("side-by-side");
    graph.add_node(Node::tool("start", "echo")).unwrap();
    graph
        .add_node(Node::human_approval("review", "Ship it?"))
        .unwrap();
    graph.add_node(Node::tool("build", "gate")).unwrap();
    graph.add_node(Node::tool("publish", "echo")).unwrap();
    graph.add_edge(Edge::always("start", "review")).unwrap();
    graph.add_edge(Edge::always("start", "build")).unwrap();
    graph.add_edge(Edge::on_success("build", "publish")).unwrap();

    let handle = fx.engine.start(graph, json!({})).await.unwrap();
    fx.gate.wait_started().await;
    fx.gate.release();

    // The tool branch finishes while the approval is still open.
    let waiting = handle.wait().await.unwrap();
    assert_eq!(waiting.status(), RunStatus::Running);
    assert!(waiting.context.node_results.contains_key("build"));
    assert!(waiting.context.node_results.contains_key("publish"));
    assert!(!waiting.context.node_results.contains_key("review"));
    assert_eq!(waiting.context.pending_human.len(), 1);

    let request_id = waiting.context.pending_human.keys().next().unwrap().clone();
    let done = fx
        .engine
        .submit_feedback(&waiting.run_id, &request_id, json!("approve"))
        .await
        .unwrap();
    assert_eq!(done.status(), RunStatus::Completed);
    assert!(done.context.node_results.contains_key("review"));
}

#[tokio::test]
async fn test_finished_runs_are_released() {
    let fx = fixture(AppConfig::default(), FunctionRegistry::new());

    let mut quick = WorkflowGraph::new("quick");
    quick.add_node(Node::tool("only", "echo")).unwrap();
    let done = fx.engine.run(quick, json!({})).await.unwrap();
    assert_eq!(done.status(), RunStatus::Completed);
    assert!(fx.engine.live_runs().await.is_empty());
    // Still readable from the store.
    let ctx = fx.engine.context(&done.run_id).await.unwrap();
    assert_eq!(ctx.status, RunStatus::Completed);

    let mut gated = WorkflowGraph::new("gated");
    gated
        .add_node(Node::human_approval("review", "Proceed?"))
        .unwrap();
    let waiting = fx.engine.run(gated, json!({})).await.unwrap();
    assert_eq!(fx.engine.live_runs().await, vec![waiting.run_id.clone()]);

    fx.engine.cancel(&waiting.run_id, None).await.unwrap();
    assert!(fx.engine.live_runs().await.is_empty());
    assert_eq!(
        fx.engine.context(&waiting.run_id).await.unwrap().status,
        RunStatus::Cancelled
    );
}

#[tokio::test]
async fn test_engine_from_config_uses_fallback_model() {
    let mut config = AppConfig::default();
    config.model.model_id = "primary".to_string();
    config.fallback_models.push(tessera_core::config::ModelConfig {
        model_id: "backup".to_string(),
        ..Default::default()
    });
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;

    let primary = ScriptedLlm::new().then_error("HTTP 401 unauthorized");
    let backup = ScriptedLlm::new().then_finish(json!({"answer": 42}));
    let (primary_calls, backup_calls) = (primary.clone(), backup.clone());

    let engine = WorkflowEngine::from_config(
        config,
        |model| {
            let llm = if model.model_id == "primary" {
                primary.clone()
            } else {
                backup.clone()
            };
            Box::new(llm) as Box<dyn tessera_core::traits::LlmClient>
        },
        Arc::new(ToolRegistry::new()),
        Arc::new(MemoryStore::new()),
    )
    .with_counter(TokenCounter::heuristic());

    let mut graph = WorkflowGraph::new("ask");
    graph.add_node(Node::agent("ask", "Answer the question")).unwrap();
    let report = engine.run(graph, json!({})).await.unwrap();

    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.context.node_results["ask"], json!({"answer": 42}));
    assert_eq!(primary_calls.call_count(), 1);
    assert_eq!(backup_calls.call_count(), 1);
}

#[tokio::test]
async fn test_reloaded_run_keeps_writing_its_log() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn tessera_core::traits::Store> = Arc::new(MemoryStore::new());
    let engine_with = |config: AppConfig| {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool::new("echo"));
        WorkflowEngine::new(
            config,
            Arc::new(ScriptedLlm::new()),
            Arc::new(tools),
            store.clone(),
        )
    };
    let mut graph = WorkflowGraph::new("approve-then-act");
    graph
        .add_node(Node::human_approval("review", "Go ahead?"))
        .unwrap();
    graph.add_node(Node::tool("act", "echo")).unwrap();
    graph.add_edge(Edge::on_success("review", "act")).unwrap();

    let first = engine_with(AppConfig::default());
    let waiting = first.run(graph.clone(), json!({})).await.unwrap();
    let request_id = waiting.context.pending_human.keys().next().unwrap().clone();
    drop(first);

    let mut config = AppConfig::default();
    config.log = Some(tessera_core::config::LogConfig {
        log_dir: Some(dir.path().display().to_string()),
        ..Default::default()
    });
    let second = engine_with(config);
    second.register_workflow(graph).unwrap();
    let done = second
        .submit_feedback(&waiting.run_id, &request_id, json!("approve"))
        .await
        .unwrap();
    assert_eq!(done.status(), RunStatus::Completed);

    let run_dir = dir.path().join(waiting.run_id.as_str());
    let logged = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if let Ok(mut entries) = std::fs::read_dir(&run_dir) {
                let text = entries
                    .next()
                    .and_then(|e| e.ok())
                    .and_then(|e| std::fs::read_to_string(e.path()).ok())
                    .unwrap_or_default();
                if text.contains("run_completed") {
                    return text;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("run log written after reload");
    assert!(logged.contains("human_feedback"));
}
