use std::sync::Arc;

use serde_json::json;

use tessera_agent::{
    Compactor, ContextCompiler, Edge, JoinPolicy, Node, RunJournal, TokenCounter, WorkflowEngine,
    WorkflowGraph,
};
use tessera_core::config::{AppConfig, CompactionConfig};
use tessera_core::event::{Emitter, EventKind, Scope};
use tessera_core::traits::Store;
use tessera_core::types::{RunId, RunStatus};
use tessera_store::MemoryStore;
use tessera_test_utils::{synthetic_events, EchoTool, GatedTool, ScriptedLlm};
use tessera_tools::ToolRegistry;

fn engine(config: AppConfig, llm: ScriptedLlm, tools: ToolRegistry) -> Arc<WorkflowEngine> {
    Arc::new(
        WorkflowEngine::new(
            config,
            Arc::new(llm),
            Arc::new(tools),
            Arc::new(MemoryStore::new()),
        )
        .with_counter(TokenCounter::heuristic()),
    )
}

#[tokio::test]
async fn test_agents_in_sequence_with_tool_call() {
    let llm = ScriptedLlm::new()
        .then_tool_call("echo", json!({"query": "rust"}))
        .then_finish(json!({"notes": "rust is a systems language"}))
        .then_finish(json!({"report": "done"}));
    let echo = EchoTool::new("echo");
    let mut tools = ToolRegistry::new();
    tools.register(echo.clone());
    let engine = engine(AppConfig::default(), llm.clone(), tools);

    let mut graph = WorkflowGraph::new("research");
    graph
        .add_node(Node::agent("gather", "Collect notes").with_output_key("notes"))
        .unwrap();
    graph.add_node(Node::agent("write", "Write the report")).unwrap();
    graph.add_edge(Edge::always("gather", "write")).unwrap();

    let report = engine.run(graph, json!({"topic": "rust"})).await.unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.context.node_results.len(), 2);
    assert_eq!(report.context.node_results["write"], json!({"report": "done"}));
    assert_eq!(
        report.context.variables["notes"],
        json!({"notes": "rust is a systems language"})
    );
    assert_eq!(echo.calls(), 1);
    assert_eq!(llm.call_count(), 3);
}

#[tokio::test]
async fn test_breaker_escalates_then_feedback_resumes() {
    let llm = ScriptedLlm::new()
        .then_text("not json")
        .then_text("still not json")
        .then_text("nope")
        .then_finish(json!("recovered"));
    let mut config = AppConfig::default();
    config.agent.max_consecutive_errors = 2;
    let engine = engine(config, llm.clone(), ToolRegistry::new());

    let mut graph = WorkflowGraph::new("fragile");
    graph.add_node(Node::agent("a", "Do the thing")).unwrap();

    let report = engine.run(graph, json!(null)).await.unwrap();
    assert_eq!(report.status(), RunStatus::Running);
    assert_eq!(report.context.pending_human.len(), 1);
    let (request_id, pending) = report.context.pending_human.iter().next().unwrap();
    assert_eq!(pending.node_id, "a");

    let report = engine
        .submit_feedback(&report.run_id, request_id, json!("retry"))
        .await
        .unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.context.node_results["a"], json!("recovered"));
    assert_eq!(llm.call_count(), 4);
}

#[tokio::test]
async fn test_thousand_events_compact_once() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let run_id = RunId::from_string("long-run");
    for event in synthetic_events(1000, Emitter::node("worker")) {
        store.append(&run_id, &event).await.unwrap();
    }
    let journal = RunJournal::open(run_id, store, None).await.unwrap();
    let config = CompactionConfig {
        token_threshold: 500,
        overlap_events: 10,
        ..Default::default()
    };
    let scope = Scope::node("worker");
    let compactor = Compactor::new(TokenCounter::heuristic(), None);

    let compacted = compactor
        .maybe_compact(&journal, &scope, &config)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(compacted.covers_from_seq, 0);
    assert_eq!(compacted.covers_to_seq, 989);
    assert_eq!(compacted.covered_events, 990);

    let log = journal.snapshot();
    assert_eq!(log.len(), 1001);
    assert_eq!(log.compactions().count(), 1);
    assert_eq!(log.events_since_last_compaction(&scope).len(), 10);

    let view = ContextCompiler::compile(&log, &scope);
    assert_eq!(view.summaries().count(), 1);
    assert_eq!(view.raw_events().count(), 10);
    assert!(view.raw_events().all(|e| e.seq >= 990));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fan_out_join_waits_for_both_branches() {
    let gate_b = GatedTool::new("gate_b");
    let gate_c = GatedTool::new("gate_c");
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool::new("echo"));
    tools.register(gate_b.clone());
    tools.register(gate_c.clone());
    let engine = engine(AppConfig::default(), ScriptedLlm::new(), tools);

    let mut graph = WorkflowGraph::new("fan");
    graph.add_node(Node::tool("a", "echo")).unwrap();
    graph.add_node(Node::tool("b", "gate_b")).unwrap();
    graph.add_node(Node::tool("c", "gate_c")).unwrap();
    graph
        .add_node(Node::tool("d", "echo").with_join(JoinPolicy::All))
        .unwrap();
    graph.add_edge(Edge::always("a", "b")).unwrap();
    graph.add_edge(Edge::always("a", "c")).unwrap();
    graph.add_edge(Edge::always("b", "d")).unwrap();
    graph.add_edge(Edge::always("c", "d")).unwrap();

    let handle = engine.start(graph, json!({})).await.unwrap();
    gate_b.wait_started().await;
    gate_c.wait_started().await;

    let ctx = engine.context(handle.run_id()).await.unwrap();
    assert!(ctx.current_nodes.contains("b"));
    assert!(ctx.current_nodes.contains("c"));
    assert!(!ctx.activations.contains_key("d"));

    gate_c.release();
    gate_b.release();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.context.activations["d"], 1);

    assert_eq!(report.context.node_results.len(), 4);
    assert_eq!(report.context.node_results["d"]["upstream"]["b"]["released"], true);
    assert_eq!(report.context.node_results["d"]["upstream"]["c"]["released"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_waits_for_in_flight_tool() {
    let gate = GatedTool::new("slow");
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool::new("echo"));
    tools.register(gate.clone());
    let engine = engine(AppConfig::default(), ScriptedLlm::new(), tools);

    let mut graph = WorkflowGraph::new("cancellable");
    graph.add_node(Node::tool("a", "slow")).unwrap();
    graph.add_node(Node::tool("b", "echo")).unwrap();
    graph.add_edge(Edge::always("a", "b")).unwrap();

    let handle = engine.start(graph, json!({})).await.unwrap();
    let run_id = handle.run_id().clone();
    gate.wait_started().await;

    engine
        .cancel(&run_id, Some("operator stop".into()))
        .await
        .unwrap();
    gate.release();

    let report = handle.wait().await.unwrap();
    assert_eq!(report.status(), RunStatus::Cancelled);
    assert_eq!(gate.finished(), 1);
    assert!(!report.context.node_results.contains_key("b"));

    let ctx = engine.context(&run_id).await.unwrap();
    assert_eq!(ctx.status, RunStatus::Cancelled);
    assert!(!ctx.activations.contains_key("b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_activation_after_cancel() {
    let gate = GatedTool::new("slow");
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool::new("echo"));
    tools.register(gate.clone());
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(
        WorkflowEngine::new(
            AppConfig::default(),
            Arc::new(ScriptedLlm::new()),
            Arc::new(tools),
            store.clone(),
        )
        .with_counter(TokenCounter::heuristic()),
    );

    let mut graph = WorkflowGraph::new("cancellable");
    graph.add_node(Node::tool("a", "slow")).unwrap();
    graph.add_node(Node::tool("b", "echo")).unwrap();
    graph.add_edge(Edge::always("a", "b")).unwrap();

    let handle = engine.start(graph, json!({})).await.unwrap();
    let run_id = handle.run_id().clone();
    gate.wait_started().await;
    engine.cancel(&run_id, None).await.unwrap();
    gate.release();
    handle.wait().await.unwrap();

    let events = store.load(&run_id).await.unwrap();
    let cancelled_at = events
        .iter()
        .position(|e| matches!(e.kind, EventKind::Cancelled { .. }))
        .unwrap();
    let after = &events[cancelled_at + 1..];
    assert!(after
        .iter()
        .all(|e| !matches!(e.kind, EventKind::NodeActivated { .. })));
    // the late tool result is kept for audit
    assert!(after.iter().any(|e| matches!(
        &e.kind,
        EventKind::Annotation { note, .. } if note.contains("after cancellation")
    )));
}
