//! The workflow engine.
//!
//! One driver at a time owns a run (`RunControl::driver`). The driver reads
//! the folded context, activates queued nodes up to
//! `engine.max_concurrency`, and reacts to finished activations by
//! evaluating outgoing edges. Every scheduling decision is an event, so a
//! run reloaded from the store continues where it stopped.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tessera_core::bus::EventBus;
use tessera_core::config::{AppConfig, ModelConfig};
use tessera_core::error::{Result, TesseraError};
use tessera_core::event::{Emitter, EventKind, FailureCause};
use tessera_core::traits::{LlmClient, Store};
use tessera_core::types::{RunId, RunStatus, ToolContext};
use tessera_llm::RetryingClient;
use tessera_tools::{FunctionRegistry, ToolRegistry};

use crate::agent_loop::{AgentExecutor, AgentOutcome, AgentTask};
use crate::compaction::EventSummarizer;
use crate::graph::{
    evaluate_condition, Edge, EdgeCondition, JoinPolicy, Node, NodeKind, Topology, WorkflowGraph,
};
use crate::journal::RunJournal;
use crate::log::EventLog;
use crate::run_log::RunLogger;
use crate::state::ExecutionContext;
use crate::tokens::TokenCounter;

/// The state of a run when its driver returned.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub context: ExecutionContext,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        self.context.status
    }

    /// `Ok` unless the run failed or was cancelled.
    pub fn into_result(self) -> Result<Self> {
        match self.context.status {
            RunStatus::Cancelled => Err(TesseraError::Cancelled),
            RunStatus::Failed => match self.context.failure {
                Some(failure) if failure.cause == FailureCause::CriticalNode => {
                    Err(TesseraError::CriticalNodeFailure {
                        node_id: failure.node_id.unwrap_or_default(),
                        seq: failure.origin_seq,
                        message: failure.message,
                    })
                }
                Some(failure) => Err(TesseraError::RunFailed {
                    seq: failure.origin_seq,
                    message: failure.message,
                }),
                None => Err(TesseraError::RunFailed {
                    seq: self.context.last_seq.unwrap_or(0),
                    message: "run failed".to_string(),
                }),
            },
            _ => Ok(self),
        }
    }
}

/// A run driven by a background task.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    handle: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Wait for the driver to finish, suspend or fail.
    pub async fn wait(self) -> Result<RunReport> {
        self.handle
            .await
            .map_err(|e| TesseraError::Join(e.to_string()))?
    }
}

/// How one node activation ended.
#[derive(Debug)]
enum NodeOutcome {
    Completed(Value),
    Failed { cause: FailureCause, message: String },
    AwaitingHuman,
    Cancelled,
}

/// Everything a node task needs, shared by all runs of one engine.
#[derive(Clone)]
struct NodeServices {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    functions: FunctionRegistry,
    config: AppConfig,
    summarizer: Option<Arc<dyn EventSummarizer>>,
    counter: Option<TokenCounter>,
}

struct RunControl {
    journal: Arc<RunJournal>,
    graph: Arc<WorkflowGraph>,
    topology: Topology,
    cancel: CancellationToken,
    wake: Notify,
    driver: Mutex<()>,
    /// Set when new work arrived while another task held the driver.
    redrive: AtomicBool,
    started: Instant,
    /// JSONL audit writer; it stops by itself at the run's terminal event.
    logger: Option<JoinHandle<()>>,
}

impl RunControl {
    fn new(
        journal: Arc<RunJournal>,
        graph: Arc<WorkflowGraph>,
        topology: Topology,
        logger: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            journal,
            graph,
            topology,
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            driver: Mutex::new(()),
            redrive: AtomicBool::new(false),
            started: Instant::now(),
            logger,
        }
    }

    fn node(&self, id: &str) -> Result<&Node> {
        self.graph
            .node(id)
            .ok_or_else(|| TesseraError::UnknownNode(id.to_string()))
    }
}

/// Executes workflow graphs against an event store.
pub struct WorkflowEngine {
    services: Arc<NodeServices>,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    workflows: RwLock<HashMap<String, Arc<WorkflowGraph>>>,
    runs: Mutex<HashMap<RunId, Arc<RunControl>>>,
}

impl WorkflowEngine {
    pub fn new(
        config: AppConfig,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            services: Arc::new(NodeServices {
                llm,
                tools,
                functions: FunctionRegistry::new(),
                config,
                summarizer: None,
                counter: None,
            }),
            store,
            bus: Arc::new(EventBus::default()),
            workflows: RwLock::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// An engine whose LLM is the `[model]` client wrapped with `[retry]`
    /// and the `[[fallback_models]]` chain.
    pub fn from_config<F>(
        config: AppConfig,
        connect: F,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn Store>,
    ) -> Self
    where
        F: FnMut(&ModelConfig) -> Box<dyn LlmClient>,
    {
        let llm = RetryingClient::from_config(&config, connect);
        info!(
            model = %config.model.model_id,
            fallbacks = config.fallback_models.len(),
            max_retries = config.retry.max_retries,
            "LLM client configured"
        );
        Self::new(config, Arc::new(llm), tools, store)
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        Arc::make_mut(&mut self.services).functions = functions;
        self
    }

    /// Summarizer used for compaction instead of the rule-based fallback.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn EventSummarizer>) -> Self {
        Arc::make_mut(&mut self.services).summarizer = Some(summarizer);
        self
    }

    pub fn with_counter(mut self, counter: TokenCounter) -> Self {
        Arc::make_mut(&mut self.services).counter = Some(counter);
        self
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &AppConfig {
        &self.services.config
    }

    /// Validate and register a workflow under its name, replacing any previous one.
    pub fn register_workflow(&self, graph: WorkflowGraph) -> Result<()> {
        graph.validate()?;
        info!(
            workflow = graph.name(),
            nodes = graph.nodes().len(),
            edges = graph.edges().len(),
            "Workflow registered"
        );
        self.workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(graph.name().to_string(), Arc::new(graph));
        Ok(())
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<WorkflowGraph>> {
        self.workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Start a run and drive it until it ends or suspends.
    pub async fn run(&self, graph: WorkflowGraph, input: Value) -> Result<RunReport> {
        self.register_workflow(graph.clone())?;
        let control = self.launch(Arc::new(graph), input, Emitter::Engine).await?;
        self.drive(control).await
    }

    /// Start a run and drive it on a background task.
    pub async fn start(self: &Arc<Self>, graph: WorkflowGraph, input: Value) -> Result<RunHandle> {
        self.register_workflow(graph.clone())?;
        self.spawn_run(Arc::new(graph), input, Emitter::Engine).await
    }

    /// Start a registered workflow by name.
    pub async fn start_workflow(
        self: &Arc<Self>,
        name: &str,
        input: Value,
        emitter: Emitter,
    ) -> Result<RunHandle> {
        let graph = self
            .workflow(name)
            .ok_or_else(|| TesseraError::Validation(format!("unknown workflow '{}'", name)))?;
        self.spawn_run(graph, input, emitter).await
    }

    async fn spawn_run(
        self: &Arc<Self>,
        graph: Arc<WorkflowGraph>,
        input: Value,
        emitter: Emitter,
    ) -> Result<RunHandle> {
        let control = self.launch(graph, input, emitter).await?;
        let run_id = control.journal.run_id().clone();
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.drive(control).await });
        Ok(RunHandle { run_id, handle })
    }

    /// Stop activating new nodes. In-flight activations run to completion.
    pub async fn pause(&self, run_id: &RunId, reason: Option<String>) -> Result<()> {
        let control = self.control(run_id).await?;
        if control.journal.status() == RunStatus::Paused {
            return Ok(());
        }
        control
            .journal
            .append(Emitter::External, EventKind::Paused { reason })
            .await?;
        info!(run_id = %run_id, "Run paused");
        control.wake.notify_one();
        Ok(())
    }

    /// Resume a paused or interrupted run, reloading it from the store if needed.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunReport> {
        let control = self.control(run_id).await?;
        let status = control.journal.status();
        if status.is_terminal() {
            return Err(TesseraError::RunTerminal {
                run_id: run_id.to_string(),
                status: status.to_string(),
            });
        }
        if status == RunStatus::Paused {
            control
                .journal
                .append(Emitter::External, EventKind::Resumed {})
                .await?;
        }
        info!(run_id = %run_id, "Run resumed");
        self.drive_or_wake(control).await
    }

    /// Cancel a run. Calls already in flight get `engine.cancel_grace_secs` to finish.
    pub async fn cancel(&self, run_id: &RunId, reason: Option<String>) -> Result<()> {
        let control = self.control(run_id).await?;
        control
            .journal
            .append(Emitter::External, EventKind::Cancelled { reason })
            .await?;
        control.cancel.cancel();
        control.wake.notify_one();
        info!(run_id = %run_id, "Run cancelled");
        // An idle run has no driver left to release it.
        if let Ok(_driver) = control.driver.try_lock() {
            self.release(&control).await;
        }
        Ok(())
    }

    /// Answer a pending human request. The run continues unless it is paused.
    pub async fn submit_feedback(
        &self,
        run_id: &RunId,
        request_id: &str,
        response: Value,
    ) -> Result<RunReport> {
        let control = self.control(run_id).await?;
        let ctx = control.journal.context();
        let pending = ctx.pending_human.get(request_id).ok_or_else(|| {
            TesseraError::Validation(format!(
                "run {} has no pending human request '{}'",
                run_id, request_id
            ))
        })?;

        control
            .journal
            .append(
                Emitter::node(&pending.node_id),
                EventKind::HumanFeedback {
                    request_id: request_id.to_string(),
                    response,
                },
            )
            .await?;
        info!(run_id = %run_id, node = %pending.node_id, request_id, "Human feedback received");

        if ctx.status == RunStatus::Paused {
            return Ok(report(&control).await);
        }
        self.drive_or_wake(control).await
    }

    /// The current context of a run, live or persisted.
    pub async fn context(&self, run_id: &RunId) -> Result<ExecutionContext> {
        let live = self.runs.lock().await.get(run_id).cloned();
        if let Some(control) = live {
            return Ok(control.journal.context());
        }
        let events = self.store.load(run_id).await?;
        if events.is_empty() {
            return Err(TesseraError::RunNotFound(run_id.to_string()));
        }
        Ok(EventLog::from_events(run_id.clone(), events)?.replay(0))
    }

    pub async fn list_runs(&self) -> Result<Vec<RunId>> {
        self.store.list_runs().await
    }

    /// Runs held in memory: in progress, paused or waiting for a human.
    pub async fn live_runs(&self) -> Vec<RunId> {
        self.runs.lock().await.keys().cloned().collect()
    }

    async fn control(&self, run_id: &RunId) -> Result<Arc<RunControl>> {
        if let Some(control) = self.runs.lock().await.get(run_id) {
            return Ok(control.clone());
        }

        let journal =
            RunJournal::open(run_id.clone(), self.store.clone(), Some(self.bus.clone())).await?;
        let ctx = journal.context();
        let name = ctx.workflow.ok_or_else(|| TesseraError::Resume {
            run_id: run_id.to_string(),
            message: "log has no run_started event".to_string(),
        })?;
        let graph = self.workflow(&name).ok_or_else(|| TesseraError::Resume {
            run_id: run_id.to_string(),
            message: format!("workflow '{}' is not registered", name),
        })?;
        let topology = graph.validate()?;

        let mut runs = self.runs.lock().await;
        if let Some(control) = runs.get(run_id) {
            return Ok(control.clone());
        }
        let logger = self.spawn_logger(run_id);
        let control = Arc::new(RunControl::new(Arc::new(journal), graph, topology, logger));
        runs.insert(run_id.clone(), control.clone());
        debug!(run_id = %run_id, "Run reloaded from store");
        Ok(control)
    }

    /// Start the JSONL audit writer for a run when `[log]` is enabled.
    fn spawn_logger(&self, run_id: &RunId) -> Option<JoinHandle<()>> {
        let config = &self.services.config;
        let log = config.log.as_ref().filter(|l| l.enabled)?;
        Some(RunLogger::new(config.log_dir(), log.level).spawn(&self.bus, run_id.clone()))
    }

    /// Forget a finished run; later lookups reload it from the store.
    async fn release(&self, control: &RunControl) {
        let run_id = control.journal.run_id();
        let removed = self.runs.lock().await.remove(run_id);
        if removed.is_some() {
            let logging = control.logger.as_ref().is_some_and(|h| !h.is_finished());
            debug!(run_id = %run_id, logging, "Run released");
        }
    }

    async fn launch(
        &self,
        graph: Arc<WorkflowGraph>,
        input: Value,
        emitter: Emitter,
    ) -> Result<Arc<RunControl>> {
        let topology = graph.validate()?;
        let run_id = RunId::new();
        let journal = Arc::new(RunJournal::new(
            run_id.clone(),
            self.store.clone(),
            Some(self.bus.clone()),
        ));
        let logger = self.spawn_logger(&run_id);
        let control = Arc::new(RunControl::new(journal, graph.clone(), topology, logger));

        self.runs.lock().await.insert(run_id.clone(), control.clone());
        control
            .journal
            .append(
                emitter,
                EventKind::RunStarted {
                    workflow: graph.name().to_string(),
                    input,
                },
            )
            .await?;
        control
            .journal
            .append(
                Emitter::Engine,
                EventKind::NodeQueued {
                    node_id: control.topology.entry.clone(),
                },
            )
            .await?;

        info!(run_id = %run_id, workflow = graph.name(), entry = %control.topology.entry, "Run started");
        Ok(control)
    }

    async fn drive(&self, control: Arc<RunControl>) -> Result<RunReport> {
        loop {
            let report = {
                let _driver = control.driver.lock().await;
                self.drive_locked(&control).await?
            };
            if !control.redrive.swap(false, Ordering::SeqCst) {
                return Ok(report);
            }
        }
    }

    /// Drive the run unless another task already does; then just nudge that task.
    async fn drive_or_wake(&self, control: Arc<RunControl>) -> Result<RunReport> {
        control.redrive.store(true, Ordering::SeqCst);
        let guard = control.driver.try_lock();
        match guard {
            Ok(_driver) => {
                control.redrive.store(false, Ordering::SeqCst);
                self.drive_locked(&control).await
            }
            Err(_) => {
                control.wake.notify_one();
                Ok(report(&control).await)
            }
        }
    }

    async fn drive_locked(&self, control: &Arc<RunControl>) -> Result<RunReport> {
        let engine = &self.services.config.engine;
        let max_concurrency = engine.max_concurrency.max(1);
        let deadline = engine
            .run_timeout_secs
            .map(|secs| control.started + Duration::from_secs(secs));
        let run_id = control.journal.run_id().clone();

        let mut tasks: JoinSet<(String, NodeOutcome)> = JoinSet::new();
        let mut running: HashSet<String> = HashSet::new();

        loop {
            let ctx = control.journal.context();
            if ctx.status.is_terminal() || control.cancel.is_cancelled() {
                break;
            }

            if ctx.status == RunStatus::Running {
                match self
                    .schedule(control, &ctx, &mut tasks, &mut running, max_concurrency)
                    .await
                {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) if ended_concurrently(&e) => continue,
                    Err(e) => return Err(e),
                }
            }

            if tasks.is_empty() {
                let ctx = control.journal.context();
                if ctx.status.is_terminal() {
                    break;
                }
                if ctx.status == RunStatus::Paused {
                    debug!(run_id = %run_id, "Driver idle while paused");
                    break;
                }
                let stalled = ctx
                    .current_nodes
                    .iter()
                    .any(|n| !running.contains(n) && !ctx.awaiting_human(n));
                if !ctx.queued.is_empty() || stalled {
                    continue;
                }
                if !ctx.pending_human.is_empty() {
                    info!(run_id = %run_id, pending = ctx.pending_human.len(), "Run waiting for human input");
                    break;
                }
                match self.finish_run(control, &ctx).await {
                    Err(e) if !ended_concurrently(&e) => return Err(e),
                    _ => break,
                }
            }

            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok((node_id, outcome))) => {
                            running.remove(&node_id);
                            match self.settle(control, &node_id, outcome, &running).await {
                                Err(e) if !ended_concurrently(&e) => return Err(e),
                                _ => {}
                            }
                        }
                        Some(Err(e)) => error!(run_id = %run_id, error = %e, "Node task ended abnormally"),
                        None => {}
                    }
                }
                _ = control.wake.notified() => {}
                _ = control.cancel.cancelled() => {}
                _ = until(deadline) => {
                    match self.fail_on_timeout(control).await {
                        Err(e) if !ended_concurrently(&e) => return Err(e),
                        _ => {}
                    }
                }
            }
        }

        self.drain(control, &mut tasks).await;
        let report = report(control).await;
        if report.status().is_terminal() {
            self.release(control).await;
        }
        Ok(report)
    }

    /// Restart interrupted nodes and activate queued ones.
    /// Returns `true` when a loop node was evaluated inline and the context moved on.
    async fn schedule(
        &self,
        control: &Arc<RunControl>,
        ctx: &ExecutionContext,
        tasks: &mut JoinSet<(String, NodeOutcome)>,
        running: &mut HashSet<String>,
        max_concurrency: usize,
    ) -> Result<bool> {
        for node_id in &ctx.current_nodes {
            if running.len() >= max_concurrency {
                return Ok(false);
            }
            if running.contains(node_id) || ctx.awaiting_human(node_id) {
                continue;
            }
            let node = control.node(node_id)?;
            if node.is_loop() {
                self.run_loop(control, node, running).await?;
                return Ok(true);
            }
            debug!(run_id = %control.journal.run_id(), node = %node_id, "Restarting node");
            self.spawn_node(control, node, ctx, tasks);
            running.insert(node_id.clone());
        }

        for node_id in &ctx.queued {
            if running.len() >= max_concurrency {
                break;
            }
            let node = control.node(node_id)?;
            if node.is_loop() {
                self.run_loop(control, node, running).await?;
                return Ok(true);
            }
            control
                .journal
                .append(
                    Emitter::Engine,
                    EventKind::NodeActivated {
                        node_id: node_id.clone(),
                    },
                )
                .await?;
            debug!(run_id = %control.journal.run_id(), node = %node_id, kind = node.kind_name(), "Node activated");
            self.spawn_node(control, node, ctx, tasks);
            running.insert(node_id.clone());
        }
        Ok(false)
    }

    fn spawn_node(
        &self,
        control: &Arc<RunControl>,
        node: &Node,
        ctx: &ExecutionContext,
        tasks: &mut JoinSet<(String, NodeOutcome)>,
    ) {
        let input = node_input(&control.graph, &node.id, ctx);
        let feedback = ctx.feedback.get(&node.id).cloned();
        let services = self.services.clone();
        let journal = control.journal.clone();
        let cancel = control.cancel.clone();
        let node = node.clone();
        let secs = node
            .timeout_secs
            .unwrap_or(self.services.config.engine.node_timeout_secs);

        tasks.spawn(async move {
            let node_id = node.id.clone();
            let work =
                AssertUnwindSafe(execute_node(services, journal, node, input, feedback, cancel))
                    .catch_unwind();
            let outcome = match tokio::time::timeout(Duration::from_secs(secs), work).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => NodeOutcome::Failed {
                    cause: FailureCause::Panic,
                    message: panic_message(panic.as_ref()),
                },
                Err(_) => NodeOutcome::Failed {
                    cause: FailureCause::Timeout,
                    message: format!("timed out after {}s", secs),
                },
            };
            (node_id, outcome)
        });
    }

    /// Record how an activation ended and follow the edges it enables.
    async fn settle(
        &self,
        control: &Arc<RunControl>,
        node_id: &str,
        outcome: NodeOutcome,
        running: &HashSet<String>,
    ) -> Result<()> {
        let journal = &control.journal;
        let run_id = journal.run_id();
        let node = control.node(node_id)?;

        match outcome {
            NodeOutcome::Completed(output) => {
                let done = journal
                    .append(
                        Emitter::Engine,
                        EventKind::NodeCompleted {
                            node_id: node_id.to_string(),
                            output: output.clone(),
                        },
                    )
                    .await?;
                if let Some(key) = &node.output_key {
                    journal
                        .append(
                            Emitter::Engine,
                            EventKind::VariableSet {
                                key: key.clone(),
                                value: output,
                            },
                        )
                        .await?;
                }
                info!(run_id = %run_id, node = node_id, "Node completed");
                self.follow_edges(control, node, None, done.seq, running)
                    .await
            }
            NodeOutcome::Failed { cause, message } => {
                warn!(run_id = %run_id, node = node_id, cause = %cause, error = %message, "Node failed");
                let failed = journal
                    .append(
                        Emitter::Engine,
                        EventKind::Failure {
                            node_id: Some(node_id.to_string()),
                            cause,
                            message: message.clone(),
                            critical: node.critical,
                        },
                    )
                    .await?;

                if node.critical {
                    error!(run_id = %run_id, node = node_id, "Critical node failed, aborting run");
                    journal
                        .append(
                            Emitter::Engine,
                            EventKind::RunFailed {
                                cause: FailureCause::CriticalNode,
                                message: format!("critical node '{}' failed: {}", node_id, message),
                                origin_seq: failed.seq,
                            },
                        )
                        .await?;
                    return Ok(());
                }
                self.follow_edges(control, node, Some((cause, message)), failed.seq, running)
                    .await
            }
            NodeOutcome::AwaitingHuman => {
                info!(run_id = %run_id, node = node_id, "Node waiting for human input");
                Ok(())
            }
            NodeOutcome::Cancelled => {
                debug!(run_id = %run_id, node = node_id, "Node stopped after cancellation");
                Ok(())
            }
        }
    }

    /// Fire the outgoing edges enabled by a node's outcome. A branch that ends
    /// without a successor fails the run when nothing else is in progress.
    async fn follow_edges(
        &self,
        control: &Arc<RunControl>,
        node: &Node,
        failure: Option<(FailureCause, String)>,
        origin_seq: u64,
        running: &HashSet<String>,
    ) -> Result<()> {
        let journal = &control.journal;
        let succeeded = failure.is_none();
        let ctx = journal.context();
        let continuing = node.is_loop()
            && ctx
                .node_results
                .get(&node.id)
                .and_then(|v| v.get("continuing"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

        let mut fired = 0;
        let mut has_outgoing = false;
        for (index, edge) in control.graph.outgoing(&node.id) {
            has_outgoing = true;
            let fire = match &edge.condition {
                EdgeCondition::Always | EdgeCondition::OnSuccess => succeeded,
                EdgeCondition::OnFailure => !succeeded,
                EdgeCondition::Conditional { expr } => succeeded && evaluate_condition(expr, &ctx),
                EdgeCondition::LoopContinue => succeeded && continuing,
                EdgeCondition::LoopExit => succeeded && !continuing,
            };
            if fire {
                self.traverse(control, index, edge).await?;
                fired += 1;
            }
        }

        if fired > 0 || (succeeded && !has_outgoing) {
            return Ok(());
        }

        let ctx = journal.context();
        let other_work = !running.is_empty()
            || !ctx.queued.is_empty()
            || !ctx.current_nodes.is_empty()
            || !ctx.pending_human.is_empty();
        if other_work {
            debug!(run_id = %journal.run_id(), node = %node.id, "Branch ended");
            return Ok(());
        }

        let (cause, message) = match failure {
            Some((cause, message)) => (
                cause,
                format!("node '{}' failed with no on_failure edge: {}", node.id, message),
            ),
            None => (
                FailureCause::DeadEnd,
                format!("no outgoing edge of '{}' matched", node.id),
            ),
        };
        warn!(run_id = %journal.run_id(), node = %node.id, cause = %cause, "Run failed");
        journal
            .append(
                Emitter::Engine,
                EventKind::RunFailed {
                    cause,
                    message,
                    origin_seq,
                },
            )
            .await?;
        Ok(())
    }

    async fn traverse(&self, control: &Arc<RunControl>, index: usize, edge: &Edge) -> Result<()> {
        let journal = &control.journal;
        journal
            .append(
                Emitter::Engine,
                EventKind::EdgeTraversed {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                },
            )
            .await?;

        let ctx = journal.context();
        let target = control.node(&edge.to)?;
        let ready = control.topology.is_back_edge(index)
            || match target.join {
                JoinPolicy::Any => true,
                JoinPolicy::All => match control.topology.forward_preds(&edge.to) {
                    Some(preds) => ctx
                        .arrivals
                        .get(&edge.to)
                        .is_some_and(|arrived| preds.is_subset(arrived)),
                    None => true,
                },
            };

        if !ready {
            debug!(run_id = %journal.run_id(), node = %edge.to, "Join waiting for predecessors");
            return Ok(());
        }

        let id = edge.to.as_str();
        if ctx.queued.iter().any(|n| n == id) || ctx.current_nodes.contains(id) {
            return Ok(());
        }
        let ran = ctx.node_results.contains_key(id) || ctx.failed_nodes.contains_key(id);
        if ran && !control.topology.repeatable.contains(id) {
            debug!(run_id = %journal.run_id(), node = id, "Node already ran, not queueing again");
            return Ok(());
        }
        journal
            .append(
                Emitter::Engine,
                EventKind::NodeQueued {
                    node_id: id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Loop nodes only count iterations, so they are evaluated on the driver.
    async fn run_loop(
        &self,
        control: &Arc<RunControl>,
        node: &Node,
        running: &HashSet<String>,
    ) -> Result<()> {
        let NodeKind::Loop {
            max_iterations,
            condition,
        } = &node.kind
        else {
            return Ok(());
        };
        let journal = &control.journal;

        journal
            .append(
                Emitter::Engine,
                EventKind::NodeActivated {
                    node_id: node.id.clone(),
                },
            )
            .await?;
        let ctx = journal.context();
        let iteration = ctx.loop_iterations.get(&node.id).copied().unwrap_or(0) + 1;
        let holds = condition
            .as_deref()
            .map_or(true, |expr| evaluate_condition(expr, &ctx));
        let continuing = iteration <= *max_iterations && holds;

        journal
            .append(
                Emitter::Engine,
                EventKind::LoopIteration {
                    node_id: node.id.clone(),
                    iteration,
                    continuing,
                },
            )
            .await?;
        let done = journal
            .append(
                Emitter::Engine,
                EventKind::NodeCompleted {
                    node_id: node.id.clone(),
                    output: json!({ "iteration": iteration, "continuing": continuing }),
                },
            )
            .await?;
        debug!(run_id = %journal.run_id(), node = %node.id, iteration, continuing, "Loop evaluated");

        self.follow_edges(control, node, None, done.seq, running)
            .await
    }

    async fn finish_run(&self, control: &Arc<RunControl>, ctx: &ExecutionContext) -> Result<()> {
        let journal = &control.journal;
        let starved = ctx.arrivals.iter().find(|(node, arrived)| {
            !arrived.is_empty()
                && !ctx.node_results.contains_key(*node)
                && !ctx.failed_nodes.contains_key(*node)
        });

        match starved {
            Some((node_id, _)) => {
                let message = format!(
                    "join at '{}' never received all of its predecessors",
                    node_id
                );
                warn!(run_id = %journal.run_id(), node = %node_id, "Run failed at an unsatisfied join");
                journal
                    .append(
                        Emitter::Engine,
                        EventKind::RunFailed {
                            cause: FailureCause::DeadEnd,
                            message,
                            origin_seq: ctx.last_seq.unwrap_or(0),
                        },
                    )
                    .await?;
            }
            None => {
                journal
                    .append(Emitter::Engine, EventKind::RunCompleted {})
                    .await?;
                info!(
                    run_id = %journal.run_id(),
                    nodes = ctx.node_results.len(),
                    input_tokens = ctx.usage.input_tokens,
                    output_tokens = ctx.usage.output_tokens,
                    "Run completed"
                );
            }
        }
        Ok(())
    }

    async fn fail_on_timeout(&self, control: &Arc<RunControl>) -> Result<()> {
        let secs = self.services.config.engine.run_timeout_secs.unwrap_or(0);
        let message = format!("run exceeded its {}s deadline", secs);
        warn!(run_id = %control.journal.run_id(), timeout_secs = secs, "Run timed out");

        let failure = control
            .journal
            .append(
                Emitter::Engine,
                EventKind::Failure {
                    node_id: None,
                    cause: FailureCause::Timeout,
                    message: message.clone(),
                    critical: false,
                },
            )
            .await?;
        control.cancel.cancel();
        control
            .journal
            .append(
                Emitter::Engine,
                EventKind::RunFailed {
                    cause: FailureCause::Timeout,
                    message,
                    origin_seq: failure.seq,
                },
            )
            .await?;
        Ok(())
    }

    /// After cancellation in-flight nodes get a grace period; otherwise they are aborted.
    async fn drain(&self, control: &Arc<RunControl>, tasks: &mut JoinSet<(String, NodeOutcome)>) {
        if tasks.is_empty() {
            return;
        }
        if control.cancel.is_cancelled() {
            let grace = Duration::from_secs(self.services.config.engine.cancel_grace_secs);
            let finished = tokio::time::timeout(grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if finished.is_err() {
                warn!(
                    run_id = %control.journal.run_id(),
                    in_flight = tasks.len(),
                    "Grace period elapsed, aborting in-flight nodes"
                );
            }
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

async fn report(control: &RunControl) -> RunReport {
    RunReport {
        run_id: control.journal.run_id().clone(),
        context: control.journal.context(),
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Another task made the run terminal between our read and our append.
fn ended_concurrently(e: &TesseraError) -> bool {
    matches!(e, TesseraError::RunTerminal { .. })
}

async fn execute_node(
    services: Arc<NodeServices>,
    journal: Arc<RunJournal>,
    node: Node,
    input: Value,
    feedback: Option<Value>,
    cancel: CancellationToken,
) -> NodeOutcome {
    match &node.kind {
        NodeKind::Agent {
            instructions,
            system_prompt,
            tools,
            max_iterations,
            compaction,
        } => {
            if let Some(response) = feedback.as_ref().filter(|r| !approval_decision(r)) {
                return NodeOutcome::Failed {
                    cause: FailureCause::Human,
                    message: format!("human stopped the agent: {}", render(response)),
                };
            }

            let mut executor = AgentExecutor::new(
                services.llm.clone(),
                services.tools.clone(),
                services.config.model.clone(),
                services.config.agent.clone(),
                services.config.compaction.clone(),
                services.summarizer.clone(),
            );
            if let Some(counter) = &services.counter {
                executor = executor.with_counter(counter.clone());
            }
            let task = AgentTask {
                node_id: node.id.clone(),
                instructions: instructions.clone(),
                input,
                system_prompt: system_prompt.clone(),
                tools: tools.clone(),
                max_iterations: *max_iterations,
                compaction: compaction.clone(),
            };

            match executor.run(&journal, &task, &cancel).await {
                Ok(AgentOutcome::Success(output)) => NodeOutcome::Completed(output),
                Ok(AgentOutcome::Failure(message)) => NodeOutcome::Failed {
                    cause: FailureCause::Agent,
                    message,
                },
                Ok(AgentOutcome::AwaitingHuman { .. }) => NodeOutcome::AwaitingHuman,
                Ok(AgentOutcome::Cancelled) => NodeOutcome::Cancelled,
                Err(e) => NodeOutcome::Failed {
                    cause: FailureCause::Agent,
                    message: e.to_string(),
                },
            }
        }
        NodeKind::Tool { tool, arguments } => {
            let args = if arguments.is_null() {
                input
            } else {
                arguments.clone()
            };
            run_tool(&services, &journal, &node.id, tool, args, &cancel).await
        }
        NodeKind::Function {
            function,
            arguments,
        } => {
            let mut payload = input;
            if let Value::Object(map) = &mut payload {
                map.insert("arguments".to_string(), arguments.clone());
            }
            match services.functions.call(function, payload) {
                Ok(output) => NodeOutcome::Completed(output),
                Err(e) => NodeOutcome::Failed {
                    cause: FailureCause::Function,
                    message: e.to_string(),
                },
            }
        }
        NodeKind::HumanApproval { prompt, options } => match feedback {
            Some(response) if approval_decision(&response) => {
                NodeOutcome::Completed(json!({ "approved": true, "response": response }))
            }
            Some(response) => NodeOutcome::Failed {
                cause: FailureCause::Human,
                message: format!("rejected: {}", render(&response)),
            },
            None => {
                let request = EventKind::HumanRequest {
                    request_id: Uuid::new_v4().to_string(),
                    node_id: node.id.clone(),
                    context: prompt.clone(),
                    options: options.clone(),
                };
                match journal.append(Emitter::node(&node.id), request).await {
                    Ok(_) => NodeOutcome::AwaitingHuman,
                    Err(e) => NodeOutcome::Failed {
                        cause: FailureCause::Human,
                        message: e.to_string(),
                    },
                }
            }
        },
        NodeKind::Loop { .. } => NodeOutcome::Failed {
            cause: FailureCause::Panic,
            message: "loop nodes are evaluated by the driver".to_string(),
        },
    }
}

async fn run_tool(
    services: &NodeServices,
    journal: &RunJournal,
    node_id: &str,
    tool: &str,
    arguments: Value,
    cancel: &CancellationToken,
) -> NodeOutcome {
    let emitter = Emitter::node(node_id);
    let call_id = format!("{}-{}", node_id, Uuid::new_v4().simple());

    let call = EventKind::ToolCall {
        call_id: call_id.clone(),
        tool: tool.to_string(),
        arguments: arguments.clone(),
    };
    if let Err(e) = journal.append(emitter.clone(), call).await {
        return NodeOutcome::Failed {
            cause: FailureCause::Tool,
            message: e.to_string(),
        };
    }

    let ctx = ToolContext::new(journal.run_id().clone(), node_id);
    let result = services.tools.invoke(tool, arguments, ctx).await;

    if cancel.is_cancelled() {
        let note = EventKind::Annotation {
            note: "tool finished after cancellation".to_string(),
            detail: json!({ "call_id": call_id, "tool": tool, "result": result }),
        };
        if let Err(e) = journal.append(emitter, note).await {
            warn!(node = node_id, error = %e, "Could not record late tool result");
        }
        return NodeOutcome::Cancelled;
    }

    let outcome = if result.is_success() {
        NodeOutcome::Completed(result.output.clone())
    } else {
        NodeOutcome::Failed {
            cause: FailureCause::Tool,
            message: result
                .error
                .clone()
                .unwrap_or_else(|| format!("{} failed", tool)),
        }
    };
    let recorded = journal
        .append(
            emitter,
            EventKind::ToolResult {
                call_id,
                tool: tool.to_string(),
                result,
            },
        )
        .await;
    match recorded {
        Ok(_) => outcome,
        Err(e) => NodeOutcome::Failed {
            cause: FailureCause::Tool,
            message: e.to_string(),
        },
    }
}

/// `{"input": ..., "upstream": {pred: result}, "variables": {...}}`
fn node_input(graph: &WorkflowGraph, node_id: &str, ctx: &ExecutionContext) -> Value {
    let mut upstream = Map::new();
    for (_, edge) in graph.incoming(node_id) {
        if let Some(result) = ctx.node_results.get(&edge.from) {
            upstream.insert(edge.from.clone(), result.clone());
        }
    }
    json!({
        "input": ctx.input,
        "upstream": upstream,
        "variables": ctx.variables,
    })
}

/// Whether a human response lets the node go ahead.
fn approval_decision(response: &Value) -> bool {
    match response {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::String(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "reject" | "rejected" | "deny" | "denied" | "no" | "abort" | "false"
        ),
        Value::Object(map) => map
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        _ => true,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("node panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("node panicked: {}", s)
    } else {
        "node panicked".to_string()
    }
}
