//! `ExecutionContext`, the state of a run derived by folding its event log.
//!
//! Nothing in here is persisted. The fold is pure: the same events always
//! produce the same context, which is what makes replay, resume and audit work.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use tessera_core::event::{Event, EventKind, FailureCause};
use tessera_core::types::{RunStatus, TokenUsage};

/// An outstanding request for human input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingHuman {
    pub node_id: String,
    pub context: String,
    pub options: Vec<String>,
    pub seq: u64,
}

/// Why a run ended in `failed`, traceable to the event that caused it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalFailure {
    /// The failed node behind `origin_seq`, when there is one.
    pub node_id: Option<String>,
    pub cause: FailureCause,
    pub message: String,
    pub origin_seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionContext {
    pub workflow: Option<String>,
    pub input: Value,
    pub status: RunStatus,
    pub variables: BTreeMap<String, Value>,
    /// Latest output per completed node.
    pub node_results: BTreeMap<String, Value>,
    /// Activated nodes that have not completed or failed.
    pub current_nodes: BTreeSet<String>,
    /// Nodes waiting for a worker, in activation order.
    pub queued: Vec<String>,
    /// Predecessors that reached each node since its last activation.
    pub arrivals: BTreeMap<String, BTreeSet<String>>,
    pub failed_nodes: BTreeMap<String, String>,
    /// Open human requests keyed by request id.
    pub pending_human: BTreeMap<String, PendingHuman>,
    /// Answered human requests not yet consumed, keyed by node id.
    pub feedback: BTreeMap<String, Value>,
    /// Current iteration of each loop node that is still looping.
    pub loop_iterations: BTreeMap<String, u32>,
    pub activations: BTreeMap<String, u32>,
    pub failure: Option<TerminalFailure>,
    pub usage: TokenUsage,
    pub compactions: usize,
    pub last_seq: Option<u64>,
    #[serde(skip)]
    pub(crate) last_node_failure: Option<(u64, String)>,
}

impl ExecutionContext {
    /// Fold a sequence of events into a fresh context.
    pub fn fold<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut ctx = Self::default();
        for event in events {
            ctx.apply(event);
        }
        ctx
    }

    /// Apply one event.
    pub fn apply(&mut self, event: &Event) {
        self.last_seq = Some(event.seq);

        match &event.kind {
            EventKind::RunStarted { workflow, input } => {
                self.workflow = Some(workflow.clone());
                self.input = input.clone();
                self.status = RunStatus::Running;
            }
            EventKind::Paused { .. } => {
                if !self.status.is_terminal() {
                    self.status = RunStatus::Paused;
                }
            }
            EventKind::Resumed {} => {
                if !self.status.is_terminal() {
                    self.status = RunStatus::Running;
                }
            }
            EventKind::Cancelled { .. } => self.status = RunStatus::Cancelled,
            EventKind::RunCompleted {} => self.status = RunStatus::Completed,
            EventKind::RunFailed {
                cause,
                message,
                origin_seq,
            } => {
                self.status = RunStatus::Failed;
                let node_id = self
                    .last_node_failure
                    .as_ref()
                    .filter(|(seq, _)| seq == origin_seq)
                    .map(|(_, node)| node.clone());
                self.failure = Some(TerminalFailure {
                    node_id,
                    cause: *cause,
                    message: message.clone(),
                    origin_seq: *origin_seq,
                });
            }
            EventKind::NodeQueued { node_id } => {
                if !self.queued.contains(node_id) {
                    self.queued.push(node_id.clone());
                }
            }
            EventKind::NodeActivated { node_id } => {
                self.queued.retain(|n| n != node_id);
                self.arrivals.remove(node_id);
                self.failed_nodes.remove(node_id);
                self.current_nodes.insert(node_id.clone());
                *self.activations.entry(node_id.clone()).or_insert(0) += 1;
            }
            EventKind::EdgeTraversed { from, to } => {
                self.arrivals
                    .entry(to.clone())
                    .or_default()
                    .insert(from.clone());
            }
            EventKind::NodeCompleted { node_id, output } => {
                self.current_nodes.remove(node_id);
                self.feedback.remove(node_id);
                self.node_results.insert(node_id.clone(), output.clone());
            }
            EventKind::Failure {
                node_id, message, ..
            } => {
                if let Some(node_id) = node_id {
                    self.current_nodes.remove(node_id);
                    self.feedback.remove(node_id);
                    self.pending_human.retain(|_, p| &p.node_id != node_id);
                    self.failed_nodes.insert(node_id.clone(), message.clone());
                    self.last_node_failure = Some((event.seq, node_id.clone()));
                }
            }
            EventKind::VariableSet { key, value } => {
                self.variables.insert(key.clone(), value.clone());
            }
            EventKind::LoopIteration {
                node_id,
                iteration,
                continuing,
            } => {
                if *continuing {
                    self.loop_iterations.insert(node_id.clone(), *iteration);
                } else {
                    self.loop_iterations.remove(node_id);
                }
            }
            EventKind::AgentThought { usage, .. } => {
                self.usage.input_tokens += usage.input_tokens;
                self.usage.output_tokens += usage.output_tokens;
            }
            EventKind::HumanRequest {
                request_id,
                node_id,
                context,
                options,
            } => {
                self.feedback.remove(node_id);
                self.pending_human.insert(
                    request_id.clone(),
                    PendingHuman {
                        node_id: node_id.clone(),
                        context: context.clone(),
                        options: options.clone(),
                        seq: event.seq,
                    },
                );
            }
            EventKind::HumanFeedback {
                request_id,
                response,
            } => {
                if let Some(req) = self.pending_human.remove(request_id) {
                    self.feedback.insert(req.node_id, response.clone());
                }
            }
            EventKind::Compacted(_) => self.compactions += 1,
            EventKind::ToolCall { .. }
            | EventKind::ToolResult { .. }
            | EventKind::AgentError { .. }
            | EventKind::AgentFinished { .. }
            | EventKind::Annotation { .. } => {}
            EventKind::Unknown { event_type, .. } => {
                warn!(seq = event.seq, event_type = %event_type, "Skipping unknown event type during replay");
            }
        }
    }

    /// Whether `node_id` has an open human request.
    pub fn awaiting_human(&self, node_id: &str) -> bool {
        self.pending_human.values().any(|p| p.node_id == node_id)
    }

    /// `completed`, `failed`, `running`, `queued` or `pending`.
    pub fn node_status(&self, node_id: &str) -> &'static str {
        if self.current_nodes.contains(node_id) {
            "running"
        } else if self.queued.iter().any(|n| n == node_id) {
            "queued"
        } else if self.failed_nodes.contains_key(node_id) {
            "failed"
        } else if self.node_results.contains_key(node_id) {
            "completed"
        } else {
            "pending"
        }
    }

    /// Resolve a dotted path used by edge conditions.
    ///
    /// `input.x` reads the run input, a leading variable name reads
    /// `variables`, a node id reads that node's result, and
    /// `<node>.status` reads the node's status.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        let rest: Vec<&str> = parts.collect();

        if head == "input" {
            return navigate(&self.input, &rest);
        }
        if let Some(value) = self.variables.get(head) {
            return navigate(value, &rest);
        }
        if rest.first() == Some(&"status") && rest.len() == 1 {
            return Some(Value::String(self.node_status(head).to_string()));
        }
        if let Some(value) = self.node_results.get(head) {
            return navigate(value, &rest);
        }
        None
    }
}

fn navigate(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for key in path {
        current = match current {
            Value::Object(map) => map.get(*key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
