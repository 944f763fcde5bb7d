//! Run events: the immutable, ordered facts every run is derived from.
//!
//! An `Event` is the envelope (`id`, `seq`, `timestamp`, `emitter`) around an
//! `EventKind`, a tagged union of everything the engine, agents, compactor and
//! triggers can record. Persisted form is the flat `EventRecord`
//! (`event_type` + JSON `payload`); records whose type this build does not
//! know decode into `EventKind::Unknown` instead of failing, so older
//! binaries can still replay logs written by newer ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::CompactionStrategy;
use crate::error::{Result, TesseraError};
use crate::types::{ExecutionResult, TokenUsage};

/// Who appended an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Emitter {
    /// The workflow engine (scheduling and lifecycle).
    Engine,
    /// A node's own namespace (agent think-act loop, tool node).
    Node(String),
    /// The context compactor.
    Compactor,
    /// A trigger that started or resumed the run.
    Trigger(String),
    /// An external caller (control surface, human feedback).
    External,
}

impl Emitter {
    pub fn node(id: impl Into<String>) -> Self {
        Self::Node(id.into())
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Node(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine => f.write_str("engine"),
            Self::Node(id) => write!(f, "node:{}", id),
            Self::Compactor => f.write_str("compactor"),
            Self::Trigger(name) => write!(f, "trigger:{}", name),
            Self::External => f.write_str("external"),
        }
    }
}

impl From<Emitter> for String {
    fn from(e: Emitter) -> Self {
        e.to_string()
    }
}

impl TryFrom<String> for Emitter {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "engine" => Ok(Self::Engine),
            "compactor" => Ok(Self::Compactor),
            "external" => Ok(Self::External),
            other => {
                if let Some(id) = other.strip_prefix("node:") {
                    Ok(Self::Node(id.to_string()))
                } else if let Some(name) = other.strip_prefix("trigger:") {
                    Ok(Self::Trigger(name.to_string()))
                } else {
                    Err(format!("unknown emitter: {}", other))
                }
            }
        }
    }
}

/// The slice of a log a compiled view or compaction applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Every event in the log.
    All,
    /// Only events emitted under one node's namespace.
    Node(String),
}

impl Scope {
    pub fn node(id: impl Into<String>) -> Self {
        Self::Node(id.into())
    }

    /// Whether `event` belongs to this scope.
    pub fn contains(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Node(id) => event.emitter.node_id() == Some(id.as_str()),
        }
    }

    /// Whether coverage recorded under `other` can overlap coverage under `self`.
    pub fn overlaps(&self, other: &Scope) -> bool {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => true,
            (Self::Node(a), Self::Node(b)) => a == b,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Node(id) => write!(f, "node:{}", id),
        }
    }
}

/// Why a node or run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Agent,
    Tool,
    Function,
    Timeout,
    Human,
    Panic,
    DeadEnd,
    CriticalNode,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Function => "function",
            Self::Timeout => "timeout",
            Self::Human => "human",
            Self::Panic => "panic",
            Self::DeadEnd => "dead_end",
            Self::CriticalNode => "critical_node",
        };
        f.write_str(s)
    }
}

/// Error classes tracked by the agent circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Parse,
    Llm,
    Tool,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Parse => "parse",
            Self::Llm => "llm",
            Self::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// Inferred kind of work in a compacted range; selects the summary template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    General,
    ToolSequence,
    Exploratory,
}

/// Which summarizer produced a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizerKind {
    Llm,
    RuleBased,
}

/// A synthetic event summarizing a contiguous range of earlier events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactedEvent {
    pub covers_from_seq: u64,
    pub covers_to_seq: u64,
    pub summary_text: String,
    /// `covered_tokens / summary_tokens`.
    pub compaction_ratio: f64,
    pub created_at: DateTime<Utc>,
    pub scope: Scope,
    pub strategy: CompactionStrategy,
    pub task_type: TaskType,
    pub summarizer: SummarizerKind,
    pub covered_events: usize,
    pub covered_tokens: usize,
    pub summary_tokens: usize,
}

impl CompactedEvent {
    /// Whether `event` is hidden behind this summary in a compiled view.
    pub fn covers(&self, event: &Event) -> bool {
        !event.is_compaction()
            && self.scope.contains(event)
            && event.seq >= self.covers_from_seq
            && event.seq <= self.covers_to_seq
    }

    /// Whether two compactions cover a common event.
    pub fn intersects(&self, other: &CompactedEvent) -> bool {
        self.scope.overlaps(&other.scope)
            && self.covers_from_seq <= other.covers_to_seq
            && other.covers_from_seq <= self.covers_to_seq
    }
}

/// Discriminated union of every event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    // Run lifecycle
    RunStarted {
        workflow: String,
        #[serde(default)]
        input: Value,
    },
    Paused {
        #[serde(default)]
        reason: Option<String>,
    },
    Resumed {},
    Cancelled {
        #[serde(default)]
        reason: Option<String>,
    },
    RunCompleted {},
    RunFailed {
        cause: FailureCause,
        message: String,
        origin_seq: u64,
    },

    // Graph traversal
    NodeQueued {
        node_id: String,
    },
    NodeActivated {
        node_id: String,
    },
    EdgeTraversed {
        from: String,
        to: String,
    },
    NodeCompleted {
        node_id: String,
        #[serde(default)]
        output: Value,
    },
    Failure {
        #[serde(default)]
        node_id: Option<String>,
        cause: FailureCause,
        message: String,
        #[serde(default)]
        critical: bool,
    },
    VariableSet {
        key: String,
        value: Value,
    },
    LoopIteration {
        node_id: String,
        iteration: u32,
        continuing: bool,
    },

    // Agent think-act loop (emitted under `node:<id>`)
    AgentThought {
        content: String,
        #[serde(default)]
        usage: TokenUsage,
    },
    ToolCall {
        call_id: String,
        tool: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        tool: String,
        result: ExecutionResult,
    },
    AgentError {
        class: ErrorClass,
        message: String,
        consecutive: u32,
    },
    AgentFinished {
        #[serde(default)]
        output: Value,
    },

    // Human in the loop
    HumanRequest {
        request_id: String,
        node_id: String,
        context: String,
        #[serde(default)]
        options: Vec<String>,
    },
    HumanFeedback {
        request_id: String,
        response: Value,
    },

    // Context compaction
    Compacted(CompactedEvent),

    // Audit trail; accepted even after the run is terminal.
    Annotation {
        note: String,
        #[serde(default)]
        detail: Value,
    },

    /// A record written by a newer build; kept verbatim, skipped on replay.
    #[serde(skip)]
    Unknown { event_type: String, payload: Value },
}

const KNOWN_TYPES: &[&str] = &[
    "run_started",
    "paused",
    "resumed",
    "cancelled",
    "run_completed",
    "run_failed",
    "node_queued",
    "node_activated",
    "edge_traversed",
    "node_completed",
    "failure",
    "variable_set",
    "loop_iteration",
    "agent_thought",
    "tool_call",
    "tool_result",
    "agent_error",
    "agent_finished",
    "human_request",
    "human_feedback",
    "compacted",
    "annotation",
];

impl EventKind {
    /// The wire name of this event type.
    pub fn type_name(&self) -> &str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::Paused { .. } => "paused",
            Self::Resumed {} => "resumed",
            Self::Cancelled { .. } => "cancelled",
            Self::RunCompleted {} => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::NodeQueued { .. } => "node_queued",
            Self::NodeActivated { .. } => "node_activated",
            Self::EdgeTraversed { .. } => "edge_traversed",
            Self::NodeCompleted { .. } => "node_completed",
            Self::Failure { .. } => "failure",
            Self::VariableSet { .. } => "variable_set",
            Self::LoopIteration { .. } => "loop_iteration",
            Self::AgentThought { .. } => "agent_thought",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::AgentError { .. } => "agent_error",
            Self::AgentFinished { .. } => "agent_finished",
            Self::HumanRequest { .. } => "human_request",
            Self::HumanFeedback { .. } => "human_feedback",
            Self::Compacted(_) => "compacted",
            Self::Annotation { .. } => "annotation",
            Self::Unknown { event_type, .. } => event_type.as_str(),
        }
    }

    pub fn is_known_type(name: &str) -> bool {
        KNOWN_TYPES.contains(&name)
    }

    /// Events that may still be appended after the run reached a terminal status.
    pub fn is_audit(&self) -> bool {
        matches!(self, Self::Annotation { .. })
    }

    /// Events that move the run into a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted {} | Self::RunFailed { .. } | Self::Cancelled { .. }
        )
    }
}

/// An immutable, sequenced record in a run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub emitter: Emitter,
    pub kind: EventKind,
}

/// Flat persisted representation of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub emitter: String,
    pub payload: Value,
}

impl Event {
    pub fn new(seq: u64, emitter: Emitter, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            seq,
            timestamp: Utc::now(),
            emitter,
            kind,
        }
    }

    pub fn event_type(&self) -> &str {
        self.kind.type_name()
    }

    pub fn is_compaction(&self) -> bool {
        matches!(self.kind, EventKind::Compacted(_))
    }

    pub fn as_compaction(&self) -> Option<&CompactedEvent> {
        match &self.kind {
            EventKind::Compacted(c) => Some(c),
            _ => None,
        }
    }

    /// Convert to the flat record written by stores.
    pub fn to_record(&self) -> Result<EventRecord> {
        let payload = match &self.kind {
            EventKind::Unknown { payload, .. } => payload.clone(),
            kind => {
                let mut tagged = serde_json::to_value(kind)?;
                tagged
                    .get_mut("payload")
                    .map(Value::take)
                    .unwrap_or(Value::Null)
            }
        };

        Ok(EventRecord {
            id: self.id.clone(),
            seq: self.seq,
            timestamp: self.timestamp,
            event_type: self.event_type().to_string(),
            emitter: self.emitter.to_string(),
            payload,
        })
    }

    /// Decode a persisted record. Unknown types become `EventKind::Unknown`;
    /// a known type with an undecodable payload is a corrupt log.
    pub fn from_record(record: EventRecord) -> Result<Self> {
        let emitter = Emitter::try_from(record.emitter).map_err(|message| {
            TesseraError::CorruptEvent {
                seq: record.seq,
                message,
            }
        })?;

        let kind = if EventKind::is_known_type(&record.event_type) {
            let tagged = serde_json::json!({
                "type": record.event_type,
                "payload": record.payload,
            });
            serde_json::from_value(tagged).map_err(|e| TesseraError::CorruptEvent {
                seq: record.seq,
                message: e.to_string(),
            })?
        } else {
            EventKind::Unknown {
                event_type: record.event_type,
                payload: record.payload,
            }
        };

        Ok(Self {
            id: record.id,
            seq: record.seq,
            timestamp: record.timestamp,
            emitter,
            kind,
        })
    }

    /// One-line human-readable rendering, used for prompts and token estimates.
    pub fn describe(&self) -> String {
        match &self.kind {
            EventKind::RunStarted { workflow, input } => {
                format!("run started: workflow '{}' with input {}", workflow, input)
            }
            EventKind::Paused { reason } => {
                format!("run paused{}", reason_suffix(reason.as_deref()))
            }
            EventKind::Resumed {} => "run resumed".to_string(),
            EventKind::Cancelled { reason } => {
                format!("run cancelled{}", reason_suffix(reason.as_deref()))
            }
            EventKind::RunCompleted {} => "run completed".to_string(),
            EventKind::RunFailed {
                cause,
                message,
                origin_seq,
            } => format!("run failed ({}) at seq {}: {}", cause, origin_seq, message),
            EventKind::NodeQueued { node_id } => format!("node '{}' queued", node_id),
            EventKind::NodeActivated { node_id } => format!("node '{}' activated", node_id),
            EventKind::EdgeTraversed { from, to } => format!("edge {} -> {}", from, to),
            EventKind::NodeCompleted { node_id, output } => {
                format!("node '{}' completed: {}", node_id, output)
            }
            EventKind::Failure {
                node_id,
                cause,
                message,
                ..
            } => format!(
                "node '{}' failed ({}): {}",
                node_id.as_deref().unwrap_or("-"),
                cause,
                message
            ),
            EventKind::VariableSet { key, value } => format!("set {} = {}", key, value),
            EventKind::LoopIteration {
                node_id,
                iteration,
                continuing,
            } => format!(
                "loop '{}' iteration {} ({})",
                node_id,
                iteration,
                if *continuing { "continue" } else { "exit" }
            ),
            EventKind::AgentThought { content, .. } => format!("assistant: {}", content),
            EventKind::ToolCall {
                tool, arguments, ..
            } => format!("call {}({})", tool, arguments),
            EventKind::ToolResult { tool, result, .. } => match &result.error {
                Some(err) => format!("{} -> error: {}", tool, err),
                None => format!("{} -> ok: {}", tool, result.output),
            },
            EventKind::AgentError {
                class,
                message,
                consecutive,
            } => format!("{} error #{}: {}", class, consecutive, message),
            EventKind::AgentFinished { output } => format!("finished: {}", output),
            EventKind::HumanRequest {
                context, options, ..
            } => format!(
                "human input requested: {} (options: {})",
                context,
                options.join(", ")
            ),
            EventKind::HumanFeedback { response, .. } => format!("human feedback: {}", response),
            EventKind::Compacted(c) => format!(
                "summary of events {}-{}: {}",
                c.covers_from_seq, c.covers_to_seq, c.summary_text
            ),
            EventKind::Annotation { note, .. } => format!("note: {}", note),
            EventKind::Unknown { event_type, .. } => format!("unknown event '{}'", event_type),
        }
    }
}

fn reason_suffix(reason: Option<&str>) -> String {
    reason.map(|r| format!(": {}", r)).unwrap_or_default()
}
