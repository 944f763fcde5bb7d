use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::event::Event;
use crate::types::*;

/// LLM client, the inference boundary.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and wait for the complete response.
    fn invoke(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<LlmResponse>>;
}

/// Tool execution.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ExecutionResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Persistence backend for run logs.
pub trait Store: Send + Sync + 'static {
    /// Persist one event. Fails with `SequenceConflict` unless `event.seq`
    /// is the next sequence number for the run.
    fn append(&self, run_id: &RunId, event: &Event) -> BoxFuture<'_, Result<()>>;

    /// Load every event of a run in sequence order. Empty when the run is unknown.
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Event>>>;

    /// Ids of all runs with at least one event.
    fn list_runs(&self) -> BoxFuture<'_, Result<Vec<RunId>>>;
}
