use thiserror::Error;

#[derive(Debug, Error)]
pub enum TesseraError {
    // Event log errors
    #[error("Sequence conflict: expected seq {expected}, got {actual}")]
    SequenceConflict { expected: u64, actual: u64 },

    #[error("Cannot resume run {run_id}: {message}")]
    Resume { run_id: String, message: String },

    #[error("Run {run_id} is {status}; only audit annotations may be appended")]
    RunTerminal { run_id: String, status: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Corrupt event at seq {seq}: {message}")]
    CorruptEvent { seq: u64, message: String },

    // Compaction errors
    #[error("Compaction failed: {0}")]
    Compaction(String),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    Parse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    // Graph construction errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Cycle detected through node '{0}' (cycles must pass through a loop node)")]
    Cycle(String),

    #[error("Node '{0}' is unreachable from the entry node")]
    UnreachableNode(String),

    // Execution errors
    #[error("Timeout after {timeout_secs}s: {scope}")]
    Timeout { scope: String, timeout_secs: u64 },

    #[error("Critical node '{node_id}' failed (seq {seq}): {message}")]
    CriticalNodeFailure {
        node_id: String,
        seq: u64,
        message: String,
    },

    #[error("Run failed (seq {seq}): {message}")]
    RunFailed { seq: u64, message: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Background task failed: {0}")]
    Join(String),

    // Trigger errors
    #[error("Trigger dispatch failed: {trigger}: {message}")]
    Trigger { trigger: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TesseraError>;
