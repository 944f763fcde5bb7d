pub mod agent_loop;
pub mod compaction;
pub mod context;
pub mod engine;
pub mod graph;
pub mod journal;
pub mod log;
pub mod run_log;
pub mod state;
pub mod tokens;
pub mod trigger;

pub use agent_loop::{parse_action, AgentAction, AgentExecutor, AgentOutcome, AgentTask};
pub use compaction::{
    CompiledView, Compactor, ContextCompiler, EventSummarizer, LlmSummarizer, RuleBasedSummarizer,
    ViewEntry,
};
pub use context::PromptBuilder;
pub use engine::{RunHandle, RunReport, WorkflowEngine};
pub use graph::{Edge, EdgeCondition, JoinPolicy, Node, NodeKind, WorkflowDefinition, WorkflowGraph};
pub use journal::RunJournal;
pub use log::EventLog;
pub use run_log::RunLogger;
pub use state::ExecutionContext;
pub use tokens::TokenCounter;
pub use trigger::{Dispatch, EventDrivenTrigger, ExternalEvent, ScheduledTrigger, TriggerService};
