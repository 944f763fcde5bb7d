//! Context compilation and compaction.
//!
//! `ContextCompiler` is a pure read: it turns a log into the view an agent
//! sees. `Compactor` is the only writer: it summarizes old events into a
//! `Compacted` event so later views stay under the token threshold.

pub mod compactor;
pub mod compiler;
pub mod summarizer;

pub use compactor::{plan_compaction, CompactionPlan, Compactor};
pub use compiler::{CompiledView, ContextCompiler, ViewEntry};
pub use summarizer::{infer_task_type, EventSummarizer, LlmSummarizer, RuleBasedSummarizer};
