use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use tessera_core::config::ModelConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::event::{ErrorClass, Event, EventKind, SummarizerKind, TaskType};
use tessera_core::traits::LlmClient;
use tessera_core::types::ChatMessage;

/// Turns a range of events into summary text.
pub trait EventSummarizer: Send + Sync + 'static {
    fn kind(&self) -> SummarizerKind;

    /// Summarize `events` in roughly `budget_tokens` tokens.
    fn summarize(
        &self,
        events: Vec<Arc<Event>>,
        task_type: TaskType,
        budget_tokens: usize,
    ) -> BoxFuture<'_, Result<String>>;
}

/// Classify a range: no tool calls is dialogue, many failed tool calls is
/// exploration, anything else is a tool sequence.
pub fn infer_task_type(events: &[Arc<Event>]) -> TaskType {
    let mut tool_calls = 0usize;
    let mut failures = 0usize;
    for event in events {
        match &event.kind {
            EventKind::ToolCall { .. } => tool_calls += 1,
            EventKind::ToolResult { result, .. } if !result.is_success() => failures += 1,
            EventKind::AgentError {
                class: ErrorClass::Tool,
                ..
            } => failures += 1,
            _ => {}
        }
    }

    if tool_calls == 0 {
        TaskType::General
    } else if failures * 4 >= tool_calls {
        TaskType::Exploratory
    } else {
        TaskType::ToolSequence
    }
}

fn instructions(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::General => {
            "Summarize the conversation below. Keep decisions, facts the user \
             provided, open questions and the current goal. Drop pleasantries."
        }
        TaskType::ToolSequence => {
            "Summarize the tool activity below. For each step keep which tool was \
             called, with which key arguments, and what it returned that matters \
             for the remaining work. Keep final values exactly."
        }
        TaskType::Exploratory => {
            "Summarize the exploration below. Keep every approach that was tried \
             and failed, with the error, so it is not repeated. Keep partial \
             findings and clues about where the answer may be."
        }
    }
}

/// Summarizes through the configured model.
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self { llm, model }
    }
}

impl EventSummarizer for LlmSummarizer {
    fn kind(&self) -> SummarizerKind {
        SummarizerKind::Llm
    }

    fn summarize(
        &self,
        events: Vec<Arc<Event>>,
        task_type: TaskType,
        budget_tokens: usize,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let transcript = events
                .iter()
                .map(|e| format!("[{}] {}: {}", e.seq, e.emitter, e.describe()))
                .collect::<Vec<_>>()
                .join("\n");

            let prompt = format!(
                "{}\nUse at most {} tokens. Output only the summary.\n\n{}",
                instructions(task_type),
                budget_tokens,
                transcript
            );

            let mut model = self.model.clone();
            model.max_tokens = u32::try_from(budget_tokens).unwrap_or(u32::MAX);

            debug!(events = events.len(), task_type = ?task_type, "Requesting summary");
            let response = self
                .llm
                .invoke(&model, vec![ChatMessage::user(prompt)], &[])
                .await
                .map_err(|e| TesseraError::Compaction(e.to_string()))?;

            let text = response.content.trim();
            if text.is_empty() {
                return Err(TesseraError::Compaction(
                    "summarizer returned empty text".to_string(),
                ));
            }
            Ok(text.to_string())
        })
    }
}

/// Deterministic summary built from the events themselves. Never fails.
pub struct RuleBasedSummarizer;

impl RuleBasedSummarizer {
    pub fn summarize_now(events: &[Arc<Event>], task_type: TaskType) -> String {
        let mut lines = Vec::new();
        let (from, to) = match (events.first(), events.last()) {
            (Some(f), Some(l)) => (f.seq, l.seq),
            _ => return "No events.".to_string(),
        };
        lines.push(format!("{} events ({}-{}).", events.len(), from, to));

        let mut tools: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        let mut failures = Vec::new();
        let mut last_thought = None;
        let mut feedback = Vec::new();

        for event in events {
            match &event.kind {
                EventKind::ToolResult { tool, result, .. } => {
                    let entry = tools.entry(tool.as_str()).or_default();
                    entry.0 += 1;
                    if !result.is_success() {
                        entry.1 += 1;
                        if let Some(err) = &result.error {
                            failures.push(format!("{}: {}", tool, err));
                        }
                    }
                }
                EventKind::AgentError { class, message, .. } => {
                    failures.push(format!("{} error: {}", class, message));
                }
                EventKind::AgentThought { content, .. } if !content.trim().is_empty() => {
                    last_thought = Some(content.trim());
                }
                EventKind::HumanFeedback { response, .. } => {
                    feedback.push(response.to_string());
                }
                _ => {}
            }
        }

        if !tools.is_empty() {
            let used = tools
                .iter()
                .map(|(name, (calls, failed))| {
                    if *failed > 0 {
                        format!("{} x{} ({} failed)", name, calls, failed)
                    } else {
                        format!("{} x{}", name, calls)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("Tools: {}.", used));
        }

        if !failures.is_empty() {
            let keep = if task_type == TaskType::Exploratory {
                failures.len()
            } else {
                failures.len().min(3)
            };
            lines.push("Failed attempts:".to_string());
            for failure in failures.iter().rev().take(keep).rev() {
                lines.push(format!("- {}", failure));
            }
        }

        if !feedback.is_empty() {
            lines.push(format!("Human feedback: {}", feedback.join("; ")));
        }
        if let Some(thought) = last_thought {
            lines.push(format!("Last reasoning: {}", thought));
        }
        lines.join("\n")
    }
}

impl EventSummarizer for RuleBasedSummarizer {
    fn kind(&self) -> SummarizerKind {
        SummarizerKind::RuleBased
    }

    fn summarize(
        &self,
        events: Vec<Arc<Event>>,
        task_type: TaskType,
        _budget_tokens: usize,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Ok(Self::summarize_now(&events, task_type)) })
    }
}
