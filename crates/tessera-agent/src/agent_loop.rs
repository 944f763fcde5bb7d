use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tessera_core::config::{AgentConfig, CompactionConfig, ModelConfig};
use tessera_core::error::{Result, TesseraError};
use tessera_core::event::{Emitter, ErrorClass, EventKind, Scope};
use tessera_core::traits::LlmClient;
use tessera_core::types::{LlmResponse, ToolCall, ToolContext};
use tessera_tools::ToolRegistry;

use crate::compaction::{Compactor, ContextCompiler, EventSummarizer};
use crate::context::{finish_tool_definition, PromptBuilder, FINISH_TOOL};
use crate::journal::RunJournal;
use crate::tokens::TokenCounter;

/// What an agent node is asked to do.
#[derive(Debug, Clone, Default)]
pub struct AgentTask {
    pub node_id: String,
    pub instructions: String,
    pub input: Value,
    pub system_prompt: Option<String>,
    /// Tool names offered to the model; empty means every registered tool.
    pub tools: Vec<String>,
    pub max_iterations: Option<usize>,
    pub compaction: Option<CompactionConfig>,
}

/// How a think-act loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Success(Value),
    Failure(String),
    /// The error breaker asked a human; the node resumes once feedback arrives.
    AwaitingHuman { request_id: String },
    Cancelled,
}

/// Phases of the think-act loop, logged as the agent moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Thinking,
    Acting,
    Finishing,
    ErrorHandling,
    AwaitingHuman,
    Terminal,
}

/// A structured action parsed from a model response.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    Tools(Vec<ToolCall>),
    Finish(Value),
}

/// Consecutive errors of one class.
#[derive(Debug, Default)]
struct ErrorStreak {
    current: Option<(ErrorClass, u32)>,
}

impl ErrorStreak {
    fn record(&mut self, class: ErrorClass) -> u32 {
        let count = match self.current {
            Some((c, n)) if c == class => n + 1,
            _ => 1,
        };
        self.current = Some((class, count));
        count
    }

    fn clear(&mut self, class: ErrorClass) {
        if matches!(self.current, Some((c, _)) if c == class) {
            self.current = None;
        }
    }
}

/// Runs the think-act loop of one agent node against the run journal.
pub struct AgentExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    model: ModelConfig,
    config: AgentConfig,
    compaction: CompactionConfig,
    counter: TokenCounter,
    summarizer: Option<Arc<dyn EventSummarizer>>,
    compactor: Compactor,
}

impl AgentExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        model: ModelConfig,
        config: AgentConfig,
        compaction: CompactionConfig,
        summarizer: Option<Arc<dyn EventSummarizer>>,
    ) -> Self {
        let counter = TokenCounter::from_config(&model);
        Self {
            compactor: Compactor::new(counter.clone(), summarizer.clone()),
            summarizer,
            llm,
            tools,
            model,
            config,
            compaction,
            counter,
        }
    }

    /// Use a specific token counter (tests use the heuristic one).
    pub fn with_counter(mut self, counter: TokenCounter) -> Self {
        self.compactor = Compactor::new(counter.clone(), self.summarizer.clone());
        self.counter = counter;
        self
    }

    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    pub async fn run(
        &self,
        journal: &RunJournal,
        task: &AgentTask,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome> {
        let node_id = task.node_id.as_str();
        let scope = Scope::node(node_id);
        let emitter = Emitter::node(node_id);
        let max_iterations = task.max_iterations.unwrap_or(self.config.max_iterations);
        let compaction = task.compaction.as_ref().unwrap_or(&self.compaction);

        let mut tool_defs = self.tools.definitions_for(&task.tools);
        tool_defs.push(finish_tool_definition());
        let prompt = PromptBuilder::new(self.counter.clone(), self.config.max_tool_output_tokens)
            .with_system_prompt(
                task.system_prompt
                    .as_deref()
                    .or(self.config.system_prompt.as_deref()),
            );

        let mut errors = ErrorStreak::default();
        let mut state = AgentState::Idle;

        for iteration in 0..max_iterations {
            if cancel.is_cancelled() {
                return Ok(AgentOutcome::Cancelled);
            }

            if let Err(e) = self.compactor.maybe_compact(journal, &scope, compaction).await {
                warn!(node = node_id, error = %e, "Compaction skipped");
            }

            state = transition(node_id, state, AgentState::Thinking);
            let log = journal.snapshot();
            let view = ContextCompiler::compile(&log, &scope);
            let messages = prompt.build(&task.instructions, &task.input, &tool_defs, &view);
            debug!(
                node = node_id,
                iteration,
                messages = messages.len(),
                tokens = self.counter.count_messages(&messages),
                "Invoking model"
            );

            let response = self.llm.invoke(&self.model, messages, &tool_defs).await;
            if cancel.is_cancelled() {
                return Ok(AgentOutcome::Cancelled);
            }

            let response = match response {
                Ok(r) => {
                    errors.clear(ErrorClass::Llm);
                    r
                }
                Err(e) => {
                    state = transition(node_id, state, AgentState::ErrorHandling);
                    if let Some(outcome) = self
                        .record_error(journal, task, &mut errors, ErrorClass::Llm, e.to_string())
                        .await?
                    {
                        return Ok(outcome);
                    }
                    continue;
                }
            };

            journal
                .append(
                    emitter.clone(),
                    EventKind::AgentThought {
                        content: response.content.clone(),
                        usage: response.usage,
                    },
                )
                .await?;

            let action = match parse_action(&response) {
                Ok(action) => {
                    errors.clear(ErrorClass::Parse);
                    action
                }
                Err(e) => {
                    state = transition(node_id, state, AgentState::ErrorHandling);
                    if let Some(outcome) = self
                        .record_error(journal, task, &mut errors, ErrorClass::Parse, e.to_string())
                        .await?
                    {
                        return Ok(outcome);
                    }
                    continue;
                }
            };

            match action {
                AgentAction::Finish(output) => {
                    let state = transition(node_id, state, AgentState::Finishing);
                    journal
                        .append(
                            emitter.clone(),
                            EventKind::AgentFinished {
                                output: output.clone(),
                            },
                        )
                        .await?;
                    transition(node_id, state, AgentState::Terminal);
                    info!(node = node_id, iterations = iteration + 1, "Agent finished");
                    return Ok(AgentOutcome::Success(output));
                }
                AgentAction::Tools(calls) => {
                    state = transition(node_id, state, AgentState::Acting);
                    for call in calls {
                        journal
                            .append(
                                emitter.clone(),
                                EventKind::ToolCall {
                                    call_id: call.id.clone(),
                                    tool: call.name.clone(),
                                    arguments: call.arguments.clone(),
                                },
                            )
                            .await?;

                        let ctx = ToolContext::new(journal.run_id().clone(), node_id);
                        let result = self.tools.invoke(&call.name, call.arguments, ctx).await;

                        if cancel.is_cancelled() {
                            journal
                                .append(
                                    emitter.clone(),
                                    EventKind::Annotation {
                                        note: "tool finished after cancellation".to_string(),
                                        detail: serde_json::json!({
                                            "call_id": call.id,
                                            "tool": call.name,
                                            "result": result,
                                        }),
                                    },
                                )
                                .await?;
                            return Ok(AgentOutcome::Cancelled);
                        }

                        let failure = result.error.clone().filter(|_| !result.is_success());
                        journal
                            .append(
                                emitter.clone(),
                                EventKind::ToolResult {
                                    call_id: call.id,
                                    tool: call.name.clone(),
                                    result,
                                },
                            )
                            .await?;

                        match failure {
                            Some(message) => {
                                state = transition(node_id, state, AgentState::ErrorHandling);
                                if let Some(outcome) = self
                                    .record_error(
                                        journal,
                                        task,
                                        &mut errors,
                                        ErrorClass::Tool,
                                        format!("{}: {}", call.name, message),
                                    )
                                    .await?
                                {
                                    return Ok(outcome);
                                }
                            }
                            None => errors.clear(ErrorClass::Tool),
                        }
                    }
                }
            }
        }

        transition(node_id, state, AgentState::Terminal);
        warn!(node = node_id, max_iterations, "Agent hit iteration limit");
        Ok(AgentOutcome::Failure(format!(
            "exceeded {} iterations without finishing",
            max_iterations
        )))
    }

    /// Append an `AgentError`; past the breaker limit also ask a human.
    async fn record_error(
        &self,
        journal: &RunJournal,
        task: &AgentTask,
        errors: &mut ErrorStreak,
        class: ErrorClass,
        message: String,
    ) -> Result<Option<AgentOutcome>> {
        let consecutive = errors.record(class);
        warn!(node = %task.node_id, class = %class, consecutive, error = %message, "Agent step failed");

        journal
            .append(
                Emitter::node(&task.node_id),
                EventKind::AgentError {
                    class,
                    message: message.clone(),
                    consecutive,
                },
            )
            .await?;

        if consecutive <= self.config.max_consecutive_errors {
            return Ok(None);
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        journal
            .append(
                Emitter::node(&task.node_id),
                EventKind::HumanRequest {
                    request_id: request_id.clone(),
                    node_id: task.node_id.clone(),
                    context: format!(
                        "{} consecutive {} errors, last: {}",
                        consecutive, class, message
                    ),
                    options: vec!["retry".to_string(), "abort".to_string()],
                },
            )
            .await?;
        transition(&task.node_id, AgentState::ErrorHandling, AgentState::AwaitingHuman);
        info!(node = %task.node_id, request_id = %request_id, "Agent awaiting human");
        Ok(Some(AgentOutcome::AwaitingHuman { request_id }))
    }
}

fn transition(node_id: &str, from: AgentState, to: AgentState) -> AgentState {
    if from != to {
        debug!(node = node_id, from = ?from, to = ?to, "Agent state");
    }
    to
}

/// Parse a structured action from a model response.
///
/// Native tool calls win; otherwise the text must hold a JSON action,
/// optionally inside a code fence.
pub fn parse_action(response: &LlmResponse) -> Result<AgentAction> {
    if let Some(finish) = response.tool_calls.iter().find(|c| c.name == FINISH_TOOL) {
        let output = finish
            .arguments
            .get("output")
            .cloned()
            .unwrap_or_else(|| finish.arguments.clone());
        return Ok(AgentAction::Finish(output));
    }
    if !response.tool_calls.is_empty() {
        return Ok(AgentAction::Tools(response.tool_calls.clone()));
    }

    let text = response.content.trim();
    if text.is_empty() {
        return Err(TesseraError::Parse("empty response".to_string()));
    }
    let value = extract_json(text)
        .ok_or_else(|| TesseraError::Parse("no JSON action object in response".to_string()))?;

    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| TesseraError::Parse("action object has no \"action\" field".to_string()))?;

    match action {
        "finish_task" | "finish" => Ok(AgentAction::Finish(
            value.get("output").cloned().unwrap_or(Value::Null),
        )),
        "tool" | "tool_call" => {
            let name = value
                .get("tool")
                .or_else(|| value.get("name"))
                .and_then(Value::as_str)
                .ok_or_else(|| TesseraError::Parse("tool action without a tool name".to_string()))?;
            let arguments = value
                .get("arguments")
                .or_else(|| value.get("args"))
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            Ok(AgentAction::Tools(vec![ToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                name: name.to_string(),
                arguments,
            }]))
        }
        other => Err(TesseraError::Parse(format!("unknown action '{}'", other))),
    }
}

fn extract_json(text: &str) -> Option<Value> {
    let body = strip_fence(text);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(body) {
        return Some(value);
    }
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&body[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // drop the language tag line
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
