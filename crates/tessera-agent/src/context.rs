//! Rendering a compiled view into chat messages.

use serde_json::Value;

use tessera_core::event::{Event, EventKind};
use tessera_core::types::{ChatMessage, ContentBlock, Role, ToolDefinition};

use crate::compaction::{CompiledView, ViewEntry};
use crate::tokens::TokenCounter;

/// Name of the pseudo-tool an agent calls to end its task.
pub const FINISH_TOOL: &str = "finish_task";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a careful agent working on one step of a larger workflow.";

const PROTOCOL: &str = "\
Work in a think-act loop. Each reply must either call exactly the tools you need \
or finish the task by calling `finish_task` with the structured result as `output`.
If you cannot call tools natively, reply with a single JSON object instead:
{\"action\": \"tool\", \"tool\": \"<name>\", \"arguments\": {...}}
{\"action\": \"finish_task\", \"output\": <result>}";

pub fn finish_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: FINISH_TOOL.to_string(),
        description: "Finish the task and return its final structured output.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "output": { "description": "The result of the task" }
            },
            "required": ["output"]
        }),
    }
}

/// Builds the message list for one think step.
pub struct PromptBuilder {
    system: String,
    counter: TokenCounter,
    max_tool_output_tokens: usize,
}

impl PromptBuilder {
    pub fn new(counter: TokenCounter, max_tool_output_tokens: usize) -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            counter,
            max_tool_output_tokens,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<&str>) -> Self {
        if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
            self.system = prompt.trim().to_string();
        }
        self
    }

    /// Final system message: base prompt, protocol and tool listing.
    pub fn system_message(&self, tools: &[ToolDefinition]) -> ChatMessage {
        let mut parts = vec![self.system.clone(), PROTOCOL.to_string()];
        if !tools.is_empty() {
            let listing = tools
                .iter()
                .map(|t| format!("- {}: {}", t.name, t.description))
                .collect::<Vec<_>>()
                .join("\n");
            parts.push(format!("## Available tools\n{}", listing));
        }
        ChatMessage::system(parts.join("\n\n"))
    }

    pub fn build(
        &self,
        instructions: &str,
        input: &Value,
        tools: &[ToolDefinition],
        view: &CompiledView,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![self.system_message(tools), task_message(instructions, input)];
        for entry in &view.entries {
            self.push_entry(&mut messages, entry);
        }
        messages
    }

    fn push_entry(&self, messages: &mut Vec<ChatMessage>, entry: &ViewEntry) {
        let event = match entry {
            ViewEntry::Summary(event) => {
                if let Some(c) = event.as_compaction() {
                    push_text(
                        messages,
                        Role::User,
                        format!(
                            "[Summary of earlier events {}-{}]\n{}",
                            c.covers_from_seq, c.covers_to_seq, c.summary_text
                        ),
                    );
                }
                return;
            }
            ViewEntry::Raw(event) => event,
        };

        match &event.kind {
            EventKind::AgentThought { content, .. } => {
                if !content.trim().is_empty() {
                    push_text(messages, Role::Assistant, content.clone());
                }
            }
            EventKind::ToolCall {
                call_id,
                tool,
                arguments,
            } => push_block(
                messages,
                Role::Assistant,
                ContentBlock::ToolUse {
                    id: call_id.clone(),
                    name: tool.clone(),
                    input: arguments.clone(),
                },
            ),
            EventKind::ToolResult {
                call_id, result, ..
            } => {
                let content = match &result.error {
                    Some(err) => format!("Error: {}", err),
                    None => match &result.output {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                };
                push_block(
                    messages,
                    Role::User,
                    ContentBlock::ToolResult {
                        tool_use_id: call_id.clone(),
                        content: self.counter.truncate(&content, self.max_tool_output_tokens),
                        is_error: !result.is_success(),
                    },
                );
            }
            EventKind::AgentError { class, message, .. } => push_text(
                messages,
                Role::User,
                format!(
                    "Your last step failed ({} error): {}\nReply with a valid tool call or finish_task.",
                    class, message
                ),
            ),
            EventKind::HumanFeedback { response, .. } => push_text(
                messages,
                Role::User,
                format!("Human feedback: {}", render_value(response)),
            ),
            EventKind::AgentFinished { .. } => {}
            _ => push_text(messages, Role::User, describe(event)),
        }
    }
}

fn describe(event: &Event) -> String {
    format!("[{}] {}", event.emitter, event.describe())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn task_message(instructions: &str, input: &Value) -> ChatMessage {
    let mut text = instructions.trim().to_string();
    if !input.is_null() {
        let rendered = serde_json::to_string_pretty(input).unwrap_or_else(|_| input.to_string());
        text.push_str(&format!("\n\n## Input\n{}", rendered));
    }
    ChatMessage::user(text)
}

fn push_text(messages: &mut Vec<ChatMessage>, role: Role, text: String) {
    push_block(messages, role, ContentBlock::Text { text });
}

/// Consecutive blocks of the same role share one message.
fn push_block(messages: &mut Vec<ChatMessage>, role: Role, block: ContentBlock) {
    match messages.last_mut() {
        Some(last) if last.role == role && role != Role::System => last.content.push(block),
        _ => messages.push(ChatMessage {
            role,
            content: vec![block],
        }),
    }
}
