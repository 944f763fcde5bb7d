use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use tessera_core::config::ModelConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::LlmClient;
use tessera_core::types::{ChatMessage, LlmResponse, ToolCall, ToolDefinition};

enum Step {
    Respond(LlmResponse),
    Fail(String),
}

#[derive(Default)]
struct Inner {
    script: VecDeque<Step>,
    repeat: Option<LlmResponse>,
    calls: Vec<Vec<ChatMessage>>,
    next_call_id: usize,
}

/// An `LlmClient` that replays a fixed script of responses.
///
/// Clones share the script and the call record, so a test can keep a handle
/// after moving the client into an executor.
#[derive(Clone, Default)]
pub struct ScriptedLlm {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, response: LlmResponse) -> Self {
        self.push(Step::Respond(response));
        self
    }

    pub fn then_text(self, text: &str) -> Self {
        self.then(LlmResponse::text(text))
    }

    /// A native tool call.
    pub fn then_tool_call(self, tool: &str, arguments: serde_json::Value) -> Self {
        let id = {
            let mut inner = self.lock();
            inner.next_call_id += 1;
            format!("call_{}", inner.next_call_id)
        };
        self.then(LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id,
                name: tool.to_string(),
                arguments,
            }],
            ..Default::default()
        })
    }

    /// A JSON `finish_task` action in the message body.
    pub fn then_finish(self, output: serde_json::Value) -> Self {
        let body = serde_json::json!({"action": "finish_task", "output": output});
        self.then_text(&body.to_string())
    }

    pub fn then_error(self, message: &str) -> Self {
        self.push(Step::Fail(message.to_string()));
        self
    }

    /// Response returned forever once the script is exhausted.
    pub fn repeating(self, response: LlmResponse) -> Self {
        self.lock().repeat = Some(response);
        self
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Messages of every invocation so far.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.lock().calls.clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock().script.len()
    }

    fn push(&self, step: Step) {
        self.lock().script.push_back(step);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LlmClient for ScriptedLlm {
    fn invoke(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
        _tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        let step = {
            let mut inner = self.lock();
            inner.calls.push(messages);
            match inner.script.pop_front() {
                Some(step) => step,
                None => match &inner.repeat {
                    Some(r) => Step::Respond(r.clone()),
                    None => Step::Fail("script exhausted".to_string()),
                },
            }
        };

        Box::pin(async move {
            match step {
                Step::Respond(r) => Ok(r),
                Step::Fail(msg) => Err(TesseraError::LlmRequest(msg)),
            }
        })
    }
}
