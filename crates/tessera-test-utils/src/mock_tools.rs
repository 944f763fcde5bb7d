use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Tool;
use tessera_core::types::{ExecutionResult, ToolContext};

fn object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

/// Returns its input as output.
#[derive(Clone)]
pub struct EchoTool {
    name: String,
    calls: Arc<AtomicUsize>,
}

impl EchoTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echo the input back"
    }

    fn input_schema(&self) -> serde_json::Value {
        object_schema()
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ExecutionResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(ExecutionResult::success(input)) })
    }
}

/// Always fails with the configured message.
pub struct FailingTool {
    name: String,
    message: String,
}

impl FailingTool {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
        }
    }
}

impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn input_schema(&self) -> serde_json::Value {
        object_schema()
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ExecutionResult>> {
        Box::pin(async move {
            Err(TesseraError::ToolExecution {
                tool: self.name.clone(),
                message: self.message.clone(),
            })
        })
    }
}

/// Blocks inside `execute` until released, so tests can act while a call is in flight.
#[derive(Clone)]
pub struct GatedTool {
    name: String,
    timeout_secs: u64,
    started: Arc<Notify>,
    release: Arc<Notify>,
    calls: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl GatedTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            timeout_secs: 30,
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            calls: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Wait until a call has entered `execute`.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Let one blocked (or the next) call finish.
    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Tool for GatedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Waits for the test to release it"
    }

    fn input_schema(&self) -> serde_json::Value {
        object_schema()
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ExecutionResult>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResult::success(
                serde_json::json!({"released": true, "input": input}),
            ))
        })
    }
}
