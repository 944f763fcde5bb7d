use std::io::Write;

use tempfile::NamedTempFile;

use tessera_core::event::{Emitter, Event, EventKind};
use tessera_core::types::{ExecutionResult, TokenUsage};

/// `n` agent thoughts with seq `0..n`, all under `emitter`.
pub fn synthetic_events(n: usize, emitter: Emitter) -> Vec<Event> {
    (0..n as u64)
        .map(|seq| {
            Event::new(
                seq,
                emitter.clone(),
                EventKind::AgentThought {
                    content: format!("step {}: inspected record {} and noted nothing unusual", seq, seq),
                    usage: TokenUsage::default(),
                },
            )
        })
        .collect()
}

/// A tool call followed by its successful result, starting at `seq`.
pub fn tool_exchange(seq: u64, node: &str, tool: &str, output: serde_json::Value) -> Vec<Event> {
    let call_id = format!("call_{}", seq);
    vec![
        Event::new(
            seq,
            Emitter::node(node),
            EventKind::ToolCall {
                call_id: call_id.clone(),
                tool: tool.to_string(),
                arguments: serde_json::json!({}),
            },
        ),
        Event::new(
            seq + 1,
            Emitter::node(node),
            EventKind::ToolResult {
                call_id,
                tool: tool.to_string(),
                result: ExecutionResult::success(output),
            },
        ),
    ]
}

/// Write `contents` to a temporary `.toml` file that lives as long as the handle.
pub fn temp_toml(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write temp file");
    file.flush().expect("flush temp file");
    file
}
