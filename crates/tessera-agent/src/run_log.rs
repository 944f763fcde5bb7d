use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use tessera_core::bus::{BusEvent, EventBus};
use tessera_core::event::{Event, EventKind};
use tessera_core::types::RunId;

/// JSONL run logger.
///
/// Follows one run on the `EventBus` and writes a line per event to
/// `{log_dir}/{run_id}/{timestamp}.jsonl`. Lines are flushed as they are
/// written, so a crash loses at most the line in progress. The event store
/// stays the source of truth; this file is for people tailing a run.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    seq: u64,
    event_type: String,
    emitter: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl RunLogger {
    /// `level`: 1 = run lifecycle, 2 = adds node, edge, human and compaction
    /// events, 3 = everything including agent steps.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in the background until the run ends.
    pub fn spawn(self, bus: &EventBus, run_id: RunId) -> JoinHandle<()> {
        let rx = bus.subscribe();
        tokio::spawn(self.run(rx, run_id))
    }

    async fn run(self, mut rx: broadcast::Receiver<BusEvent>, run_id: RunId) {
        let run_dir = self.log_dir.join(run_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            match rx.recv().await {
                Ok(bus_event) => {
                    if bus_event.run_id != run_id {
                        continue;
                    }
                    let event: Arc<Event> = bus_event.event;
                    if let Some(entry) = self.event_to_entry(&run_id, &event) {
                        if let Ok(json) = serde_json::to_string(&entry) {
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush log");
                            }
                        }
                    }
                    if event.kind.is_terminal() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "RunLogger lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventBus closed, RunLogger stopping");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// `None` when the event is above the configured level.
    fn event_to_entry(&self, run_id: &RunId, event: &Event) -> Option<LogEntry> {
        if verbosity(&event.kind) > self.level {
            return None;
        }
        Some(LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            run_id: run_id.to_string(),
            seq: event.seq,
            event_type: event.event_type().to_string(),
            emitter: event.emitter.to_string(),
            detail: Some(truncate_chars(&event.describe(), 300)),
        })
    }
}

/// Lowest log level at which an event is written.
fn verbosity(kind: &EventKind) -> u8 {
    match kind {
        EventKind::RunStarted { .. }
        | EventKind::Paused { .. }
        | EventKind::Resumed {}
        | EventKind::Cancelled { .. }
        | EventKind::RunCompleted {}
        | EventKind::RunFailed { .. } => 1,
        EventKind::NodeQueued { .. }
        | EventKind::NodeActivated { .. }
        | EventKind::NodeCompleted { .. }
        | EventKind::EdgeTraversed { .. }
        | EventKind::Failure { .. }
        | EventKind::LoopIteration { .. }
        | EventKind::HumanRequest { .. }
        | EventKind::HumanFeedback { .. }
        | EventKind::Compacted(_) => 2,
        _ => 3,
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
