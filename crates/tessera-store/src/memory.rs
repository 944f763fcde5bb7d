use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use tessera_core::error::{Result, TesseraError};
use tessera_core::event::Event;
use tessera_core::traits::Store;
use tessera_core::types::RunId;

/// Process-local event store. Runs keep their insertion order.
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<RunId, Vec<Event>>>,
    order: Mutex<Vec<RunId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn append(&self, run_id: &RunId, event: &Event) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let event = event.clone();

        Box::pin(async move {
            let mut runs = self.runs.lock().await;
            let expected = runs.get(&run_id).map_or(0, |log| log.len() as u64);
            if event.seq != expected {
                return Err(TesseraError::SequenceConflict {
                    expected,
                    actual: event.seq,
                });
            }
            if expected == 0 {
                self.order.lock().await.push(run_id.clone());
            }
            runs.entry(run_id).or_default().push(event);
            Ok(())
        })
    }

    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Event>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let runs = self.runs.lock().await;
            Ok(runs.get(&run_id).cloned().unwrap_or_default())
        })
    }

    fn list_runs(&self) -> BoxFuture<'_, Result<Vec<RunId>>> {
        Box::pin(async move { Ok(self.order.lock().await.clone()) })
    }
}
