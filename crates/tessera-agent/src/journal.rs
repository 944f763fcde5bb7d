use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use tessera_core::bus::EventBus;
use tessera_core::error::{Result, TesseraError};
use tessera_core::event::{Emitter, Event, EventKind};
use tessera_core::traits::Store;
use tessera_core::types::{RunId, RunStatus};

use crate::log::EventLog;
use crate::state::ExecutionContext;

/// The log and its fold as of one sequence number.
#[derive(Clone)]
struct Published {
    log: EventLog,
    context: ExecutionContext,
}

/// The single write path of a run.
///
/// Appends are serialized by `writer`: each one is persisted to the store,
/// then added to the published log, folded into the context and sent on
/// the bus. Readers clone the published prefix and never wait for store
/// I/O; the read lock is only held while an appended event is folded in.
pub struct RunJournal {
    run_id: RunId,
    store: Arc<dyn Store>,
    bus: Option<Arc<EventBus>>,
    writer: Mutex<()>,
    published: RwLock<Arc<Published>>,
    compaction: Mutex<()>,
}

impl RunJournal {
    /// A journal for a run that has no events yet.
    pub fn new(run_id: RunId, store: Arc<dyn Store>, bus: Option<Arc<EventBus>>) -> Self {
        let log = EventLog::new(run_id.clone());
        Self::with_log(run_id, store, bus, log, ExecutionContext::default())
    }

    /// Reload a run from the store and replay it.
    pub async fn open(
        run_id: RunId,
        store: Arc<dyn Store>,
        bus: Option<Arc<EventBus>>,
    ) -> Result<Self> {
        let events = store.load(&run_id).await.map_err(|e| match e {
            TesseraError::CorruptEvent { .. } => TesseraError::Resume {
                run_id: run_id.to_string(),
                message: e.to_string(),
            },
            other => other,
        })?;
        if events.is_empty() {
            return Err(TesseraError::Resume {
                run_id: run_id.to_string(),
                message: "no persisted events".to_string(),
            });
        }

        let log = EventLog::from_events(run_id.clone(), events)?;
        let context = log.replay(0);
        debug!(run_id = %run_id, events = log.len(), status = %context.status, "Replayed run");

        Ok(Self::with_log(run_id, store, bus, log, context))
    }

    fn with_log(
        run_id: RunId,
        store: Arc<dyn Store>,
        bus: Option<Arc<EventBus>>,
        log: EventLog,
        context: ExecutionContext,
    ) -> Self {
        Self {
            run_id,
            store,
            bus,
            writer: Mutex::new(()),
            published: RwLock::new(Arc::new(Published { log, context })),
            compaction: Mutex::new(()),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Append one event.
    ///
    /// Once the run is terminal only audit annotations are accepted.
    pub async fn append(&self, emitter: Emitter, kind: EventKind) -> Result<Arc<Event>> {
        let _writer = self.writer.lock().await;

        // Only holders of `writer` change the published state.
        let current = self.current();
        let status = current.context.status;
        if status.is_terminal() && !kind.is_audit() {
            return Err(TesseraError::RunTerminal {
                run_id: self.run_id.to_string(),
                status: status.to_string(),
            });
        }

        let event = Event::new(current.log.next_seq(), emitter, kind);
        drop(current);
        self.store.append(&self.run_id, &event).await?;

        let event = {
            let mut slot = self.published.write().unwrap_or_else(|e| e.into_inner());
            // Copies only when a reader still holds the previous snapshot.
            let next = Arc::make_mut(&mut *slot);
            let event = next.log.append(event)?;
            next.context.apply(&event);
            event
        };

        if let Some(bus) = &self.bus {
            bus.publish(&self.run_id, event.clone());
        }
        Ok(event)
    }

    fn current(&self) -> Arc<Published> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The log as of the last completed append.
    pub fn snapshot(&self) -> EventLog {
        self.current().log.clone()
    }

    pub fn context(&self) -> ExecutionContext {
        self.current().context.clone()
    }

    pub fn status(&self) -> RunStatus {
        self.current().context.status
    }

    /// Claim the run's compaction slot, or `None` if another compaction is in flight.
    pub fn try_begin_compaction(&self) -> Option<MutexGuard<'_, ()>> {
        self.compaction.try_lock().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_store::MemoryStore;

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_append_persists_and_folds() {
        let store = store();
        let run_id = RunId::from_string("r1");
        let journal = RunJournal::new(run_id.clone(), store.clone(), None);

        journal
            .append(
                Emitter::Engine,
                EventKind::RunStarted {
                    workflow: "wf".into(),
                    input: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        let event = journal
            .append(Emitter::Engine, EventKind::Paused { reason: None })
            .await
            .unwrap();

        assert_eq!(event.seq, 1);
        assert_eq!(journal.status(), RunStatus::Paused);
        assert_eq!(store.load(&run_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_run_only_accepts_annotations() {
        let journal = RunJournal::new(RunId::from_string("r1"), store(), None);
        journal
            .append(Emitter::Engine, EventKind::Cancelled { reason: None })
            .await
            .unwrap();

        let err = journal
            .append(Emitter::Engine, EventKind::Resumed {})
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::RunTerminal { .. }));

        journal
            .append(
                Emitter::External,
                EventKind::Annotation {
                    note: "late tool result".into(),
                    detail: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        assert_eq!(journal.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_open_replays_persisted_events() {
        let store = store();
        let run_id = RunId::from_string("r1");
        {
            let journal = RunJournal::new(run_id.clone(), store.clone(), None);
            journal
                .append(
                    Emitter::Engine,
                    EventKind::VariableSet {
                        key: "k".into(),
                        value: serde_json::json!(1),
                    },
                )
                .await
                .unwrap();
        }

        let reopened = RunJournal::open(run_id, store, None).await.unwrap();
        assert_eq!(reopened.context().variables["k"], serde_json::json!(1));

        let next = reopened
            .append(Emitter::Engine, EventKind::Resumed {})
            .await
            .unwrap();
        assert_eq!(next.seq, 1);
    }

    #[tokio::test]
    async fn test_open_unknown_run_fails() {
        let err = RunJournal::open(RunId::from_string("nope"), store(), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TesseraError::Resume { .. }));
    }

    #[tokio::test]
    async fn test_single_compaction_slot() {
        let journal = RunJournal::new(RunId::from_string("r1"), store(), None);
        let guard = journal.try_begin_compaction();
        assert!(guard.is_some());
        assert!(journal.try_begin_compaction().is_none());
        drop(guard);
        assert!(journal.try_begin_compaction().is_some());
    }

    /// Holds every append until `release` is notified.
    struct GatedStore {
        inner: MemoryStore,
        release: Arc<tokio::sync::Notify>,
    }

    impl Store for GatedStore {
        fn append(
            &self,
            run_id: &RunId,
            event: &Event,
        ) -> futures::future::BoxFuture<'_, Result<()>> {
            let run_id = run_id.clone();
            let event = event.clone();
            Box::pin(async move {
                self.release.notified().await;
                self.inner.append(&run_id, &event).await
            })
        }

        fn load(&self, run_id: &RunId) -> futures::future::BoxFuture<'_, Result<Vec<Event>>> {
            self.inner.load(run_id)
        }

        fn list_runs(&self) -> futures::future::BoxFuture<'_, Result<Vec<RunId>>> {
            self.inner.list_runs()
        }
    }

    #[tokio::test]
    async fn test_reads_see_prefix_while_append_is_in_flight() {
        let release = Arc::new(tokio::sync::Notify::new());
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            release: release.clone(),
        });
        let journal = Arc::new(RunJournal::new(RunId::from_string("r1"), store, None));

        release.notify_one();
        journal
            .append(Emitter::Engine, EventKind::Paused { reason: None })
            .await
            .unwrap();

        let writer = journal.clone();
        let pending = tokio::spawn(async move {
            writer
                .append(Emitter::Engine, EventKind::Resumed {})
                .await
                .map(|e| e.seq)
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        // The second append is parked in the store; readers still get the first.
        assert_eq!(journal.snapshot().len(), 1);
        assert_eq!(journal.status(), RunStatus::Paused);
        assert!(!pending.is_finished());

        release.notify_one();
        assert_eq!(pending.await.unwrap().unwrap(), 1);
        assert_eq!(journal.snapshot().len(), 2);
        assert_eq!(journal.status(), RunStatus::Running);
    }

    #[tokio::test]
    async fn test_appends_are_published() {
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let journal = RunJournal::new(RunId::from_string("r1"), store(), Some(bus));
        journal
            .append(Emitter::Engine, EventKind::Resumed {})
            .await
            .unwrap();
        let published = rx.recv().await.unwrap();
        assert_eq!(published.run_id.as_str(), "r1");
        assert_eq!(published.event.seq, 0);
    }
}
