//! The in-memory event log of one run.
//!
//! `EventLog` is append-only and strictly sequenced. It knows nothing about
//! persistence; `RunJournal` pairs it with a `Store` and is the only thing
//! that appends in a running engine.

use std::sync::Arc;

use tessera_core::config::CompactionConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::event::{CompactedEvent, Event, Scope};
use tessera_core::types::RunId;

use crate::compaction::ContextCompiler;
use crate::state::ExecutionContext;
use crate::tokens::TokenCounter;

#[derive(Debug, Clone)]
pub struct EventLog {
    run_id: RunId,
    events: Vec<Arc<Event>>,
}

impl EventLog {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            events: Vec::new(),
        }
    }

    /// Rebuild a log from persisted events, which must be `0..n` without gaps.
    pub fn from_events(run_id: RunId, events: Vec<Event>) -> Result<Self> {
        for (expected, event) in events.iter().enumerate() {
            if event.seq != expected as u64 {
                return Err(TesseraError::Resume {
                    run_id: run_id.to_string(),
                    message: format!(
                        "non-contiguous log: expected seq {}, found {}",
                        expected, event.seq
                    ),
                });
            }
        }
        Ok(Self {
            run_id,
            events: events.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_seq(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn events(&self) -> &[Arc<Event>] {
        &self.events
    }

    pub fn get(&self, seq: u64) -> Option<&Arc<Event>> {
        self.events.get(usize::try_from(seq).ok()?)
    }

    /// Append the next event. Fails with `SequenceConflict` on any other seq.
    pub fn append(&mut self, event: Event) -> Result<Arc<Event>> {
        let expected = self.next_seq();
        if event.seq != expected {
            return Err(TesseraError::SequenceConflict {
                expected,
                actual: event.seq,
            });
        }
        let event = Arc::new(event);
        self.events.push(event.clone());
        Ok(event)
    }

    /// Fold every event with `seq >= from` into a fresh context.
    pub fn replay(&self, from: u64) -> ExecutionContext {
        ExecutionContext::fold(
            self.events
                .iter()
                .filter(|e| e.seq >= from)
                .map(|e| e.as_ref()),
        )
    }

    /// Apply the events `ctx` has not seen yet.
    pub fn replay_onto(&self, ctx: &mut ExecutionContext) {
        let from = ctx.last_seq.map(|s| s + 1).unwrap_or(0);
        for event in self.events.iter().filter(|e| e.seq >= from) {
            ctx.apply(event);
        }
    }

    /// Events with `from <= seq <= to`.
    pub fn slice(&self, from: u64, to: u64) -> &[Arc<Event>] {
        let len = self.events.len();
        let start = (from as usize).min(len);
        let end = (to as usize).saturating_add(1).min(len);
        if start >= end {
            return &[];
        }
        &self.events[start..end]
    }

    pub fn compactions(&self) -> impl Iterator<Item = &CompactedEvent> {
        self.events.iter().filter_map(|e| e.as_compaction())
    }

    /// The most recent compaction recorded for exactly `scope`.
    pub fn last_compaction(&self, scope: &Scope) -> Option<&CompactedEvent> {
        self.compactions().filter(|c| &c.scope == scope).last()
    }

    /// Highest seq covered by any compaction that can overlap `scope`.
    pub fn compaction_boundary(&self, scope: &Scope) -> Option<u64> {
        self.compactions()
            .filter(|c| c.scope.overlaps(scope))
            .map(|c| c.covers_to_seq)
            .max()
    }

    /// In-scope raw events after the compaction boundary, oldest first.
    pub fn events_since_last_compaction(&self, scope: &Scope) -> Vec<Arc<Event>> {
        let boundary = self.compaction_boundary(scope);
        self.events
            .iter()
            .filter(|e| !e.is_compaction() && scope.contains(e))
            .filter(|e| boundary.map_or(true, |b| e.seq > b))
            .cloned()
            .collect()
    }

    /// Tokens of the compiled view for `scope`.
    pub fn estimate_token_count(&self, scope: &Scope, counter: &TokenCounter) -> usize {
        ContextCompiler::compile(self, scope).token_count(counter)
    }

    /// Whether the uncompacted tail of `scope` is over the threshold and
    /// long enough to leave `overlap_events` raw after compacting.
    pub fn should_compact(
        &self,
        config: &CompactionConfig,
        scope: &Scope,
        counter: &TokenCounter,
    ) -> bool {
        if !config.enabled {
            return false;
        }
        let pending = self.events_since_last_compaction(scope);
        pending.len() > config.overlap_events
            && counter.count_events(pending.iter().map(|e| e.as_ref())) > config.token_threshold
    }
}
