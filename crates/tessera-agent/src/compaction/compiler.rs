use std::sync::Arc;

use tessera_core::event::{CompactedEvent, Event, Scope};

use crate::log::EventLog;
use crate::tokens::TokenCounter;

/// One entry of a compiled view.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEntry {
    /// An event shown verbatim.
    Raw(Arc<Event>),
    /// A compaction standing in for the events it covers.
    Summary(Arc<Event>),
}

impl ViewEntry {
    pub fn event(&self) -> &Event {
        match self {
            Self::Raw(e) | Self::Summary(e) => e,
        }
    }

    pub fn is_summary(&self) -> bool {
        matches!(self, Self::Summary(_))
    }

    /// Where the entry sits in the view: raw events at their own seq,
    /// summaries at the start of the range they cover.
    fn position(&self) -> (u64, u8) {
        match self {
            Self::Summary(e) => (
                e.as_compaction().map(|c| c.covers_from_seq).unwrap_or(e.seq),
                0,
            ),
            Self::Raw(e) => (e.seq, 1),
        }
    }
}

/// A bounded, chronological view of a log for one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledView {
    pub scope: Scope,
    pub entries: Vec<ViewEntry>,
}

impl CompiledView {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn raw_events(&self) -> impl Iterator<Item = &Event> {
        self.entries.iter().filter_map(|e| match e {
            ViewEntry::Raw(event) => Some(event.as_ref()),
            ViewEntry::Summary(_) => None,
        })
    }

    pub fn summaries(&self) -> impl Iterator<Item = &CompactedEvent> {
        self.entries.iter().filter_map(|e| match e {
            ViewEntry::Summary(event) => event.as_compaction(),
            ViewEntry::Raw(_) => None,
        })
    }

    pub fn token_count(&self, counter: &TokenCounter) -> usize {
        counter.count_events(self.entries.iter().map(|e| e.event()))
    }

    /// One line per entry, for inspection.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|entry| match entry {
                ViewEntry::Raw(e) => format!("[{:>5}] {} {}", e.seq, e.emitter, e.describe()),
                ViewEntry::Summary(e) => format!("[{:>5}] {}", e.seq, e.describe()),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Builds compiled views. Pure: compiling the same log twice gives the same view.
pub struct ContextCompiler;

impl ContextCompiler {
    pub fn compile(log: &EventLog, scope: &Scope) -> CompiledView {
        let summaries: Vec<&Arc<Event>> = log
            .events()
            .iter()
            .filter(|e| {
                e.as_compaction()
                    .is_some_and(|c| c.scope.overlaps(scope))
            })
            .collect();

        let mut entries: Vec<ViewEntry> = log
            .events()
            .iter()
            .filter(|e| !e.is_compaction() && scope.contains(e))
            .filter(|e| {
                !summaries
                    .iter()
                    .filter_map(|s| s.as_compaction())
                    .any(|c| c.covers(e))
            })
            .map(|e| ViewEntry::Raw(e.clone()))
            .collect();

        entries.extend(summaries.into_iter().map(|e| ViewEntry::Summary(e.clone())));
        entries.sort_by_key(|e| e.position());

        CompiledView {
            scope: scope.clone(),
            entries,
        }
    }
}
