use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use tessera_core::config::{CompactionConfig, CompactionStrategy};
use tessera_core::error::Result;
use tessera_core::event::{CompactedEvent, Emitter, Event, EventKind, Scope, SummarizerKind, TaskType};

use super::summarizer::{infer_task_type, EventSummarizer, RuleBasedSummarizer};
use crate::journal::RunJournal;
use crate::log::EventLog;
use crate::tokens::TokenCounter;

/// The range a compaction will cover and how it was chosen.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub events: Vec<Arc<Event>>,
    pub strategy: CompactionStrategy,
    /// Token budget for the summary.
    pub budget: usize,
    /// Tokens of the covered events.
    pub covered_tokens: usize,
}

impl CompactionPlan {
    pub fn covers_from(&self) -> u64 {
        self.events.first().map(|e| e.seq).unwrap_or(0)
    }

    pub fn covers_to(&self) -> u64 {
        self.events.last().map(|e| e.seq).unwrap_or(0)
    }
}

/// Whether a topic ends after `pending[i]`.
fn is_topic_boundary(pending: &[Arc<Event>], i: usize) -> bool {
    match &pending[i].kind {
        EventKind::ToolResult { .. } | EventKind::HumanFeedback { .. } => true,
        _ => pending
            .get(i + 1)
            .is_some_and(|next| next.emitter != pending[i].emitter),
    }
}

/// Decide what to compact for `scope`, or `None` if nothing should be.
pub fn plan_compaction(
    log: &EventLog,
    scope: &Scope,
    config: &CompactionConfig,
    counter: &TokenCounter,
) -> Option<CompactionPlan> {
    if !config.enabled {
        return None;
    }

    let pending = log.events_since_last_compaction(scope);
    let tokens = counter.count_events(pending.iter().map(|e| e.as_ref()));
    if tokens <= config.token_threshold || pending.len() <= config.overlap_events {
        return None;
    }

    let emergency = matches!(
        config.strategy,
        CompactionStrategy::Emergency | CompactionStrategy::Hybrid
    ) && tokens > config.emergency_threshold();

    // A zero budget would truncate the summary away and hide the covered range.
    let full_budget = config.max_summary_tokens.max(1);
    let (end, strategy, budget) = if emergency {
        let keep = config.overlap_events / 2;
        (
            pending.len() - keep,
            CompactionStrategy::Emergency,
            (full_budget / 2).max(1),
        )
    } else {
        let cut = pending.len() - config.overlap_events;
        let topic_end = match config.strategy {
            CompactionStrategy::TopicChunk | CompactionStrategy::Hybrid => {
                (0..cut).rev().find(|&i| is_topic_boundary(&pending, i))
            }
            _ => None,
        };
        match topic_end {
            Some(i) => (i + 1, CompactionStrategy::TopicChunk, full_budget),
            None => (cut, CompactionStrategy::SlidingWindow, full_budget),
        }
    };

    if end == 0 {
        return None;
    }

    let events: Vec<Arc<Event>> = pending[..end].to_vec();
    let covered_tokens = counter.count_events(events.iter().map(|e| e.as_ref()));
    Some(CompactionPlan {
        events,
        strategy,
        budget,
        covered_tokens,
    })
}

/// Appends `Compacted` events for one agent.
///
/// Holds the summarizer circuit breaker: after `breaker_threshold`
/// consecutive failures of the primary summarizer every later compaction
/// uses the rule-based one.
pub struct Compactor {
    counter: TokenCounter,
    primary: Option<Arc<dyn EventSummarizer>>,
    fallback: RuleBasedSummarizer,
    failures: AtomicU32,
    tripped: AtomicBool,
}

impl Compactor {
    pub fn new(counter: TokenCounter, primary: Option<Arc<dyn EventSummarizer>>) -> Self {
        Self {
            counter,
            primary,
            fallback: RuleBasedSummarizer,
            failures: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Compact `scope` if it is over threshold.
    ///
    /// Returns `None` when nothing needed compacting or another compaction of
    /// the same run is in flight. A summarizer failure is returned as
    /// `Compaction` and nothing is appended.
    pub async fn maybe_compact(
        &self,
        journal: &RunJournal,
        scope: &Scope,
        config: &CompactionConfig,
    ) -> Result<Option<CompactedEvent>> {
        let Some(_slot) = journal.try_begin_compaction() else {
            debug!(run_id = %journal.run_id(), scope = %scope, "Compaction already in flight");
            return Ok(None);
        };

        let log = journal.snapshot();
        let Some(plan) = plan_compaction(&log, scope, config, &self.counter) else {
            return Ok(None);
        };

        let task_type = infer_task_type(&plan.events);
        let (text, summarizer) = self.summarize(&plan, task_type, config).await?;

        let summary_text = self.counter.truncate(&text, plan.budget);
        let summary_tokens = self.counter.count(&summary_text).max(1);
        let compacted = CompactedEvent {
            covers_from_seq: plan.covers_from(),
            covers_to_seq: plan.covers_to(),
            summary_text,
            compaction_ratio: plan.covered_tokens as f64 / summary_tokens as f64,
            created_at: Utc::now(),
            scope: scope.clone(),
            strategy: plan.strategy,
            task_type,
            summarizer,
            covered_events: plan.events.len(),
            covered_tokens: plan.covered_tokens,
            summary_tokens,
        };

        journal
            .append(Emitter::Compactor, EventKind::Compacted(compacted.clone()))
            .await?;

        info!(
            run_id = %journal.run_id(),
            scope = %scope,
            from = compacted.covers_from_seq,
            to = compacted.covers_to_seq,
            strategy = %compacted.strategy,
            ratio = compacted.compaction_ratio,
            "Compacted context"
        );
        Ok(Some(compacted))
    }

    async fn summarize(
        &self,
        plan: &CompactionPlan,
        task_type: TaskType,
        config: &CompactionConfig,
    ) -> Result<(String, SummarizerKind)> {
        if let Some(primary) = self.primary.as_ref().filter(|_| !self.is_tripped()) {
            match primary
                .summarize(plan.events.clone(), task_type, plan.budget)
                .await
            {
                Ok(text) => {
                    self.failures.store(0, Ordering::SeqCst);
                    return Ok((text, primary.kind()));
                }
                Err(e) => {
                    let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures < config.breaker_threshold {
                        warn!(error = %e, failures, "Summarizer failed, compaction skipped");
                        return Err(e);
                    }
                    warn!(error = %e, failures, "Summarizer breaker tripped, using rule-based summaries");
                    self.tripped.store(true, Ordering::SeqCst);
                }
            }
        }

        let text = self
            .fallback
            .summarize(plan.events.clone(), task_type, plan.budget)
            .await?;
        Ok((text, SummarizerKind::RuleBased))
    }
}
