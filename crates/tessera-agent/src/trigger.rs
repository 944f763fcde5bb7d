use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tessera_core::config::{RetryConfig, TriggersConfig};
use tessera_core::error::{Result, TesseraError};
use tessera_core::event::Emitter;
use tessera_core::types::RunId;
use tessera_llm::calculate_backoff;

use crate::engine::{RunHandle, RunReport, WorkflowEngine};

/// Starts a workflow on a cron schedule (seconds field included).
#[derive(Debug, Clone)]
pub struct ScheduledTrigger {
    pub name: String,
    pub workflow: String,
    pub input: Value,
    expression: String,
    schedule: Schedule,
}

impl ScheduledTrigger {
    pub fn new(
        name: impl Into<String>,
        expression: &str,
        workflow: impl Into<String>,
        input: Value,
    ) -> Result<Self> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| TesseraError::Config(format!("invalid cron '{}': {}", expression, e)))?;
        Ok(Self {
            name: name.into(),
            workflow: workflow.into(),
            input,
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Starts a workflow when an external event's topic matches a glob.
///
/// `*` matches one dot-separated segment, `**` any number of them and `?`
/// one character.
#[derive(Debug, Clone)]
pub struct EventDrivenTrigger {
    pub name: String,
    pub topic: String,
    pub workflow: String,
    pattern: Regex,
}

impl EventDrivenTrigger {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        workflow: impl Into<String>,
    ) -> Result<Self> {
        let topic = topic.into();
        let pattern = topic_regex(&topic)?;
        Ok(Self {
            name: name.into(),
            topic,
            workflow: workflow.into(),
            pattern,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.pattern.is_match(topic)
    }
}

fn topic_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                pattern.push_str(".*");
            }
            '*' => pattern.push_str("[^.]*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
        .map_err(|e| TesseraError::Config(format!("invalid topic pattern '{}': {}", glob, e)))
}

/// A message from outside the engine.
///
/// Naming a `run_id` resumes that run; adding a `request_id` answers one of
/// its pending human requests with `payload`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// What an external event caused.
#[derive(Debug)]
pub enum Dispatch {
    Started { trigger: String, handle: RunHandle },
    Resumed(RunReport),
    Answered(RunReport),
}

/// Drives scheduled triggers and routes external events to the engine.
pub struct TriggerService {
    engine: Arc<WorkflowEngine>,
    scheduled: Vec<ScheduledTrigger>,
    events: Vec<EventDrivenTrigger>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl TriggerService {
    pub fn new(engine: Arc<WorkflowEngine>, retry: RetryConfig, cancel: CancellationToken) -> Self {
        Self {
            engine,
            scheduled: Vec::new(),
            events: Vec::new(),
            retry,
            cancel,
        }
    }

    /// Build from `[triggers]`; invalid entries are logged and skipped.
    pub fn from_config(
        config: &TriggersConfig,
        engine: Arc<WorkflowEngine>,
        cancel: CancellationToken,
    ) -> Self {
        let mut service = Self::new(engine, config.retry.clone(), cancel);

        for entry in &config.scheduled {
            match ScheduledTrigger::new(&entry.name, &entry.schedule, &entry.workflow, entry.input.clone()) {
                Ok(trigger) => {
                    info!(name = %entry.name, schedule = %entry.schedule, "Scheduled trigger registered");
                    service.scheduled.push(trigger);
                }
                Err(e) => warn!(
                    name = %entry.name,
                    schedule = %entry.schedule,
                    error = %e,
                    "Invalid cron expression, skipping trigger"
                ),
            }
        }
        for entry in &config.event {
            match EventDrivenTrigger::new(&entry.name, &entry.topic, &entry.workflow) {
                Ok(trigger) => {
                    info!(name = %entry.name, topic = %entry.topic, "Event trigger registered");
                    service.events.push(trigger);
                }
                Err(e) => warn!(name = %entry.name, error = %e, "Invalid topic pattern, skipping trigger"),
            }
        }
        service
    }

    pub fn add_scheduled(&mut self, trigger: ScheduledTrigger) {
        self.scheduled.push(trigger);
    }

    pub fn add_event(&mut self, trigger: EventDrivenTrigger) {
        self.events.push(trigger);
    }

    pub fn scheduled(&self) -> &[ScheduledTrigger] {
        &self.scheduled
    }

    pub fn event_triggers(&self) -> &[EventDrivenTrigger] {
        &self.events
    }

    /// Run the cron loop. Blocks until cancelled.
    pub async fn run(&self) {
        if self.scheduled.is_empty() {
            info!("No scheduled triggers configured, trigger loop idle");
            self.cancel.cancelled().await;
            return;
        }

        info!(count = self.scheduled.len(), "Trigger loop started");

        loop {
            let now = Utc::now();
            let next = self
                .scheduled
                .iter()
                .filter_map(|t| t.next_fire(now).map(|at| (at, t)))
                .min_by_key(|(at, _)| *at);

            let Some((fire_at, trigger)) = next else {
                self.cancel.cancelled().await;
                break;
            };

            let delay = (fire_at - now).to_std().unwrap_or(Duration::from_secs(1));
            debug!(
                trigger = %trigger.name,
                fire_at = %fire_at.format("%H:%M:%S"),
                delay_secs = delay.as_secs(),
                "Next scheduled trigger"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    info!(trigger = %trigger.name, workflow = %trigger.workflow, "Firing scheduled trigger");
                    match self.dispatch_with_retry(&trigger.name, &trigger.workflow, trigger.input.clone()).await {
                        Ok(handle) => info!(trigger = %trigger.name, run_id = %handle.run_id(), "Scheduled run started"),
                        Err(e) => error!(trigger = %trigger.name, error = %e, "Scheduled trigger failed"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Trigger loop shutting down");
                    break;
                }
            }
        }
    }

    /// Route one external event. Events that match no trigger are ignored.
    pub async fn handle_event(&self, event: ExternalEvent) -> Result<Vec<Dispatch>> {
        let matching: Vec<&EventDrivenTrigger> =
            self.events.iter().filter(|t| t.matches(&event.topic)).collect();
        if matching.is_empty() {
            debug!(topic = %event.topic, "No trigger matches event");
            return Ok(Vec::new());
        }

        if let Some(run_id) = &event.run_id {
            let dispatch = match &event.request_id {
                Some(request_id) => Dispatch::Answered(
                    self.engine
                        .submit_feedback(run_id, request_id, event.payload.clone())
                        .await?,
                ),
                None => Dispatch::Resumed(self.engine.resume(run_id).await?),
            };
            info!(topic = %event.topic, run_id = %run_id, "Event routed to existing run");
            return Ok(vec![dispatch]);
        }

        let mut dispatched = Vec::with_capacity(matching.len());
        for trigger in matching {
            let handle = self
                .dispatch_with_retry(&trigger.name, &trigger.workflow, event.payload.clone())
                .await?;
            info!(trigger = %trigger.name, topic = %event.topic, run_id = %handle.run_id(), "Event started run");
            dispatched.push(Dispatch::Started {
                trigger: trigger.name.clone(),
                handle,
            });
        }
        Ok(dispatched)
    }

    /// Start a run, retrying transient failures. Each attempt is a new run.
    async fn dispatch_with_retry(
        &self,
        trigger: &str,
        workflow: &str,
        input: Value,
    ) -> Result<RunHandle> {
        let mut attempt = 0;
        loop {
            let started = self
                .engine
                .start_workflow(workflow, input.clone(), Emitter::Trigger(trigger.to_string()))
                .await;
            match started {
                Ok(handle) => return Ok(handle),
                Err(e) if is_transient(&e) && attempt < self.retry.max_retries => {
                    let backoff = calculate_backoff(attempt, &self.retry);
                    warn!(
                        trigger,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Dispatch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(TesseraError::Trigger {
                        trigger: trigger.to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

fn is_transient(e: &TesseraError) -> bool {
    matches!(
        e,
        TesseraError::Store(_)
            | TesseraError::Io(_)
            | TesseraError::Timeout { .. }
            | TesseraError::LlmRequest(_)
    )
}
