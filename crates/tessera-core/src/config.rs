use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Top-level Tessera configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub triggers: TriggersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// USD per million input tokens, used for cost estimates.
    #[serde(default)]
    pub input_cost_per_mtok: Option<f64>,
    /// USD per million output tokens.
    #[serde(default)]
    pub output_cost_per_mtok: Option<f64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            input_cost_per_mtok: None,
            output_cost_per_mtok: None,
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_model_id() -> String { "gpt-4o".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests and trigger dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Workflow scheduler limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node activations in flight per run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-node activation timeout; nodes may override it.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Overall run deadline. None = unbounded.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    /// How long in-flight calls may keep running after a cancel.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            node_timeout_secs: default_node_timeout(),
            run_timeout_secs: None,
            cancel_grace_secs: default_cancel_grace(),
        }
    }
}

fn default_max_concurrency() -> usize { 4 }
fn default_node_timeout() -> u64 { 300 }
fn default_cancel_grace() -> u64 { 5 }

/// Think-act loop limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Consecutive same-class errors tolerated before escalating to a human.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Tool output is truncated to this many tokens before it enters the prompt.
    #[serde(default = "default_max_tool_output_tokens")]
    pub max_tool_output_tokens: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_consecutive_errors: default_max_consecutive_errors(),
            system_prompt: None,
            max_tool_output_tokens: default_max_tool_output_tokens(),
        }
    }
}

fn default_max_iterations() -> usize { 25 }
fn default_max_consecutive_errors() -> u32 { 3 }
fn default_max_tool_output_tokens() -> usize { 4_000 }

/// How the compactor picks the range it summarizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStrategy {
    #[default]
    SlidingWindow,
    Emergency,
    TopicChunk,
    Hybrid,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SlidingWindow => "sliding_window",
            Self::Emergency => "emergency",
            Self::TopicChunk => "topic_chunk",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_compaction_enabled")]
    pub enabled: bool,
    /// Uncompacted tokens above which a compaction is attempted.
    #[serde(default = "default_token_threshold")]
    pub token_threshold: usize,
    /// Newest events always left raw.
    #[serde(default = "default_overlap_events")]
    pub overlap_events: usize,
    #[serde(default = "default_max_summary_tokens")]
    pub max_summary_tokens: usize,
    #[serde(default)]
    pub strategy: CompactionStrategy,
    /// Consecutive LLM summarizer failures before switching to rule-based summaries.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    /// Multiple of `token_threshold` that triggers emergency compaction.
    #[serde(default = "default_emergency_factor")]
    pub emergency_factor: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_compaction_enabled(),
            token_threshold: default_token_threshold(),
            overlap_events: default_overlap_events(),
            max_summary_tokens: default_max_summary_tokens(),
            strategy: CompactionStrategy::default(),
            breaker_threshold: default_breaker_threshold(),
            emergency_factor: default_emergency_factor(),
        }
    }
}

impl CompactionConfig {
    /// Token count past which emergency compaction applies.
    pub fn emergency_threshold(&self) -> usize {
        (self.token_threshold as f64 * self.emergency_factor).ceil() as usize
    }
}

fn default_compaction_enabled() -> bool { true }
fn default_token_threshold() -> usize { 8_000 }
fn default_overlap_events() -> usize { 10 }
fn default_max_summary_tokens() -> usize { 1_000 }
fn default_breaker_threshold() -> u32 { 3 }
fn default_emergency_factor() -> f64 { 2.0 }

/// Event store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            db_file: default_db_file(),
        }
    }
}

fn default_workspace() -> String { "~/.tessera".to_string() }
fn default_db_file() -> String { "tessera.db".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run lifecycle, 2 = node lifecycle, 3 = agent steps (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggersConfig {
    #[serde(default)]
    pub scheduled: Vec<ScheduledTriggerConfig>,
    #[serde(default)]
    pub event: Vec<EventTriggerConfig>,
    /// Backoff for failed dispatches.
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTriggerConfig {
    pub name: String,
    /// Cron expression (seconds field included).
    pub schedule: String,
    pub workflow: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTriggerConfig {
    pub name: String,
    /// Topic glob, e.g. `orders.*`.
    pub topic: String,
    pub workflow: String,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TesseraError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| TesseraError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.store.workspace)
    }

    pub fn db_path(&self) -> PathBuf {
        self.workspace_dir().join(&self.store.db_file)
    }

    /// Directory for JSONL run logs.
    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_deref()) {
            Some(dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
