use std::io::Write;

use tessera_core::config::{AppConfig, CompactionStrategy};
use tessera_core::error::TesseraError;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(contents.as_bytes()).expect("write toml");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 2048
temperature = 0.5

[[fallback_models]]
provider = "openai"
model_id = "gpt-4o-mini"

[retry]
max_retries = 5
initial_backoff_ms = 200

[engine]
max_concurrency = 8
node_timeout_secs = 60
run_timeout_secs = 3600
cancel_grace_secs = 2

[agent]
max_iterations = 12
max_consecutive_errors = 2

[compaction]
token_threshold = 4000
overlap_events = 6
max_summary_tokens = 500
strategy = "hybrid"

[store]
workspace = "/tmp/tessera-test"
db_file = "runs.db"

[log]
level = 3

[[triggers.scheduled]]
name = "nightly"
schedule = "0 0 2 * * *"
workflow = "report"
input = { full = true }

[[triggers.event]]
name = "orders"
topic = "orders.*"
workflow = "fulfil"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 2048);
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].model_id, "gpt-4o-mini");
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.max_backoff_ms, 30_000);

    assert_eq!(config.engine.max_concurrency, 8);
    assert_eq!(config.engine.run_timeout_secs, Some(3600));
    assert_eq!(config.agent.max_iterations, 12);
    assert_eq!(config.compaction.strategy, CompactionStrategy::Hybrid);
    assert_eq!(config.compaction.max_summary_tokens, 500);

    assert_eq!(
        config.db_path(),
        std::path::PathBuf::from("/tmp/tessera-test/runs.db")
    );
    let log = config.log.as_ref().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(
        config.log_dir(),
        std::path::PathBuf::from("/tmp/tessera-test/logs")
    );

    assert_eq!(config.triggers.scheduled.len(), 1);
    assert_eq!(config.triggers.scheduled[0].input["full"], true);
    assert_eq!(config.triggers.event[0].topic, "orders.*");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("TESSERA_TEST_API_KEY", "expanded-key-value");

    let tmp = write_config(
        r#"
[model]
model_id = "test-model"
api_key = "${TESSERA_TEST_API_KEY}"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("TESSERA_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = write_config(
        r#"
[model]
model_id = "llama3.2"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 4);
    assert_eq!(config.engine.node_timeout_secs, 300);
    assert!(config.engine.run_timeout_secs.is_none());
    assert_eq!(config.agent.max_iterations, 25);
    assert_eq!(config.agent.max_consecutive_errors, 3);
    assert!(config.compaction.enabled);
    assert_eq!(config.compaction.token_threshold, 8_000);
    assert_eq!(config.compaction.overlap_events, 10);
    assert_eq!(config.compaction.strategy, CompactionStrategy::SlidingWindow);
    assert!(config.log.is_none());
    assert!(config.triggers.scheduled.is_empty());
    assert!(config.fallback_models.is_empty());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/tessera.toml")).unwrap_err();
    assert!(matches!(err, TesseraError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_config_is_rejected() {
    let tmp = write_config("[engine]\nmax_concurrency = \"lots\"\n");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, TesseraError::Config(_)));
}
