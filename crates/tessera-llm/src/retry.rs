use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use tessera_core::config::{AppConfig, ModelConfig, RetryConfig};
use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::LlmClient;
use tessera_core::types::*;

/// An LLM client that retries failed requests and falls back to alternative models.
pub struct RetryingClient {
    primary: Box<dyn LlmClient>,
    fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn LlmClient>,
        fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }

    /// Build the chain described by `[model]`, `[[fallback_models]]` and `[retry]`.
    /// `connect` creates the backend client for one model entry.
    pub fn from_config<F>(config: &AppConfig, mut connect: F) -> Self
    where
        F: FnMut(&ModelConfig) -> Box<dyn LlmClient>,
    {
        let primary = connect(&config.model);
        let fallbacks = config
            .fallback_models
            .iter()
            .map(|model| (model.clone(), connect(model)))
            .collect();
        Self::new(primary, fallbacks, config.retry.clone())
    }
}

/// Transient backend failures worth another attempt.
pub fn is_retryable(e: &TesseraError) -> bool {
    match e {
        TesseraError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        TesseraError::Timeout { .. } => true,
        _ => false,
    }
}

/// Exponential backoff capped at `max_backoff_ms`, with 0.8x to 1.2x jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn invoke(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        let config = config.clone();
        let tools = tools.to_vec();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            // Try primary with retries
            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.invoke(&config, messages.clone(), &tools).await {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying LLM request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !self.fallbacks.is_empty() {
                info!("Primary LLM exhausted, trying fallback models");
            }
            for (fb_config, fb_client) in &self.fallbacks {
                match fb_client.invoke(fb_config, messages.clone(), &tools).await {
                    Ok(response) => {
                        info!(
                            model = %fb_config.model_id,
                            provider = %fb_config.provider,
                            "Fell back to alternative model"
                        );
                        return Ok(response);
                    }
                    Err(e) => {
                        warn!(
                            model = %fb_config.model_id,
                            error = %e,
                            "Fallback model also failed"
                        );
                        continue;
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| TesseraError::LlmRequest("All models failed".into())))
        })
    }
}
