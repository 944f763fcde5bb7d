//! Token and cost estimation.
//!
//! Counts use the BPE tokenizer matching the model family (`o200k_base` for
//! the GPT-4o generation, `cl100k_base` for everything else we know about).
//! If a tokenizer cannot be loaded the counter degrades to a chars/4 estimate
//! instead of failing.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use tessera_core::config::ModelConfig;
use tessera_core::event::Event;
use tessera_core::types::{ChatMessage, TokenUsage};

/// Fixed per-event overhead (envelope, role markers).
pub const EVENT_OVERHEAD_TOKENS: usize = 4;

const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Tokenizer family used for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerFamily {
    O200k,
    Cl100k,
    /// Roughly four characters per token.
    Heuristic,
}

fn o200k() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER.get_or_init(|| tiktoken_rs::o200k_base().ok()).as_ref()
}

fn cl100k() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER.get_or_init(|| tiktoken_rs::cl100k_base().ok()).as_ref()
}

impl TokenizerFamily {
    /// Pick the family for a model id.
    pub fn for_model(model_id: &str) -> Self {
        let id = model_id.to_ascii_lowercase();
        if id.starts_with("gpt-4o")
            || id.starts_with("gpt-4.1")
            || id.starts_with("gpt-5")
            || id.starts_with("o1")
            || id.starts_with("o3")
            || id.starts_with("o4")
        {
            Self::O200k
        } else {
            // Claude, GPT-4, GPT-3.5 and unknown models: cl100k is a close enough proxy
            Self::Cl100k
        }
    }

    fn bpe(self) -> Option<&'static CoreBPE> {
        match self {
            Self::O200k => o200k(),
            Self::Cl100k => cl100k(),
            Self::Heuristic => None,
        }
    }
}

/// Token counter and cost estimator for one model.
#[derive(Debug, Clone)]
pub struct TokenCounter {
    family: TokenizerFamily,
    input_cost_per_mtok: f64,
    output_cost_per_mtok: f64,
}

impl TokenCounter {
    pub fn for_model(model_id: &str) -> Self {
        let (input, output) = default_pricing(model_id);
        Self {
            family: TokenizerFamily::for_model(model_id),
            input_cost_per_mtok: input,
            output_cost_per_mtok: output,
        }
    }

    /// Counter for a configured model; explicit prices override the built-in table.
    pub fn from_config(config: &ModelConfig) -> Self {
        let mut counter = Self::for_model(&config.model_id);
        if let Some(p) = config.input_cost_per_mtok {
            counter.input_cost_per_mtok = p;
        }
        if let Some(p) = config.output_cost_per_mtok {
            counter.output_cost_per_mtok = p;
        }
        counter
    }

    pub fn heuristic() -> Self {
        Self {
            family: TokenizerFamily::Heuristic,
            input_cost_per_mtok: 0.0,
            output_cost_per_mtok: 0.0,
        }
    }

    pub fn family(&self) -> TokenizerFamily {
        self.family
    }

    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.family.bpe() {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => text.chars().count().div_ceil(4),
        }
    }

    /// Tokens an event contributes to a prompt.
    pub fn count_event(&self, event: &Event) -> usize {
        self.count(&event.describe()) + EVENT_OVERHEAD_TOKENS
    }

    pub fn count_events<'a>(&self, events: impl IntoIterator<Item = &'a Event>) -> usize {
        events.into_iter().map(|e| self.count_event(e)).sum()
    }

    /// Serialized content plus 4 tokens overhead per message.
    pub fn count_messages(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| {
                let content = serde_json::to_string(&m.content).unwrap_or_default();
                self.count(&content) + 4
            })
            .sum()
    }

    /// Estimated USD cost of a call.
    pub fn estimate_cost(&self, usage: TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_cost_per_mtok
            + usage.output_tokens as f64 * self.output_cost_per_mtok)
            / 1_000_000.0
    }

    /// Cut `text` so it counts at most `max_tokens`, on a char boundary.
    /// A `[truncated]` marker is appended when it fits in the budget.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.count(text) <= max_tokens {
            return text.to_string();
        }

        let marker_tokens = self.count(TRUNCATION_MARKER);
        let (budget, marker) = if max_tokens > marker_tokens * 2 {
            (max_tokens - marker_tokens, TRUNCATION_MARKER)
        } else {
            (max_tokens, "")
        };

        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        // Largest prefix within budget
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.count(&text[..boundaries[mid]]) <= budget {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        // BPE merges across the join can add a token; back off until it fits
        loop {
            let candidate = format!("{}{}", &text[..boundaries[lo]], marker);
            if self.count(&candidate) <= max_tokens || lo == 0 {
                return if lo == 0 && self.count(&candidate) > max_tokens {
                    String::new()
                } else {
                    candidate
                };
            }
            lo -= 1;
        }
    }
}

/// USD per million (input, output) tokens for well-known models.
fn default_pricing(model_id: &str) -> (f64, f64) {
    let id = model_id.to_ascii_lowercase();
    if id.starts_with("gpt-4o-mini") {
        (0.15, 0.60)
    } else if id.starts_with("gpt-4o") {
        (2.50, 10.00)
    } else if id.starts_with("gpt-4.1") {
        (2.00, 8.00)
    } else if id.contains("claude") && id.contains("haiku") {
        (0.80, 4.00)
    } else if id.contains("claude") && id.contains("opus") {
        (15.00, 75.00)
    } else if id.contains("claude") {
        (3.00, 15.00)
    } else {
        (0.0, 0.0)
    }
}
