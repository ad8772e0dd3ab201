//! Token usage reported by each backend dialect, normalized to [`UsageStats`].

use llmux_contracts::UsageStats;
use reqwest::header::HeaderMap;
use serde_json::Value;

const PROMPT_HEADER: &str = "x-prompt-tokens";
const COMPLETION_HEADER: &str = "x-completion-tokens";
const CACHED_HEADER: &str = "x-cached-tokens";
const REASONING_HEADER: &str = "x-reasoning-tokens";

/// Usage fields seen so far; absent fields stay `None` until a report fills them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartialUsage {
    pub prompt: Option<u64>,
    pub completion: Option<u64>,
    pub total: Option<u64>,
    pub cached: Option<u64>,
    pub reasoning: Option<u64>,
}

impl PartialUsage {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Field-wise fallback: values present here win.
    pub fn or(self, fallback: PartialUsage) -> PartialUsage {
        PartialUsage {
            prompt: self.prompt.or(fallback.prompt),
            completion: self.completion.or(fallback.completion),
            total: self.total.or(fallback.total),
            cached: self.cached.or(fallback.cached),
            reasoning: self.reasoning.or(fallback.reasoning),
        }
    }

    /// Later reports override earlier ones field by field.
    pub fn merge_from(&mut self, other: PartialUsage) {
        *self = other.or(*self);
    }

    pub fn finish(self) -> UsageStats {
        let prompt_tokens = self.prompt.unwrap_or(0);
        let completion_tokens = self.completion.unwrap_or(0);
        UsageStats {
            prompt_tokens,
            completion_tokens,
            total_tokens: self
                .total
                .unwrap_or_else(|| prompt_tokens.saturating_add(completion_tokens)),
            cached_tokens: self.cached.unwrap_or(0),
            reasoning_tokens: self.reasoning.unwrap_or(0),
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> PartialUsage {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| sanitize_count(&Value::String(value.to_string())))
        };
        PartialUsage {
            prompt: read(PROMPT_HEADER),
            completion: read(COMPLETION_HEADER),
            total: None,
            cached: read(CACHED_HEADER),
            reasoning: read(REASONING_HEADER),
        }
    }

    /// `prompt_tokens`/`completion_tokens` with the nested detail objects.
    pub fn from_openai(usage: &Value) -> PartialUsage {
        PartialUsage {
            prompt: field(usage, &["prompt_tokens"]),
            completion: field(usage, &["completion_tokens"]),
            total: field(usage, &["total_tokens"]),
            cached: field(usage, &["prompt_tokens_details", "cached_tokens"]),
            reasoning: field(usage, &["completion_tokens_details", "reasoning_tokens"]),
        }
    }

    pub fn from_anthropic(usage: &Value) -> PartialUsage {
        PartialUsage {
            prompt: field(usage, &["input_tokens"]),
            completion: field(usage, &["output_tokens"]),
            total: None,
            cached: field(usage, &["cache_read_input_tokens"]),
            reasoning: None,
        }
    }

    pub fn from_gemini(usage: &Value) -> PartialUsage {
        PartialUsage {
            prompt: field(usage, &["promptTokenCount"]),
            completion: field(usage, &["candidatesTokenCount"]),
            total: field(usage, &["totalTokenCount"]),
            cached: field(usage, &["cachedContentTokenCount"]),
            reasoning: field(usage, &["thoughtsTokenCount"]),
        }
    }

    pub fn from_ollama(body: &Value) -> PartialUsage {
        PartialUsage {
            prompt: field(body, &["prompt_eval_count"]),
            completion: field(body, &["eval_count"]),
            ..PartialUsage::default()
        }
    }
}

fn field(value: &Value, path: &[&str]) -> Option<u64> {
    path.iter().try_fold(value, |current, key| current.get(key)).map(sanitize_count)
}

/// Counts that are negative or not numeric collapse to zero.
pub fn sanitize_count(value: &Value) -> u64 {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|n| n.is_finite() && *n > 0.0).map(|n| n as u64))
            .unwrap_or(0),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite() && *n > 0.0)
            .map(|n| n as u64)
            .unwrap_or(0),
        _ => 0,
    }
}
