pub(crate) mod anthropic;
pub(crate) mod gemini;
pub(crate) mod mock;
pub(crate) mod ollama;
pub(crate) mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use mock::{MockProvider, MockStep, RecordedCall};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::Arc;

    use llmux_core::{
        CallOptions, InMemorySettingsService, NormalizedCallOptions, ProviderDefaults,
        RuntimeContext, StaticRuntimeConfig, normalize_call,
    };

    pub(crate) fn runtime() -> RuntimeContext {
        RuntimeContext::new(
            Arc::new(InMemorySettingsService::new()),
            Arc::new(StaticRuntimeConfig::new("session-test")),
        )
        .with_runtime_id("runtime-test")
    }

    /// Normalizes `options` against offline defaults for `provider`.
    pub(crate) fn normalized(
        provider: &str,
        model: &str,
        options: CallOptions,
    ) -> NormalizedCallOptions {
        let defaults = ProviderDefaults::new(provider, model)
            .with_auth_token(Some("test-token".to_string()))
            .with_base_url(Some("https://backend.test".to_string()))
            .with_env_lookup(|_| None);
        normalize_call(options.with_runtime(runtime()).into(), &defaults, None)
            .expect("fixture call must normalize")
    }
}
