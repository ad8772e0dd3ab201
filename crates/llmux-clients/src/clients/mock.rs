use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use llmux_contracts::{Content, ContentMetadata, ModelInfo, Speaker, UsageStats};
use llmux_core::{
    CallInput, ContentStream, CoreError, NormalizedCallOptions, Provider, ProviderDefaults,
    RuntimeBinding, RuntimeSettingsAware, normalize_call,
};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_MODEL: &str = "mock-model";

/// One scripted stream item.
#[derive(Debug, Clone, PartialEq)]
pub enum MockStep {
    Chunk(Content),
    Fail(CoreError),
}

/// What a call looked like after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub model: String,
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub streaming: bool,
    pub ephemeral_settings: BTreeMap<String, Value>,
    pub model_params: BTreeMap<String, Value>,
    pub runtime_id: String,
    pub metadata: BTreeMap<String, Value>,
    pub tool_names: Vec<String>,
}

impl RecordedCall {
    fn from_options(options: &NormalizedCallOptions) -> Self {
        Self {
            model: options.resolved.model.clone(),
            base_url: options.resolved.base_url.clone(),
            auth_token: options.resolved.auth_token.clone(),
            streaming: options.resolved.streaming,
            ephemeral_settings: options.invocation.ephemeral_settings.clone(),
            model_params: options.invocation.model_params.clone(),
            runtime_id: options.runtime.runtime_id.clone(),
            metadata: options.runtime.metadata.clone(),
            tool_names: options.tools().iter().map(|tool| tool.name.clone()).collect(),
        }
    }
}

/// Offline provider: echoes the last human turn, or replays a script.
pub struct MockProvider {
    defaults: ProviderDefaults,
    binding: RuntimeBinding,
    script: Vec<MockStep>,
    rejection: Option<CoreError>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            defaults: ProviderDefaults::new(name, DEFAULT_MODEL)
                .without_auth()
                .with_env_lookup(|_| None),
            binding: RuntimeBinding::default(),
            script: Vec::new(),
            rejection: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.defaults.model = model.to_string();
        self
    }

    pub fn with_script(mut self, script: Vec<MockStep>) -> Self {
        self.script = script;
        self
    }

    /// Every call fails synchronously with `error`, before any stream exists.
    pub fn rejecting(mut self, error: CoreError) -> Self {
        self.rejection = Some(error);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn echo(&self, options: &NormalizedCallOptions) -> Vec<MockStep> {
        let input = options
            .contents
            .iter()
            .rev()
            .find(|content| content.speaker == Speaker::Human)
            .map(Content::text)
            .unwrap_or_default();
        let words: Vec<&str> = input.split_whitespace().collect();
        if words.is_empty() {
            return vec![MockStep::Fail(CoreError::protocol(
                self.name(),
                "provider returned empty output",
            ))];
        }

        let mut text = format!("[{}]", self.name());
        for word in &words {
            text.push(' ');
            text.push_str(word);
        }
        let count = words.len() as u64;
        let metadata = ContentMetadata {
            model: Some(options.resolved.model.clone()),
            provider: Some(self.name().to_string()),
            finish_reason: Some("stop".to_string()),
            usage: Some(UsageStats::new(count, count.saturating_add(1))),
        };
        vec![MockStep::Chunk(Content::ai_text(text).with_metadata(metadata))]
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.defaults.provider
    }

    fn generate_chat_completion(&self, input: CallInput) -> Result<ContentStream, CoreError> {
        if let Some(error) = &self.rejection {
            return Err(error.clone());
        }
        let bound = self.binding.bound_runtime();
        let options = normalize_call(input, &self.defaults, bound.as_ref())?;
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall::from_options(&options));

        let steps = if self.script.is_empty() { self.echo(&options) } else { self.script.clone() };
        debug!(
            event = "provider.mock.generated",
            provider = %options.provider,
            model = %options.resolved.model,
            steps = steps.len()
        );
        let abort = options.abort.clone();
        Ok(Box::pin(async_stream::stream! {
            for step in steps {
                if abort.is_cancelled() {
                    return;
                }
                match step {
                    MockStep::Chunk(content) => yield Ok(content),
                    MockStep::Fail(error) => {
                        yield Err(error);
                        return;
                    }
                }
                tokio::task::yield_now().await;
            }
        }))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, CoreError> {
        Ok(vec![ModelInfo::named(self.name(), &self.defaults.model)])
    }

    fn get_default_model(&self) -> String {
        self.defaults.model.clone()
    }

    fn runtime_settings(&self) -> Option<&dyn RuntimeSettingsAware> {
        Some(&self.binding)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use llmux_contracts::ContentBlock;
    use llmux_core::{CallOptions, RuntimeContext};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::clients::fixtures::runtime;

    async fn collect(stream: ContentStream) -> Vec<Result<Content, CoreError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn echoes_last_human_turn_with_usage() {
        let provider = MockProvider::new("mock-a");
        let options = CallOptions::new(vec![
            Content::human_text("first"),
            Content::ai_text("ignored"),
            Content::human_text("hello  there"),
        ])
        .with_runtime(runtime());
        let chunks = collect(provider.generate_chat_completion(options.into()).expect("call"))
            .await;

        assert_eq!(chunks.len(), 1);
        let chunk = chunks[0].as_ref().expect("echo must succeed");
        assert_eq!(chunk.text(), "[mock-a] hello there");
        assert_eq!(chunk.usage(), Some(&UsageStats::new(2, 3)));
        assert_eq!(provider.calls()[0].runtime_id, "runtime-test");
    }

    #[tokio::test]
    async fn scripted_failure_ends_stream_after_yielded_chunks() {
        let provider = MockProvider::new("mock-a").with_script(vec![
            MockStep::Chunk(Content::ai_text("partial")),
            MockStep::Fail(CoreError::transport("mock-a", Some(503), "down")),
            MockStep::Chunk(Content::ai_text("never")),
        ]);
        let options = CallOptions::new(vec![Content::human_text("x")]).with_runtime(runtime());
        let chunks = collect(provider.generate_chat_completion(options.into()).expect("call"))
            .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], Ok(Content::ai_text("partial")));
        assert!(matches!(&chunks[1], Err(error) if error.is_retryable()));
    }

    #[test]
    fn rejection_and_missing_runtime_fail_synchronously() {
        let rejecting = MockProvider::new("mock-a")
            .rejecting(CoreError::Configuration("scripted rejection".to_string()));
        let options = CallOptions::new(vec![Content::human_text("x")]).with_runtime(runtime());
        assert!(matches!(
            rejecting.generate_chat_completion(options.into()),
            Err(CoreError::Configuration(_))
        ));

        let provider = MockProvider::new("mock-a");
        let result = provider.generate_chat_completion(vec![Content::human_text("x")].into());
        assert!(matches!(
            result,
            Err(CoreError::MissingRuntimeContext { field: "settings_service", .. })
        ));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn legacy_calls_use_bound_runtime() {
        let provider = MockProvider::new("mock-a");
        provider
            .runtime_settings()
            .expect("mock must accept a runtime")
            .bind_runtime(runtime().with_metadata("origin", json!("bound")));
        let chunks = collect(
            provider
                .generate_chat_completion(vec![Content::human_text("ping")].into())
                .expect("bound runtime must satisfy the guard"),
        )
        .await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(provider.calls()[0].metadata.get("origin"), Some(&json!("bound")));
    }

    #[tokio::test]
    async fn aborted_call_yields_nothing() {
        let provider = MockProvider::new("mock-a").with_script(vec![MockStep::Chunk(
            Content::ai_blocks(vec![ContentBlock::text("a")]),
        )]);
        let abort = CancellationToken::new();
        abort.cancel();
        let options = CallOptions::new(vec![])
            .with_runtime(RuntimeContext { runtime_id: None, ..runtime() })
            .with_abort(abort);
        let chunks = collect(provider.generate_chat_completion(options.into()).expect("call"))
            .await;
        assert!(chunks.is_empty());
    }
}
