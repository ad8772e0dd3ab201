use std::{sync::Arc, time::Duration};

use llmux_balancer::LoadBalancingProvider;
use llmux_clients::{
    AnthropicProvider, GeminiProvider, HttpRuntime, MockProvider, OllamaProvider,
    OpenAiProvider,
};
use llmux_contracts::Content;
use llmux_core::{
    CallOptions, ContentStream, CoreError, InMemorySettingsService, Provider, ProviderRegistry,
    RuntimeContext, StaticRuntimeConfig, ThrottleTracker,
};
use llmux_logging::{LoggingConfig, LoggingProvider};
use tracing::{info, warn};
use uuid::Uuid;

pub mod config;

use config::{AppConfig, ProviderKind};

/// Logs backend-requested waits; the app does not sleep on them.
#[derive(Debug, Default)]
pub struct TracingThrottleTracker;

impl ThrottleTracker for TracingThrottleTracker {
    fn record_wait(&self, provider: &str, wait: Duration) {
        warn!(
            event = "provider.throttle.wait_requested",
            provider = %provider,
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)
        );
    }
}

/// Every configured provider wrapped in logging, plus the optional balancer on top.
pub struct ProviderStack {
    registry: ProviderRegistry,
    default_provider: String,
    runtime: RuntimeContext,
}

impl ProviderStack {
    pub fn from_config(config: &AppConfig) -> Result<Self, CoreError> {
        let http_client = HttpRuntime::build_http_client(config.provider_timeout_seconds);
        let max_inflight = Some(config.provider_max_inflight);
        let throttle: Arc<dyn ThrottleTracker> = Arc::new(TracingThrottleTracker);

        let mut registry = ProviderRegistry::new();
        for kind in ProviderKind::ALL {
            let Some(provider_config) = config.provider(kind) else {
                continue;
            };
            let base_url = provider_config.base_url.clone();
            let api_key = provider_config.api_key.clone();
            let model = provider_config.model.clone();
            let client = http_client.clone();
            let provider: Arc<dyn Provider> = match kind {
                ProviderKind::OpenAi => {
                    Arc::new(OpenAiProvider::new(base_url, api_key, model, client, max_inflight))
                }
                ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
                    base_url,
                    api_key,
                    model,
                    client,
                    max_inflight,
                )),
                ProviderKind::Gemini => {
                    Arc::new(GeminiProvider::new(base_url, api_key, model, client, max_inflight))
                }
                ProviderKind::Ollama => {
                    Arc::new(OllamaProvider::new(base_url, api_key, model, client, max_inflight))
                }
                ProviderKind::Mock => {
                    let mock = MockProvider::new(kind.name());
                    Arc::new(match model.as_deref() {
                        Some(model) => mock.with_model(model),
                        None => mock,
                    })
                }
            };
            if let Some(trackable) = provider.throttle_tracker() {
                trackable.set_throttle_tracker(throttle.clone());
            }
            registry.register(Arc::new(LoggingProvider::new(provider, LoggingConfig::default())));
        }

        if let Some(profile) = &config.load_balancer {
            let backends: Arc<ProviderRegistry> = Arc::new(registry.clone());
            let balancer = LoadBalancingProvider::new(profile.clone(), backends)?;
            if registry.get(balancer.name()).is_some() {
                return Err(CoreError::Configuration(format!(
                    "load balancer name {} collides with a provider",
                    balancer.name()
                )));
            }
            registry.register(Arc::new(balancer));
        }
        if registry.is_empty() {
            return Err(CoreError::Configuration("no providers are enabled".to_string()));
        }

        let runtime_config = StaticRuntimeConfig {
            session_id: format!("session-{}", Uuid::new_v4().simple()),
            conversation_logging: config.conversation_logging,
            log_dir: config.conversation_log_dir.clone(),
            redaction: config.redaction,
            ..StaticRuntimeConfig::default()
        };
        let runtime = RuntimeContext::new(
            Arc::new(InMemorySettingsService::new()),
            Arc::new(runtime_config),
        )
        .with_runtime_id("llmux-app");
        let bound = registry.bind_runtime(&runtime);
        info!(
            event = "app.providers.ready",
            providers = ?registry.names(),
            default_provider = %config.default_provider,
            bound
        );

        Ok(Self { registry, default_provider: config.default_provider.clone(), runtime })
    }

    pub fn names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.registry.get(name)
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    /// `provider/model` selects a registered provider; anything else goes to the default.
    pub fn resolve_target(&self, target: Option<&str>) -> (String, Option<String>) {
        let Some(target) = target.map(str::trim).filter(|target| !target.is_empty()) else {
            return (self.default_provider.clone(), None);
        };
        if self.registry.get(target).is_some() {
            return (target.to_string(), None);
        }
        if let Some((candidate, model)) = target.split_once('/')
            && self.registry.get(candidate).is_some()
        {
            return (candidate.to_string(), Some(model.to_string()));
        }
        (self.default_provider.clone(), Some(target.to_string()))
    }

    pub fn chat(
        &self,
        target: Option<&str>,
        contents: Vec<Content>,
    ) -> Result<ContentStream, CoreError> {
        let (name, model) = self.resolve_target(target);
        let provider = self.provider(&name).ok_or_else(|| {
            CoreError::Configuration(format!("provider {name} is not configured"))
        })?;
        let mut options = CallOptions::new(contents).with_runtime(self.runtime.clone());
        options.resolved.model = model;
        provider.generate_chat_completion(options.into())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use llmux_balancer::{LoadBalancerProfile, SubProfile};

    use super::*;

    fn stack(config: &AppConfig) -> ProviderStack {
        ProviderStack::from_config(config).expect("stack must build")
    }

    async fn reply(stack: &ProviderStack, target: Option<&str>, text: &str) -> String {
        let chunks: Vec<Content> = stack
            .chat(target, vec![Content::human_text(text)])
            .expect("call must be accepted")
            .map(|chunk| chunk.expect("chunk must be ok"))
            .collect()
            .await;
        chunks.iter().map(Content::text).collect()
    }

    #[tokio::test]
    async fn test_config_serves_the_mock_by_default() {
        let stack = stack(&AppConfig::for_tests());
        assert_eq!(stack.names(), vec!["mock".to_string()]);
        assert_eq!(stack.default_provider(), "mock");
        assert_eq!(reply(&stack, None, "hello world").await, "[mock] hello world");
    }

    #[test]
    fn targets_resolve_by_name_then_prefix() {
        let stack = stack(&AppConfig::for_tests());
        assert_eq!(stack.resolve_target(None), ("mock".to_string(), None));
        assert_eq!(stack.resolve_target(Some("mock")), ("mock".to_string(), None));
        assert_eq!(
            stack.resolve_target(Some("mock/tiny")),
            ("mock".to_string(), Some("tiny".to_string()))
        );
        assert_eq!(
            stack.resolve_target(Some("gpt-4.1")),
            ("mock".to_string(), Some("gpt-4.1".to_string()))
        );
    }

    #[test]
    fn unknown_default_provider_is_a_configuration_error() {
        let mut config = AppConfig::for_tests();
        config.default_provider = "missing".to_string();
        let stack = stack(&config);
        assert!(matches!(
            stack.chat(None, vec![Content::human_text("x")]),
            Err(CoreError::Configuration(message)) if message.contains("missing")
        ));
    }

    #[test]
    fn disabling_everything_fails_fast() {
        let mut config = AppConfig::for_tests();
        for provider in config.providers.values_mut() {
            provider.enabled = false;
        }
        assert!(matches!(
            ProviderStack::from_config(&config),
            Err(CoreError::Configuration(message)) if message.contains("no providers")
        ));
    }

    #[tokio::test]
    async fn load_balancer_is_registered_over_the_logged_providers() {
        let mut config = AppConfig::for_tests();
        config.load_balancer = Some(LoadBalancerProfile {
            name: "pool".to_string(),
            sub_profiles: vec![
                SubProfile::new("small", "mock").with_model("mock-small"),
                SubProfile::new("large", "mock").with_model("mock-large"),
            ],
            ..LoadBalancerProfile::default()
        });
        config.default_provider = "pool".to_string();
        let stack = stack(&config);
        assert_eq!(stack.names(), vec!["mock".to_string(), "pool".to_string()]);
        assert_eq!(reply(&stack, None, "one").await, "[mock] one");
        assert_eq!(reply(&stack, Some("pool"), "two").await, "[mock] two");
    }

    #[test]
    fn balancer_name_must_not_shadow_a_provider() {
        let mut config = AppConfig::for_tests();
        config.load_balancer = Some(LoadBalancerProfile {
            name: "mock".to_string(),
            sub_profiles: vec![SubProfile::new("only", "mock")],
            ..LoadBalancerProfile::default()
        });
        assert!(matches!(
            ProviderStack::from_config(&config),
            Err(CoreError::Configuration(message)) if message.contains("collides")
        ));
    }
}
