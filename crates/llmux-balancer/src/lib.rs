//! Round-robin dispatch across named sub-profiles of registered providers.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use llmux_contracts::ModelInfo;
use llmux_core::{
    CallInput, ContentStream, CoreError, Provider, ProviderLookup, ResolvedOverrides,
    RuntimeBinding, RuntimeSettingsAware,
    guard::{AUTH_KEYFILE_KEY, ENDPOINT_KEYS},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

/// One endpoint of a load-balanced pool, as configured.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct SubProfile {
    pub name: String,
    #[serde(alias = "providerName")]
    pub provider_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(
        default,
        alias = "baseUrl",
        alias = "baseURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_url: Option<String>,
    #[serde(default, alias = "authToken", skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, alias = "authKeyfile", skip_serializing_if = "Option::is_none")]
    pub auth_keyfile: Option<String>,
    #[serde(default, alias = "ephemeralSettings")]
    pub ephemeral_settings: BTreeMap<String, Value>,
    #[serde(default, alias = "modelParams")]
    pub model_params: BTreeMap<String, Value>,
}

impl SubProfile {
    pub fn new(name: &str, provider_name: &str) -> Self {
        Self { name: name.to_string(), provider_name: provider_name.to_string(), ..Self::default() }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_string());
        self
    }

    pub fn with_ephemeral(mut self, key: &str, value: Value) -> Self {
        self.ephemeral_settings.insert(key.to_string(), value);
        self
    }

    pub fn with_model_param(mut self, key: &str, value: Value) -> Self {
        self.model_params.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct LoadBalancerProfile {
    pub name: String,
    #[serde(alias = "subProfiles", alias = "profiles")]
    pub sub_profiles: Vec<SubProfile>,
    #[serde(default, alias = "ephemeralSettings")]
    pub ephemeral_settings: BTreeMap<String, Value>,
    #[serde(default, alias = "modelParams")]
    pub model_params: BTreeMap<String, Value>,
}

/// A validated sub-profile: trimmed identity, blank optional fields removed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSubProfile {
    pub name: String,
    pub provider_name: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub auth_keyfile: Option<String>,
    pub ephemeral_settings: BTreeMap<String, Value>,
    pub model_params: BTreeMap<String, Value>,
}

impl ResolvedSubProfile {
    fn resolve(profile: &str, index: usize, raw: &SubProfile) -> Result<Self, CoreError> {
        let name = raw.name.trim();
        if name.is_empty() {
            return Err(CoreError::Configuration(format!(
                "load balancer {profile}: sub-profile #{index} has no name"
            )));
        }
        let provider_name = raw.provider_name.trim();
        if provider_name.is_empty() {
            return Err(CoreError::Configuration(format!(
                "load balancer {profile}: sub-profile {name} has no provider_name"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            provider_name: provider_name.to_string(),
            model: non_empty(raw.model.as_deref()),
            base_url: non_empty(raw.base_url.as_deref()),
            auth_token: non_empty(raw.auth_token.as_deref()),
            auth_keyfile: non_empty(raw.auth_keyfile.as_deref()),
            ephemeral_settings: raw.ephemeral_settings.clone(),
            model_params: raw.model_params.clone(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|value| !value.is_empty()).map(ToString::to_string)
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoadBalancerStats {
    pub profile_name: String,
    pub total_requests: u64,
    pub last_selected: Option<String>,
    pub per_profile_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct BalancerState {
    cursor: usize,
    total_requests: u64,
    per_profile_counts: BTreeMap<String, u64>,
    last_selected: Option<String>,
}

/// Dispatches each call to the next sub-profile in a fixed rotation.
///
/// The cursor advances at selection time, before the provider is resolved, so a
/// misconfigured sub-profile never blocks the ones after it.
pub struct LoadBalancingProvider {
    name: String,
    sub_profiles: Vec<ResolvedSubProfile>,
    ephemeral_settings: BTreeMap<String, Value>,
    model_params: BTreeMap<String, Value>,
    lookup: Arc<dyn ProviderLookup>,
    state: Mutex<BalancerState>,
    binding: RuntimeBinding,
}

impl LoadBalancingProvider {
    pub fn new(
        profile: LoadBalancerProfile,
        lookup: Arc<dyn ProviderLookup>,
    ) -> Result<Self, CoreError> {
        let name = profile.name.trim().to_string();
        if profile.sub_profiles.is_empty() {
            return Err(CoreError::Configuration(format!(
                "load balancer {name} has no sub-profiles"
            )));
        }
        let sub_profiles = profile
            .sub_profiles
            .iter()
            .enumerate()
            .map(|(index, raw)| ResolvedSubProfile::resolve(&name, index, raw))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            event = "balancer.profile.loaded",
            profile = %name,
            sub_profiles = sub_profiles.len()
        );
        Ok(Self {
            name,
            sub_profiles,
            ephemeral_settings: profile.ephemeral_settings,
            model_params: profile.model_params,
            lookup,
            state: Mutex::new(BalancerState::default()),
            binding: RuntimeBinding::default(),
        })
    }

    pub fn sub_profiles(&self) -> &[ResolvedSubProfile] {
        &self.sub_profiles
    }

    pub fn get_stats(&self) -> LoadBalancerStats {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        LoadBalancerStats {
            profile_name: self.name.clone(),
            total_requests: state.total_requests,
            last_selected: state.last_selected.clone(),
            per_profile_counts: state.per_profile_counts.clone(),
        }
    }

    /// Clears counters and `last_selected`; the rotation position is kept.
    pub fn reset_stats(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.total_requests = 0;
        state.per_profile_counts.clear();
        state.last_selected = None;
    }

    fn select(&self) -> (ResolvedSubProfile, u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let selected = self.sub_profiles[state.cursor % self.sub_profiles.len()].clone();
        state.cursor = (state.cursor + 1) % self.sub_profiles.len();
        state.total_requests = state.total_requests.saturating_add(1);
        *state.per_profile_counts.entry(selected.name.clone()).or_insert(0) += 1;
        state.last_selected = Some(selected.name.clone());
        (selected, state.total_requests)
    }

    fn resolve_provider(&self, sub: &ResolvedSubProfile) -> Result<Arc<dyn Provider>, CoreError> {
        self.lookup.lookup(&sub.provider_name).ok_or_else(|| {
            CoreError::Configuration(format!(
                "load balancer {}: sub-profile {} references unknown provider {}",
                self.name, sub.name, sub.provider_name
            ))
        })
    }
}

#[async_trait]
impl Provider for LoadBalancingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_chat_completion(&self, input: CallInput) -> Result<ContentStream, CoreError> {
        let (sub, request) = self.select();
        let provider = match self.resolve_provider(&sub) {
            Ok(provider) => provider,
            Err(err) => {
                warn!(
                    event = "balancer.provider.unresolved",
                    profile = %self.name,
                    sub_profile = %sub.name,
                    provider = %sub.provider_name
                );
                return Err(err);
            }
        };

        let bound = self.binding.bound_runtime();
        let mut options = input.into_options(bound.as_ref());

        let mut ephemeral: BTreeMap<String, Value> =
            std::mem::take(&mut options.invocation.ephemeral_settings)
                .into_iter()
                .filter(|(key, _)| !ENDPOINT_KEYS.contains(&key.as_str()))
                .collect();
        ephemeral.extend(sub.ephemeral_settings.clone());
        ephemeral.extend(self.ephemeral_settings.clone());
        if sub.auth_token.is_none()
            && let Some(keyfile) = &sub.auth_keyfile
        {
            ephemeral.insert(AUTH_KEYFILE_KEY.to_string(), json!(keyfile));
        }
        options.invocation.ephemeral_settings = ephemeral;
        options.invocation.model_params.extend(sub.model_params.clone());
        options.invocation.model_params.extend(self.model_params.clone());

        let inbound = std::mem::take(&mut options.resolved);
        options.resolved = ResolvedOverrides {
            model: sub.model.clone().or(inbound.model),
            base_url: sub.base_url.clone().or(inbound.base_url),
            auth_token: sub.auth_token.clone().or(inbound.auth_token),
            streaming: inbound.streaming,
        };

        info!(
            event = "balancer.sub_profile.selected",
            profile = %self.name,
            sub_profile = %sub.name,
            provider = %sub.provider_name,
            model = options.resolved.model.as_deref().unwrap_or(""),
            request
        );
        provider.generate_chat_completion(options.into())
    }

    /// Models of the first sub-profile's provider.
    async fn get_models(&self) -> Result<Vec<ModelInfo>, CoreError> {
        let first = &self.sub_profiles[0];
        self.resolve_provider(first)?.get_models().await
    }

    fn get_default_model(&self) -> String {
        let first = &self.sub_profiles[0];
        match &first.model {
            Some(model) => model.clone(),
            None => self
                .lookup
                .lookup(&first.provider_name)
                .map(|provider| provider.get_default_model())
                .unwrap_or_default(),
        }
    }

    fn runtime_settings(&self) -> Option<&dyn RuntimeSettingsAware> {
        Some(&self.binding)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use futures::StreamExt;
    use llmux_clients::MockProvider;
    use llmux_contracts::Content;
    use llmux_core::{
        CallOptions, InMemorySettingsService, ProviderRegistry, RuntimeContext,
        StaticRuntimeConfig,
    };

    use super::*;

    fn runtime() -> RuntimeContext {
        RuntimeContext::new(
            Arc::new(InMemorySettingsService::new()),
            Arc::new(StaticRuntimeConfig::new("lb-session")),
        )
        .with_runtime_id("lb-runtime")
    }

    fn registry(mock: &Arc<MockProvider>) -> Arc<dyn ProviderLookup> {
        let mut registry = ProviderRegistry::new();
        registry.register(mock.clone());
        Arc::new(registry)
    }

    fn abc_profile() -> LoadBalancerProfile {
        LoadBalancerProfile {
            name: "pool".to_string(),
            sub_profiles: ["A", "B", "C"]
                .iter()
                .map(|name| SubProfile::new(name, "mock").with_model(&format!("model-{name}")))
                .collect(),
            ..LoadBalancerProfile::default()
        }
    }

    async fn call(balancer: &LoadBalancingProvider, options: CallOptions) -> Vec<Content> {
        balancer
            .generate_chat_completion(options.into())
            .expect("dispatch must succeed")
            .map(|chunk| chunk.expect("chunk must be ok"))
            .collect()
            .await
    }

    fn hello() -> CallOptions {
        CallOptions::new(vec![Content::human_text("hello")]).with_runtime(runtime())
    }

    #[test]
    fn construction_rejects_invalid_profiles() {
        let lookup: Arc<dyn ProviderLookup> = Arc::new(ProviderRegistry::new());
        let empty = LoadBalancerProfile { name: "empty".to_string(), ..Default::default() };
        assert!(matches!(
            LoadBalancingProvider::new(empty, lookup.clone()),
            Err(CoreError::Configuration(message)) if message.contains("no sub-profiles")
        ));

        for (sub, expected) in [
            (SubProfile::new(" ", "mock"), "has no name"),
            (SubProfile::new("a", ""), "has no provider_name"),
        ] {
            let profile = LoadBalancerProfile {
                name: "bad".to_string(),
                sub_profiles: vec![SubProfile::new("ok", "mock"), sub],
                ..Default::default()
            };
            let error = LoadBalancingProvider::new(profile, lookup.clone())
                .err()
                .expect("invalid sub-profile must be rejected");
            assert!(error.to_string().contains(expected), "{error}");
        }
    }

    #[tokio::test]
    async fn seven_calls_rotate_through_three_sub_profiles() {
        let mock = Arc::new(MockProvider::new("mock"));
        let balancer =
            LoadBalancingProvider::new(abc_profile(), registry(&mock)).expect("profile is valid");
        for _ in 0..7 {
            call(&balancer, hello()).await;
        }

        let models: Vec<String> = mock.calls().into_iter().map(|call| call.model).collect();
        assert_eq!(
            models,
            ["A", "B", "C", "A", "B", "C", "A"].map(|name| format!("model-{name}")).to_vec()
        );
        let stats = balancer.get_stats();
        assert_eq!(stats.total_requests, 7);
        assert_eq!(stats.last_selected.as_deref(), Some("A"));
        assert_eq!(
            stats.per_profile_counts,
            BTreeMap::from([("A".to_string(), 3), ("B".to_string(), 2), ("C".to_string(), 2)])
        );
        assert_eq!(stats.per_profile_counts.values().sum::<u64>(), stats.total_requests);
    }

    #[tokio::test]
    async fn reset_is_idempotent_and_keeps_the_cursor() {
        let mock = Arc::new(MockProvider::new("mock"));
        let balancer =
            LoadBalancingProvider::new(abc_profile(), registry(&mock)).expect("profile is valid");
        call(&balancer, hello()).await;
        call(&balancer, hello()).await;

        balancer.reset_stats();
        let once = balancer.get_stats();
        balancer.reset_stats();
        assert_eq!(balancer.get_stats(), once);
        assert_eq!(once.total_requests, 0);
        assert_eq!(once.last_selected, None);
        assert!(once.per_profile_counts.is_empty());

        call(&balancer, hello()).await;
        assert_eq!(balancer.get_stats().last_selected.as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn unknown_provider_fails_but_still_advances() {
        let mock = Arc::new(MockProvider::new("mock"));
        let profile = LoadBalancerProfile {
            name: "pool".to_string(),
            sub_profiles: vec![SubProfile::new("broken", "missing"), SubProfile::new("ok", "mock")],
            ..Default::default()
        };
        let balancer = LoadBalancingProvider::new(profile, registry(&mock)).expect("valid");

        let error = balancer
            .generate_chat_completion(hello().into())
            .err()
            .expect("unknown provider must fail");
        let message = error.to_string();
        assert!(message.contains("broken") && message.contains("missing"), "{message}");

        assert_eq!(call(&balancer, hello()).await.len(), 1);
        assert_eq!(mock.calls().len(), 1);
        assert_eq!(balancer.get_stats().total_requests, 2);
    }

    #[tokio::test]
    async fn settings_merge_inbound_then_sub_profile_then_balancer() {
        let mock = Arc::new(MockProvider::new("mock"));
        let profile = LoadBalancerProfile {
            name: "pool".to_string(),
            sub_profiles: vec![
                SubProfile::new("only", "mock")
                    .with_ephemeral("temperature-mode", json!("sub"))
                    .with_ephemeral("shared", json!("sub"))
                    .with_model_param("temperature", json!(0.5))
                    .with_model_param("top_p", json!(0.9)),
            ],
            ephemeral_settings: BTreeMap::from([("shared".to_string(), json!("lb"))]),
            model_params: BTreeMap::from([("top_p".to_string(), json!(0.1))]),
        };
        let balancer = LoadBalancingProvider::new(profile, registry(&mock)).expect("valid");
        let options = hello()
            .with_ephemeral("inbound-only", json!(1))
            .with_ephemeral("temperature-mode", json!("inbound"))
            .with_ephemeral("model", json!("inbound-model"))
            .with_ephemeral("base-url", json!("https://inbound.test"))
            .with_model_param("max_tokens", json!(64));
        call(&balancer, options).await;

        let recorded = &mock.calls()[0];
        assert_eq!(
            recorded.ephemeral_settings,
            BTreeMap::from([
                ("inbound-only".to_string(), json!(1)),
                ("shared".to_string(), json!("lb")),
                ("temperature-mode".to_string(), json!("sub")),
            ])
        );
        assert_eq!(
            recorded.model_params,
            BTreeMap::from([
                ("max_tokens".to_string(), json!(64)),
                ("temperature".to_string(), json!(0.5)),
                ("top_p".to_string(), json!(0.1)),
            ])
        );
        assert_eq!(recorded.model, "mock-model");
        assert_eq!(recorded.base_url, None);
        assert_eq!(recorded.runtime_id, "lb-runtime");
    }

    #[tokio::test]
    async fn missing_sub_profile_token_inherits_inbound_resolution() {
        let mock = Arc::new(MockProvider::new("mock"));
        let profile = LoadBalancerProfile {
            name: "pool".to_string(),
            sub_profiles: vec![
                SubProfile::new("inherits", "mock"),
                SubProfile::new("owns", "mock").with_auth_token("sub-token"),
            ],
            ..Default::default()
        };
        let balancer = LoadBalancingProvider::new(profile, registry(&mock)).expect("valid");
        let inbound = || {
            hello().with_resolved(ResolvedOverrides {
                model: Some("inbound-model".to_string()),
                auth_token: Some("inbound-token".to_string()),
                ..ResolvedOverrides::default()
            })
        };
        call(&balancer, inbound()).await;
        call(&balancer, inbound()).await;

        let calls = mock.calls();
        assert_eq!(calls[0].auth_token.as_deref(), Some("inbound-token"));
        assert_eq!(calls[0].model, "inbound-model");
        assert_eq!(calls[1].auth_token.as_deref(), Some("sub-token"));
    }

    #[tokio::test]
    async fn sub_profile_keyfile_becomes_the_token() {
        let mut keyfile = tempfile::NamedTempFile::new().expect("keyfile must be created");
        writeln!(keyfile, "file-token").expect("keyfile must be written");
        let mock = Arc::new(MockProvider::new("mock"));
        let mut sub = SubProfile::new("keyed", "mock");
        sub.auth_keyfile = Some(keyfile.path().display().to_string());
        let profile = LoadBalancerProfile {
            name: "pool".to_string(),
            sub_profiles: vec![sub],
            ..Default::default()
        };
        let balancer = LoadBalancingProvider::new(profile, registry(&mock)).expect("valid");
        call(&balancer, hello()).await;
        assert_eq!(mock.calls()[0].auth_token.as_deref(), Some("file-token"));
    }

    #[tokio::test]
    async fn legacy_calls_use_the_bound_runtime() {
        let mock = Arc::new(MockProvider::new("mock"));
        let balancer =
            LoadBalancingProvider::new(abc_profile(), registry(&mock)).expect("profile is valid");
        balancer.runtime_settings().expect("balancer accepts a runtime").bind_runtime(runtime());
        let chunks: Vec<_> = balancer
            .generate_chat_completion(vec![Content::human_text("legacy")].into())
            .expect("bound runtime must satisfy the guard")
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(mock.calls()[0].runtime_id, "lb-runtime");
    }

    #[tokio::test]
    async fn profile_parses_from_json_and_reports_first_models() {
        let profile: LoadBalancerProfile = serde_json::from_value(json!({
            "name": "pool",
            "subProfiles": [
                {"name": "a", "providerName": "mock", "model": "m-a", "modelParams": {"seed": 1}},
                {"name": "b", "provider_name": "mock"}
            ]
        }))
        .expect("profile must parse");
        assert_eq!(profile.sub_profiles[0].model_params.get("seed"), Some(&json!(1)));

        let mock = Arc::new(MockProvider::new("mock"));
        let balancer = LoadBalancingProvider::new(profile, registry(&mock)).expect("valid");
        assert_eq!(balancer.name(), "pool");
        assert_eq!(balancer.get_default_model(), "m-a");
        assert_eq!(
            balancer.get_models().await,
            Ok(vec![ModelInfo::named("mock", "mock-model")])
        );
        assert!(balancer.get_server_tools().is_empty());
    }
}
