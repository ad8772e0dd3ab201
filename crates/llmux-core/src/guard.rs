use std::{env, fmt, fs};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{
    CallInput, CoreError, NormalizedCallOptions, NormalizedRuntime, ResolvedOptions,
    RuntimeContext, SettingsService, options::value_as_bool,
};

pub const MODEL_KEY: &str = "model";
pub const BASE_URL_KEY: &str = "base-url";
pub const AUTH_KEY: &str = "auth-key";
pub const AUTH_KEYFILE_KEY: &str = "auth-keyfile";
pub const STREAMING_KEY: &str = "streaming";

/// Keys that select an endpoint rather than tune a request.
pub const ENDPOINT_KEYS: [&str; 4] = [MODEL_KEY, BASE_URL_KEY, AUTH_KEY, AUTH_KEYFILE_KEY];

pub type EnvLookup = fn(&str) -> Option<String>;

fn process_env(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Adapter-level defaults used when neither the call nor the settings service decide.
#[derive(Clone)]
pub struct ProviderDefaults {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub fallback_base_url: Option<String>,
    pub api_key_env: Vec<String>,
    pub base_url_env: Option<String>,
    pub requires_auth: bool,
    env_lookup: EnvLookup,
}

impl ProviderDefaults {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            base_url: None,
            auth_token: None,
            fallback_base_url: None,
            api_key_env: Vec::new(),
            base_url_env: None,
            requires_auth: true,
            env_lookup: process_env,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model.filter(|value| !value.trim().is_empty()) {
            self.model = model;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn with_fallback_base_url(mut self, url: &str) -> Self {
        self.fallback_base_url = Some(url.to_string());
        self
    }

    pub fn with_api_key_env(mut self, name: &str) -> Self {
        self.api_key_env.push(name.to_string());
        self
    }

    pub fn with_base_url_env(mut self, name: &str) -> Self {
        self.base_url_env = Some(name.to_string());
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    pub fn with_env_lookup(mut self, env_lookup: EnvLookup) -> Self {
        self.env_lookup = env_lookup;
        self
    }

    /// Base URL from the settings service, configured default, environment, built-in.
    pub fn default_base_url(&self, settings: Option<&dyn SettingsService>) -> Option<String> {
        settings
            .and_then(|settings| settings.provider_setting(&self.provider, BASE_URL_KEY))
            .as_ref()
            .and_then(non_empty_value)
            .or_else(|| self.base_url.clone())
            .or_else(|| self.base_url_env.as_deref().and_then(|name| self.env(name)))
            .or_else(|| self.fallback_base_url.clone())
    }

    pub fn default_auth_token(&self, settings: Option<&dyn SettingsService>) -> Option<String> {
        settings
            .and_then(|settings| settings.provider_setting(&self.provider, AUTH_KEY))
            .as_ref()
            .and_then(non_empty_value)
            .or_else(|| self.auth_token.clone())
            .or_else(|| self.api_key_env.iter().find_map(|name| self.env(name)))
    }

    fn env(&self, name: &str) -> Option<String> {
        (self.env_lookup)(name).filter(|value| !value.trim().is_empty())
    }
}

impl fmt::Debug for ProviderDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDefaults")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<set>"))
            .field("fallback_base_url", &self.fallback_base_url)
            .field("api_key_env", &self.api_key_env)
            .field("base_url_env", &self.base_url_env)
            .field("requires_auth", &self.requires_auth)
            .finish()
    }
}

/// Validates the runtime context and resolves model, endpoint and credentials.
///
/// Runs before any backend I/O. The legacy content-array shape takes its runtime
/// from `bound`; an explicit options object never falls back to it.
pub fn normalize_call(
    input: CallInput,
    defaults: &ProviderDefaults,
    bound: Option<&RuntimeContext>,
) -> Result<NormalizedCallOptions, CoreError> {
    let options = input.into_options(bound);
    let provider = defaults.provider.clone();
    let runtime_label =
        options.runtime.runtime_id.clone().unwrap_or_else(|| "unassigned".to_string());

    let settings_service = options.runtime.settings_service.clone().ok_or_else(|| {
        CoreError::MissingRuntimeContext {
            provider: provider.clone(),
            field: "settings_service",
            runtime_id: runtime_label.clone(),
        }
    })?;
    let config = options.runtime.config.clone().ok_or_else(|| {
        CoreError::MissingRuntimeContext {
            provider: provider.clone(),
            field: "config",
            runtime_id: runtime_label.clone(),
        }
    })?;

    let ephemeral = &options.invocation.ephemeral_settings;
    let settings = Some(settings_service.as_ref());

    let model = ephemeral
        .get(MODEL_KEY)
        .and_then(non_empty_value)
        .or_else(|| non_empty(options.resolved.model.as_deref()))
        .or_else(|| {
            settings_service
                .provider_setting(&provider, MODEL_KEY)
                .as_ref()
                .and_then(non_empty_value)
        })
        .unwrap_or_else(|| defaults.model.clone());

    let base_url = ephemeral
        .get(BASE_URL_KEY)
        .and_then(non_empty_value)
        .or_else(|| non_empty(options.resolved.base_url.as_deref()))
        .or_else(|| defaults.default_base_url(settings));

    let explicit_token = match ephemeral.get(AUTH_KEY).and_then(non_empty_value) {
        Some(token) => Some(token),
        None => ephemeral
            .get(AUTH_KEYFILE_KEY)
            .and_then(non_empty_value)
            .map(|path| read_keyfile(&provider, &path))
            .transpose()?,
    };
    let auth_token = explicit_token
        .or_else(|| non_empty(options.resolved.auth_token.as_deref()))
        .or_else(|| defaults.default_auth_token(settings));

    if defaults.requires_auth && auth_token.is_none() {
        let endpoint = base_url.clone().unwrap_or_default();
        if !is_local_endpoint(&endpoint) {
            return Err(CoreError::Authentication { provider, endpoint });
        }
    }

    let streaming = ephemeral
        .get(STREAMING_KEY)
        .and_then(value_as_bool)
        .or(options.resolved.streaming)
        .or_else(|| settings_service.get(STREAMING_KEY).as_ref().and_then(value_as_bool))
        .unwrap_or(true);

    let runtime_id = options
        .runtime
        .runtime_id
        .clone()
        .unwrap_or_else(|| format!("runtime-{}", Uuid::new_v4().simple()));

    debug!(
        event = "runtime.guard.normalized",
        provider = %provider,
        model = %model,
        runtime_id = %runtime_id,
        streaming,
        has_auth = auth_token.is_some(),
        base_url = base_url.as_deref().unwrap_or("")
    );

    Ok(NormalizedCallOptions {
        provider,
        contents: options.contents,
        tools: options.tools,
        resolved: ResolvedOptions { model, base_url, auth_token, streaming },
        runtime: NormalizedRuntime {
            settings_service,
            config,
            runtime_id,
            metadata: options.runtime.metadata,
        },
        invocation: options.invocation,
        abort: options.abort.unwrap_or_else(CancellationToken::new),
        redactor: options.redactor,
    })
}

/// Loopback and unspecified hosts accept unauthenticated calls.
pub fn is_local_endpoint(url: &str) -> bool {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = match authority.strip_prefix('[') {
        Some(bracketed) => bracketed.split(']').next().unwrap_or_default(),
        None => authority.split(':').next().unwrap_or_default(),
    };
    let host = host.to_ascii_lowercase();
    host == "localhost"
        || host.ends_with(".localhost")
        || host == "::1"
        || host == "0.0.0.0"
        || host.starts_with("127.")
}

fn read_keyfile(provider: &str, path: &str) -> Result<String, CoreError> {
    let expanded = match path.strip_prefix("~/") {
        Some(rest) => env::var("HOME")
            .map(|home| format!("{home}/{rest}"))
            .unwrap_or_else(|_| path.to_string()),
        None => path.to_string(),
    };
    let token = fs::read_to_string(&expanded).map_err(|err| {
        CoreError::Configuration(format!("{provider} auth keyfile {expanded} is unreadable: {err}"))
    })?;
    let token = token.trim();
    if token.is_empty() {
        return Err(CoreError::Configuration(format!(
            "{provider} auth keyfile {expanded} is empty"
        )));
    }
    Ok(token.to_string())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|value| !value.is_empty()).map(ToString::to_string)
}

fn non_empty_value(value: &Value) -> Option<String> {
    non_empty(value.as_str())
}
