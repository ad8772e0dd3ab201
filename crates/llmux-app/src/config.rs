use std::{collections::BTreeMap, env, path::PathBuf};

use llmux_balancer::LoadBalancerProfile;
use llmux_core::RedactionSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
    Mock,
}

impl ProviderKind {
    pub const ALL: [Self; 5] =
        [Self::OpenAi, Self::Anthropic, Self::Gemini, Self::Ollama, Self::Mock];

    pub fn name(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        }
    }

    fn env_prefix(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI",
            Self::Anthropic => "ANTHROPIC",
            Self::Gemini => "GEMINI",
            Self::Ollama => "OLLAMA",
            Self::Mock => "LLMUX_MOCK",
        }
    }

    /// The offline mock is opt-in; real backends are on unless disabled.
    fn enabled_by_default(self) -> bool {
        !matches!(self, Self::Mock)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider_timeout_seconds: u64,
    pub provider_max_inflight: usize,
    pub default_provider: String,
    pub conversation_logging: bool,
    pub conversation_log_dir: Option<PathBuf>,
    pub redaction: RedactionSettings,
    pub load_balancer: Option<LoadBalancerProfile>,
    pub providers: BTreeMap<ProviderKind, ProviderConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid LLMUX_PROVIDER_TIMEOUT value: {0}")]
    InvalidProviderConnectTimeout(String),
    #[error("invalid LLMUX_PROVIDER_MAX_INFLIGHT value: {0}")]
    InvalidProviderMaxInflight(String),
    #[error("invalid {var} value: {value}")]
    InvalidBool { var: String, value: String },
    #[error("invalid LLMUX_LOAD_BALANCER profile: {0}")]
    InvalidLoadBalancer(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let provider_timeout_raw =
            lookup("LLMUX_PROVIDER_TIMEOUT").unwrap_or_else(|| "15".to_string());
        let provider_timeout_seconds = provider_timeout_raw.trim().parse::<u64>().map_err(|_| {
            ConfigError::InvalidProviderConnectTimeout(provider_timeout_raw.clone())
        })?;
        let provider_max_inflight_raw =
            lookup("LLMUX_PROVIDER_MAX_INFLIGHT").unwrap_or_else(|| "100".to_string());
        let provider_max_inflight = parse_positive_usize(&provider_max_inflight_raw)
            .ok_or(ConfigError::InvalidProviderMaxInflight(provider_max_inflight_raw))?;

        let conversation_logging = bool_var(&lookup, "LLMUX_CONVERSATION_LOGGING", false)?;
        let conversation_log_dir =
            non_empty(lookup("LLMUX_CONVERSATION_LOG_DIR")).map(PathBuf::from);
        let redact = parse_string_list(lookup("LLMUX_REDACT").unwrap_or_default().trim(), &[]);
        let redaction = RedactionSettings::from_categories(redact.iter().map(String::as_str));

        let load_balancer = non_empty(lookup("LLMUX_LOAD_BALANCER"))
            .map(|raw| {
                serde_json::from_str::<LoadBalancerProfile>(&raw)
                    .map_err(|err| ConfigError::InvalidLoadBalancer(err.to_string()))
            })
            .transpose()?;

        let mut providers = BTreeMap::new();
        for kind in ProviderKind::ALL {
            providers.insert(kind, provider_from_lookup(&lookup, kind)?);
        }
        let default_provider = non_empty(lookup("LLMUX_DEFAULT_PROVIDER"))
            .or_else(|| load_balancer.as_ref().map(|profile| profile.name.clone()))
            .or_else(|| first_enabled(&providers))
            .unwrap_or_else(|| ProviderKind::OpenAi.name().to_string());

        Ok(Self {
            provider_timeout_seconds,
            provider_max_inflight,
            default_provider,
            conversation_logging,
            conversation_log_dir,
            redaction,
            load_balancer,
            providers,
        })
    }

    /// Offline configuration: only the mock backend, logging off.
    pub fn for_tests() -> Self {
        Self {
            provider_timeout_seconds: 15,
            provider_max_inflight: 100,
            default_provider: ProviderKind::Mock.name().to_string(),
            conversation_logging: false,
            conversation_log_dir: None,
            redaction: RedactionSettings::default(),
            load_balancer: None,
            providers: ProviderKind::ALL
                .into_iter()
                .map(|kind| {
                    let enabled = kind == ProviderKind::Mock;
                    (kind, ProviderConfig { enabled, ..ProviderConfig::default() })
                })
                .collect(),
        }
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.get(&kind).filter(|config| config.enabled)
    }
}

fn provider_from_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    kind: ProviderKind,
) -> Result<ProviderConfig, ConfigError> {
    let prefix = kind.env_prefix();
    Ok(ProviderConfig {
        enabled: bool_var(lookup, &format!("{prefix}_ENABLED"), kind.enabled_by_default())?,
        api_key: non_empty(lookup(&format!("{prefix}_API_KEY"))),
        base_url: non_empty(lookup(&format!("{prefix}_BASE_URL"))),
        model: non_empty(lookup(&format!("{prefix}_MODEL"))),
    })
}

fn first_enabled(providers: &BTreeMap<ProviderKind, ProviderConfig>) -> Option<String> {
    providers
        .iter()
        .find(|(_, config)| config.enabled)
        .map(|(kind, _)| kind.name().to_string())
}

fn bool_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => parse_bool(&raw)
            .ok_or_else(|| ConfigError::InvalidBool { var: var.to_string(), value: raw }),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive_usize(value: &str) -> Option<usize> {
    let parsed = value.trim().parse::<usize>().ok()?;
    if parsed == 0 { None } else { Some(parsed) }
}

/// Comma-separated list or JSON string array; empty or unparsable input yields `default`.
fn parse_string_list(trimmed: &str, default: &[&str]) -> Vec<String> {
    let fallback = || default.iter().map(|value| (*value).to_string()).collect::<Vec<_>>();
    if trimmed.is_empty() {
        return fallback();
    }
    if trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Vec<String>>(trimmed) {
            return parsed
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect();
        }
        return fallback();
    }

    let parsed = trimmed
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();
    if parsed.is_empty() { fallback() } else { parsed }
}
