use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Settings store consulted by the guard and adapters on every call.
pub trait SettingsService: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn provider_setting(&self, provider: &str, key: &str) -> Option<Value>;
    fn set_provider_setting(&self, provider: &str, key: &str, value: Value);

    /// Snapshot of the global (ephemeral) settings.
    fn ephemeral_settings(&self) -> BTreeMap<String, Value>;
}

#[derive(Debug, Default)]
pub struct InMemorySettingsService {
    global: RwLock<BTreeMap<String, Value>>,
    providers: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl InMemorySettingsService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn with_provider(self, provider: &str, key: &str, value: Value) -> Self {
        self.set_provider_setting(provider, key, value);
        self
    }
}

impl SettingsService for InMemorySettingsService {
    fn get(&self, key: &str) -> Option<Value> {
        self.global.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.global.write().unwrap_or_else(PoisonError::into_inner).insert(key.to_string(), value);
    }

    fn provider_setting(&self, provider: &str, key: &str) -> Option<Value> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .and_then(|settings| settings.get(key))
            .cloned()
    }

    fn set_provider_setting(&self, provider: &str, key: &str, value: Value) {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(provider.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn ephemeral_settings(&self) -> BTreeMap<String, Value> {
        self.global.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RedactionSettings {
    #[serde(default)]
    pub api_keys: bool,
    #[serde(default)]
    pub credentials: bool,
    #[serde(default)]
    pub file_paths: bool,
    #[serde(default)]
    pub emails: bool,
    #[serde(default)]
    pub personal_info: bool,
}

impl RedactionSettings {
    pub fn all() -> Self {
        Self {
            api_keys: true,
            credentials: true,
            file_paths: true,
            emails: true,
            personal_info: true,
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.api_keys || self.credentials || self.file_paths || self.emails || self.personal_info
    }

    /// Parses category names such as `api_keys` or `emails`; unknown names are ignored.
    pub fn from_categories<'a>(categories: impl IntoIterator<Item = &'a str>) -> Self {
        let mut settings = Self::default();
        for category in categories {
            match category.trim().to_ascii_lowercase().replace('-', "_").as_str() {
                "api_keys" | "apikeys" => settings.api_keys = true,
                "credentials" => settings.credentials = true,
                "file_paths" | "paths" => settings.file_paths = true,
                "emails" => settings.emails = true,
                "personal_info" | "pii" => settings.personal_info = true,
                "all" => settings = Self::all(),
                _ => {}
            }
        }
        settings
    }
}

/// Read-only process configuration visible to every call.
pub trait RuntimeConfig: Send + Sync {
    fn session_id(&self) -> String;
    fn conversation_logging_enabled(&self) -> bool;
    fn conversation_log_dir(&self) -> Option<PathBuf>;
    fn redaction(&self) -> RedactionSettings;

    fn feature_enabled(&self, _flag: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticRuntimeConfig {
    pub session_id: String,
    pub conversation_logging: bool,
    pub log_dir: Option<PathBuf>,
    pub redaction: RedactionSettings,
    pub features: BTreeSet<String>,
}

impl StaticRuntimeConfig {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), ..Self::default() }
    }

    pub fn with_conversation_logging(mut self, enabled: bool) -> Self {
        self.conversation_logging = enabled;
        self
    }

    pub fn with_redaction(mut self, redaction: RedactionSettings) -> Self {
        self.redaction = redaction;
        self
    }
}

impl RuntimeConfig for StaticRuntimeConfig {
    fn session_id(&self) -> String {
        self.session_id.clone()
    }

    fn conversation_logging_enabled(&self) -> bool {
        self.conversation_logging
    }

    fn conversation_log_dir(&self) -> Option<PathBuf> {
        self.log_dir.clone()
    }

    fn redaction(&self) -> RedactionSettings {
        self.redaction
    }

    fn feature_enabled(&self, flag: &str) -> bool {
        self.features.contains(flag)
    }
}
