use std::{collections::BTreeMap, fmt, sync::Arc};

use llmux_contracts::{Content, ToolDefinition};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{MessageRedactor, RuntimeConfig, SettingsService};

pub type AbortSignal = CancellationToken;

/// Per-call collaborators every invocation needs.
#[derive(Clone, Default)]
pub struct RuntimeContext {
    pub settings_service: Option<Arc<dyn SettingsService>>,
    pub config: Option<Arc<dyn RuntimeConfig>>,
    pub runtime_id: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl RuntimeContext {
    pub fn new(settings_service: Arc<dyn SettingsService>, config: Arc<dyn RuntimeConfig>) -> Self {
        Self {
            settings_service: Some(settings_service),
            config: Some(config),
            runtime_id: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_runtime_id(mut self, runtime_id: impl Into<String>) -> Self {
        self.runtime_id = Some(runtime_id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("settings_service", &self.settings_service.is_some())
            .field("config", &self.config.is_some())
            .field("runtime_id", &self.runtime_id)
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationContext {
    pub ephemeral_settings: BTreeMap<String, Value>,
    pub model_params: BTreeMap<String, Value>,
    pub user_memory: Option<String>,
}

/// Values resolved upstream (for example by a load-balancer sub-profile).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedOverrides {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub streaming: Option<bool>,
}

#[derive(Clone, Default)]
pub struct CallOptions {
    pub contents: Vec<Content>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub resolved: ResolvedOverrides,
    pub runtime: RuntimeContext,
    pub invocation: InvocationContext,
    pub abort: Option<AbortSignal>,
    pub redactor: Option<Arc<dyn MessageRedactor>>,
}

impl CallOptions {
    pub fn new(contents: Vec<Content>) -> Self {
        Self { contents, ..Self::default() }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeContext) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_resolved(mut self, resolved: ResolvedOverrides) -> Self {
        self.resolved = resolved;
        self
    }

    pub fn with_ephemeral(mut self, key: &str, value: Value) -> Self {
        self.invocation.ephemeral_settings.insert(key.to_string(), value);
        self
    }

    pub fn with_model_param(mut self, key: &str, value: Value) -> Self {
        self.invocation.model_params.insert(key.to_string(), value);
        self
    }

    pub fn with_user_memory(mut self, memory: impl Into<String>) -> Self {
        self.invocation.user_memory = Some(memory.into());
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn MessageRedactor>) -> Self {
        self.redactor = Some(redactor);
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("contents", &self.contents.len())
            .field("tools", &self.tools.as_ref().map(Vec::len))
            .field("resolved", &self.resolved)
            .field("runtime", &self.runtime)
            .field("invocation", &self.invocation)
            .field("abort", &self.abort.is_some())
            .field("redactor", &self.redactor.is_some())
            .finish()
    }
}

/// Inbound shape of `generate_chat_completion`.
#[derive(Debug, Clone)]
pub enum CallInput {
    Contents(Vec<Content>),
    Options(Box<CallOptions>),
}

impl CallInput {
    pub fn contents(&self) -> &[Content] {
        match self {
            Self::Contents(contents) => contents,
            Self::Options(options) => &options.contents,
        }
    }

    pub fn options(&self) -> Option<&CallOptions> {
        match self {
            Self::Contents(_) => None,
            Self::Options(options) => Some(options),
        }
    }

    /// Lifts the legacy shape into options carrying `runtime`.
    pub fn into_options(self, runtime: Option<&RuntimeContext>) -> CallOptions {
        match self {
            Self::Contents(contents) => CallOptions {
                contents,
                runtime: runtime.cloned().unwrap_or_default(),
                ..CallOptions::default()
            },
            Self::Options(options) => *options,
        }
    }
}

impl From<Vec<Content>> for CallInput {
    fn from(contents: Vec<Content>) -> Self {
        Self::Contents(contents)
    }
}

impl From<CallOptions> for CallInput {
    fn from(options: CallOptions) -> Self {
        Self::Options(Box::new(options))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub model: String,
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub streaming: bool,
}

#[derive(Clone)]
pub struct NormalizedRuntime {
    pub settings_service: Arc<dyn SettingsService>,
    pub config: Arc<dyn RuntimeConfig>,
    pub runtime_id: String,
    pub metadata: BTreeMap<String, Value>,
}

/// Fully merged per-call configuration handed to a backend.
#[derive(Clone)]
pub struct NormalizedCallOptions {
    pub provider: String,
    pub contents: Vec<Content>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub resolved: ResolvedOptions,
    pub runtime: NormalizedRuntime,
    pub invocation: InvocationContext,
    pub abort: AbortSignal,
    pub redactor: Option<Arc<dyn MessageRedactor>>,
}

impl NormalizedCallOptions {
    /// Per-call ephemeral value, falling back to the settings service.
    pub fn ephemeral(&self, key: &str) -> Option<Value> {
        self.invocation
            .ephemeral_settings
            .get(key)
            .cloned()
            .or_else(|| self.runtime.settings_service.get(key))
    }

    pub fn ephemeral_bool(&self, key: &str, default: bool) -> bool {
        self.ephemeral(key).as_ref().and_then(value_as_bool).unwrap_or(default)
    }

    pub fn ephemeral_str(&self, key: &str) -> Option<String> {
        self.ephemeral(key)
            .and_then(|value| value.as_str().map(str::trim).map(ToString::to_string))
            .filter(|value| !value.is_empty())
    }

    pub fn ephemeral_u64(&self, key: &str) -> Option<u64> {
        self.ephemeral(key).and_then(|value| match value {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        self.tools.as_deref().unwrap_or(&[])
    }
}

impl fmt::Debug for NormalizedCallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedCallOptions")
            .field("provider", &self.provider)
            .field("contents", &self.contents.len())
            .field("tools", &self.tools.as_ref().map(Vec::len))
            .field("model", &self.resolved.model)
            .field("base_url", &self.resolved.base_url)
            .field("streaming", &self.resolved.streaming)
            .field("runtime_id", &self.runtime.runtime_id)
            .finish()
    }
}

/// Accepts JSON booleans and the usual textual spellings.
pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" | "enabled" => Some(true),
            "0" | "false" | "no" | "off" | "disabled" => Some(false),
            _ => None,
        },
        Value::Number(number) => number.as_u64().map(|n| n != 0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn value_as_bool_accepts_common_spellings() {
        assert_eq!(value_as_bool(&json!(true)), Some(true));
        assert_eq!(value_as_bool(&json!("disabled")), Some(false));
        assert_eq!(value_as_bool(&json!(" ON ")), Some(true));
        assert_eq!(value_as_bool(&json!(0)), Some(false));
        assert_eq!(value_as_bool(&json!("maybe")), None);
        assert_eq!(value_as_bool(&json!(null)), None);
    }

    #[test]
    fn legacy_input_inherits_runtime() {
        let runtime = RuntimeContext::default().with_runtime_id("bound");
        let input = CallInput::from(vec![Content::human_text("hi")]);
        let options = input.into_options(Some(&runtime));
        assert_eq!(options.runtime.runtime_id.as_deref(), Some("bound"));
        assert_eq!(options.contents.len(), 1);
    }

    #[test]
    fn options_input_keeps_its_own_runtime() {
        let bound = RuntimeContext::default().with_runtime_id("bound");
        let options = CallOptions::new(vec![])
            .with_runtime(RuntimeContext::default().with_runtime_id("explicit"));
        let options = CallInput::from(options).into_options(Some(&bound));
        assert_eq!(options.runtime.runtime_id.as_deref(), Some("explicit"));
    }
}
