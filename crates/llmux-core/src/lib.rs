use std::{
    pin::Pin,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use futures::Stream;
use llmux_contracts::{Content, ModelInfo};
use serde_json::Value;

mod error;
pub mod guard;
mod options;
mod registry;
mod settings;

pub use error::{CoreError, is_retryable_status};
pub use guard::{ProviderDefaults, is_local_endpoint, normalize_call};
pub use options::{
    AbortSignal, CallInput, CallOptions, InvocationContext, NormalizedCallOptions,
    NormalizedRuntime, ResolvedOptions, ResolvedOverrides, RuntimeContext, value_as_bool,
};
pub use registry::{ProviderLookup, ProviderRegistry};
pub use settings::{
    InMemorySettingsService, RedactionSettings, RuntimeConfig, SettingsService,
    StaticRuntimeConfig,
};

/// Lazily consumed, single-pass stream of canonical content for one call.
pub type ContentStream = Pin<Box<dyn Stream<Item = Result<Content, CoreError>> + Send>>;

/// The contract shared by backend adapters and every decorator around them.
///
/// `generate_chat_completion` is synchronous so configuration and authentication
/// failures surface before any chunk; the returned stream performs the I/O.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn generate_chat_completion(&self, input: CallInput) -> Result<ContentStream, CoreError>;

    async fn get_models(&self) -> Result<Vec<ModelInfo>, CoreError>;

    fn get_default_model(&self) -> String;

    fn get_server_tools(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke_server_tool(
        &self,
        tool_name: &str,
        _params: Value,
    ) -> Result<Value, CoreError> {
        Err(CoreError::Unsupported {
            provider: self.name().to_string(),
            operation: format!("server tool {tool_name}"),
        })
    }

    fn throttle_tracker(&self) -> Option<&dyn ThrottleTrackable> {
        None
    }

    fn runtime_settings(&self) -> Option<&dyn RuntimeSettingsAware> {
        None
    }
}

/// Receives backend-requested wait times (for example `retry-after`).
pub trait ThrottleTracker: Send + Sync {
    fn record_wait(&self, provider: &str, wait: Duration);
}

pub trait ThrottleTrackable: Send + Sync {
    fn set_throttle_tracker(&self, tracker: std::sync::Arc<dyn ThrottleTracker>);
}

/// Providers that accept a bound runtime for legacy content-array calls.
pub trait RuntimeSettingsAware: Send + Sync {
    fn bind_runtime(&self, runtime: RuntimeContext);
    fn bound_runtime(&self) -> Option<RuntimeContext>;
}

/// Runtime context bound once at startup and used by legacy content-array calls.
#[derive(Debug, Default)]
pub struct RuntimeBinding {
    bound: RwLock<Option<RuntimeContext>>,
}

impl RuntimeSettingsAware for RuntimeBinding {
    fn bind_runtime(&self, runtime: RuntimeContext) {
        *self.bound.write().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
    }

    fn bound_runtime(&self) -> Option<RuntimeContext> {
        self.bound.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

pub trait MessageRedactor: Send + Sync {
    fn redact_message(&self, content: &Content) -> Content;
    fn redact_tool_call(&self, tool_name: &str, parameters: &Value) -> Value;
    fn redact_response_content(&self, text: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRedactor;

impl MessageRedactor for IdentityRedactor {
    fn redact_message(&self, content: &Content) -> Content {
        content.clone()
    }

    fn redact_tool_call(&self, _tool_name: &str, parameters: &Value) -> Value {
        parameters.clone()
    }

    fn redact_response_content(&self, text: &str) -> String {
        text.to_string()
    }
}
