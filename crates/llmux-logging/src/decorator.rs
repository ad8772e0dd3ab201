use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::StreamExt;
use llmux_contracts::{ModelInfo, UsageStats};
use llmux_core::{
    CallInput, ContentStream, CoreError, MessageRedactor, Provider, RuntimeConfig,
    RuntimeContext, RuntimeSettingsAware, ThrottleTrackable,
};
use serde_json::Value;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    ConfigurableRedactor, ConversationLogWriter, DiagnosticSink, JsonlConversationWriter,
    RecordKey, RequestRecord, RequestTelemetry, ResponseRecord, ResponseTelemetry,
    TelemetrySink, ToolCallRecord, TracingDiagnostics, TracingTelemetrySink,
};

/// Collaborators of a [`LoggingProvider`]; unset fields fall back to the call's runtime.
#[derive(Clone)]
pub struct LoggingConfig {
    pub redactor: Option<Arc<dyn MessageRedactor>>,
    pub writer: Option<Arc<dyn ConversationLogWriter>>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub diagnostics: Arc<dyn DiagnosticSink>,
    pub conversation_id: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            redactor: None,
            writer: None,
            telemetry: Arc::new(TracingTelemetrySink),
            diagnostics: Arc::new(TracingDiagnostics),
            conversation_id: None,
        }
    }
}

impl LoggingConfig {
    pub fn with_redactor(mut self, redactor: Arc<dyn MessageRedactor>) -> Self {
        self.redactor = Some(redactor);
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn ConversationLogWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Aggregated call metrics for one decorator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderPerformance {
    pub requests: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_duration: Duration,
    pub last_usage: Option<UsageStats>,
}

impl ProviderPerformance {
    fn record(&mut self, duration: Duration, success: bool, usage: Option<UsageStats>) {
        self.requests = self.requests.saturating_add(1);
        if !success {
            self.failures = self.failures.saturating_add(1);
        }
        self.total_duration = self.total_duration.saturating_add(duration);
        if let Some(usage) = usage {
            self.prompt_tokens = self.prompt_tokens.saturating_add(usage.prompt_tokens);
            self.completion_tokens =
                self.completion_tokens.saturating_add(usage.completion_tokens);
            self.total_tokens = self.total_tokens.saturating_add(usage.total_tokens);
            self.last_usage = Some(usage);
        }
    }

    pub fn average_latency(&self) -> Option<Duration> {
        u32::try_from(self.requests).ok().filter(|requests| *requests > 0).map(|requests| {
            self.total_duration / requests
        })
    }
}

/// What a finished turn produced, before redaction.
struct TurnOutcome {
    text: String,
    tool_calls: Vec<(String, String, Value)>,
    duration: Duration,
    failure: Option<String>,
    usage: Option<UsageStats>,
}

impl TurnOutcome {
    fn failed(duration: Duration, error: String) -> Self {
        Self {
            text: String::new(),
            tool_calls: Vec::new(),
            duration,
            failure: Some(error),
            usage: None,
        }
    }
}

/// Sinks and identity of one logged turn.
struct TurnLog {
    provider: String,
    key: RecordKey,
    writer: Option<Arc<dyn ConversationLogWriter>>,
    telemetry: Arc<dyn TelemetrySink>,
    diagnostics: Arc<dyn DiagnosticSink>,
    redactor: Arc<dyn MessageRedactor>,
}

impl TurnLog {
    fn report(&self, err: &CoreError) {
        self.diagnostics.persistence_failed(&self.provider, &self.key, err);
    }

    async fn request(&self, request: RequestRecord) {
        self.telemetry.record_request(&RequestTelemetry {
            provider: self.provider.clone(),
            key: self.key.clone(),
            messages: request.contents.len(),
            tools: request.tools.len(),
        });
        if let Some(writer) = &self.writer
            && let Err(err) = writer.write_request(&self.key, request).await
        {
            self.report(&err);
        }
    }

    async fn response(&self, outcome: TurnOutcome) {
        let success = outcome.failure.is_none();
        self.telemetry.record_response(&ResponseTelemetry {
            provider: self.provider.clone(),
            key: self.key.clone(),
            duration: outcome.duration,
            success,
            chars: outcome.text.chars().count(),
            tool_calls: outcome.tool_calls.len(),
            usage: outcome.usage,
        });
        let Some(writer) = &self.writer else {
            return;
        };
        let response = ResponseRecord {
            provider: self.provider.clone(),
            text: self.redactor.redact_response_content(&outcome.text),
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
            success,
            error: outcome
                .failure
                .as_deref()
                .map(|error| self.redactor.redact_response_content(error)),
            usage: outcome.usage,
        };
        if let Err(err) = writer.write_response(&self.key, response).await {
            self.report(&err);
        }
        for (call_id, tool_name, parameters) in outcome.tool_calls {
            let call = ToolCallRecord {
                provider: self.provider.clone(),
                parameters: self.redactor.redact_tool_call(&tool_name, &parameters),
                call_id,
                tool_name,
            };
            if let Err(err) = writer.write_tool_call(&self.key, call).await {
                self.report(&err);
            }
        }
    }
}

/// Wraps a provider with redacted conversation logging and usage metrics.
///
/// Chunks pass through unmodified. Persistence failures go to the diagnostic sink and
/// never reach the caller.
pub struct LoggingProvider {
    inner: Arc<dyn Provider>,
    config: LoggingConfig,
    turns: AtomicU64,
    metrics: Arc<Mutex<ProviderPerformance>>,
    directory_writers: Mutex<BTreeMap<PathBuf, Arc<JsonlConversationWriter>>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl LoggingProvider {
    pub fn new(inner: Arc<dyn Provider>, config: LoggingConfig) -> Self {
        Self {
            inner,
            config,
            turns: AtomicU64::new(0),
            metrics: Arc::new(Mutex::new(ProviderPerformance::default())),
            directory_writers: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Provider> {
        &self.inner
    }

    pub fn metrics(&self) -> ProviderPerformance {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Waits until records of synchronously rejected calls are written.
    pub async fn flush(&self) {
        let pending =
            std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        for task in pending {
            if let Err(err) = task.await {
                warn!(
                    event = "provider.log.flush_failed",
                    provider = %self.inner.name(),
                    error = %err
                );
            }
        }
    }

    /// Rejections surface before any stream exists, so their records are written on a task.
    fn persist_detached(&self, log: TurnLog, request: RequestRecord, outcome: TurnOutcome) {
        let Ok(handle) = Handle::try_current() else {
            log.report(&CoreError::Persistence(
                "no async runtime to persist a rejected call".to_string(),
            ));
            return;
        };
        let task = handle.spawn(async move {
            log.request(request).await;
            log.response(outcome).await;
        });
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|task| !task.is_finished());
        pending.push(task);
    }

    fn call_runtime(&self, input: &CallInput) -> RuntimeContext {
        match input.options() {
            Some(options) => options.runtime.clone(),
            None => self
                .inner
                .runtime_settings()
                .and_then(|binding| binding.bound_runtime())
                .unwrap_or_default(),
        }
    }

    fn writer_for(&self, config: &dyn RuntimeConfig) -> Option<Arc<dyn ConversationLogWriter>> {
        if let Some(writer) = &self.config.writer {
            return Some(writer.clone());
        }
        let dir = config.conversation_log_dir()?;
        let mut writers = self.directory_writers.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = writers
            .entry(dir.clone())
            .or_insert_with(|| Arc::new(JsonlConversationWriter::new(dir)))
            .clone();
        Some(writer)
    }
}

#[async_trait]
impl Provider for LoggingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate_chat_completion(&self, input: CallInput) -> Result<ContentStream, CoreError> {
        let provider = self.inner.name().to_string();
        let runtime = self.call_runtime(&input);
        let runtime_config = runtime.config.clone();
        let logging_enabled =
            runtime_config.as_ref().is_some_and(|config| config.conversation_logging_enabled());

        let redactor: Arc<dyn MessageRedactor> = input
            .options()
            .and_then(|options| options.redactor.clone())
            .or_else(|| self.config.redactor.clone())
            .unwrap_or_else(|| {
                let settings =
                    runtime_config.as_ref().map(|config| config.redaction()).unwrap_or_default();
                Arc::new(ConfigurableRedactor::new(settings))
            });
        let writer = match (&runtime_config, logging_enabled) {
            (Some(config), true) => self.writer_for(config.as_ref()),
            _ => None,
        };

        let turn = self.turns.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let conversation_id = self
            .config
            .conversation_id
            .clone()
            .or_else(|| runtime_config.as_ref().map(|config| config.session_id()))
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| "default".to_string());
        let key = RecordKey { conversation_id, turn, correlation_id: Uuid::new_v4().to_string() };

        let request = logging_enabled.then(|| RequestRecord {
            provider: provider.clone(),
            contents: input
                .contents()
                .iter()
                .map(|content| redactor.redact_message(content))
                .collect(),
            tools: input
                .options()
                .and_then(|options| options.tools.as_ref())
                .map(|tools| tools.iter().map(|tool| tool.name.clone()).collect())
                .unwrap_or_default(),
        });
        let log = TurnLog {
            provider: provider.clone(),
            key,
            writer,
            telemetry: self.config.telemetry.clone(),
            diagnostics: self.config.diagnostics.clone(),
            redactor,
        };

        let started = Instant::now();
        let mut inner = match self.inner.generate_chat_completion(input) {
            Ok(stream) => stream,
            Err(err) => {
                let duration = started.elapsed();
                self.metrics.lock().unwrap_or_else(PoisonError::into_inner).record(
                    duration,
                    false,
                    None,
                );
                warn!(
                    event = "provider.call.rejected",
                    provider = %provider,
                    turn,
                    correlation_id = %log.key.correlation_id,
                    error = %err
                );
                if let Some(request) = request {
                    let outcome = TurnOutcome::failed(duration, err.to_string());
                    self.persist_detached(log, request, outcome);
                }
                return Err(err);
            }
        };
        debug!(
            event = "provider.call.started",
            provider = %provider,
            turn,
            correlation_id = %log.key.correlation_id,
            logging_enabled
        );

        let metrics = self.metrics.clone();
        Ok(Box::pin(async_stream::stream! {
            if let Some(request) = request {
                log.request(request).await;
            }

            let mut text = String::new();
            let mut tool_calls: Vec<(String, String, Value)> = Vec::new();
            let mut usage = None;
            let mut failure = None;
            while let Some(item) = inner.next().await {
                match &item {
                    Ok(content) => {
                        if logging_enabled {
                            text.push_str(&content.text());
                            tool_calls.extend(content.tool_calls().map(|(id, name, parameters)| {
                                (id.to_string(), name.to_string(), parameters.clone())
                            }));
                        }
                        if let Some(reported) = content.usage() {
                            usage = Some(*reported);
                        }
                    }
                    Err(err) => failure = Some(err.to_string()),
                }
                let failed = item.is_err();
                yield item;
                if failed {
                    break;
                }
            }

            let duration = started.elapsed();
            metrics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(duration, failure.is_none(), usage);
            if logging_enabled {
                log.response(TurnOutcome { text, tool_calls, duration, failure, usage }).await;
            }
        }))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, CoreError> {
        self.inner.get_models().await
    }

    fn get_default_model(&self) -> String {
        self.inner.get_default_model()
    }

    fn get_server_tools(&self) -> Vec<String> {
        self.inner.get_server_tools()
    }

    async fn invoke_server_tool(&self, tool_name: &str, params: Value) -> Result<Value, CoreError> {
        self.inner.invoke_server_tool(tool_name, params).await
    }

    fn throttle_tracker(&self) -> Option<&dyn ThrottleTrackable> {
        self.inner.throttle_tracker()
    }

    fn runtime_settings(&self) -> Option<&dyn RuntimeSettingsAware> {
        self.inner.runtime_settings()
    }
}
