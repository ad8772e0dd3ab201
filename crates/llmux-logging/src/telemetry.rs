use std::time::Duration;

use llmux_contracts::UsageStats;
use llmux_core::CoreError;
use tracing::{info, warn};

use crate::RecordKey;

#[derive(Debug, Clone, PartialEq)]
pub struct RequestTelemetry {
    pub provider: String,
    pub key: RecordKey,
    pub messages: usize,
    pub tools: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseTelemetry {
    pub provider: String,
    pub key: RecordKey,
    pub duration: Duration,
    pub success: bool,
    pub chars: usize,
    pub tool_calls: usize,
    pub usage: Option<UsageStats>,
}

/// Receives per-call request and response summaries.
pub trait TelemetrySink: Send + Sync {
    fn record_request(&self, event: &RequestTelemetry);
    fn record_response(&self, event: &ResponseTelemetry);
}

/// Reports where persistence failed without interrupting the call.
pub trait DiagnosticSink: Send + Sync {
    fn persistence_failed(&self, provider: &str, key: &RecordKey, error: &CoreError);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn record_request(&self, event: &RequestTelemetry) {
        info!(
            event = "conversation.request.logged",
            provider = %event.provider,
            conversation_id = %event.key.conversation_id,
            turn = event.key.turn,
            correlation_id = %event.key.correlation_id,
            messages = event.messages,
            tools = event.tools
        );
    }

    fn record_response(&self, event: &ResponseTelemetry) {
        let usage = event.usage.unwrap_or_default();
        info!(
            event = "conversation.response.logged",
            provider = %event.provider,
            conversation_id = %event.key.conversation_id,
            turn = event.key.turn,
            correlation_id = %event.key.correlation_id,
            duration_ms = event.duration.as_millis() as u64,
            success = event.success,
            chars = event.chars,
            tool_calls = event.tool_calls,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn persistence_failed(&self, provider: &str, key: &RecordKey, error: &CoreError) {
        warn!(
            event = "conversation.persistence.failed",
            provider = %provider,
            conversation_id = %key.conversation_id,
            turn = key.turn,
            error = %error
        );
    }
}
