//! Conversation logging, redaction and usage metrics around any [`llmux_core::Provider`].

mod conversation;
mod decorator;
mod redaction;
mod telemetry;

pub use conversation::{
    ConversationEntry, ConversationLogWriter, ConversationRecord, InMemoryConversationLog,
    JsonlConversationWriter, RecordKey, RequestRecord, ResponseRecord, ToolCallRecord,
};
pub use decorator::{LoggingConfig, LoggingProvider, ProviderPerformance};
pub use redaction::ConfigurableRedactor;
pub use telemetry::{
    DiagnosticSink, RequestTelemetry, ResponseTelemetry, TelemetrySink, TracingDiagnostics,
    TracingTelemetrySink,
};
