use std::time::Duration;

use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};

pub const DEFAULT_TRACE_ENDPOINT: &str = "http://127.0.0.1:4318/v1/traces";
pub const DEFAULT_TRACE_TIMEOUT: Duration = Duration::from_millis(3_000);

/// OTLP/HTTP payload encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TraceProtocol {
    #[default]
    Binary,
    Json,
}

impl TraceProtocol {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" | "http/json" => Self::Json,
            _ => Self::Binary,
        }
    }
}

impl From<TraceProtocol> for Protocol {
    fn from(protocol: TraceProtocol) -> Self {
        match protocol {
            TraceProtocol::Binary => Protocol::HttpBinary,
            TraceProtocol::Json => Protocol::HttpJson,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceExportConfig {
    pub endpoint: String,
    pub protocol: TraceProtocol,
    pub timeout: Duration,
}

impl Default for TraceExportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_TRACE_ENDPOINT.to_string(),
            protocol: TraceProtocol::default(),
            timeout: DEFAULT_TRACE_TIMEOUT,
        }
    }
}

/// Batching tracer provider that ships spans to `config.endpoint`.
///
/// Runs before the subscriber exists, so a build failure is reported on stderr and
/// tracing continues without export.
pub fn build_tracer_provider(
    service_name: &str,
    config: &TraceExportConfig,
) -> Option<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_endpoint(config.endpoint.clone())
        .with_timeout(config.timeout)
        .with_protocol(config.protocol.into())
        .build();
    match exporter {
        Ok(exporter) => Some(
            SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(
                    Resource::builder().with_service_name(service_name.to_string()).build(),
                )
                .build(),
        ),
        Err(error) => {
            eprintln!(
                "llmux: failed to initialize OTLP trace exporter (endpoint={}): {error}; spans are not exported",
                config.endpoint
            );
            None
        }
    }
}
