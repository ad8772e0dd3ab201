use std::{env, time::Duration};

use crate::exporters::{
    log::LogExporterKind,
    otlp::{TraceExportConfig, TraceProtocol},
};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Crates whose events the fallback filter admits at the configured level.
const WORKSPACE_TARGETS: [&str; 6] = [
    "llmux_app",
    "llmux_balancer",
    "llmux_clients",
    "llmux_core",
    "llmux_logging",
    "llmux_observability",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_span_events: bool,
    pub log_exporter: LogExporterKind,
    pub trace_enabled: bool,
    pub trace_export: TraceExportConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_span_events: false,
            log_exporter: LogExporterKind::Stdout,
            trace_enabled: false,
            trace_export: TraceExportConfig::default(),
        }
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_level = lookup("LLMUX_LOG_LEVEL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        let log_exporter =
            LogExporterKind::parse(&lookup("LLMUX_LOG_EXPORTER").unwrap_or_default());
        let defaults = TraceExportConfig::default();
        let trace_export = TraceExportConfig {
            endpoint: lookup("LLMUX_OTEL_TRACE_ENDPOINT")
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.endpoint),
            protocol: lookup("LLMUX_OTEL_TRACE_PROTOCOL")
                .map(|value| TraceProtocol::parse(&value))
                .unwrap_or(defaults.protocol),
            timeout: lookup("LLMUX_OTEL_TRACE_TIMEOUT_MS")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|millis| *millis > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
        };

        Self {
            log_level,
            log_span_events: truthy(lookup("LLMUX_LOG_SPAN_EVENTS"), false),
            log_exporter,
            trace_enabled: truthy(lookup("LLMUX_TRACE_ENABLED"), false),
            trace_export,
        }
    }

    /// Filter used when `RUST_LOG` is unset or invalid.
    pub fn fallback_filter(&self) -> String {
        let mut filter = self.log_level.clone();
        for target in WORKSPACE_TARGETS {
            filter.push_str(&format!(",{target}={}", self.log_level));
        }
        filter
    }
}

fn truthy(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            let v = value.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(default)
}
