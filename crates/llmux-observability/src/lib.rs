//! Tracing subscriber setup shared by llmux binaries.

use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod exporters;

pub use config::ObservabilityConfig;
pub use exporters::{
    log::{LogExporterKind, span_events_mask},
    otlp::{TraceExportConfig, TraceProtocol, build_tracer_provider},
};

/// Keeps span export alive; dropping it flushes pending spans and stops the exporter.
#[must_use = "dropping the guard stops trace export"]
pub struct ObservabilityGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl ObservabilityGuard {
    pub fn trace_export_active(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(error) = provider.shutdown()
        {
            eprintln!("llmux: trace exporter shutdown failed: {error}");
        }
    }
}

pub fn init_observability(service_name: &str) -> ObservabilityGuard {
    init_with_config(service_name, &ObservabilityConfig::from_env())
}

/// Installs the global subscriber once; later calls are ignored and export nothing.
pub fn init_with_config(service_name: &str, config: &ObservabilityConfig) -> ObservabilityGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.fallback_filter()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let tracer_provider = if config.trace_enabled {
        build_tracer_provider(service_name, &config.trace_export)
    } else {
        None
    };
    let telemetry_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()))
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(config.log_exporter.layer(config.log_span_events))
        .with(telemetry_layer)
        .try_init()
        .is_ok();
    if !installed {
        return ObservabilityGuard { tracer_provider: None };
    }
    tracing::debug!(
        event = "observability.initialized",
        service = %service_name,
        log_level = %config.log_level,
        log_exporter = ?config.log_exporter,
        trace_export = tracer_provider.is_some()
    );
    ObservabilityGuard { tracer_provider }
}
