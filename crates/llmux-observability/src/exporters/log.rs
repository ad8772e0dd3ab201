use tracing::Subscriber;
use tracing_subscriber::{Layer, fmt::format::FmtSpan, registry::LookupSpan};

/// Destination of formatted log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogExporterKind {
    Stdout,
    Stderr,
    None,
}

impl LogExporterKind {
    /// Unknown values fall back to stdout.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Self::None,
            "stderr" => Self::Stderr,
            _ => Self::Stdout,
        }
    }

    /// Compact formatter writing to this sink; `None` installs nothing.
    pub fn layer<S>(self, log_span_events: bool) -> Option<Box<dyn Layer<S> + Send + Sync>>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        let layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_span_events(span_events_mask(log_span_events));
        match self {
            Self::Stdout => Some(layer.with_writer(std::io::stdout).boxed()),
            Self::Stderr => Some(layer.with_writer(std::io::stderr).boxed()),
            Self::None => None,
        }
    }
}

pub fn span_events_mask(log_span_events: bool) -> FmtSpan {
    if log_span_events { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::Registry;

    use super::*;

    #[test]
    fn unknown_sinks_fall_back_to_stdout() {
        for raw in ["", "stdout", "journald"] {
            assert_eq!(LogExporterKind::parse(raw), LogExporterKind::Stdout, "{raw:?}");
        }
        assert_eq!(LogExporterKind::parse(" STDERR "), LogExporterKind::Stderr);
        assert_eq!(LogExporterKind::parse("none"), LogExporterKind::None);
        assert_eq!(LogExporterKind::parse("off"), LogExporterKind::None);
    }

    #[test]
    fn silent_sink_installs_no_layer() {
        assert!(LogExporterKind::None.layer::<Registry>(false).is_none());
        assert!(LogExporterKind::Stderr.layer::<Registry>(true).is_some());
    }

    #[test]
    fn span_events_are_opt_in() {
        assert_eq!(span_events_mask(false), FmtSpan::NONE);
        assert_eq!(span_events_mask(true), FmtSpan::NEW | FmtSpan::CLOSE);
    }
}
