#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error(
        "{provider} call is missing {field} on runtime context (runtime id: {runtime_id}); \
         pass it in call options or bind a runtime to the provider"
    )]
    MissingRuntimeContext { provider: String, field: &'static str, runtime_id: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{provider} requires an auth token for non-local endpoint {endpoint}")]
    Authentication { provider: String, endpoint: String },
    #[error("{provider} transport error{}: {message}", status_suffix(.status))]
    Transport { provider: String, status: Option<u16>, message: String, retryable: bool },
    #[error("{provider} protocol error: {message}")]
    Protocol { provider: String, message: String },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("{provider} does not support {operation}")]
    Unsupported { provider: String, operation: String },
}

impl CoreError {
    pub fn transport(provider: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.to_string(),
            status,
            message: message.into(),
            retryable: status.is_some_and(is_retryable_status),
        }
    }

    pub fn protocol(provider: &str, message: impl Into<String>) -> Self {
        Self::Protocol { provider: provider.to_string(), message: message.into() }
    }

    /// Whether an outer retry policy may re-issue the call.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" (status {code})")).unwrap_or_default()
}

/// Rate limiting and server-side failures.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_cover_rate_limit_and_server_errors() {
        for status in [429, 500, 502, 503, 599] {
            assert!(is_retryable_status(status), "{status} must be retryable");
        }
        for status in [200, 400, 401, 403, 404, 422, 600] {
            assert!(!is_retryable_status(status), "{status} must not be retryable");
        }
    }

    #[test]
    fn transport_helper_derives_retryable_flag() {
        assert!(CoreError::transport("openai", Some(503), "busy").is_retryable());
        assert!(!CoreError::transport("openai", Some(400), "bad").is_retryable());
        assert!(!CoreError::transport("openai", None, "reset").is_retryable());
        assert!(!CoreError::Configuration("x".to_string()).is_retryable());
    }

    #[test]
    fn missing_runtime_context_names_field_and_runtime() {
        let error = CoreError::MissingRuntimeContext {
            provider: "anthropic".to_string(),
            field: "config",
            runtime_id: "rt-7".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("anthropic"));
        assert!(message.contains("config"));
        assert!(message.contains("rt-7"));
    }

    #[test]
    fn transport_message_includes_status_when_known() {
        let error = CoreError::transport("gemini", Some(429), "slow down");
        assert_eq!(error.to_string(), "gemini transport error (status 429): slow down");
        let error = CoreError::transport("gemini", None, "reset");
        assert_eq!(error.to_string(), "gemini transport error: reset");
    }
}
