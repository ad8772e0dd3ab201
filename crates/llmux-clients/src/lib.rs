use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use llmux_core::{CoreError, ThrottleTracker};
use reqwest::{Client, Response, header::RETRY_AFTER};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

mod accumulator;
mod adapter;
pub mod clients;
mod framing;
pub mod thinking;
pub mod tool_ids;
pub mod usage;

pub use accumulator::{ToolCallAccumulator, parse_tool_arguments};
pub use clients::{
    AnthropicProvider, GeminiProvider, MockProvider, MockStep, OllamaProvider, OpenAiProvider,
    RecordedCall,
};
pub use thinking::{ThinkingBuffer, ThinkingMode, ThinkingOptions};
pub use tool_ids::ToolIdFormat;
pub use usage::PartialUsage;

const ERROR_BODY_LIMIT: usize = 512;

/// Shared HTTP plumbing for one backend: client, in-flight limit, status mapping.
#[derive(Clone)]
pub struct HttpRuntime {
    provider_id: String,
    http_client: Client,
    max_inflight: Option<Arc<Semaphore>>,
    throttle: Arc<RwLock<Option<Arc<dyn ThrottleTracker>>>>,
}

impl HttpRuntime {
    pub fn build_http_client(connect_timeout_seconds: u64) -> Option<Client> {
        Client::builder().connect_timeout(Duration::from_secs(connect_timeout_seconds)).build().ok()
    }

    pub fn new(
        provider_id: &str,
        http_client: Option<Client>,
        max_inflight: Option<usize>,
    ) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            http_client: http_client.unwrap_or_default(),
            max_inflight: max_inflight.map(Semaphore::new).map(Arc::new),
            throttle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn build_url(&self, base_url: Option<&str>, path: &str) -> Result<String, CoreError> {
        let Some(base_url) = base_url.map(str::trim).filter(|value| !value.is_empty()) else {
            return Err(CoreError::Configuration(format!(
                "{} base_url is not configured",
                self.provider_id
            )));
        };
        Ok(format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/')))
    }

    /// Takes an in-flight slot without waiting; exhaustion is a retryable transport error.
    pub fn acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>, CoreError> {
        self.max_inflight
            .as_ref()
            .map(|semaphore| {
                semaphore.clone().try_acquire_owned().map_err(|_| CoreError::Transport {
                    provider: self.provider_id.clone(),
                    status: None,
                    message: "provider overloaded: max in-flight limit reached".to_string(),
                    retryable: true,
                })
            })
            .transpose()
    }

    pub fn set_throttle_tracker(&self, tracker: Arc<dyn ThrottleTracker>) {
        *self.throttle.write().unwrap_or_else(PoisonError::into_inner) = Some(tracker);
    }

    pub async fn post_json(
        &self,
        url: &str,
        payload: &Value,
        headers: &[(String, String)],
    ) -> Result<Response, CoreError> {
        let mut request = self.http_client.post(url).json(payload);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        debug!(event = "provider.request.sent", provider = %self.provider_id, url = %url);
        let response = request.send().await.map_err(|err| self.send_error(err))?;
        self.check_status(response).await
    }

    pub async fn get_json(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Value, CoreError> {
        let mut request = self.http_client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(|err| self.send_error(err))?;
        let response = self.check_status(response).await?;
        response.json::<Value>().await.map_err(|err| {
            CoreError::protocol(&self.provider_id, format!("response body is not JSON: {err}"))
        })
    }

    fn send_error(&self, err: reqwest::Error) -> CoreError {
        CoreError::Transport {
            provider: self.provider_id.clone(),
            status: err.status().map(|status| status.as_u16()),
            message: format!("request failed: {err}"),
            retryable: err.is_timeout() || err.is_connect(),
        }
    }

    async fn check_status(&self, response: Response) -> Result<Response, CoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let code = status.as_u16();
        if code == 429
            && let Some(wait) = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after)
        {
            self.report_wait(wait);
        }
        let body = response.text().await.unwrap_or_default();
        let message = extract_error_message(&body)
            .unwrap_or_else(|| body.chars().take(ERROR_BODY_LIMIT).collect());
        warn!(
            event = "provider.response.error_status",
            provider = %self.provider_id,
            status = code,
            message = %message
        );
        Err(CoreError::transport(&self.provider_id, Some(code), message))
    }

    fn report_wait(&self, wait: Duration) {
        let tracker = self.throttle.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(tracker) = tracker {
            tracker.record_wait(&self.provider_id, wait);
        }
    }
}

/// Seconds form of `retry-after`; HTTP dates are not interpreted.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let seconds = raw.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

pub(crate) fn extract_error_message(body: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(body).ok()?;
    let error = value.get("error").unwrap_or(&value);
    if let Some(message) = error.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    error.as_str().map(ToString::to_string)
}
