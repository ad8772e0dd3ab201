use std::{collections::BTreeMap, sync::Arc};

use futures::StreamExt;
use llmux_contracts::{Content, ContentBlock, ContentMetadata, ModelInfo, ThinkingSource};
use llmux_core::{
    AbortSignal, CallInput, ContentStream, CoreError, NormalizedCallOptions, ProviderDefaults,
    RuntimeBinding, RuntimeSettingsAware, ThrottleTrackable, ThrottleTracker, normalize_call,
};
use reqwest::{Client, header::HeaderMap};
use serde_json::{Map, Value};
use tokio::sync::OwnedSemaphorePermit;
use tracing::warn;

use crate::{
    HttpRuntime, ThinkingBuffer, ThinkingOptions, ToolCallAccumulator, ToolIdFormat,
    framing::{ndjson_frames, sse_frames},
    usage::PartialUsage,
};

/// State every HTTP adapter shares: defaults, transport and the bound runtime.
pub(crate) struct AdapterCore {
    pub(crate) defaults: ProviderDefaults,
    pub(crate) runtime: HttpRuntime,
    binding: RuntimeBinding,
}

impl AdapterCore {
    pub(crate) fn new(
        defaults: ProviderDefaults,
        http_client: Option<Client>,
        max_inflight: Option<usize>,
    ) -> Self {
        let runtime = HttpRuntime::new(&defaults.provider, http_client, max_inflight);
        Self { defaults, runtime, binding: RuntimeBinding::default() }
    }

    pub(crate) fn normalize(&self, input: CallInput) -> Result<NormalizedCallOptions, CoreError> {
        let bound = self.binding.bound_runtime();
        normalize_call(input, &self.defaults, bound.as_ref())
    }

    /// Base URL and token for calls outside a chat turn (model listing, server tools).
    pub(crate) fn static_endpoint(&self) -> (Option<String>, Option<String>) {
        let bound = self.binding.bound_runtime();
        let settings = bound.as_ref().and_then(|runtime| runtime.settings_service.as_deref());
        (self.defaults.default_base_url(settings), self.defaults.default_auth_token(settings))
    }

    pub(crate) fn binding(&self) -> &RuntimeBinding {
        &self.binding
    }
}

impl ThrottleTrackable for AdapterCore {
    fn set_throttle_tracker(&self, tracker: Arc<dyn ThrottleTracker>) {
        self.runtime.set_throttle_tracker(tracker);
    }
}

/// Dialect-specific translation of backend frames into canonical chunks.
pub(crate) trait StreamDecoder: Send + 'static {
    fn on_headers(&mut self, _headers: &HeaderMap) {}

    fn decode_event(&mut self, data: &str) -> Result<Vec<Content>, CoreError>;

    fn decode_body(&mut self, body: Value) -> Result<Vec<Content>, CoreError>;

    /// Flushes whatever the turn still holds. Must be idempotent.
    fn finish(&mut self) -> Vec<Content>;

    /// What survives a failed stream; called instead of `finish`.
    fn interrupted(&mut self) -> Vec<Content>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Sse,
    NdJson,
}

pub(crate) struct StreamRequest {
    pub(crate) url: String,
    pub(crate) payload: Value,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) framing: Framing,
    pub(crate) streaming: bool,
    pub(crate) abort: AbortSignal,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

/// Lazily performs the request and decodes it. Nothing is sent until the first poll;
/// cancellation ends the stream without a final chunk.
pub(crate) fn decode_stream<D: StreamDecoder>(
    runtime: HttpRuntime,
    request: StreamRequest,
    mut decoder: D,
) -> ContentStream {
    let StreamRequest { url, payload, headers, framing, streaming, abort, permit } = request;
    Box::pin(async_stream::stream! {
        let _permit = permit;
        let sent = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            sent = runtime.post_json(&url, &payload, &headers) => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                yield Err(err);
                return;
            }
        };
        decoder.on_headers(response.headers());

        if streaming {
            let mut frames = match framing {
                Framing::Sse => sse_frames(response, runtime.provider_id()),
                Framing::NdJson => ndjson_frames(response, runtime.provider_id()),
            };
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = abort.cancelled() => return,
                    frame = frames.next() => frame,
                };
                let Some(frame) = frame else {
                    break;
                };
                match frame.and_then(|data| decoder.decode_event(&data)) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            yield Ok(chunk);
                        }
                    }
                    Err(err) => {
                        for chunk in decoder.interrupted() {
                            yield Ok(chunk);
                        }
                        yield Err(err);
                        return;
                    }
                }
            }
        } else {
            let body = tokio::select! {
                biased;
                _ = abort.cancelled() => return,
                body = response.json::<Value>() => body,
            };
            let decoded = body
                .map_err(|err| {
                    let message = format!("response body is not JSON: {err}");
                    CoreError::protocol(runtime.provider_id(), message)
                })
                .and_then(|body| decoder.decode_body(body));
            match decoded {
                Ok(chunks) => {
                    for chunk in chunks {
                        yield Ok(chunk);
                    }
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }

        for chunk in decoder.finish() {
            yield Ok(chunk);
        }
    })
}

/// Per-turn accumulation shared by the HTTP decoders.
pub(crate) struct TurnState {
    provider: String,
    pub(crate) model: String,
    tool_ids: ToolIdFormat,
    tools: ToolCallAccumulator,
    thinking: ThinkingBuffer,
    pub(crate) usage: PartialUsage,
    header_usage: PartialUsage,
    pub(crate) finish_reason: Option<String>,
    finished: bool,
}

impl TurnState {
    pub(crate) fn new(options: &NormalizedCallOptions, tool_ids: ToolIdFormat) -> Self {
        Self {
            provider: options.provider.clone(),
            model: options.resolved.model.clone(),
            tool_ids,
            tools: ToolCallAccumulator::new(),
            thinking: ThinkingBuffer::new(ThinkingOptions::from_call(options)),
            usage: PartialUsage::default(),
            header_usage: PartialUsage::default(),
            finish_reason: None,
            finished: false,
        }
    }

    pub(crate) fn provider(&self) -> &str {
        &self.provider
    }

    pub(crate) fn set_header_usage(&mut self, headers: &HeaderMap) {
        self.header_usage = PartialUsage::from_headers(headers);
    }

    pub(crate) fn text(&mut self, text: &str) -> Vec<Content> {
        blocks_into_chunks(self.thinking.push_text(text))
    }

    pub(crate) fn reasoning(&mut self, fragment: &str, source: ThinkingSource) -> Vec<Content> {
        blocks_into_chunks(self.thinking.push_reasoning(fragment, source))
    }

    pub(crate) fn signature(&mut self, signature: &str) {
        self.thinking.set_signature(signature);
    }

    pub(crate) fn tool_fragment(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        fragment: Option<&str>,
    ) -> Vec<Content> {
        let flushed =
            if self.tools.contains(index) { Vec::new() } else { self.thinking.before_tool_call() };
        self.tools.push(index, id, name, fragment, &self.tool_ids);
        blocks_into_chunks(flushed)
    }

    /// A call delivered whole (Gemini, Ollama); emitted immediately.
    pub(crate) fn whole_tool_call(
        &mut self,
        id: Option<&str>,
        name: &str,
        arguments: Value,
    ) -> Vec<Content> {
        let mut blocks = self.thinking.before_tool_call();
        let id = match id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => self.tool_ids.to_canonical_id(id),
            None => llmux_contracts::mint_canonical_tool_id(),
        };
        let arguments = match arguments {
            Value::String(raw) => crate::parse_tool_arguments(&raw),
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        blocks.push(ContentBlock::tool_call(id, name, arguments));
        blocks_into_chunks(blocks)
    }

    pub(crate) fn close_thinking(&mut self) -> Vec<Content> {
        blocks_into_chunks(self.thinking.close_block())
    }

    /// End of an indexed block: its thinking with any signature, or its tool call.
    pub(crate) fn complete_block(&mut self, index: u32) -> Vec<Content> {
        let mut blocks = self.thinking.close_block();
        blocks.extend(self.tools.finish(index));
        blocks_into_chunks(blocks)
    }

    pub(crate) fn complete_all_tools(&mut self) -> Vec<Content> {
        blocks_into_chunks(self.tools.finish_all())
    }

    /// Remaining text, reasoning and tool calls, then the metadata-carrying final chunk.
    pub(crate) fn finish(&mut self) -> Vec<Content> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut blocks = self.thinking.finish();
        blocks.extend(self.tools.finish_all());
        let mut chunks = blocks_into_chunks(blocks);
        self.attach_metadata(&mut chunks);
        chunks
    }

    /// Held text and reasoning plus the usage seen so far. Unfinished tool calls are
    /// dropped since their arguments may be truncated.
    pub(crate) fn interrupted(&mut self) -> Vec<Content> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let dropped = self.tools.finish_all().len();
        if dropped > 0 {
            warn!(event = "provider.stream.tool_calls_dropped", provider = %self.provider, dropped);
        }
        let mut chunks = blocks_into_chunks(self.thinking.finish());
        if !self.usage.or(self.header_usage).is_empty() {
            self.attach_metadata(&mut chunks);
        }
        chunks
    }

    fn attach_metadata(&self, chunks: &mut Vec<Content>) {
        let usage = self.usage.or(self.header_usage);
        let metadata = ContentMetadata {
            model: Some(self.model.clone()),
            provider: Some(self.provider.clone()),
            finish_reason: self.finish_reason.clone(),
            usage: (!usage.is_empty()).then(|| usage.finish()),
        };
        match chunks.last_mut() {
            Some(last) => last.metadata = Some(metadata),
            None => chunks.push(Content::ai_blocks(Vec::new()).with_metadata(metadata)),
        }
    }
}

/// One chunk per block keeps the stream granular for renderers.
pub(crate) fn blocks_into_chunks(blocks: Vec<ContentBlock>) -> Vec<Content> {
    blocks.into_iter().map(|block| Content::ai_blocks(vec![block])).collect()
}

pub(crate) fn bearer_headers(token: Option<&str>) -> Vec<(String, String)> {
    token
        .map(|token| vec![("authorization".to_string(), format!("Bearer {token}"))])
        .unwrap_or_default()
}

/// Tool output rendered as the text most backends expect in a tool message.
pub(crate) fn tool_result_text(result: &Value, error: Option<&str>) -> String {
    if let Some(error) = error {
        return format!("Error: {error}");
    }
    match result {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn fallback_models(
    provider: &str,
    default_model: &str,
    err: &CoreError,
) -> Vec<ModelInfo> {
    warn!(
        event = "provider.models.fallback",
        provider = %provider,
        default_model = %default_model,
        error = %err
    );
    vec![ModelInfo::named(provider, default_model)]
}

/// Shallow merge of call-level model parameters; request-owned keys are never replaced.
pub(crate) fn merge_model_params(
    target: &mut Map<String, Value>,
    params: &BTreeMap<String, Value>,
    reserved: &[&str],
) {
    for (key, value) in params {
        if !reserved.contains(&key.as_str()) {
            target.insert(key.clone(), value.clone());
        }
    }
}
