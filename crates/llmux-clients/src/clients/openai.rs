use std::collections::HashSet;

use async_trait::async_trait;
use llmux_contracts::{
    Content, ContentBlock, ModelInfo, Speaker, ThinkingSource, orphan_tool_responses,
};
use llmux_core::{
    CallInput, ContentStream, CoreError, NormalizedCallOptions, Provider, ProviderDefaults,
    RuntimeSettingsAware, ThrottleTrackable,
};
use reqwest::{Client, header::HeaderMap};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::{
    ToolIdFormat,
    adapter::{
        AdapterCore, Framing, StreamDecoder, StreamRequest, TurnState, bearer_headers,
        decode_stream, fallback_models, merge_model_params, tool_result_text,
    },
    thinking::{EFFORT_KEY, INCLUDE_IN_CONTEXT_KEY},
    usage::PartialUsage,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4.1";
const RESERVED_KEYS: [&str; 5] = ["model", "messages", "stream", "stream_options", "tools"];

/// Chat Completions dialect; also serves OpenAI-compatible endpoints via `base-url`.
pub struct OpenAiProvider {
    core: AdapterCore,
    tool_ids: ToolIdFormat,
}

impl OpenAiProvider {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        model: Option<String>,
        http_client: Option<Client>,
        max_inflight: Option<usize>,
    ) -> Self {
        let defaults = ProviderDefaults::new("openai", DEFAULT_MODEL)
            .with_model(model)
            .with_base_url(base_url)
            .with_auth_token(api_key)
            .with_fallback_base_url(DEFAULT_BASE_URL)
            .with_api_key_env("OPENAI_API_KEY")
            .with_base_url_env("OPENAI_BASE_URL");
        Self::with_defaults(defaults, http_client, max_inflight)
    }

    pub fn with_defaults(
        defaults: ProviderDefaults,
        http_client: Option<Client>,
        max_inflight: Option<usize>,
    ) -> Self {
        Self {
            core: AdapterCore::new(defaults, http_client, max_inflight),
            tool_ids: ToolIdFormat::Prefixed("call_"),
        }
    }

    /// Some compatible backends reject `call_` IDs and need a fixed alphanumeric shape.
    pub fn with_tool_id_format(mut self, tool_ids: ToolIdFormat) -> Self {
        self.tool_ids = tool_ids;
        self
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.core.defaults.provider
    }

    fn generate_chat_completion(&self, input: CallInput) -> Result<ContentStream, CoreError> {
        let options = self.core.normalize(input)?;
        let url = self
            .core
            .runtime
            .build_url(options.resolved.base_url.as_deref(), "chat/completions")?;
        let permit = self.core.runtime.acquire_permit()?;
        let (payload, normalization) = build_openai_payload(&options, &self.tool_ids);
        info!(
            event = "provider.request.payload.normalized",
            provider = %options.provider,
            model = %options.resolved.model,
            messages = normalization.messages,
            tools_out = normalization.tools,
            orphans_dropped = normalization.orphans_dropped,
            streaming = options.resolved.streaming
        );
        let request = StreamRequest {
            url,
            payload,
            headers: bearer_headers(options.resolved.auth_token.as_deref()),
            framing: Framing::Sse,
            streaming: options.resolved.streaming,
            abort: options.abort.clone(),
            permit,
        };
        let decoder = OpenAiDecoder::new(&options, self.tool_ids.clone());
        Ok(decode_stream(self.core.runtime.clone(), request, decoder))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, CoreError> {
        let (base_url, token) = self.core.static_endpoint();
        let listed = async {
            let url = self.core.runtime.build_url(base_url.as_deref(), "models")?;
            let body = self.core.runtime.get_json(&url, &bearer_headers(token.as_deref())).await?;
            Ok::<_, CoreError>(parse_model_list(self.name(), &body))
        }
        .await;
        match listed {
            Ok(models) if !models.is_empty() => Ok(models),
            Ok(_) => Ok(fallback_models(
                self.name(),
                &self.core.defaults.model,
                &CoreError::protocol(self.name(), "model listing is empty"),
            )),
            Err(err) => Ok(fallback_models(self.name(), &self.core.defaults.model, &err)),
        }
    }

    fn get_default_model(&self) -> String {
        self.core.defaults.model.clone()
    }

    fn throttle_tracker(&self) -> Option<&dyn ThrottleTrackable> {
        Some(&self.core)
    }

    fn runtime_settings(&self) -> Option<&dyn RuntimeSettingsAware> {
        Some(self.core.binding())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PayloadNormalization {
    pub(crate) messages: usize,
    pub(crate) tools: usize,
    pub(crate) orphans_dropped: usize,
}

pub(crate) fn build_openai_payload(
    options: &NormalizedCallOptions,
    ids: &ToolIdFormat,
) -> (Value, PayloadNormalization) {
    let orphans: HashSet<String> = orphan_tool_responses(&options.contents).into_iter().collect();
    let include_reasoning = options.ephemeral_bool(INCLUDE_IN_CONTEXT_KEY, false);
    let mut normalization = PayloadNormalization::default();

    let mut messages = Vec::new();
    let memory = options.invocation.user_memory.as_deref().filter(|m| !m.trim().is_empty());
    if let Some(memory) = memory {
        messages.push(json!({"role": "system", "content": memory}));
    }
    for content in &options.contents {
        for block in &content.blocks {
            if let ContentBlock::ToolResponse { call_id, result, error, .. } = block {
                if orphans.contains(call_id) {
                    normalization.orphans_dropped += 1;
                    continue;
                }
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": ids.to_backend_id(call_id),
                    "content": tool_result_text(result, error.as_deref()),
                }));
            }
        }
        match content.speaker {
            Speaker::Ai => messages.push(assistant_message(content, ids, include_reasoning)),
            Speaker::Human => {
                let text = content.text();
                if !text.is_empty() {
                    messages.push(json!({"role": "user", "content": text}));
                }
            }
            Speaker::Tool => {}
        }
    }
    if normalization.orphans_dropped > 0 {
        debug!(
            event = "provider.request.orphan_tool_responses_dropped",
            provider = %options.provider,
            dropped = normalization.orphans_dropped
        );
    }
    normalization.messages = messages.len();

    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(options.resolved.model));
    payload.insert("messages".to_string(), Value::Array(messages));
    payload.insert("stream".to_string(), json!(options.resolved.streaming));
    if options.resolved.streaming {
        payload.insert("stream_options".to_string(), json!({"include_usage": true}));
    }
    let tools: Vec<Value> = options
        .tools()
        .iter()
        .map(|tool| {
            let mut function = Map::new();
            function.insert("name".to_string(), json!(tool.name));
            if let Some(description) = &tool.description {
                function.insert("description".to_string(), json!(description));
            }
            function.insert("parameters".to_string(), tool.parameters.clone());
            json!({"type": "function", "function": function})
        })
        .collect();
    normalization.tools = tools.len();
    if !tools.is_empty() {
        payload.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(effort) = options.ephemeral_str(EFFORT_KEY) {
        let mapped = if effort.eq_ignore_ascii_case("xhigh") { "high".to_string() } else { effort };
        payload.insert("reasoning_effort".to_string(), json!(mapped));
    }
    merge_model_params(&mut payload, &options.invocation.model_params, &RESERVED_KEYS);
    (Value::Object(payload), normalization)
}

fn assistant_message(content: &Content, ids: &ToolIdFormat, include_reasoning: bool) -> Value {
    let text = content.text();
    let tool_calls: Vec<Value> = content
        .tool_calls()
        .map(|(id, name, parameters)| {
            let arguments = match parameters {
                Value::String(raw) => raw.clone(),
                other => other.to_string(),
            };
            json!({
                "id": ids.to_backend_id(id),
                "type": "function",
                "function": {"name": name, "arguments": arguments},
            })
        })
        .collect();

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert("content".to_string(), if text.is_empty() { Value::Null } else { json!(text) });
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    let reasoning = content.thinking_text();
    if include_reasoning && !reasoning.is_empty() {
        message.insert("reasoning_content".to_string(), json!(reasoning));
    }
    Value::Object(message)
}

fn parse_model_list(provider: &str, body: &Value) -> Vec<ModelInfo> {
    body.get("data")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|model| model.get("id").and_then(Value::as_str))
                .map(|id| ModelInfo::named(provider, id))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) struct OpenAiDecoder {
    turn: TurnState,
}

impl OpenAiDecoder {
    pub(crate) fn new(options: &NormalizedCallOptions, tool_ids: ToolIdFormat) -> Self {
        Self { turn: TurnState::new(options, tool_ids) }
    }

    fn decode_chunk(&mut self, chunk: &Value) -> Result<Vec<Content>, CoreError> {
        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(CoreError::protocol(self.turn.provider(), message));
        }
        if let Some(model) = chunk.get("model").and_then(Value::as_str).filter(|m| !m.is_empty()) {
            self.turn.model = model.to_string();
        }
        if let Some(usage) = chunk.get("usage").filter(|usage| usage.is_object()) {
            self.turn.usage.merge_from(PartialUsage::from_openai(usage));
        }

        let mut out = Vec::new();
        let Some(choice) = chunk.get("choices").and_then(Value::as_array).and_then(|c| c.first())
        else {
            return Ok(out);
        };
        let Some(delta) = choice.get("delta").or_else(|| choice.get("message")) else {
            return Ok(out);
        };

        for field in ["reasoning_content", "reasoning"] {
            if let Some(reasoning) = delta.get(field).and_then(Value::as_str) {
                out.extend(self.turn.reasoning(reasoning, ThinkingSource::ReasoningContent));
                break;
            }
        }
        match delta.get("content") {
            Some(Value::String(text)) => out.extend(self.turn.text(text)),
            Some(Value::Array(parts)) => {
                let text: String = parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect();
                out.extend(self.turn.text(&text));
            }
            _ => {}
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for (position, call) in calls.iter().enumerate() {
                let index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .and_then(|index| u32::try_from(index).ok())
                    .unwrap_or(position as u32);
                let function = call.get("function");
                let name = function.and_then(|f| f.get("name")).and_then(Value::as_str);
                let arguments = match function.and_then(|f| f.get("arguments")) {
                    Some(Value::String(raw)) => Some(raw.clone()),
                    Some(Value::Null) | None => None,
                    Some(other) => Some(other.to_string()),
                };
                let id = call.get("id").and_then(Value::as_str);
                out.extend(self.turn.tool_fragment(index, id, name, arguments.as_deref()));
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.turn.finish_reason = Some(reason.to_string());
            out.extend(self.turn.complete_all_tools());
        }
        Ok(out)
    }
}

impl StreamDecoder for OpenAiDecoder {
    fn on_headers(&mut self, headers: &HeaderMap) {
        self.turn.set_header_usage(headers);
    }

    fn decode_event(&mut self, data: &str) -> Result<Vec<Content>, CoreError> {
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(self.turn.finish());
        }
        let chunk = serde_json::from_str::<Value>(data).map_err(|err| {
            CoreError::protocol(self.turn.provider(), format!("malformed stream event: {err}"))
        })?;
        self.decode_chunk(&chunk)
    }

    fn decode_body(&mut self, body: Value) -> Result<Vec<Content>, CoreError> {
        self.decode_chunk(&body)
    }

    fn finish(&mut self) -> Vec<Content> {
        self.turn.finish()
    }

    fn interrupted(&mut self) -> Vec<Content> {
        self.turn.interrupted()
    }
}
