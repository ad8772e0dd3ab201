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
use tracing::info;

use crate::{
    ToolIdFormat,
    adapter::{
        AdapterCore, Framing, StreamDecoder, StreamRequest, TurnState, decode_stream,
        fallback_models, merge_model_params, tool_result_text,
    },
    parse_tool_arguments,
    thinking::{BUDGET_TOKENS_KEY, ENABLED_KEY, INCLUDE_IN_CONTEXT_KEY},
    usage::PartialUsage,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;
const DEFAULT_THINKING_BUDGET: u64 = 1024;
const RESERVED_KEYS: [&str; 6] = ["model", "messages", "system", "stream", "tools", "thinking"];

pub struct AnthropicProvider {
    core: AdapterCore,
}

impl AnthropicProvider {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        model: Option<String>,
        http_client: Option<Client>,
        max_inflight: Option<usize>,
    ) -> Self {
        let defaults = ProviderDefaults::new("anthropic", DEFAULT_MODEL)
            .with_model(model)
            .with_base_url(base_url)
            .with_auth_token(api_key)
            .with_fallback_base_url(DEFAULT_BASE_URL)
            .with_api_key_env("ANTHROPIC_API_KEY")
            .with_base_url_env("ANTHROPIC_BASE_URL");
        Self::with_defaults(defaults, http_client, max_inflight)
    }

    pub fn with_defaults(
        defaults: ProviderDefaults,
        http_client: Option<Client>,
        max_inflight: Option<usize>,
    ) -> Self {
        Self { core: AdapterCore::new(defaults, http_client, max_inflight) }
    }
}

const TOOL_IDS: ToolIdFormat = ToolIdFormat::Prefixed("toolu_");

fn auth_headers(token: Option<&str>) -> Vec<(String, String)> {
    let mut headers = vec![("anthropic-version".to_string(), API_VERSION.to_string())];
    if let Some(token) = token {
        headers.push(("x-api-key".to_string(), token.to_string()));
    }
    headers
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.core.defaults.provider
    }

    fn generate_chat_completion(&self, input: CallInput) -> Result<ContentStream, CoreError> {
        let options = self.core.normalize(input)?;
        let url =
            self.core.runtime.build_url(options.resolved.base_url.as_deref(), "v1/messages")?;
        let permit = self.core.runtime.acquire_permit()?;
        let payload = build_anthropic_payload(&options);
        info!(
            event = "provider.request.payload.normalized",
            provider = %options.provider,
            model = %options.resolved.model,
            messages = payload["messages"].as_array().map_or(0, Vec::len),
            tools_out = options.tools().len(),
            thinking = payload.get("thinking").is_some(),
            streaming = options.resolved.streaming
        );
        let request = StreamRequest {
            url,
            payload,
            headers: auth_headers(options.resolved.auth_token.as_deref()),
            framing: Framing::Sse,
            streaming: options.resolved.streaming,
            abort: options.abort.clone(),
            permit,
        };
        let decoder = AnthropicDecoder::new(&options);
        Ok(decode_stream(self.core.runtime.clone(), request, decoder))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, CoreError> {
        let (base_url, token) = self.core.static_endpoint();
        let listed = async {
            let url = self.core.runtime.build_url(base_url.as_deref(), "v1/models")?;
            let body = self.core.runtime.get_json(&url, &auth_headers(token.as_deref())).await?;
            Ok::<_, CoreError>(parse_model_list(self.name(), &body))
        }
        .await;
        match listed {
            Ok(models) if !models.is_empty() => Ok(models),
            Ok(_) => Ok(vec![ModelInfo::named(self.name(), &self.core.defaults.model)]),
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

pub(crate) fn build_anthropic_payload(options: &NormalizedCallOptions) -> Value {
    let orphans: HashSet<String> = orphan_tool_responses(&options.contents).into_iter().collect();
    let include_thinking = options.ephemeral_bool(INCLUDE_IN_CONTEXT_KEY, false);

    let mut messages: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for content in &options.contents {
        let (role, blocks) = match content.speaker {
            Speaker::Ai => ("assistant", assistant_blocks(content, include_thinking)),
            Speaker::Human | Speaker::Tool => ("user", user_blocks(content, &orphans)),
        };
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => {
                // tool results must lead a user turn
                if role == "user" {
                    let (mut results, rest): (Vec<Value>, Vec<Value>) = last_blocks
                        .drain(..)
                        .chain(blocks)
                        .partition(|block| block["type"] == "tool_result");
                    results.extend(rest);
                    *last_blocks = results;
                } else {
                    last_blocks.extend(blocks);
                }
            }
            _ => messages.push((role, blocks)),
        }
    }

    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(options.resolved.model));
    payload.insert(
        "messages".to_string(),
        Value::Array(
            messages
                .into_iter()
                .map(|(role, blocks)| json!({"role": role, "content": blocks}))
                .collect(),
        ),
    );
    payload.insert("max_tokens".to_string(), json!(DEFAULT_MAX_TOKENS));
    payload.insert("stream".to_string(), json!(options.resolved.streaming));
    if let Some(memory) = options.invocation.user_memory.as_deref().filter(|m| !m.trim().is_empty())
    {
        payload.insert("system".to_string(), json!(memory));
    }
    let tools: Vec<Value> = options
        .tools()
        .iter()
        .map(|tool| {
            let mut entry = Map::new();
            entry.insert("name".to_string(), json!(tool.name));
            if let Some(description) = &tool.description {
                entry.insert("description".to_string(), json!(description));
            }
            entry.insert("input_schema".to_string(), tool.parameters.clone());
            Value::Object(entry)
        })
        .collect();
    if !tools.is_empty() {
        payload.insert("tools".to_string(), Value::Array(tools));
    }
    if options.ephemeral_bool(ENABLED_KEY, false) {
        let budget =
            options.ephemeral_u64(BUDGET_TOKENS_KEY).unwrap_or(DEFAULT_THINKING_BUDGET);
        payload
            .insert("thinking".to_string(), json!({"type": "enabled", "budget_tokens": budget}));
    }
    merge_model_params(&mut payload, &options.invocation.model_params, &RESERVED_KEYS);
    Value::Object(payload)
}

fn user_blocks(content: &Content, orphans: &HashSet<String>) -> Vec<Value> {
    let mut results = Vec::new();
    let mut texts = Vec::new();
    for block in &content.blocks {
        match block {
            ContentBlock::ToolResponse { call_id, result, error, .. }
                if !orphans.contains(call_id) =>
            {
                let mut entry = json!({
                    "type": "tool_result",
                    "tool_use_id": TOOL_IDS.to_backend_id(call_id),
                    "content": tool_result_text(result, error.as_deref()),
                });
                if error.is_some() {
                    entry["is_error"] = json!(true);
                }
                results.push(entry);
            }
            ContentBlock::Text { text } if !text.is_empty() => {
                texts.push(json!({"type": "text", "text": text}));
            }
            _ => {}
        }
    }
    results.extend(texts);
    results
}

fn assistant_blocks(content: &Content, include_thinking: bool) -> Vec<Value> {
    let mut blocks = Vec::new();
    for block in &content.blocks {
        match block {
            ContentBlock::Thinking { thought, signature: Some(signature), .. }
                if include_thinking =>
            {
                blocks.push(json!({
                    "type": "thinking",
                    "thinking": thought,
                    "signature": signature,
                }));
            }
            ContentBlock::Text { text } if !text.is_empty() => {
                blocks.push(json!({"type": "text", "text": text}));
            }
            ContentBlock::ToolCall { id, name, parameters } => {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": TOOL_IDS.to_backend_id(id),
                    "name": name,
                    "input": tool_input(parameters),
                }));
            }
            _ => {}
        }
    }
    blocks
}

/// `input` must be an object on the wire.
fn tool_input(parameters: &Value) -> Value {
    match parameters {
        Value::Object(_) => parameters.clone(),
        Value::String(raw) => match parse_tool_arguments(raw) {
            value @ Value::Object(_) => value,
            other => json!({"input": other}),
        },
        Value::Null => json!({}),
        other => json!({"input": other}),
    }
}

fn parse_model_list(provider: &str, body: &Value) -> Vec<ModelInfo> {
    body.get("data")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|model| {
                    let id = model.get("id").and_then(Value::as_str)?;
                    let mut info = ModelInfo::named(provider, id);
                    if let Some(name) = model.get("display_name").and_then(Value::as_str) {
                        info.name = name.to_string();
                    }
                    Some(info)
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) struct AnthropicDecoder {
    turn: TurnState,
}

impl AnthropicDecoder {
    pub(crate) fn new(options: &NormalizedCallOptions) -> Self {
        Self { turn: TurnState::new(options, TOOL_IDS) }
    }

    fn block_index(event: &Value) -> u32 {
        event
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|index| u32::try_from(index).ok())
            .unwrap_or(0)
    }

    fn record_usage(&mut self, usage: Option<&Value>) {
        if let Some(usage) = usage.filter(|usage| usage.is_object()) {
            self.turn.usage.merge_from(PartialUsage::from_anthropic(usage));
        }
    }

    fn decode_typed(&mut self, event: &Value) -> Result<Vec<Content>, CoreError> {
        let mut out = Vec::new();
        match event.get("type").and_then(Value::as_str).unwrap_or_default() {
            "message_start" => {
                let message = event.get("message");
                if let Some(model) = message.and_then(|m| m.get("model")).and_then(Value::as_str) {
                    self.turn.model = model.to_string();
                }
                self.record_usage(message.and_then(|m| m.get("usage")));
            }
            "content_block_start" => {
                let index = Self::block_index(event);
                let block = event.get("content_block").cloned().unwrap_or(Value::Null);
                match block.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "tool_use" => {
                        let id = block.get("id").and_then(Value::as_str);
                        let name = block.get("name").and_then(Value::as_str);
                        let initial = block
                            .get("input")
                            .filter(|input| input.as_object().is_some_and(|map| !map.is_empty()))
                            .map(Value::to_string);
                        out.extend(self.turn.tool_fragment(index, id, name, initial.as_deref()));
                    }
                    "text" => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            out.extend(self.turn.text(text));
                        }
                    }
                    "thinking" => {
                        if let Some(thought) = block.get("thinking").and_then(Value::as_str) {
                            out.extend(self.turn.reasoning(thought, ThinkingSource::ThinkingBlock));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let index = Self::block_index(event);
                let delta = event.get("delta").cloned().unwrap_or(Value::Null);
                let text_of =
                    |key: &str| delta.get(key).and_then(Value::as_str).unwrap_or_default();
                match delta.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "text_delta" => out.extend(self.turn.text(text_of("text"))),
                    "input_json_delta" => out.extend(self.turn.tool_fragment(
                        index,
                        None,
                        None,
                        Some(text_of("partial_json")),
                    )),
                    "thinking_delta" => out.extend(
                        self.turn.reasoning(text_of("thinking"), ThinkingSource::ThinkingBlock),
                    ),
                    "signature_delta" => self.turn.signature(text_of("signature")),
                    _ => {}
                }
            }
            "content_block_stop" => out.extend(self.turn.complete_block(Self::block_index(event))),
            "message_delta" => {
                if let Some(reason) =
                    event.get("delta").and_then(|d| d.get("stop_reason")).and_then(Value::as_str)
                {
                    self.turn.finish_reason = Some(reason.to_string());
                }
                self.record_usage(event.get("usage"));
            }
            "message_stop" => out.extend(self.turn.finish()),
            "error" => {
                let message = event
                    .get("error")
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("backend reported an error");
                return Err(CoreError::protocol(self.turn.provider(), message));
            }
            _ => {}
        }
        Ok(out)
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn on_headers(&mut self, headers: &HeaderMap) {
        self.turn.set_header_usage(headers);
    }

    fn decode_event(&mut self, data: &str) -> Result<Vec<Content>, CoreError> {
        let event = serde_json::from_str::<Value>(data).map_err(|err| {
            CoreError::protocol(self.turn.provider(), format!("malformed stream event: {err}"))
        })?;
        self.decode_typed(&event)
    }

    fn decode_body(&mut self, body: Value) -> Result<Vec<Content>, CoreError> {
        if body.get("type").and_then(Value::as_str) == Some("error") {
            return self.decode_typed(&body);
        }
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            self.turn.model = model.to_string();
        }
        let mut out = Vec::new();
        for block in body.get("content").and_then(Value::as_array).into_iter().flatten() {
            match block.get("type").and_then(Value::as_str).unwrap_or_default() {
                "text" => {
                    out.extend(self.turn.text(block["text"].as_str().unwrap_or_default()));
                }
                "thinking" => {
                    if let Some(signature) = block.get("signature").and_then(Value::as_str) {
                        self.turn.signature(signature);
                    }
                    let thought = block["thinking"].as_str().unwrap_or_default();
                    out.extend(self.turn.reasoning(thought, ThinkingSource::ThinkingBlock));
                    out.extend(self.turn.close_thinking());
                }
                "tool_use" => {
                    let id = block.get("id").and_then(Value::as_str);
                    let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    out.extend(self.turn.whole_tool_call(id, name, input));
                }
                _ => {}
            }
        }
        if let Some(reason) = body.get("stop_reason").and_then(Value::as_str) {
            self.turn.finish_reason = Some(reason.to_string());
        }
        self.record_usage(body.get("usage"));
        Ok(out)
    }

    fn finish(&mut self) -> Vec<Content> {
        self.turn.finish()
    }

    fn interrupted(&mut self) -> Vec<Content> {
        self.turn.interrupted()
    }
}
