use std::collections::HashSet;

use async_trait::async_trait;
use llmux_contracts::{
    Content, ContentBlock, ModelInfo, Speaker, ThinkingSource, orphan_tool_responses,
};
use llmux_core::{
    CallInput, ContentStream, CoreError, NormalizedCallOptions, Provider, ProviderDefaults,
    RuntimeSettingsAware, ThrottleTrackable, value_as_bool,
};
use reqwest::Client;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::{
    ToolIdFormat,
    adapter::{
        AdapterCore, Framing, StreamDecoder, StreamRequest, TurnState, bearer_headers,
        decode_stream, fallback_models, tool_result_text,
    },
    parse_tool_arguments,
    thinking::{ENABLED_KEY, INCLUDE_IN_CONTEXT_KEY},
    usage::PartialUsage,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.1";

/// Self-hosted backend speaking the Ollama chat API.
pub struct OllamaProvider {
    core: AdapterCore,
}

impl OllamaProvider {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        model: Option<String>,
        http_client: Option<Client>,
        max_inflight: Option<usize>,
    ) -> Self {
        let defaults = ProviderDefaults::new("ollama", DEFAULT_MODEL)
            .with_model(model)
            .with_base_url(base_url)
            .with_auth_token(api_key)
            .with_fallback_base_url(DEFAULT_BASE_URL)
            .with_api_key_env("OLLAMA_API_KEY")
            .with_base_url_env("OLLAMA_BASE_URL")
            .without_auth();
        Self { core: AdapterCore::new(defaults, http_client, max_inflight) }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.core.defaults.provider
    }

    fn generate_chat_completion(&self, input: CallInput) -> Result<ContentStream, CoreError> {
        let options = self.core.normalize(input)?;
        let url = self.core.runtime.build_url(options.resolved.base_url.as_deref(), "api/chat")?;
        let permit = self.core.runtime.acquire_permit()?;
        let payload = build_ollama_payload(&options);
        info!(
            event = "provider.request.payload.normalized",
            provider = %options.provider,
            model = %options.resolved.model,
            messages = payload["messages"].as_array().map_or(0, Vec::len),
            tools_out = options.tools().len(),
            streaming = options.resolved.streaming
        );
        let request = StreamRequest {
            url,
            payload,
            headers: bearer_headers(options.resolved.auth_token.as_deref()),
            framing: Framing::NdJson,
            streaming: options.resolved.streaming,
            abort: options.abort.clone(),
            permit,
        };
        let decoder = OllamaDecoder::new(&options);
        Ok(decode_stream(self.core.runtime.clone(), request, decoder))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, CoreError> {
        let (base_url, token) = self.core.static_endpoint();
        let listed = async {
            let url = self.core.runtime.build_url(base_url.as_deref(), "api/tags")?;
            let body = self.core.runtime.get_json(&url, &bearer_headers(token.as_deref())).await?;
            let models: Vec<ModelInfo> = body
                .get("models")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|model| model.get("name").or_else(|| model.get("model")))
                .filter_map(Value::as_str)
                .map(|name| ModelInfo::named(self.name(), name))
                .collect();
            Ok::<_, CoreError>(models)
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

pub(crate) fn build_ollama_payload(options: &NormalizedCallOptions) -> Value {
    let orphans: HashSet<String> = orphan_tool_responses(&options.contents).into_iter().collect();
    let include_thinking = options.ephemeral_bool(INCLUDE_IN_CONTEXT_KEY, false);
    let mut messages = Vec::new();
    if let Some(memory) = options.invocation.user_memory.as_deref().filter(|m| !m.trim().is_empty())
    {
        messages.push(json!({"role": "system", "content": memory}));
    }
    for content in &options.contents {
        for block in &content.blocks {
            if let ContentBlock::ToolResponse { call_id, tool_name, result, error } = block
                && !orphans.contains(call_id)
            {
                messages.push(json!({
                    "role": "tool",
                    "tool_name": tool_name,
                    "content": tool_result_text(result, error.as_deref()),
                }));
            }
        }
        match content.speaker {
            Speaker::Human if !content.text().is_empty() => {
                messages.push(json!({"role": "user", "content": content.text()}));
            }
            Speaker::Ai => {
                let mut message = Map::new();
                message.insert("role".to_string(), json!("assistant"));
                message.insert("content".to_string(), json!(content.text()));
                let calls: Vec<Value> = content
                    .tool_calls()
                    .map(|(_, name, parameters)| {
                        let arguments = match parameters {
                            Value::String(raw) => parse_tool_arguments(raw),
                            other => other.clone(),
                        };
                        json!({"function": {"name": name, "arguments": arguments}})
                    })
                    .collect();
                if !calls.is_empty() {
                    message.insert("tool_calls".to_string(), Value::Array(calls));
                }
                let thinking = content.thinking_text();
                if include_thinking && !thinking.is_empty() {
                    message.insert("thinking".to_string(), json!(thinking));
                }
                messages.push(Value::Object(message));
            }
            _ => {}
        }
    }

    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(options.resolved.model));
    payload.insert("messages".to_string(), Value::Array(messages));
    payload.insert("stream".to_string(), json!(options.resolved.streaming));
    let tools: Vec<Value> = options
        .tools()
        .iter()
        .map(|tool| {
            json!({"type": "function", "function": {
                "name": tool.name,
                "description": tool.description.clone().unwrap_or_default(),
                "parameters": tool.parameters,
            }})
        })
        .collect();
    if !tools.is_empty() {
        payload.insert("tools".to_string(), Value::Array(tools));
    }
    if !options.invocation.model_params.is_empty() {
        payload.insert("options".to_string(), json!(options.invocation.model_params));
    }
    if let Some(think) = options.ephemeral(ENABLED_KEY).as_ref().and_then(value_as_bool) {
        payload.insert("think".to_string(), json!(think));
    }
    Value::Object(payload)
}

pub(crate) struct OllamaDecoder {
    turn: TurnState,
}

impl OllamaDecoder {
    pub(crate) fn new(options: &NormalizedCallOptions) -> Self {
        // the backend assigns no call IDs; every ID is minted
        Self { turn: TurnState::new(options, ToolIdFormat::Prefixed("call_")) }
    }

    fn decode_line(&mut self, line: &Value) -> Result<Vec<Content>, CoreError> {
        if let Some(error) = line.get("error") {
            let message =
                error.as_str().map(ToString::to_string).unwrap_or_else(|| error.to_string());
            return Err(CoreError::protocol(self.turn.provider(), message));
        }
        if let Some(model) = line.get("model").and_then(Value::as_str) {
            self.turn.model = model.to_string();
        }
        let mut out = Vec::new();
        if let Some(message) = line.get("message") {
            if let Some(thinking) = message.get("thinking").and_then(Value::as_str) {
                out.extend(self.turn.reasoning(thinking, ThinkingSource::ReasoningContent));
            }
            if let Some(text) = message.get("content").and_then(Value::as_str) {
                out.extend(self.turn.text(text));
            }
            for call in message.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
                let function = call.get("function").cloned().unwrap_or(Value::Null);
                let name = function.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = function.get("arguments").cloned().unwrap_or(Value::Null);
                let id = call.get("id").and_then(Value::as_str);
                out.extend(self.turn.whole_tool_call(id, name, arguments));
            }
        }
        if line.get("done").and_then(Value::as_bool).unwrap_or(false) {
            if let Some(reason) = line.get("done_reason").and_then(Value::as_str) {
                self.turn.finish_reason = Some(reason.to_string());
            }
            self.turn.usage.merge_from(PartialUsage::from_ollama(line));
        }
        Ok(out)
    }
}

impl StreamDecoder for OllamaDecoder {
    fn decode_event(&mut self, data: &str) -> Result<Vec<Content>, CoreError> {
        let line = serde_json::from_str::<Value>(data).map_err(|err| {
            CoreError::protocol(self.turn.provider(), format!("malformed stream line: {err}"))
        })?;
        self.decode_line(&line)
    }

    fn decode_body(&mut self, body: Value) -> Result<Vec<Content>, CoreError> {
        self.decode_line(&body)
    }

    fn finish(&mut self) -> Vec<Content> {
        self.turn.finish()
    }

    fn interrupted(&mut self) -> Vec<Content> {
        self.turn.interrupted()
    }
}

#[cfg(test)]
mod tests {
    use llmux_contracts::UsageStats;
    use llmux_core::{CallOptions, normalize_call};

    use super::*;
    use crate::clients::fixtures::normalized;

    #[test]
    fn local_default_endpoint_needs_no_credentials() {
        let defaults = ProviderDefaults::new("ollama", DEFAULT_MODEL)
            .with_fallback_base_url(DEFAULT_BASE_URL)
            .with_env_lookup(|_| None)
            .without_auth();
        let options = CallOptions::new(vec![Content::human_text("hi")])
            .with_runtime(crate::clients::fixtures::runtime());
        let normalized = normalize_call(options.into(), &defaults, None)
            .expect("local endpoint must not need a token");
        assert_eq!(normalized.resolved.base_url.as_deref(), Some(DEFAULT_BASE_URL));
        assert_eq!(normalized.resolved.auth_token, None);
        assert!(bearer_headers(normalized.resolved.auth_token.as_deref()).is_empty());
    }

    #[test]
    fn payload_carries_tool_messages_options_and_think_flag() {
        let history = vec![
            Content::human_text("list"),
            Content::ai_blocks(vec![ContentBlock::tool_call(
                "hist_tool_1",
                "ls",
                json!("{\"p\":1}"),
            )]),
            Content::new(
                Speaker::Tool,
                vec![ContentBlock::tool_response("hist_tool_1", "ls", json!("a b"))],
            ),
        ];
        let options = normalized(
            "ollama",
            "llama-test",
            CallOptions::new(history)
                .with_model_param("num_ctx", json!(8192))
                .with_ephemeral("reasoning.enabled", json!("false")),
        );
        let payload = build_ollama_payload(&options);
        assert_eq!(
            payload["messages"][1]["tool_calls"][0],
            json!({"function": {"name": "ls", "arguments": {"p": 1}}})
        );
        assert_eq!(
            payload["messages"][2],
            json!({"role": "tool", "tool_name": "ls", "content": "a b"})
        );
        assert_eq!(payload["options"], json!({"num_ctx": 8192}));
        assert_eq!(payload["think"], json!(false));
    }

    #[test]
    fn ndjson_lines_decode_to_chunks_with_usage() {
        let options = normalized("ollama", "llama-test", CallOptions::new(vec![]));
        let mut decoder = OllamaDecoder::new(&options);
        let mut chunks = Vec::new();
        for line in [
            r#"{"model":"llama3.1","message":{"role":"assistant","content":"<think>hmm"}}"#,
            r#"{"message":{"role":"assistant","content":"</think>Hello"}}"#,
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"ls","arguments":{"p":"."}}}]}}"#,
            r#"{"done":true,"done_reason":"stop","prompt_eval_count":11,"eval_count":6}"#,
        ] {
            chunks.extend(decoder.decode_event(line).expect("line must decode"));
        }
        chunks.extend(decoder.finish());

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].thinking_text(), "hmm");
        assert_eq!(chunks[1].text(), "Hello");
        let calls: Vec<_> = chunks[2].tool_calls().collect();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.starts_with("hist_tool_"));
        assert_eq!((calls[0].1, calls[0].2), ("ls", &json!({"p": "."})));
        let metadata = chunks[3].metadata.clone().expect("final chunk must carry metadata");
        assert_eq!(metadata.usage, Some(UsageStats::new(11, 6)));
        assert_eq!(metadata.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn error_line_is_protocol_error() {
        let options = normalized("ollama", "llama-test", CallOptions::new(vec![]));
        let mut decoder = OllamaDecoder::new(&options);
        assert_eq!(
            decoder.decode_event(r#"{"error":"model not found"}"#),
            Err(CoreError::protocol("ollama", "model not found"))
        );
    }
}
