use std::collections::HashSet;

use async_trait::async_trait;
use llmux_contracts::{
    Content, ContentBlock, ModelInfo, Speaker, ThinkingSource, orphan_tool_responses,
};
use llmux_core::{
    CallInput, ContentStream, CoreError, NormalizedCallOptions, Provider, ProviderDefaults,
    RuntimeSettingsAware, ThrottleTrackable, is_local_endpoint,
};
use reqwest::{Client, header::HeaderMap};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::{
    ToolIdFormat,
    adapter::{
        AdapterCore, Framing, StreamDecoder, StreamRequest, TurnState, decode_stream,
        fallback_models,
    },
    parse_tool_arguments,
    thinking::{BUDGET_TOKENS_KEY, ENABLED_KEY},
    usage::PartialUsage,
};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const WEB_SEARCH_TOOL: &str = "web_search";
const TOOL_IDS: ToolIdFormat = ToolIdFormat::Prefixed("fc_");

pub struct GeminiProvider {
    core: AdapterCore,
}

impl GeminiProvider {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        model: Option<String>,
        http_client: Option<Client>,
        max_inflight: Option<usize>,
    ) -> Self {
        let defaults = ProviderDefaults::new("gemini", DEFAULT_MODEL)
            .with_model(model)
            .with_base_url(base_url)
            .with_auth_token(api_key)
            .with_fallback_base_url(DEFAULT_BASE_URL)
            .with_api_key_env("GEMINI_API_KEY")
            .with_api_key_env("GOOGLE_API_KEY")
            .with_base_url_env("GEMINI_BASE_URL");
        Self::with_defaults(defaults, http_client, max_inflight)
    }

    pub fn with_defaults(
        defaults: ProviderDefaults,
        http_client: Option<Client>,
        max_inflight: Option<usize>,
    ) -> Self {
        Self { core: AdapterCore::new(defaults, http_client, max_inflight) }
    }

    async fn web_search(&self, params: &Value) -> Result<Value, CoreError> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .ok_or_else(|| {
                CoreError::Configuration(format!("{WEB_SEARCH_TOOL} requires a non-empty query"))
            })?;
        let (base_url, token) = self.core.static_endpoint();
        let endpoint = base_url.clone().unwrap_or_default();
        if token.is_none() && !is_local_endpoint(&endpoint) {
            return Err(CoreError::Authentication { provider: self.name().to_string(), endpoint });
        }
        let path = format!("models/{}:generateContent", self.core.defaults.model);
        let url = self.core.runtime.build_url(base_url.as_deref(), &path)?;
        let _permit = self.core.runtime.acquire_permit()?;
        let payload = json!({
            "contents": [{"role": "user", "parts": [{"text": query}]}],
            "tools": [{"googleSearch": {}}],
        });
        let response =
            self.core.runtime.post_json(&url, &payload, &auth_headers(token.as_deref())).await?;
        let body = response.json::<Value>().await.map_err(|err| {
            CoreError::protocol(self.name(), format!("search response is not JSON: {err}"))
        })?;
        Ok(parse_search_result(&body))
    }
}

fn auth_headers(token: Option<&str>) -> Vec<(String, String)> {
    token.map(|token| vec![("x-goog-api-key".to_string(), token.to_string())]).unwrap_or_default()
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        &self.core.defaults.provider
    }

    fn generate_chat_completion(&self, input: CallInput) -> Result<ContentStream, CoreError> {
        let options = self.core.normalize(input)?;
        let model = options.resolved.model.trim_start_matches("models/");
        let path = if options.resolved.streaming {
            format!("models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("models/{model}:generateContent")
        };
        let url = self.core.runtime.build_url(options.resolved.base_url.as_deref(), &path)?;
        let permit = self.core.runtime.acquire_permit()?;
        let payload = build_gemini_payload(&options);
        info!(
            event = "provider.request.payload.normalized",
            provider = %options.provider,
            model = %options.resolved.model,
            contents = payload["contents"].as_array().map_or(0, Vec::len),
            tools_out = options.tools().len(),
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
        let decoder = GeminiDecoder::new(&options);
        Ok(decode_stream(self.core.runtime.clone(), request, decoder))
    }

    async fn get_models(&self) -> Result<Vec<ModelInfo>, CoreError> {
        let (base_url, token) = self.core.static_endpoint();
        let listed = async {
            let url = self.core.runtime.build_url(base_url.as_deref(), "models")?;
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

    fn get_server_tools(&self) -> Vec<String> {
        vec![WEB_SEARCH_TOOL.to_string()]
    }

    async fn invoke_server_tool(&self, tool_name: &str, params: Value) -> Result<Value, CoreError> {
        if tool_name != WEB_SEARCH_TOOL {
            return Err(CoreError::Unsupported {
                provider: self.name().to_string(),
                operation: format!("server tool {tool_name}"),
            });
        }
        self.web_search(&params).await
    }

    fn throttle_tracker(&self) -> Option<&dyn ThrottleTrackable> {
        Some(&self.core)
    }

    fn runtime_settings(&self) -> Option<&dyn RuntimeSettingsAware> {
        Some(self.core.binding())
    }
}

pub(crate) fn build_gemini_payload(options: &NormalizedCallOptions) -> Value {
    let orphans: HashSet<String> = orphan_tool_responses(&options.contents).into_iter().collect();
    let mut contents: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for content in &options.contents {
        let role = if content.speaker == Speaker::Ai { "model" } else { "user" };
        let parts: Vec<Value> =
            content.blocks.iter().filter_map(|block| part_for(block, &orphans)).collect();
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some((last_role, last_parts)) if *last_role == role => last_parts.extend(parts),
            _ => contents.push((role, parts)),
        }
    }

    let mut payload = Map::new();
    payload.insert(
        "contents".to_string(),
        Value::Array(
            contents
                .into_iter()
                .map(|(role, parts)| json!({"role": role, "parts": parts}))
                .collect(),
        ),
    );
    if let Some(memory) = options.invocation.user_memory.as_deref().filter(|m| !m.trim().is_empty())
    {
        payload.insert("systemInstruction".to_string(), json!({"parts": [{"text": memory}]}));
    }
    let declarations: Vec<Value> = options
        .tools()
        .iter()
        .map(|tool| {
            let mut declaration = Map::new();
            declaration.insert("name".to_string(), json!(tool.name));
            if let Some(description) = &tool.description {
                declaration.insert("description".to_string(), json!(description));
            }
            declaration.insert("parameters".to_string(), tool.parameters.clone());
            Value::Object(declaration)
        })
        .collect();
    if !declarations.is_empty() {
        payload.insert("tools".to_string(), json!([{"functionDeclarations": declarations}]));
    }

    let mut generation = Map::new();
    for (key, value) in &options.invocation.model_params {
        generation.insert(generation_key(key), value.clone());
    }
    if options.ephemeral_bool(ENABLED_KEY, false) {
        let mut thinking = Map::new();
        thinking.insert("includeThoughts".to_string(), json!(true));
        if let Some(budget) = options.ephemeral_u64(BUDGET_TOKENS_KEY) {
            thinking.insert("thinkingBudget".to_string(), json!(budget));
        }
        generation.insert("thinkingConfig".to_string(), Value::Object(thinking));
    }
    if !generation.is_empty() {
        payload.insert("generationConfig".to_string(), Value::Object(generation));
    }
    Value::Object(payload)
}

fn part_for(block: &ContentBlock, orphans: &HashSet<String>) -> Option<Value> {
    match block {
        ContentBlock::Text { text } if !text.is_empty() => Some(json!({"text": text})),
        ContentBlock::ToolCall { id, name, parameters } => {
            let args = match parameters {
                Value::String(raw) => parse_tool_arguments(raw),
                other => other.clone(),
            };
            Some(json!({
                "functionCall": {"id": TOOL_IDS.to_backend_id(id), "name": name, "args": args}
            }))
        }
        ContentBlock::ToolResponse { call_id, tool_name, result, error }
            if !orphans.contains(call_id) =>
        {
            let response = match error {
                Some(error) => json!({"error": error}),
                None => json!({"output": result}),
            };
            Some(json!({
                "functionResponse": {
                    "id": TOOL_IDS.to_backend_id(call_id),
                    "name": tool_name,
                    "response": response,
                }
            }))
        }
        _ => None,
    }
}

/// `generationConfig` uses camelCase; `max_tokens` has its own name there.
fn generation_key(key: &str) -> String {
    match key {
        "max_tokens" | "max_output_tokens" => "maxOutputTokens".to_string(),
        "stop" => "stopSequences".to_string(),
        _ => {
            let mut out = String::with_capacity(key.len());
            let mut upper = false;
            for c in key.chars() {
                if c == '_' {
                    upper = true;
                } else if upper {
                    out.extend(c.to_uppercase());
                    upper = false;
                } else {
                    out.push(c);
                }
            }
            out
        }
    }
}

fn parse_model_list(provider: &str, body: &Value) -> Vec<ModelInfo> {
    let Some(models) = body.get("models").and_then(Value::as_array) else {
        return Vec::new();
    };
    models
        .iter()
        .filter_map(|model| {
            let name = model.get("name").and_then(Value::as_str)?;
            let id = name.strip_prefix("models/").unwrap_or(name);
            let mut info = ModelInfo::named(provider, id);
            if let Some(display) = model.get("displayName").and_then(Value::as_str) {
                info.name = display.to_string();
            }
            let limit = |key: &str| {
                model.get(key).and_then(Value::as_u64).and_then(|n| u32::try_from(n).ok())
            };
            info.context_window = limit("inputTokenLimit");
            info.max_output_tokens = limit("outputTokenLimit");
            Some(info)
        })
        .collect()
}

fn parse_search_result(body: &Value) -> Value {
    let candidate = body.pointer("/candidates/0");
    let text: String = candidate
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts.iter().filter_map(|part| part.get("text").and_then(Value::as_str)).collect()
        })
        .unwrap_or_default();
    let sources: Vec<Value> = candidate
        .and_then(|c| c.pointer("/groundingMetadata/groundingChunks"))
        .and_then(Value::as_array)
        .map(|chunks| {
            chunks
                .iter()
                .filter_map(|chunk| chunk.get("web"))
                .map(|web| {
                    json!({
                        "title": web.get("title").cloned().unwrap_or(Value::Null),
                        "uri": web.get("uri").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    json!({"text": text, "sources": sources})
}

pub(crate) struct GeminiDecoder {
    turn: TurnState,
}

impl GeminiDecoder {
    pub(crate) fn new(options: &NormalizedCallOptions) -> Self {
        Self { turn: TurnState::new(options, TOOL_IDS) }
    }

    fn decode_response(&mut self, response: &Value) -> Result<Vec<Content>, CoreError> {
        if let Some(error) = response.get("error") {
            let message = error.get("message").and_then(Value::as_str).unwrap_or("backend error");
            return Err(CoreError::protocol(self.turn.provider(), message));
        }
        if let Some(version) = response.get("modelVersion").and_then(Value::as_str) {
            self.turn.model = version.to_string();
        }
        // cumulative: the latest report replaces earlier ones
        if let Some(usage) = response.get("usageMetadata").filter(|usage| usage.is_object()) {
            self.turn.usage = PartialUsage::from_gemini(usage);
        }

        let mut out = Vec::new();
        let Some(candidate) = response.pointer("/candidates/0") else {
            return Ok(out);
        };
        let parts = candidate.pointer("/content/parts").and_then(Value::as_array);
        for part in parts.into_iter().flatten() {
            if let Some(signature) = part.get("thoughtSignature").and_then(Value::as_str) {
                self.turn.signature(signature);
            }
            let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if is_thought {
                    out.extend(self.turn.reasoning(text, ThinkingSource::ThoughtPart));
                } else {
                    out.extend(self.turn.text(text));
                }
            }
            if let Some(call) = part.get("functionCall") {
                let id = call.get("id").and_then(Value::as_str);
                let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                let args = call.get("args").cloned().unwrap_or(Value::Null);
                out.extend(self.turn.whole_tool_call(id, name, args));
            }
        }
        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            self.turn.finish_reason = Some(reason.to_string());
        }
        Ok(out)
    }
}

impl StreamDecoder for GeminiDecoder {
    fn on_headers(&mut self, headers: &HeaderMap) {
        self.turn.set_header_usage(headers);
    }

    fn decode_event(&mut self, data: &str) -> Result<Vec<Content>, CoreError> {
        let response = serde_json::from_str::<Value>(data).map_err(|err| {
            CoreError::protocol(self.turn.provider(), format!("malformed stream event: {err}"))
        })?;
        self.decode_response(&response)
    }

    fn decode_body(&mut self, body: Value) -> Result<Vec<Content>, CoreError> {
        self.decode_response(&body)
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
    use llmux_contracts::{ToolDefinition, UsageStats};
    use llmux_core::CallOptions;

    use super::*;
    use crate::clients::fixtures::normalized;

    #[test]
    fn payload_uses_model_role_and_function_parts() {
        let history = vec![
            Content::human_text("weather?"),
            Content::ai_blocks(vec![ContentBlock::tool_call(
                "hist_tool_w1",
                "get_weather",
                json!({"city": "Oslo"}),
            )]),
            Content::new(
                Speaker::Tool,
                vec![ContentBlock::tool_response("hist_tool_w1", "get_weather", json!({"c": 4}))],
            ),
        ];
        let options = normalized(
            "gemini",
            "gemini-test",
            CallOptions::new(history)
                .with_user_memory("be terse")
                .with_tools(vec![ToolDefinition {
                    name: "get_weather".to_string(),
                    description: None,
                    parameters: json!({"type": "object"}),
                }])
                .with_model_param("max_tokens", json!(256))
                .with_model_param("top_p", json!(0.9))
                .with_ephemeral("reasoning.enabled", json!(true))
                .with_ephemeral("reasoning.budgetTokens", json!(2048)),
        );
        let payload = build_gemini_payload(&options);

        assert_eq!(payload["contents"][1]["role"], "model");
        assert_eq!(
            payload["contents"][1]["parts"][0]["functionCall"],
            json!({"id": "fc_w1", "name": "get_weather", "args": {"city": "Oslo"}})
        );
        assert_eq!(
            payload["contents"][2]["parts"][0]["functionResponse"]["response"],
            json!({"output": {"c": 4}})
        );
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(payload["tools"][0]["functionDeclarations"][0]["name"], "get_weather");
        assert_eq!(
            payload["generationConfig"],
            json!({
                "maxOutputTokens": 256,
                "topP": 0.9,
                "thinkingConfig": {"includeThoughts": true, "thinkingBudget": 2048}
            })
        );
    }

    #[test]
    fn thought_parts_function_calls_and_usage_are_decoded() {
        let options = normalized("gemini", "gemini-test", CallOptions::new(vec![]));
        let mut decoder = GeminiDecoder::new(&options);
        let mut chunks = Vec::new();
        for event in [
            json!({"candidates": [{"content": {"parts": [{"text": "Planning", "thought": true}]}}]}),
            json!({"candidates": [{"content": {"parts": [{"text": "Calling tool."}]}}],
                   "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 1}}),
            json!({"candidates": [{"content": {"parts": [{"functionCall": {"name": "ls", "args": {"p": "."}}}]},
                   "finishReason": "STOP"}],
                   "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 7, "totalTokenCount": 12}}),
        ] {
            chunks.extend(decoder.decode_event(&event.to_string()).expect("event must decode"));
        }
        chunks.extend(decoder.finish());

        assert_eq!(chunks.len(), 4);
        assert_eq!(
            chunks[0].blocks,
            vec![ContentBlock::thinking("Planning", ThinkingSource::ThoughtPart)]
        );
        assert_eq!(chunks[1].text(), "Calling tool.");
        let (id, name, args) = chunks[2].tool_calls().next().expect("tool call must be emitted");
        assert!(id.starts_with("hist_tool_"));
        assert_eq!((name, args), ("ls", &json!({"p": "."})));
        let metadata = chunks[3].metadata.clone().expect("final chunk must carry metadata");
        assert_eq!(metadata.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(metadata.usage, Some(UsageStats::new(5, 7)));
    }

    #[test]
    fn generation_keys_are_camel_cased() {
        assert_eq!(generation_key("max_tokens"), "maxOutputTokens");
        assert_eq!(generation_key("top_k"), "topK");
        assert_eq!(generation_key("temperature"), "temperature");
        assert_eq!(generation_key("stop"), "stopSequences");
        assert_eq!(generation_key("response_mime_type"), "responseMimeType");
    }

    #[test]
    fn search_results_collect_grounding_sources() {
        let result = parse_search_result(&json!({
            "candidates": [{
                "content": {"parts": [{"text": "Rust 1.80 "}, {"text": "was released."}]},
                "groundingMetadata": {"groundingChunks": [
                    {"web": {"uri": "https://blog.rust-lang.org", "title": "Rust Blog"}},
                    {"retrievedContext": {}}
                ]}
            }]
        }));
        assert_eq!(
            result,
            json!({
                "text": "Rust 1.80 was released.",
                "sources": [{"title": "Rust Blog", "uri": "https://blog.rust-lang.org"}]
            })
        );
    }

    #[tokio::test]
    async fn unknown_server_tool_is_unsupported() {
        let provider = GeminiProvider::new(None, Some("k".to_string()), None, None, None);
        assert_eq!(provider.get_server_tools(), vec!["web_search".to_string()]);
        let error = provider
            .invoke_server_tool("code_exec", json!({}))
            .await
            .expect_err("unknown tool must fail");
        assert!(matches!(error, CoreError::Unsupported { .. }));
        let error = provider
            .invoke_server_tool("web_search", json!({"query": "  "}))
            .await
            .expect_err("empty query must fail");
        assert!(matches!(error, CoreError::Configuration(_)));
    }

    #[test]
    fn model_listing_strips_prefix_and_reads_limits() {
        let models = parse_model_list(
            "gemini",
            &json!({"models": [{"name": "models/gemini-x", "displayName": "Gemini X",
                                "inputTokenLimit": 1048576, "outputTokenLimit": 8192}]}),
        );
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "gemini-x");
        assert_eq!(models[0].name, "Gemini X");
        assert_eq!(models[0].context_window, Some(1_048_576));
        assert_eq!(models[0].max_output_tokens, Some(8192));
    }
}
