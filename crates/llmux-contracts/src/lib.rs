use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Prefix shared by every tool-call ID stored in conversation history.
pub const CANONICAL_TOOL_ID_PREFIX: &str = "hist_tool_";

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Human,
    Ai,
    Tool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingSource {
    TaggedText,
    ReasoningContent,
    ThinkingBlock,
    ThoughtPart,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        parameters: Value,
    },
    ToolResponse {
        call_id: String,
        tool_name: String,
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Thinking {
        thought: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_field: Option<ThinkingSource>,
        #[serde(default)]
        is_hidden: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, parameters: Value) -> Self {
        Self::ToolCall { id: id.into(), name: name.into(), parameters }
    }

    pub fn tool_response(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: Value,
    ) -> Self {
        Self::ToolResponse {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            result,
            error: None,
        }
    }

    pub fn thinking(thought: impl Into<String>, source_field: ThinkingSource) -> Self {
        Self::Thinking {
            thought: thought.into(),
            source_field: Some(source_field),
            is_hidden: false,
            signature: None,
        }
    }

    pub fn is_visible_output(&self) -> bool {
        matches!(self, Self::Text { .. } | Self::ToolCall { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct UsageStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl UsageStats {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            cached_tokens: 0,
            reasoning_tokens: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn add(&mut self, other: &UsageStats) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.cached_tokens = self.cached_tokens.saturating_add(other.cached_tokens);
        self.reasoning_tokens = self.reasoning_tokens.saturating_add(other.reasoning_tokens);
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ContentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
}

/// One turn's payload in the provider-agnostic shape.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Content {
    pub speaker: Speaker,
    pub blocks: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContentMetadata>,
}

impl Content {
    pub fn new(speaker: Speaker, blocks: Vec<ContentBlock>) -> Self {
        Self { speaker, blocks, metadata: None }
    }

    pub fn human_text(text: impl Into<String>) -> Self {
        Self::new(Speaker::Human, vec![ContentBlock::text(text)])
    }

    pub fn ai_text(text: impl Into<String>) -> Self {
        Self::new(Speaker::Ai, vec![ContentBlock::text(text)])
    }

    pub fn ai_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::new(Speaker::Ai, blocks)
    }

    pub fn with_metadata(mut self, metadata: ContentMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn usage(&self) -> Option<&UsageStats> {
        self.metadata.as_ref().and_then(|metadata| metadata.usage.as_ref())
    }

    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn thinking_text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Thinking { thought, .. } => Some(thought.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.blocks.iter().filter_map(|block| match block {
            ContentBlock::ToolCall { id, name, parameters } => {
                Some((id.as_str(), name.as_str(), parameters))
            }
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl ModelInfo {
    pub fn named(provider: &str, id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            provider: provider.to_string(),
            context_window: None,
            max_output_tokens: None,
        }
    }
}

pub fn mint_canonical_tool_id() -> String {
    format!("{CANONICAL_TOOL_ID_PREFIX}{}", Uuid::new_v4().simple())
}

/// Tool responses whose `call_id` has no earlier matching tool call.
pub fn orphan_tool_responses(contents: &[Content]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut orphans = Vec::new();
    for content in contents {
        for block in &content.blocks {
            match block {
                ContentBlock::ToolCall { id, .. } => {
                    seen.insert(id.as_str());
                }
                ContentBlock::ToolResponse { call_id, .. } if !seen.contains(call_id.as_str()) => {
                    orphans.push(call_id.clone());
                }
                _ => {}
            }
        }
    }
    orphans
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn content_blocks_serialize_with_type_tag() {
        let content = Content::new(
            Speaker::Ai,
            vec![
                ContentBlock::text("hi"),
                ContentBlock::tool_call("hist_tool_1", "read_file", json!({"path":"a.txt"})),
            ],
        );
        let value = serde_json::to_value(&content).expect("content must serialize");
        assert_eq!(value["speaker"], "ai");
        assert_eq!(value["blocks"][0]["type"], "text");
        assert_eq!(value["blocks"][1]["type"], "tool_call");
        assert_eq!(value["blocks"][1]["parameters"]["path"], "a.txt");
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn thinking_block_defaults_hidden_flag_when_missing() {
        let block: ContentBlock =
            serde_json::from_value(json!({"type":"thinking","thought":"hmm"}))
                .expect("thinking block must deserialize");
        assert_eq!(
            block,
            ContentBlock::Thinking {
                thought: "hmm".to_string(),
                source_field: None,
                is_hidden: false,
                signature: None
            }
        );
    }

    #[test]
    fn text_helpers_skip_other_blocks() {
        let content = Content::ai_blocks(vec![
            ContentBlock::thinking("plan", ThinkingSource::TaggedText),
            ContentBlock::text("a"),
            ContentBlock::tool_call("hist_tool_x", "ls", json!({})),
            ContentBlock::text("b"),
        ]);
        assert_eq!(content.text(), "ab");
        assert_eq!(content.thinking_text(), "plan");
        assert_eq!(content.tool_calls().count(), 1);
    }

    #[test]
    fn usage_new_derives_total() {
        let usage = UsageStats::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
        assert!(!usage.is_empty());
        assert!(UsageStats::default().is_empty());
    }

    #[test]
    fn minted_ids_carry_canonical_prefix() {
        let first = mint_canonical_tool_id();
        let second = mint_canonical_tool_id();
        assert!(first.starts_with(CANONICAL_TOOL_ID_PREFIX));
        assert_ne!(first, second);
    }

    #[test]
    fn orphan_tool_responses_are_detected() {
        let contents = vec![
            Content::ai_blocks(vec![ContentBlock::tool_call("hist_tool_a", "ls", json!({}))]),
            Content::new(
                Speaker::Tool,
                vec![
                    ContentBlock::tool_response("hist_tool_a", "ls", json!("ok")),
                    ContentBlock::tool_response("hist_tool_b", "ls", json!("late")),
                ],
            ),
        ];
        assert_eq!(orphan_tool_responses(&contents), vec!["hist_tool_b".to_string()]);
    }
}
