use std::collections::BTreeMap;

use llmux_contracts::{ContentBlock, mint_canonical_tool_id};
use serde_json::{Value, json};
use tracing::debug;

use crate::ToolIdFormat;

#[derive(Debug)]
struct PendingToolCall {
    id: String,
    minted: bool,
    name: String,
    arguments: String,
}

/// Streaming tool-call fragments keyed by the backend's positional index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: BTreeMap<u32, PendingToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one fragment. The first sighting of an index assigns its ID; a backend ID
    /// arriving later replaces a minted one.
    pub fn push(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        fragment: Option<&str>,
        ids: &ToolIdFormat,
    ) {
        let entry = self.pending.entry(index).or_insert_with(|| PendingToolCall {
            id: mint_canonical_tool_id(),
            minted: true,
            name: String::new(),
            arguments: String::new(),
        });
        if entry.minted
            && let Some(id) = id.map(str::trim).filter(|id| !id.is_empty())
        {
            entry.id = ids.to_canonical_id(id);
            entry.minted = false;
        }
        if entry.name.is_empty()
            && let Some(name) = name.map(str::trim).filter(|name| !name.is_empty())
        {
            entry.name = name.to_string();
        }
        if let Some(fragment) = fragment {
            entry.arguments.push_str(fragment);
        }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.pending.contains_key(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn finish(&mut self, index: u32) -> Option<ContentBlock> {
        self.pending.remove(&index).map(finalize)
    }

    /// Finalizes every pending call in index order.
    pub fn finish_all(&mut self) -> Vec<ContentBlock> {
        std::mem::take(&mut self.pending).into_values().map(finalize).collect()
    }
}

fn finalize(call: PendingToolCall) -> ContentBlock {
    debug!(
        event = "provider.tool_call.finalized",
        tool = %call.name,
        id = %call.id,
        argument_bytes = call.arguments.len()
    );
    ContentBlock::ToolCall {
        id: call.id,
        name: call.name,
        parameters: parse_tool_arguments(&call.arguments),
    }
}

/// Parses accumulated argument text. Doubly encoded objects are unwrapped; text that is
/// not JSON is kept verbatim as a string value.
pub fn parse_tool_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::String(inner)) => match serde_json::from_str::<Value>(&inner) {
            Ok(value @ Value::Object(_)) => value,
            _ => Value::String(inner),
        },
        Ok(value) => value,
        Err(err) => {
            debug!(event = "provider.tool_call.arguments_malformed", error = %err);
            Value::String(raw.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDS: ToolIdFormat = ToolIdFormat::Prefixed("call_");

    #[test]
    fn fragments_assemble_per_index_in_order() {
        let mut tools = ToolCallAccumulator::new();
        tools.push(1, Some("call_b"), Some("write_file"), Some("{\"path\":"), &IDS);
        tools.push(0, Some("call_a"), Some("read_file"), Some("{\"path\":\"a"), &IDS);
        tools.push(0, None, None, Some(".txt\"}"), &IDS);
        tools.push(1, None, None, Some("\"b.txt\"}"), &IDS);

        let blocks = tools.finish_all();
        assert_eq!(
            blocks,
            vec![
                ContentBlock::tool_call("hist_tool_a", "read_file", json!({"path":"a.txt"})),
                ContentBlock::tool_call("hist_tool_b", "write_file", json!({"path":"b.txt"})),
            ]
        );
        assert!(tools.is_empty());
    }

    #[test]
    fn missing_backend_id_is_minted_and_later_confirmed() {
        let mut tools = ToolCallAccumulator::new();
        tools.push(0, None, Some("ls"), None, &IDS);
        let Some(ContentBlock::ToolCall { id, parameters, .. }) = tools.finish(0) else {
            panic!("tool call must be finalized");
        };
        assert!(id.starts_with("hist_tool_"));
        assert_eq!(parameters, json!({}));

        tools.push(3, None, Some("ls"), None, &IDS);
        tools.push(3, Some("call_late"), None, None, &IDS);
        tools.push(3, Some("call_ignored"), None, None, &IDS);
        let Some(ContentBlock::ToolCall { id, .. }) = tools.finish(3) else {
            panic!("tool call must be finalized");
        };
        assert_eq!(id, "hist_tool_late");
        assert!(tools.finish(3).is_none());
    }

    #[test]
    fn malformed_arguments_are_preserved_as_text() {
        assert_eq!(
            parse_tool_arguments("{\"path\": \"a"),
            Value::String("{\"path\": \"a".to_string())
        );
        assert_eq!(parse_tool_arguments("\"{\\\"n\\\":1}\""), json!({"n": 1}));
        assert_eq!(parse_tool_arguments("\"plain\""), json!("plain"));
        assert_eq!(parse_tool_arguments("  "), json!({}));
        assert_eq!(parse_tool_arguments("[1,2]"), json!([1, 2]));
    }
}
