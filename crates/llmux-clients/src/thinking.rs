//! Reasoning extraction shared by every adapter.
//!
//! Inline `<think>`/`<thinking>` spans and side-channel reasoning fields feed one
//! buffer. Visible text is held back while an opening tag may still be completing, so
//! a tag split across chunks never leaks into the response.

use llmux_contracts::{ContentBlock, ThinkingSource};
use llmux_core::NormalizedCallOptions;

pub const INCLUDE_IN_RESPONSE_KEY: &str = "reasoning.includeInResponse";
pub const INCLUDE_IN_CONTEXT_KEY: &str = "reasoning.includeInContext";
pub const INTERLEAVED_KEY: &str = "reasoning.interleaved";
pub const ENABLED_KEY: &str = "reasoning.enabled";
pub const EFFORT_KEY: &str = "reasoning.effort";
pub const BUDGET_TOKENS_KEY: &str = "reasoning.budgetTokens";

const TAGS: [(&str, &str); 2] = [("<think>", "</think>"), ("<thinking>", "</thinking>")];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThinkingMode {
    /// One merged thinking block before the first visible output.
    #[default]
    Combined,
    /// Each span or fragment is emitted as it completes.
    Interleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingOptions {
    pub mode: ThinkingMode,
    pub include_in_response: bool,
}

impl Default for ThinkingOptions {
    fn default() -> Self {
        Self { mode: ThinkingMode::Combined, include_in_response: true }
    }
}

impl ThinkingOptions {
    pub fn from_call(options: &NormalizedCallOptions) -> Self {
        let mode = if options.ephemeral_bool(INTERLEAVED_KEY, false) {
            ThinkingMode::Interleaved
        } else {
            ThinkingMode::Combined
        };
        Self { mode, include_in_response: options.ephemeral_bool(INCLUDE_IN_RESPONSE_KEY, true) }
    }
}

#[derive(Debug, Default)]
pub struct ThinkingBuffer {
    options: ThinkingOptions,
    pending: String,
    open_tag: Option<(&'static str, &'static str)>,
    thought: String,
    source: Option<ThinkingSource>,
    signature: Option<String>,
    trim_leading: bool,
}

impl ThinkingBuffer {
    pub fn new(options: ThinkingOptions) -> Self {
        Self { options, ..Self::default() }
    }

    /// Feeds visible-channel text that may contain reasoning tags.
    pub fn push_text(&mut self, text: &str) -> Vec<ContentBlock> {
        let mut out = Vec::new();
        self.pending.push_str(text);
        loop {
            if let Some((_, close)) = self.open_tag {
                let Some(position) = self.pending.find(close) else {
                    break;
                };
                let span: String = self.pending.drain(..position + close.len()).collect();
                self.open_tag = None;
                self.trim_leading = true;
                self.add_thought(span[..position].trim(), ThinkingSource::TaggedText, &mut out);
                continue;
            }

            if self.trim_leading {
                let trimmed = self.pending.trim_start();
                if trimmed.is_empty() {
                    self.pending.clear();
                    break;
                }
                self.pending = trimmed.to_string();
                self.trim_leading = false;
            }

            if let Some((position, tag)) = find_open_tag(&self.pending) {
                let visible: String = self.pending.drain(..position + tag.0.len()).collect();
                self.open_tag = Some(tag);
                self.emit_visible(&visible[..position], &mut out);
                continue;
            }

            let held = partial_open_tag_len(&self.pending);
            let split = self.pending.len() - held;
            let visible: String = self.pending.drain(..split).collect();
            self.emit_visible(&visible, &mut out);
            break;
        }
        out
    }

    /// Feeds a side-channel reasoning fragment (reasoning fields, thinking blocks).
    pub fn push_reasoning(&mut self, fragment: &str, source: ThinkingSource) -> Vec<ContentBlock> {
        let mut out = Vec::new();
        self.add_thought(fragment, source, &mut out);
        out
    }

    pub fn set_signature(&mut self, signature: &str) {
        self.signature.get_or_insert_with(String::new).push_str(signature);
    }

    /// End of a backend thinking block. Interleaved mode emits it with its signature;
    /// combined mode keeps merging until visible output.
    pub fn close_block(&mut self) -> Vec<ContentBlock> {
        let mut out = Vec::new();
        if self.options.mode == ThinkingMode::Interleaved {
            self.flush_thought(&mut out);
        }
        out
    }

    /// A tool call is visible output: combined reasoning must precede it.
    pub fn before_tool_call(&mut self) -> Vec<ContentBlock> {
        let mut out = Vec::new();
        self.flush_thought(&mut out);
        out
    }

    /// Flushes held text (an unbalanced span is shown as-is) and remaining reasoning.
    pub fn finish(&mut self) -> Vec<ContentBlock> {
        let mut out = Vec::new();
        let mut held = std::mem::take(&mut self.pending);
        if let Some((open, _)) = self.open_tag.take() {
            held.insert_str(0, open);
        }
        self.emit_visible(&held, &mut out);
        self.flush_thought(&mut out);
        out
    }

    fn add_thought(&mut self, text: &str, source: ThinkingSource, out: &mut Vec<ContentBlock>) {
        if text.is_empty() {
            return;
        }
        match self.options.mode {
            ThinkingMode::Combined => {
                if source == ThinkingSource::TaggedText && !self.thought.is_empty() {
                    self.thought.push('\n');
                }
                self.thought.push_str(text);
                self.source.get_or_insert(source);
            }
            // Block-framed reasoning waits for its block to close so a trailing signature
            // still lands on it.
            ThinkingMode::Interleaved if source == ThinkingSource::ThinkingBlock => {
                self.thought.push_str(text);
                self.source.get_or_insert(source);
            }
            ThinkingMode::Interleaved => {
                if !text.trim().is_empty() {
                    out.push(self.thinking_block(text.to_string(), source));
                }
            }
        }
    }

    fn emit_visible(&mut self, text: &str, out: &mut Vec<ContentBlock>) {
        if text.is_empty() {
            return;
        }
        self.flush_thought(out);
        out.push(ContentBlock::text(text));
    }

    fn flush_thought(&mut self, out: &mut Vec<ContentBlock>) {
        let thought = std::mem::take(&mut self.thought);
        let source = self.source.take().unwrap_or(ThinkingSource::TaggedText);
        let thought = thought.trim();
        if !thought.is_empty() {
            out.push(self.thinking_block(thought.to_string(), source));
        }
    }

    fn thinking_block(&mut self, thought: String, source: ThinkingSource) -> ContentBlock {
        ContentBlock::Thinking {
            thought,
            source_field: Some(source),
            is_hidden: !self.options.include_in_response,
            signature: self.signature.take(),
        }
    }
}

fn find_open_tag(text: &str) -> Option<(usize, (&'static str, &'static str))> {
    TAGS.iter()
        .filter_map(|tag| text.find(tag.0).map(|position| (position, *tag)))
        .min_by_key(|(position, _)| *position)
}

/// Length of the longest suffix of `text` that is a proper prefix of an opening tag.
fn partial_open_tag_len(text: &str) -> usize {
    let longest = TAGS.iter().map(|(open, _)| open.len() - 1).max().unwrap_or(0);
    (1..=longest.min(text.len()))
        .rev()
        .find(|&len| {
            let start = text.len() - len;
            text.is_char_boundary(start)
                && TAGS.iter().any(|(open, _)| open.starts_with(&text[start..]))
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buffer: &mut ThinkingBuffer, chunks: &[&str]) -> Vec<Vec<ContentBlock>> {
        let mut emitted: Vec<_> = chunks.iter().map(|chunk| buffer.push_text(chunk)).collect();
        emitted.push(buffer.finish());
        emitted
    }

    fn thinking(thought: &str, source: ThinkingSource) -> ContentBlock {
        ContentBlock::Thinking {
            thought: thought.to_string(),
            source_field: Some(source),
            is_hidden: false,
            signature: None,
        }
    }

    #[test]
    fn split_opening_tag_is_never_shown() {
        let mut buffer = ThinkingBuffer::new(ThinkingOptions::default());
        let emitted = feed(&mut buffer, &["<thi", "nk>reasoning</think> visible"]);
        assert!(emitted[0].is_empty());
        assert_eq!(
            emitted[1],
            vec![thinking("reasoning", ThinkingSource::TaggedText), ContentBlock::text("visible")]
        );
        assert!(emitted[2].is_empty());
    }

    #[test]
    fn text_before_tag_flows_and_partial_prefix_is_held() {
        let mut buffer = ThinkingBuffer::new(ThinkingOptions::default());
        assert_eq!(buffer.push_text("Hello <"), vec![ContentBlock::text("Hello ")]);
        assert_eq!(buffer.push_text("b>"), vec![ContentBlock::text("<b>")]);
        assert!(buffer.push_text("<thinking>plan").is_empty());
        assert!(buffer.push_text(" more</thinking>\n\n").is_empty());
        assert_eq!(
            buffer.push_text("\nDone"),
            vec![thinking("plan more", ThinkingSource::TaggedText), ContentBlock::text("Done")]
        );
    }

    #[test]
    fn unbalanced_span_is_flushed_as_visible_text_at_end() {
        let mut buffer = ThinkingBuffer::new(ThinkingOptions::default());
        assert!(buffer.push_text("<think>never closed").is_empty());
        assert_eq!(buffer.finish(), vec![ContentBlock::text("<think>never closed")]);

        let mut buffer = ThinkingBuffer::new(ThinkingOptions::default());
        assert_eq!(buffer.push_text("tail <thin"), vec![ContentBlock::text("tail ")]);
        assert_eq!(buffer.finish(), vec![ContentBlock::text("<thin")]);
    }

    #[test]
    fn combined_mode_merges_sources_in_arrival_order() {
        let mut buffer = ThinkingBuffer::new(ThinkingOptions::default());
        assert!(buffer.push_reasoning("step one, ", ThinkingSource::ReasoningContent).is_empty());
        assert!(buffer.push_reasoning("step two", ThinkingSource::ReasoningContent).is_empty());
        assert!(buffer.push_text("<think>tagged</think>").is_empty());
        assert_eq!(
            buffer.push_text("answer"),
            vec![
                thinking("step one, step two\ntagged", ThinkingSource::ReasoningContent),
                ContentBlock::text("answer")
            ]
        );
        assert!(buffer.finish().is_empty());
    }

    #[test]
    fn interleaved_mode_emits_each_fragment() {
        let mut buffer = ThinkingBuffer::new(ThinkingOptions {
            mode: ThinkingMode::Interleaved,
            include_in_response: true,
        });
        assert_eq!(
            buffer.push_reasoning("a", ThinkingSource::ReasoningContent),
            vec![thinking("a", ThinkingSource::ReasoningContent)]
        );
        assert_eq!(
            buffer.push_text("<think>b</think>c"),
            vec![thinking("b", ThinkingSource::TaggedText), ContentBlock::text("c")]
        );
    }

    #[test]
    fn interleaved_thinking_block_carries_signature_sent_after_its_text() {
        let mut buffer = ThinkingBuffer::new(ThinkingOptions {
            mode: ThinkingMode::Interleaved,
            include_in_response: true,
        });
        assert!(buffer.push_reasoning("step one, ", ThinkingSource::ThinkingBlock).is_empty());
        assert!(buffer.push_reasoning("step two", ThinkingSource::ThinkingBlock).is_empty());
        buffer.set_signature("sig-late");
        assert_eq!(
            buffer.close_block(),
            vec![ContentBlock::Thinking {
                thought: "step one, step two".to_string(),
                source_field: Some(ThinkingSource::ThinkingBlock),
                is_hidden: false,
                signature: Some("sig-late".to_string()),
            }]
        );
        assert!(buffer.close_block().is_empty());
        assert!(buffer.finish().is_empty());
    }

    #[test]
    fn combined_mode_ignores_block_boundaries() {
        let mut buffer = ThinkingBuffer::new(ThinkingOptions::default());
        buffer.push_reasoning("first", ThinkingSource::ThinkingBlock);
        assert!(buffer.close_block().is_empty());
        assert_eq!(buffer.finish(), vec![thinking("first", ThinkingSource::ThinkingBlock)]);
    }

    #[test]
    fn hidden_reasoning_is_marked_and_flushed_before_tool_calls() {
        let mut buffer = ThinkingBuffer::new(ThinkingOptions {
            mode: ThinkingMode::Combined,
            include_in_response: false,
        });
        buffer.push_reasoning("consider tools", ThinkingSource::ThinkingBlock);
        buffer.set_signature("sig-1");
        assert_eq!(
            buffer.before_tool_call(),
            vec![ContentBlock::Thinking {
                thought: "consider tools".to_string(),
                source_field: Some(ThinkingSource::ThinkingBlock),
                is_hidden: true,
                signature: Some("sig-1".to_string()),
            }]
        );
        assert!(buffer.before_tool_call().is_empty());
    }

    #[test]
    fn partial_prefix_detection() {
        assert_eq!(partial_open_tag_len("abc<"), 1);
        assert_eq!(partial_open_tag_len("abc<think"), 6);
        assert_eq!(partial_open_tag_len("abc<thinki"), 7);
        assert_eq!(partial_open_tag_len("abc<x"), 0);
        assert_eq!(partial_open_tag_len("héllo"), 0);
    }
}
