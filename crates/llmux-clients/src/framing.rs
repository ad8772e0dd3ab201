use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{StreamExt, stream::BoxStream};
use llmux_core::CoreError;
use reqwest::Response;

/// Data payloads of a server-sent-events body. Comments and empty events are skipped.
pub(crate) fn sse_frames(
    response: Response,
    provider: &str,
) -> BoxStream<'static, Result<String, CoreError>> {
    let provider = provider.to_string();
    response
        .bytes_stream()
        .eventsource()
        .filter_map(move |event| {
            let item = match event {
                Ok(event) if event.data.trim().is_empty() => None,
                Ok(event) => Some(Ok(event.data)),
                Err(err) => Some(Err(CoreError::Transport {
                    provider: provider.clone(),
                    status: None,
                    message: format!("event stream interrupted: {err}"),
                    retryable: true,
                })),
            };
            futures::future::ready(item)
        })
        .boxed()
}

/// One JSON document per line, as Ollama streams it.
pub(crate) fn ndjson_frames(
    response: Response,
    provider: &str,
) -> BoxStream<'static, Result<String, CoreError>> {
    let provider = provider.to_string();
    let mut body = response.bytes_stream();
    async_stream::stream! {
        let mut splitter = NdjsonSplitter::default();
        while let Some(chunk) = body.next().await {
            let chunk: Bytes = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(CoreError::Transport {
                        provider: provider.clone(),
                        status: None,
                        message: format!("response body interrupted: {err}"),
                        retryable: true,
                    });
                    return;
                }
            };
            for line in splitter.push(&chunk) {
                yield Ok(line);
            }
        }
        if let Some(line) = splitter.finish() {
            yield Ok(line);
        }
    }
    .boxed()
}

#[derive(Debug, Default)]
pub(crate) struct NdjsonSplitter {
    buffer: Vec<u8>,
}

impl NdjsonSplitter {
    /// Complete, non-blank lines contained in the bytes seen so far.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=position).collect();
            if let Some(line) = decode_line(&line) {
                lines.push(line);
            }
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks_are_joined() {
        let mut splitter = NdjsonSplitter::default();
        assert!(splitter.push(b"{\"a\":").is_empty());
        assert_eq!(splitter.push(b"1}\n\n{\"b\":2}\r\n{\"c\""), vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(splitter.finish(), Some("{\"c\"".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn multibyte_characters_survive_chunk_boundaries() {
        let text = "{\"t\":\"héllo\"}\n".as_bytes();
        let mut splitter = NdjsonSplitter::default();
        assert!(splitter.push(&text[..8]).is_empty());
        assert_eq!(splitter.push(&text[8..]), vec!["{\"t\":\"héllo\"}"]);
    }
}
