use anyhow::Context;
use futures::StreamExt;
use llmux_app::{ProviderStack, config::AppConfig};
use llmux_contracts::{Content, ContentBlock};
use llmux_observability::init_observability;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

/// Reads one prompt per line from stdin; `@target prompt` picks a provider or `provider/model`.
fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    // The trace exporter's blocking client must be shut down outside the async runtime.
    let _observability = init_observability("llmux-app");
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("async runtime must start")?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("configuration must be valid")?;
    let stack = ProviderStack::from_config(&config).context("providers must be constructible")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut history: Vec<Content> = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let (target, prompt) = split_target(&line);
        if prompt.is_empty() {
            continue;
        }
        history.push(Content::human_text(prompt));

        let mut stream = match stack.chat(target, history.clone()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(event = "app.call.rejected", error = %err);
                history.pop();
                continue;
            }
        };
        let mut reply = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(content) => {
                    for block in &content.blocks {
                        if let ContentBlock::Text { text } = block {
                            stdout.write_all(text.as_bytes()).await?;
                        }
                    }
                    stdout.flush().await?;
                    if let Some(usage) = content.usage() {
                        info!(
                            event = "app.call.usage",
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens
                        );
                    }
                    reply.extend(content.blocks);
                }
                Err(err) => {
                    warn!(event = "app.call.failed", error = %err);
                    break;
                }
            }
        }
        stdout.write_all(b"\n").await?;
        if !reply.is_empty() {
            history.push(Content::ai_blocks(reply));
        }
    }
    Ok(())
}

fn split_target(line: &str) -> (Option<&str>, &str) {
    let line = line.trim();
    match line.strip_prefix('@').and_then(|rest| rest.split_once(char::is_whitespace)) {
        Some((target, prompt)) => (Some(target), prompt.trim()),
        None => (None, line),
    }
}
