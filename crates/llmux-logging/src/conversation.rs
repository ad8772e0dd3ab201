use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use llmux_contracts::{Content, UsageStats};
use llmux_core::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

/// Identifies one persisted record within a conversation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RecordKey {
    pub conversation_id: String,
    pub turn: u64,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RequestRecord {
    pub provider: String,
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ResponseRecord {
    pub provider: String,
    pub text: String,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolCallRecord {
    pub provider: String,
    pub call_id: String,
    pub tool_name: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationEntry {
    Request(RequestRecord),
    Response(ResponseRecord),
    ToolCall(ToolCallRecord),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConversationRecord {
    #[serde(flatten)]
    pub key: RecordKey,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: ConversationEntry,
}

impl ConversationRecord {
    pub fn now(key: &RecordKey, entry: ConversationEntry) -> Self {
        Self { key: key.clone(), timestamp: Utc::now(), entry }
    }
}

/// Durable sink for redacted conversation records.
#[async_trait]
pub trait ConversationLogWriter: Send + Sync {
    async fn append(&self, record: ConversationRecord) -> Result<(), CoreError>;

    async fn write_request(
        &self,
        key: &RecordKey,
        request: RequestRecord,
    ) -> Result<(), CoreError> {
        self.append(ConversationRecord::now(key, ConversationEntry::Request(request))).await
    }

    async fn write_response(
        &self,
        key: &RecordKey,
        response: ResponseRecord,
    ) -> Result<(), CoreError> {
        self.append(ConversationRecord::now(key, ConversationEntry::Response(response))).await
    }

    async fn write_tool_call(
        &self,
        key: &RecordKey,
        call: ToolCallRecord,
    ) -> Result<(), CoreError> {
        self.append(ConversationRecord::now(key, ConversationEntry::ToolCall(call))).await
    }
}

/// Appends one JSON object per line to `<dir>/conversation-<id>.jsonl`.
#[derive(Debug)]
pub struct JsonlConversationWriter {
    dir: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlConversationWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), lock: tokio::sync::Mutex::new(()) }
    }

    pub fn path_for(&self, conversation_id: &str) -> PathBuf {
        let safe: String = conversation_id
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
            .collect();
        self.dir.join(format!("conversation-{safe}.jsonl"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ConversationLogWriter for JsonlConversationWriter {
    async fn append(&self, record: ConversationRecord) -> Result<(), CoreError> {
        let mut line = serde_json::to_string(&record)
            .map_err(|err| CoreError::Persistence(format!("record is not serializable: {err}")))?;
        line.push('\n');
        let path = self.path_for(&record.key.conversation_id);

        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| io_failure("create", &self.dir, err))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| io_failure("open", &path, err))?;
        file.write_all(line.as_bytes()).await.map_err(|err| io_failure("write", &path, err))?;
        file.flush().await.map_err(|err| io_failure("flush", &path, err))
    }
}

fn io_failure(action: &str, path: &Path, err: std::io::Error) -> CoreError {
    CoreError::Persistence(format!("cannot {action} {}: {err}", path.display()))
}

/// Keeps records in memory; used by tests and embedders that inspect turns directly.
#[derive(Debug, Default)]
pub struct InMemoryConversationLog {
    records: Mutex<Vec<ConversationRecord>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ConversationRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ConversationLogWriter for InMemoryConversationLog {
    async fn append(&self, record: ConversationRecord) -> Result<(), CoreError> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(turn: u64) -> RecordKey {
        RecordKey {
            conversation_id: "session/42".to_string(),
            turn,
            correlation_id: format!("corr-{turn}"),
        }
    }

    #[tokio::test]
    async fn jsonl_writer_appends_one_line_per_record() {
        let dir = tempfile::tempdir().expect("temp dir must be created");
        let writer = JsonlConversationWriter::new(dir.path().join("logs"));
        writer
            .write_request(
                &key(1),
                RequestRecord {
                    provider: "openai".to_string(),
                    contents: vec![Content::human_text("hi")],
                    tools: vec![],
                },
            )
            .await
            .expect("request must persist");
        writer
            .write_tool_call(
                &key(1),
                ToolCallRecord {
                    provider: "openai".to_string(),
                    call_id: "hist_tool_1".to_string(),
                    tool_name: "ls".to_string(),
                    parameters: json!({"path": "."}),
                },
            )
            .await
            .expect("tool call must persist");

        let path = writer.path_for("session/42");
        assert!(path.ends_with("conversation-session_42.jsonl"));
        let raw = std::fs::read_to_string(&path).expect("log file must exist");
        let lines: Vec<Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("line must be JSON"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "request");
        assert_eq!(lines[0]["conversation_id"], "session/42");
        assert_eq!(lines[0]["turn"], 1);
        assert_eq!(lines[1]["kind"], "tool_call");
        assert_eq!(lines[1]["correlation_id"], "corr-1");
        assert!(lines[1]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn unwritable_directory_is_a_persistence_error() {
        let dir = tempfile::tempdir().expect("temp dir must be created");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").expect("blocker must be written");
        let writer = JsonlConversationWriter::new(blocker.join("nested"));
        let error = writer
            .write_response(
                &key(2),
                ResponseRecord {
                    provider: "openai".to_string(),
                    text: String::new(),
                    duration_ms: 1,
                    success: true,
                    error: None,
                    usage: None,
                },
            )
            .await
            .expect_err("a file in place of a directory must fail");
        assert!(matches!(error, CoreError::Persistence(_)));
    }

    #[tokio::test]
    async fn records_round_trip_through_serde() {
        let log = InMemoryConversationLog::new();
        log.write_response(
            &key(3),
            ResponseRecord {
                provider: "gemini".to_string(),
                text: "done".to_string(),
                duration_ms: 12,
                success: true,
                error: None,
                usage: Some(UsageStats::new(3, 4)),
            },
        )
        .await
        .expect("in-memory append never fails");
        let record = log.records().pop().expect("record must be kept");
        let value = serde_json::to_value(&record).expect("record must serialize");
        assert_eq!(value["kind"], "response");
        let parsed: ConversationRecord =
            serde_json::from_value(value).expect("record must deserialize");
        assert_eq!(parsed, record);
    }
}
