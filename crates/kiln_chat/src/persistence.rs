//! Conversation log storage.
//!
//! Directory structure for the file-backed store:
//! ```text
//! <data>/conversations/
//!   <application_id>.jsonl   # one message per line, append-only
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{ChatError, ChatResult};
use crate::types::{Message, MessageRole};

/// Append-only message log per application.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, application_id: &str) -> ChatResult<Vec<Message>>;

    async fn append(&self, application_id: &str, message: Message) -> ChatResult<()>;

    /// Append an assistant reply unless one already exists for `message.turn`.
    /// Returns whether the reply was written.
    async fn append_reply(&self, application_id: &str, message: Message) -> ChatResult<bool>;
}

fn has_reply(messages: &[Message], turn: u32) -> bool {
    messages
        .iter()
        .any(|m| m.role == MessageRole::Assistant && m.turn == turn)
}

/// In-memory conversation log.
#[derive(Default)]
pub struct MemoryConversationStore {
    logs: RwLock<HashMap<String, Vec<Message>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn load(&self, application_id: &str) -> ChatResult<Vec<Message>> {
        Ok(self
            .logs
            .read()
            .get(application_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, application_id: &str, message: Message) -> ChatResult<()> {
        self.logs
            .write()
            .entry(application_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn append_reply(&self, application_id: &str, message: Message) -> ChatResult<bool> {
        let mut logs = self.logs.write();
        let log = logs.entry(application_id.to_string()).or_default();
        if has_reply(log, message.turn) {
            return Ok(false);
        }
        log.push(message);
        Ok(true)
    }
}

/// JSON Lines conversation log, one file per application.
pub struct JsonlConversationStore {
    dir: PathBuf,
    // Serializes appends so reply checks and writes are atomic
    write_lock: Mutex<()>,
}

impl JsonlConversationStore {
    /// Open (and create) `<data_dir>/conversations`.
    pub fn open(data_dir: impl AsRef<Path>) -> ChatResult<Self> {
        let dir = data_dir.as_ref().join("conversations");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn log_path(&self, application_id: &str) -> ChatResult<PathBuf> {
        if application_id.is_empty()
            || application_id.contains(['/', '\\'])
            || application_id.contains("..")
        {
            return Err(ChatError::Storage(format!(
                "invalid application id: {:?}",
                application_id
            )));
        }
        Ok(self.dir.join(format!("{}.jsonl", application_id)))
    }

    async fn read_log(&self, path: &Path) -> ChatResult<Vec<Message>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(
                    "Skipping unreadable line {} in {}: {}",
                    number + 1,
                    path.display(),
                    e
                ),
            }
        }
        Ok(messages)
    }

    async fn write_line(&self, path: &Path, message: &Message) -> ChatResult<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn load(&self, application_id: &str) -> ChatResult<Vec<Message>> {
        let path = self.log_path(application_id)?;
        self.read_log(&path).await
    }

    async fn append(&self, application_id: &str, message: Message) -> ChatResult<()> {
        let path = self.log_path(application_id)?;
        let _guard = self.write_lock.lock().await;
        self.write_line(&path, &message).await
    }

    async fn append_reply(&self, application_id: &str, message: Message) -> ChatResult<bool> {
        let path = self.log_path(application_id)?;
        let _guard = self.write_lock.lock().await;
        if has_reply(&self.read_log(&path).await?, message.turn) {
            return Ok(false);
        }
        self.write_line(&path, &message).await?;
        Ok(true)
    }
}
