use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use deepresearch_schema::CoreError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::{ChatMessage, ChatRole};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    role: String,
    content: String,
    timestamp: DateTime<Utc>,
}

impl From<&ChatMessage> for StoredMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: match m.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::System => "system",
            }
            .to_string(),
            content: m.content.clone(),
            timestamp: m.timestamp,
        }
    }
}

/// Persists chat conversations as `chat-history/<conversationId>.json`
/// ordered-message documents.
pub struct ChatHistoryStore {
    dir: PathBuf,
}

impl ChatHistoryStore {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self { dir: storage_dir.as_ref().join("chat-history") }
    }

    fn path_for(&self, conversation_id: Uuid) -> PathBuf {
        self.dir.join(format!("{conversation_id}.json"))
    }

    pub async fn save(&self, conversation_id: Uuid, messages: &[ChatMessage]) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CoreError::ProviderError(format!("create chat-history dir: {e}")))?;
        let stored: Vec<StoredMessage> = messages.iter().map(StoredMessage::from).collect();
        let json = serde_json::to_vec_pretty(&stored)
            .map_err(|e| CoreError::ProviderError(format!("serialize chat history: {e}")))?;
        tokio::fs::write(self.path_for(conversation_id), json)
            .await
            .map_err(|e| CoreError::ProviderError(format!("write chat history: {e}")))
    }

    pub async fn list(&self) -> Vec<Uuid> {
        let mut ids = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return ids;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = Uuid::parse_str(stem) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    pub async fn export(&self, conversation_id: Uuid) -> Result<String, CoreError> {
        let bytes = tokio::fs::read(self.path_for(conversation_id))
            .await
            .map_err(|e| CoreError::ProviderError(format!("read chat history: {e}")))?;
        String::from_utf8(bytes).map_err(|e| CoreError::ProviderError(format!("decode chat history: {e}")))
    }

    pub async fn clear(&self, conversation_id: Uuid) -> Result<(), CoreError> {
        match tokio::fs::remove_file(self.path_for(conversation_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::ProviderError(format!("remove chat history: {e}"))),
        }
    }
}
