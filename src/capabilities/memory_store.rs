// InMemoryMessageStore - process-local MessageStore keyed by conversation

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::capabilities::{MessageStore, NewMessage};
use crate::error::RelayError;
use crate::protocol::MessageRecord;

#[derive(Default)]
pub struct InMemoryMessageStore {
    conversations: DashMap<String, Vec<MessageRecord>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages stored for a conversation, oldest first
    pub fn messages(&self, conversation_id: &str) -> Vec<MessageRecord> {
        self.conversations
            .get(conversation_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn persist_message(&self, message: NewMessage) -> Result<MessageRecord, RelayError> {
        if message.conversation_id.trim().is_empty() {
            return Err(RelayError::capability("persist", "conversation id is empty"));
        }

        let record = MessageRecord {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            role: message.role,
            language: message.language,
            text: message.text,
            kind: message.kind,
            original_message_id: message.original_message_id,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        self.conversations
            .entry(record.conversation_id.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }
}
