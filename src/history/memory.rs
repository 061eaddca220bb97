use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use crate::history::{ apply_append, AppendRecord, HistoryError, SequenceStore };
use crate::models::chat::{ ChatHistory, ChatSummary };

/// Volatile store; histories live as long as the process.
#[derive(Default)]
pub struct MemoryStore {
    chats: Mutex<HashMap<u32, ChatHistory>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(chat_id: u32, history: ChatHistory) -> Self {
        let mut chats = HashMap::new();
        chats.insert(chat_id, history);
        Self { chats: Mutex::new(chats) }
    }
}

#[async_trait]
impl SequenceStore for MemoryStore {
    async fn load(&self, chat_id: u32) -> Result<ChatHistory, HistoryError> {
        Ok(self.chats.lock().await.get(&chat_id).cloned().unwrap_or_default())
    }

    async fn append(&self, chat_id: u32, record: &AppendRecord) -> Result<(), HistoryError> {
        let mut chats = self.chats.lock().await;
        let mut history = chats.get(&chat_id).cloned().unwrap_or_default();
        apply_append(&mut history, record)?;
        chats.insert(chat_id, history);
        Ok(())
    }

    async fn list_chats(&self) -> Result<Vec<ChatSummary>, HistoryError> {
        let chats = self.chats.lock().await;
        let mut summaries: Vec<ChatSummary> = chats
            .iter()
            .map(|(id, history)| ChatSummary::from_history(*id, history))
            .collect();
        summaries.sort_by_key(|c| c.chat_id);
        Ok(summaries)
    }
}
