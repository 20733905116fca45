/// Volatile message cache for tests and cache-less embeddings
use super::LocalStore;
use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<RwLock<BTreeMap<(String, String), Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows across all threads
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn get(&self, thread_id: &str, message_id: &str) -> Option<Message> {
        self.rows
            .read()
            .await
            .get(&(thread_id.to_string(), message_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn load_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|((thread, _), _)| thread == thread_id)
            .map(|(_, message)| message.clone())
            .collect())
    }

    async fn upsert_message(&self, thread_id: &str, message: &Message) -> Result<()> {
        self.rows.write().await.insert(
            (thread_id.to_string(), message.id.clone()),
            message.clone(),
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
