/// Durable per-thread message cache
pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;

/// Local message cache. A performance and offline aid, never the source of truth.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Create the storage structure if needed. Safe to call on every startup.
    async fn ensure_schema(&self) -> Result<()>;

    /// All cached messages of a thread, in no particular order
    async fn load_messages(&self, thread_id: &str) -> Result<Vec<Message>>;

    /// Insert or replace by message id, atomically
    async fn upsert_message(&self, thread_id: &str, message: &Message) -> Result<()>;

    /// Release the handle acquired by `ensure_schema`
    async fn close(&self) -> Result<()>;
}
