/// Remote message feed: live subscription plus the write path
pub mod memory;
pub mod wire;

pub use memory::MemoryRemote;
pub use wire::{MessageDoc, RemoteMessage, RemoteTimestamp, UserRef};

use crate::error::Result;
use crate::message::{LatestMessage, Message};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

/// Identifies one active subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// What a subscription delivers
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    /// Snapshot or delta, ordered newest first; may repeat earlier messages
    Batch(Vec<RemoteMessage>),
    /// Transport failure; the subscription may resume later
    Error(String),
}

/// Callback target handed to `RemoteStream::subscribe`.
///
/// Deliveries are queued for the owning reconciler and dropped once it is gone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RemoteEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RemoteEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false if the receiving side has shut down
    pub fn on_event(&self, batch: Vec<RemoteMessage>) -> bool {
        self.tx.send(RemoteEvent::Batch(batch)).is_ok()
    }

    pub fn on_error(&self, reason: impl Into<String>) -> bool {
        self.tx.send(RemoteEvent::Error(reason.into())).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Thread-scoped remote message collection
#[async_trait]
pub trait RemoteStream: Send + Sync {
    /// Start a live subscription ordered by creation time, newest first.
    /// Delivery is at-least-once.
    async fn subscribe(&self, thread_id: &str, sink: EventSink) -> Result<SubscriptionHandle>;

    /// No delivery for `handle` happens after this returns
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;

    /// Add one document to the thread's message collection; returns its key
    async fn add_message(&self, thread_id: &str, doc: MessageDoc) -> Result<String>;

    /// Merge-update the thread document's latest-message summary
    async fn merge_latest_message(&self, thread_id: &str, latest: LatestMessage) -> Result<()>;

    /// Write a message and then the thread preview.
    ///
    /// Once the message write succeeds the send counts as delivered; a failed
    /// preview update only leaves the thread list stale.
    async fn send_message(&self, thread_id: &str, message: &Message) -> Result<()> {
        self.add_message(thread_id, MessageDoc::from_message(message))
            .await?;

        if let Err(e) = self
            .merge_latest_message(thread_id, message.preview())
            .await
        {
            warn!(
                "Thread {} preview is stale after sending {}: {}",
                thread_id, message.id, e
            );
        }
        Ok(())
    }
}
