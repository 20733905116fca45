/// In-process document database with snapshot-listener semantics.
///
/// Every change to a thread re-emits the full ordered query snapshot to that
/// thread's subscribers, so redelivery is the normal case rather than the
/// exception. Connectivity can be toggled to exercise degraded paths.
use super::{EventSink, MessageDoc, RemoteMessage, RemoteStream, SubscriptionHandle};
use crate::error::{Result, SyncError};
use crate::message::{LatestMessage, Thread};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Default)]
struct ThreadDoc {
    messages: HashMap<String, MessageDoc>,
    latest_message: Option<LatestMessage>,
}

impl ThreadDoc {
    /// Query snapshot: createdAt descending, ties by document key
    fn snapshot(&self) -> Vec<RemoteMessage> {
        let mut docs: Vec<RemoteMessage> = self
            .messages
            .iter()
            .map(|(key, doc)| RemoteMessage::new(key.clone(), doc.clone()))
            .collect();
        docs.sort_by(|a, b| {
            b.created_at()
                .unwrap_or(0)
                .cmp(&a.created_at().unwrap_or(0))
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        docs
    }
}

struct Subscriber {
    thread_id: String,
    sink: EventSink,
}

struct Inner {
    threads: HashMap<String, ThreadDoc>,
    subscribers: HashMap<u64, Subscriber>,
    next_handle: u64,
    online: bool,
    fail_preview_updates: bool,
}

impl Inner {
    fn publish(&mut self, thread_id: &str) {
        let snapshot = self
            .threads
            .get(thread_id)
            .map(|t| t.snapshot())
            .unwrap_or_default();

        // Drop listeners whose reconciler is gone
        self.subscribers.retain(|_, s| !s.sink.is_closed());
        for sub in self.subscribers.values() {
            if sub.thread_id == thread_id {
                sub.sink.on_event(snapshot.clone());
            }
        }
    }
}

#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<RwLock<Inner>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                threads: HashMap::new(),
                subscribers: HashMap::new(),
                next_handle: 1,
                online: true,
                fail_preview_updates: false,
            })),
        }
    }

    /// Toggle connectivity. Going offline reports an error to every
    /// subscriber; coming back re-emits each subscriber's snapshot.
    pub async fn set_online(&self, online: bool) {
        let mut inner = self.inner.write().await;
        if inner.online == online {
            return;
        }
        inner.online = online;
        info!("Remote is now {}", if online { "online" } else { "offline" });

        if online {
            let threads: Vec<String> = inner
                .subscribers
                .values()
                .map(|s| s.thread_id.clone())
                .collect();
            let mut seen = std::collections::HashSet::new();
            for thread_id in threads {
                if seen.insert(thread_id.clone()) {
                    inner.publish(&thread_id);
                }
            }
        } else {
            for sub in inner.subscribers.values() {
                sub.sink.on_error("connection lost");
            }
        }
    }

    /// Server-side cancellation: report `reason` to every listener on the
    /// thread and detach them. Nothing more is delivered on those handles.
    pub async fn cancel_listeners(&self, thread_id: &str, reason: &str) {
        let mut inner = self.inner.write().await;
        inner.subscribers.retain(|handle, sub| {
            if sub.thread_id != thread_id {
                return true;
            }
            sub.sink.on_error(reason);
            debug!("Subscription {} cancelled: {}", handle, reason);
            false
        });
    }

    /// Make latest-message updates fail while message writes still succeed
    pub async fn fail_preview_updates(&self, fail: bool) {
        self.inner.write().await.fail_preview_updates = fail;
    }

    /// Server-side write by another participant; stored even while this
    /// client is offline and delivered once it is back.
    pub async fn inject(&self, thread_id: &str, doc: MessageDoc) -> String {
        let mut inner = self.inner.write().await;
        let key = new_doc_key();
        inner
            .threads
            .entry(thread_id.to_string())
            .or_default()
            .messages
            .insert(key.clone(), doc);
        if inner.online {
            inner.publish(thread_id);
        }
        key
    }

    /// Re-emit the current snapshot (a server-initiated redelivery)
    pub async fn redeliver(&self, thread_id: &str) {
        let mut inner = self.inner.write().await;
        if inner.online {
            inner.publish(thread_id);
        }
    }

    pub async fn thread(&self, thread_id: &str) -> Option<Thread> {
        let inner = self.inner.read().await;
        inner.threads.get(thread_id).map(|t| Thread {
            id: thread_id.to_string(),
            latest_message: t.latest_message.clone(),
        })
    }

    pub async fn messages(&self, thread_id: &str) -> Vec<RemoteMessage> {
        let inner = self.inner.read().await;
        inner
            .threads
            .get(thread_id)
            .map(|t| t.snapshot())
            .unwrap_or_default()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.read().await.subscribers.len()
    }
}

fn new_doc_key() -> String {
    Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl RemoteStream for MemoryRemote {
    async fn subscribe(&self, thread_id: &str, sink: EventSink) -> Result<SubscriptionHandle> {
        let mut inner = self.inner.write().await;
        if !inner.online {
            return Err(SyncError::Transport(format!(
                "cannot subscribe to {}: remote unavailable",
                thread_id
            )));
        }

        let handle = inner.next_handle;
        inner.next_handle += 1;

        // Initial snapshot goes out before any later change
        let snapshot = inner
            .threads
            .get(thread_id)
            .map(|t| t.snapshot())
            .unwrap_or_default();
        sink.on_event(snapshot);

        inner.subscribers.insert(
            handle,
            Subscriber {
                thread_id: thread_id.to_string(),
                sink,
            },
        );
        debug!("Subscription {} opened for thread {}", handle, thread_id);
        Ok(SubscriptionHandle(handle))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.subscribers.remove(&handle.0).is_some() {
            debug!("Subscription {} closed", handle.0);
        }
        Ok(())
    }

    async fn add_message(&self, thread_id: &str, doc: MessageDoc) -> Result<String> {
        let mut inner = self.inner.write().await;
        if !inner.online {
            return Err(SyncError::Transport(
                "message write failed: remote unavailable".to_string(),
            ));
        }

        let key = new_doc_key();
        inner
            .threads
            .entry(thread_id.to_string())
            .or_default()
            .messages
            .insert(key.clone(), doc);
        inner.publish(thread_id);
        Ok(key)
    }

    async fn merge_latest_message(&self, thread_id: &str, latest: LatestMessage) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.online || inner.fail_preview_updates {
            return Err(SyncError::Transport(
                "thread update failed: remote unavailable".to_string(),
            ));
        }

        inner
            .threads
            .entry(thread_id.to_string())
            .or_default()
            .latest_message = Some(latest);
        Ok(())
    }
}
