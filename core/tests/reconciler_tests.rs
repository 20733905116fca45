/// Reconciler integration tests
/// Cache + remote feed + optimistic sends, end to end through the public API
use async_trait::async_trait;
use chatsync_core::message::LatestMessage;
use chatsync_core::remote::{
    MessageDoc, RemoteMessage, RemoteTimestamp, SubscriptionHandle, UserRef,
};
use chatsync_core::{
    Author, Config, EventSink, LocalStore, MemoryRemote, MemoryStore, MergedSequence, Message,
    Origin, OutgoingDraft, Reconciler, RemoteStream, Result, SledStore, SyncError, SyncStatus,
    ViewEvent,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::time::{sleep, timeout};

const THREAD: &str = "thread-1";

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn doc(id: &str, text: &str, created_at: i64) -> MessageDoc {
    MessageDoc {
        id: Some(id.to_string()),
        created_at: Some(RemoteTimestamp::Millis(created_at)),
        text: text.to_string(),
        from_user: Some(UserRef {
            id: "TEST_USER_ID_2".to_string(),
            display_name: "TEST_2".to_string(),
        }),
        system: false,
    }
}

fn cached(id: &str, text: &str, created_at: i64, origin: Origin) -> Message {
    Message {
        id: id.to_string(),
        thread_id: THREAD.to_string(),
        author: Some(Author::new("TEST_USER_ID_2", "TEST_2")),
        text: text.to_string(),
        created_at,
        origin,
        system: false,
    }
}

fn me() -> Author {
    Author::new("TEST_USER_ID_1", "TEST_1")
}

/// Wait until the merged sequence satisfies `pred`
async fn wait_for<F>(reconciler: &Reconciler, pred: F) -> Arc<MergedSequence>
where
    F: Fn(&MergedSequence) -> bool,
{
    let (current, mut rx) = reconciler.watch().await.unwrap();
    if pred(&*current) {
        return current;
    }

    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(ViewEvent::SequenceChanged { sequence }) if pred(&*sequence) => return sequence,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let sequence = reconciler.sequence().await.unwrap();
                    if pred(&*sequence) {
                        return sequence;
                    }
                }
                Err(e) => panic!("event channel closed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for sequence")
}

async fn wait_for_status<F>(reconciler: &Reconciler, pred: F) -> SyncStatus
where
    F: Fn(&SyncStatus) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let status = reconciler.status().await.unwrap();
            if pred(&status) {
                return status;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for status")
}

fn has(sequence: &MergedSequence, id: &str, origin: Origin) -> bool {
    sequence.get(id).map(|m| m.origin == origin).unwrap_or(false)
}

fn unique_ids(sequence: &MergedSequence) -> bool {
    let ids: HashSet<&str> = sequence.iter().map(|m| m.id.as_str()).collect();
    ids.len() == sequence.len()
}

async fn open(store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStream>) -> Reconciler {
    Reconciler::open(THREAD, store, remote, Config::default()).await
}

// ─── Test doubles ────────────────────────────────────────────────────────────

/// Cache whose individual operations can be made to fail
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_schema: bool,
    fail_load: bool,
    fail_write: bool,
    writes: AtomicUsize,
    closes: AtomicUsize,
}

#[async_trait]
impl LocalStore for FlakyStore {
    async fn ensure_schema(&self) -> Result<()> {
        if self.fail_schema {
            return Err(SyncError::StorageUnavailable("disk gone".to_string()));
        }
        self.inner.ensure_schema().await
    }

    async fn load_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        if self.fail_load {
            return Err(SyncError::StorageRead("corrupt".to_string()));
        }
        self.inner.load_messages(thread_id).await
    }

    async fn upsert_message(&self, thread_id: &str, message: &Message) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_write {
            return Err(SyncError::StorageWrite("disk full".to_string()));
        }
        self.inner.upsert_message(thread_id, message).await
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

/// Remote whose message writes block until released
struct GatedRemote {
    inner: MemoryRemote,
    gate: Semaphore,
}

impl GatedRemote {
    fn new(inner: MemoryRemote) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
        }
    }

    fn release_one(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl RemoteStream for GatedRemote {
    async fn subscribe(&self, thread_id: &str, sink: EventSink) -> Result<SubscriptionHandle> {
        self.inner.subscribe(thread_id, sink).await
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.inner.unsubscribe(handle).await
    }

    async fn add_message(&self, thread_id: &str, doc: MessageDoc) -> Result<String> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| SyncError::Transport("gate closed".to_string()))?;
        permit.forget();
        self.inner.add_message(thread_id, doc).await
    }

    async fn merge_latest_message(&self, thread_id: &str, latest: LatestMessage) -> Result<()> {
        self.inner.merge_latest_message(thread_id, latest).await
    }
}

/// Remote that acknowledges writes but only echoes them on demand
#[derive(Default)]
struct DeferredEchoRemote {
    sink: Mutex<Option<EventSink>>,
    written: Mutex<Vec<RemoteMessage>>,
}

impl DeferredEchoRemote {
    /// Deliver everything written so far as one batch
    async fn echo(&self) {
        let batch = self.written.lock().await.clone();
        if let Some(sink) = self.sink.lock().await.as_ref() {
            sink.on_event(batch);
        }
    }
}

#[async_trait]
impl RemoteStream for DeferredEchoRemote {
    async fn subscribe(&self, _thread_id: &str, sink: EventSink) -> Result<SubscriptionHandle> {
        sink.on_event(Vec::new());
        *self.sink.lock().await = Some(sink);
        Ok(SubscriptionHandle(1))
    }

    async fn unsubscribe(&self, _handle: SubscriptionHandle) -> Result<()> {
        self.sink.lock().await.take();
        Ok(())
    }

    async fn add_message(&self, _thread_id: &str, doc: MessageDoc) -> Result<String> {
        let mut written = self.written.lock().await;
        let key = format!("doc-{}", written.len() + 1);
        written.push(RemoteMessage::new(key.clone(), doc));
        Ok(key)
    }

    async fn merge_latest_message(&self, _thread_id: &str, _latest: LatestMessage) -> Result<()> {
        Ok(())
    }
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_empty_cache_remote_message() {
    let store = Arc::new(MemoryStore::new());
    let remote = MemoryRemote::new();
    let reconciler = open(store.clone(), Arc::new(remote.clone())).await;

    remote.inject(THREAD, doc("m1", "hi", 1000)).await;
    let sequence = wait_for(&reconciler, |s| s.len() == 1).await;

    assert_eq!(sequence.ids(), vec!["m1"]);
    let m1 = sequence.get("m1").unwrap();
    assert_eq!(m1.origin, Origin::Remote);
    assert_eq!(m1.text, "hi");
    assert_eq!(m1.author.as_ref().unwrap().display_name, "TEST_2");

    // Written back to the cache
    assert!(store.get(THREAD, "m1").await.is_some());
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_cached_message_redelivered_once() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_message(THREAD, &cached("m1", "hi", 1000, Origin::Remote))
        .await
        .unwrap();
    let remote = MemoryRemote::new();
    remote.inject(THREAD, doc("m1", "hi", 1000)).await;

    let reconciler = open(store.clone(), Arc::new(remote.clone())).await;
    let initial = reconciler.sequence().await.unwrap();
    assert_eq!(initial.ids(), vec!["m1"]);

    // Later message orders after every earlier batch
    remote.inject(THREAD, doc("m2", "later", 2000)).await;
    let sequence = wait_for(&reconciler, |s| s.get("m2").is_some()).await;

    assert_eq!(sequence.ids(), vec!["m2", "m1"]);
    assert_eq!(store.len().await, 2);
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_outgoing_is_pending_until_echo() {
    let memory = MemoryRemote::new();
    let remote = Arc::new(GatedRemote::new(memory.clone()));
    let store = Arc::new(MemoryStore::new());
    let reconciler = open(store.clone(), remote.clone()).await;

    let id = reconciler
        .append_outgoing(OutgoingDraft::new("yo", me()))
        .await
        .unwrap();
    assert!(id.starts_with("local-"));

    let pending = reconciler.sequence().await.unwrap();
    assert_eq!(pending.ids(), vec![id.as_str()]);
    assert_eq!(pending.get(&id).unwrap().origin, Origin::LocalPending);
    assert_eq!(
        store.get(THREAD, &id).await.unwrap().origin,
        Origin::LocalPending
    );

    remote.release_one();
    let confirmed = wait_for(&reconciler, |s| has(s, &id, Origin::Remote)).await;
    assert_eq!(confirmed.len(), 1);
    assert!(unique_ids(&confirmed));

    // Server kept the client id, one document only
    let docs = memory.messages(THREAD).await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].identifier(), id);

    // Preview is written right after the message document
    let latest = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(latest) = memory.thread(THREAD).await.and_then(|t| t.latest_message) {
                return latest;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("thread preview not updated");
    assert_eq!(latest.text, "yo");
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_acknowledged_send_confirmed_until_echo() {
    let remote = Arc::new(DeferredEchoRemote::default());
    let store = Arc::new(MemoryStore::new());
    let reconciler = open(store.clone(), remote.clone()).await;

    let id = reconciler.send("acked", me()).await.unwrap();
    let confirmed = wait_for(&reconciler, |s| has(s, &id, Origin::LocalConfirmed)).await;
    assert_eq!(confirmed.len(), 1);
    assert_eq!(
        store.get(THREAD, &id).await.unwrap().origin,
        Origin::LocalConfirmed
    );

    remote.echo().await;
    let echoed = wait_for(&reconciler, |s| has(s, &id, Origin::Remote)).await;
    assert_eq!(echoed.len(), 1);
    assert_eq!(echoed.get(&id).unwrap().text, "acked");
    assert_eq!(store.get(THREAD, &id).await.unwrap().origin, Origin::Remote);
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_error_mid_session_then_resume() {
    let remote = MemoryRemote::new();
    remote.inject(THREAD, doc("m1", "hi", 1000)).await;
    let reconciler = open(Arc::new(MemoryStore::new()), Arc::new(remote.clone())).await;
    let before = wait_for(&reconciler, |s| s.len() == 1).await;

    let mut events = reconciler.subscribe();
    remote.set_online(false).await;
    let status = wait_for_status(&reconciler, |s| s.is_degraded()).await;
    assert_eq!(
        status,
        SyncStatus::Degraded {
            reason: "connection lost".to_string()
        }
    );
    assert!(matches!(
        events.recv().await.unwrap(),
        ViewEvent::SyncDegraded { .. }
    ));
    assert_eq!(*reconciler.sequence().await.unwrap(), *before);

    // Written server-side while we were away
    remote.inject(THREAD, doc("m2", "missed", 1500)).await;
    remote.set_online(true).await;

    // Restoration is announced before the batch that caused it
    assert!(matches!(
        events.recv().await.unwrap(),
        ViewEvent::SyncRestored
    ));
    match events.recv().await.unwrap() {
        ViewEvent::SequenceChanged { sequence } => assert_eq!(sequence.ids(), vec!["m2", "m1"]),
        other => panic!("expected SequenceChanged, got {:?}", other),
    }
    assert_eq!(reconciler.status().await.unwrap(), SyncStatus::Live);
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_resubscribe_after_listener_cancelled() {
    let remote = MemoryRemote::new();
    remote.inject(THREAD, doc("m1", "hi", 1000)).await;
    let reconciler = open(Arc::new(MemoryStore::new()), Arc::new(remote.clone())).await;
    wait_for(&reconciler, |s| s.len() == 1).await;

    // Live feed: nothing to replace
    reconciler.resubscribe().await.unwrap();
    assert_eq!(remote.subscriber_count().await, 1);

    remote.cancel_listeners(THREAD, "listener cancelled").await;
    wait_for_status(&reconciler, |s| s.is_degraded()).await;
    assert_eq!(remote.subscriber_count().await, 0);

    // Not delivered: the listener is gone
    remote.inject(THREAD, doc("m2", "missed", 1500)).await;
    assert_eq!(reconciler.sequence().await.unwrap().len(), 1);

    let mut events = reconciler.subscribe();
    reconciler.resubscribe().await.unwrap();
    assert_eq!(remote.subscriber_count().await, 1);

    let after = wait_for(&reconciler, |s| s.len() == 2).await;
    assert_eq!(after.ids(), vec!["m2", "m1"]);
    wait_for_status(&reconciler, |s| *s == SyncStatus::Live).await;
    assert!(matches!(
        events.recv().await.unwrap(),
        ViewEvent::SyncRestored
    ));
    reconciler.close().await.unwrap();
}

// ─── Properties ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_redelivery_is_idempotent() {
    let remote = MemoryRemote::new();
    remote.inject(THREAD, doc("a", "one", 1000)).await;
    remote.inject(THREAD, doc("b", "two", 2000)).await;
    let reconciler = open(Arc::new(MemoryStore::new()), Arc::new(remote.clone())).await;
    let first = wait_for(&reconciler, |s| s.len() == 2).await;

    remote.redeliver(THREAD).await;
    remote.redeliver(THREAD).await;
    remote.inject(THREAD, doc("barrier", "", 0)).await;
    let later = wait_for(&reconciler, |s| s.get("barrier").is_some()).await;

    assert!(unique_ids(&later));
    assert_eq!(later.len(), 3);
    assert_eq!(&later.as_slice()[..2], first.as_slice());
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_sequence_order_newest_first_ties_by_id() {
    let remote = MemoryRemote::new();
    remote.inject(THREAD, doc("c", "", 1000)).await;
    remote.inject(THREAD, doc("a", "", 1000)).await;
    remote.inject(THREAD, doc("z", "", 3000)).await;
    remote.inject(THREAD, doc("b", "", 500)).await;

    let store = Arc::new(MemoryStore::new());
    store
        .upsert_message(THREAD, &cached("y", "", 2000, Origin::Remote))
        .await
        .unwrap();

    let reconciler = open(store, Arc::new(remote)).await;
    let sequence = wait_for(&reconciler, |s| s.len() == 5).await;
    assert_eq!(sequence.ids(), vec!["z", "y", "a", "c", "b"]);

    for pair in sequence.as_slice().windows(2) {
        assert!(
            pair[0].created_at > pair[1].created_at
                || (pair[0].created_at == pair[1].created_at && pair[0].id < pair[1].id)
        );
    }
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_local_copy_promoted_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_message(THREAD, &cached("x", "draft", 900, Origin::LocalConfirmed))
        .await
        .unwrap();
    let remote = MemoryRemote::new();
    let reconciler = open(store.clone(), Arc::new(remote.clone())).await;

    remote.inject(THREAD, doc("x", "draft", 1000)).await;
    let sequence = wait_for(&reconciler, |s| has(s, "x", Origin::Remote)).await;

    assert_eq!(sequence.len(), 1);
    assert_eq!(sequence.get("x").unwrap().created_at, 1000);
    assert_eq!(store.get(THREAD, "x").await.unwrap().origin, Origin::Remote);
    reconciler.close().await.unwrap();
}

// ─── Cache resilience ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_load_starts_empty() {
    let store = Arc::new(FlakyStore {
        fail_load: true,
        ..Default::default()
    });
    let remote = MemoryRemote::new();
    let reconciler = open(store.clone(), Arc::new(remote.clone())).await;

    let initial = reconciler.sequence().await.unwrap();
    assert!(initial.is_empty());

    // Cache writes still happen after a failed load
    remote.inject(THREAD, doc("m1", "hi", 1000)).await;
    wait_for(&reconciler, |s| s.len() == 1).await;
    assert_eq!(store.writes.load(Ordering::SeqCst), 1);

    reconciler.close().await.unwrap();
    assert_eq!(store.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unavailable_cache_is_bypassed() {
    let store = Arc::new(FlakyStore {
        fail_schema: true,
        ..Default::default()
    });
    let remote = MemoryRemote::new();
    let reconciler = open(store.clone(), Arc::new(remote.clone())).await;

    remote.inject(THREAD, doc("m1", "hi", 1000)).await;
    reconciler.send("yo", me()).await.unwrap();
    let sequence = wait_for(&reconciler, |s| s.len() == 2).await;
    assert!(unique_ids(&sequence));

    reconciler.close().await.unwrap();
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    assert_eq!(store.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cache_write_failure_does_not_block_merge() {
    let store = Arc::new(FlakyStore {
        fail_write: true,
        ..Default::default()
    });
    let remote = MemoryRemote::new();
    let reconciler = open(store.clone(), Arc::new(remote.clone())).await;

    remote.inject(THREAD, doc("m1", "hi", 1000)).await;
    let sequence = wait_for(&reconciler, |s| s.len() == 1).await;
    assert_eq!(sequence.ids(), vec!["m1"]);
    assert!(store.writes.load(Ordering::SeqCst) >= 1);
    reconciler.close().await.unwrap();
}

// ─── Send failures ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_send_then_retry() {
    let remote = MemoryRemote::new();
    let reconciler = open(Arc::new(MemoryStore::new()), Arc::new(remote.clone())).await;
    wait_for_status(&reconciler, |s| *s == SyncStatus::Live).await;

    remote.set_online(false).await;
    let mut events = reconciler.subscribe();
    let id = reconciler.send("offline hello", me()).await.unwrap();

    let failed = wait_for(&reconciler, |s| has(s, &id, Origin::LocalFailed)).await;
    assert_eq!(failed.len(), 1);

    let send_failed = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ViewEvent::SendFailed { message_id, .. }) = events.recv().await {
                return message_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(send_failed, id);

    remote.set_online(true).await;
    reconciler.retry(&id).await.unwrap();
    let delivered = wait_for(&reconciler, |s| has(s, &id, Origin::Remote)).await;
    assert_eq!(delivered.len(), 1);

    // Only failed messages can be retried
    assert!(matches!(
        reconciler.retry(&id).await,
        Err(SyncError::InvalidState(_))
    ));
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_explicit_draft_id_is_not_duplicated() {
    let remote = MemoryRemote::new();
    let reconciler = open(Arc::new(MemoryStore::new()), Arc::new(remote.clone())).await;

    let draft = OutgoingDraft::new("once", me())
        .with_id("client-1")
        .with_created_at(1234);
    assert_eq!(reconciler.append_outgoing(draft.clone()).await.unwrap(), "client-1");
    assert_eq!(reconciler.append_outgoing(draft).await.unwrap(), "client-1");

    let sequence = wait_for(&reconciler, |s| has(s, "client-1", Origin::Remote)).await;
    assert_eq!(sequence.len(), 1);
    assert_eq!(sequence.get("client-1").unwrap().created_at, 1234);
    assert_eq!(remote.messages(THREAD).await.len(), 1);
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_failure_and_resubscribe() {
    let remote = MemoryRemote::new();
    remote.inject(THREAD, doc("m1", "hi", 1000)).await;
    remote.set_online(false).await;

    let reconciler = open(Arc::new(MemoryStore::new()), Arc::new(remote.clone())).await;
    assert!(reconciler.status().await.unwrap().is_degraded());
    assert!(reconciler.sequence().await.unwrap().is_empty());
    assert!(matches!(
        reconciler.resubscribe().await,
        Err(SyncError::Transport(_))
    ));

    remote.set_online(true).await;
    reconciler.resubscribe().await.unwrap();
    wait_for(&reconciler, |s| s.len() == 1).await;
    wait_for_status(&reconciler, |s| *s == SyncStatus::Live).await;
    reconciler.close().await.unwrap();
}

// ─── Persistence & lifecycle ─────────────────────────────────────────────────

#[tokio::test]
async fn test_cache_survives_restart_offline() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = Arc::new(SledStore::new(temp_dir.path()));
        let remote = MemoryRemote::new();
        remote.inject(THREAD, doc("m1", "hi", 1000)).await;
        let reconciler = open(store, Arc::new(remote)).await;
        wait_for(&reconciler, |s| s.len() == 1).await;
        reconciler.close().await.unwrap();
    }

    // Fresh process, no connectivity
    let store = Arc::new(SledStore::new(temp_dir.path()));
    let remote = MemoryRemote::new();
    remote.set_online(false).await;
    let reconciler = open(store, Arc::new(remote)).await;

    let sequence = reconciler.sequence().await.unwrap();
    assert_eq!(sequence.ids(), vec!["m1"]);
    assert_eq!(sequence.get("m1").unwrap().text, "hi");
    assert!(reconciler.status().await.unwrap().is_degraded());
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_interrupted_send_restored_as_failed() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SledStore::new(temp_dir.path()));
    store.ensure_schema().await.unwrap();
    store
        .upsert_message(THREAD, &cached("local-1", "lost", 1000, Origin::LocalPending))
        .await
        .unwrap();
    store.close().await.unwrap();

    let remote = MemoryRemote::new();
    let reconciler = open(store, Arc::new(remote.clone())).await;
    let sequence = reconciler.sequence().await.unwrap();
    assert!(has(&sequence, "local-1", Origin::LocalFailed));

    reconciler.retry("local-1").await.unwrap();
    wait_for(&reconciler, |s| has(s, "local-1", Origin::Remote)).await;
    reconciler.close().await.unwrap();
}

#[tokio::test]
async fn test_threads_share_store_independently() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SledStore::new(temp_dir.path()));
    let remote = MemoryRemote::new();

    let first = Reconciler::open(
        "t1",
        store.clone(),
        Arc::new(remote.clone()),
        Config::default(),
    )
    .await;
    let second = Reconciler::open(
        "t2",
        store.clone(),
        Arc::new(remote.clone()),
        Config::default(),
    )
    .await;

    remote.inject("t1", doc("a", "for t1", 1000)).await;
    remote.inject("t2", doc("b", "for t2", 1000)).await;
    assert_eq!(wait_for(&first, |s| s.len() == 1).await.ids(), vec!["a"]);
    assert_eq!(wait_for(&second, |s| s.len() == 1).await.ids(), vec!["b"]);

    // Closing one thread leaves the shared cache open for the other
    first.close().await.unwrap();
    remote.inject("t2", doc("c", "more", 2000)).await;
    wait_for(&second, |s| s.len() == 2).await;
    assert_eq!(store.count("t2").await.unwrap(), 2);

    second.close().await.unwrap();
    assert!(matches!(
        store.count("t2").await,
        Err(SyncError::StorageUnavailable(_))
    ));
}

#[tokio::test]
async fn test_close_stops_delivery() {
    let remote = MemoryRemote::new();
    let reconciler = open(Arc::new(MemoryStore::new()), Arc::new(remote.clone())).await;
    assert_eq!(remote.subscriber_count().await, 1);

    reconciler.close().await.unwrap();
    assert_eq!(remote.subscriber_count().await, 0);

    // Nobody left to deliver to
    remote.inject(THREAD, doc("m1", "hi", 1000)).await;
}

#[tokio::test]
async fn test_drop_tears_down() {
    let remote = MemoryRemote::new();
    let store = Arc::new(FlakyStore::default());
    let reconciler = open(store.clone(), Arc::new(remote.clone())).await;
    drop(reconciler);

    // Unsubscribe runs before the cache is released
    timeout(Duration::from_secs(5), async {
        while store.closes.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cache not released");
    assert_eq!(remote.subscriber_count().await, 0);
}
