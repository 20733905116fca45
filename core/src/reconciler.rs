/// Per-thread reconciler
///
/// Merges the local cache, the remote feed and locally composed messages into
/// one ordered, deduplicated sequence. All state lives in a single task; every
/// mutation (remote batch, send, send completion, query) is a message on its
/// queue, so merges never interleave.
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::message::{now_millis, Author, Message, Origin, OutgoingDraft};
use crate::remote::{EventSink, RemoteEvent, RemoteMessage, RemoteStream, SubscriptionHandle};
use crate::sequence::{MergedSequence, MessageIndex};
use crate::store::LocalStore;
use crate::view::{SyncStatus, ViewEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ─── Queue ───────────────────────────────────────────────────────────────────

type Watch = (Arc<MergedSequence>, broadcast::Receiver<ViewEvent>);

enum Command {
    Snapshot {
        reply: oneshot::Sender<Arc<MergedSequence>>,
    },
    Watch {
        reply: oneshot::Sender<Watch>,
    },
    Status {
        reply: oneshot::Sender<SyncStatus>,
    },
    Append {
        draft: OutgoingDraft,
        reply: oneshot::Sender<String>,
    },
    Retry {
        message_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Resubscribe {
        reply: oneshot::Sender<Result<()>>,
    },
    SendCompleted {
        message_id: String,
        result: Result<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Effect of one remote copy on the sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeOutcome {
    Inserted,
    /// A local copy was superseded by the server's
    Promoted,
    /// Last-write-wins update of an already remote message
    Replaced,
    Redelivered,
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Owner handle for one open thread.
///
/// Dropping it tears the thread down like `close`, without waiting.
pub struct Reconciler {
    thread_id: String,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ViewEvent>,
    task: JoinHandle<()>,
}

impl Reconciler {
    /// Load the cache, subscribe to the remote feed and start the thread's task.
    ///
    /// Never fails: an unusable cache means running without one, a failed
    /// subscription means starting degraded.
    pub async fn open(
        thread_id: impl Into<String>,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStream>,
        config: Config,
    ) -> Self {
        let thread_id = thread_id.into();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (sink, remote_rx) = EventSink::channel();

        let mut state = ThreadState {
            thread_id: thread_id.clone(),
            config,
            store,
            remote,
            cache_enabled: false,
            index: MessageIndex::new(),
            snapshot: Arc::new(MergedSequence::default()),
            status: SyncStatus::Live,
            subscription: None,
            sink,
            events: events.clone(),
            commands: commands.downgrade(),
        };
        state.load_cache().await;
        state.subscribe().await;

        info!(
            "Opened thread {} ({} cached, {:?})",
            thread_id,
            state.index.len(),
            state.status
        );
        let task = tokio::spawn(state.run(command_rx, remote_rx));

        Self {
            thread_id,
            commands,
            events,
            task,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Current merged sequence (the view's initial state)
    pub async fn sequence(&self) -> Result<Arc<MergedSequence>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Change events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }

    /// Current sequence plus a receiver that sees every change after it
    pub async fn watch(&self) -> Result<(Arc<MergedSequence>, broadcast::Receiver<ViewEvent>)> {
        self.request(|reply| Command::Watch { reply }).await
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Optimistically add an outgoing message and start its remote write.
    /// Returns the message id.
    pub async fn append_outgoing(&self, draft: OutgoingDraft) -> Result<String> {
        self.request(|reply| Command::Append { draft, reply }).await
    }

    pub async fn send(&self, text: impl Into<String>, author: Author) -> Result<String> {
        self.append_outgoing(OutgoingDraft::new(text, author)).await
    }

    /// Re-send a message whose remote write failed
    pub async fn retry(&self, message_id: &str) -> Result<()> {
        let message_id = message_id.to_string();
        self.request(|reply| Command::Retry { message_id, reply }).await?
    }

    /// Replace a subscription that failed to open or reported an error.
    /// A no-op while the feed is live.
    pub async fn resubscribe(&self) -> Result<()> {
        self.request(|reply| Command::Resubscribe { reply }).await?
    }

    /// Unsubscribe and release the cache, then stop the task
    pub async fn close(self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        drop(self.commands);
        self.task.await.map_err(|_| SyncError::Closed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}

// ─── Task state ──────────────────────────────────────────────────────────────

struct ThreadState {
    thread_id: String,
    config: Config,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStream>,
    /// False when the cache could not be opened; no store calls are made then
    cache_enabled: bool,
    index: MessageIndex,
    snapshot: Arc<MergedSequence>,
    status: SyncStatus,
    subscription: Option<SubscriptionHandle>,
    sink: EventSink,
    events: broadcast::Sender<ViewEvent>,
    /// Weak so that dropping the handle closes the queue
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl ThreadState {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut remote_events: mpsc::UnboundedReceiver<RemoteEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            return;
                        }
                    }
                    None => {
                        debug!("Handle for {} dropped", self.thread_id);
                        self.teardown().await;
                        return;
                    }
                },
                Some(event) = remote_events.recv() => match event {
                    RemoteEvent::Batch(batch) => self.merge_batch(batch).await,
                    RemoteEvent::Error(reason) => self.degrade(reason),
                },
            }
        }
    }

    /// Returns false once the task should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot.clone());
            }
            Command::Watch { reply } => {
                let _ = reply.send((self.snapshot.clone(), self.events.subscribe()));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status.clone());
            }
            Command::Append { draft, reply } => {
                let id = self.append_outgoing(draft).await;
                let _ = reply.send(id);
            }
            Command::Retry { message_id, reply } => {
                let result = self.retry(&message_id).await;
                let _ = reply.send(result);
            }
            Command::Resubscribe { reply } => {
                let result = self.resubscribe().await;
                let _ = reply.send(result);
            }
            Command::SendCompleted { message_id, result } => {
                self.send_completed(&message_id, result).await;
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // -- startup -------------------------------------------------------------

    async fn load_cache(&mut self) {
        if let Err(e) = self.store.ensure_schema().await {
            warn!("Cache unavailable for {}, continuing without it: {}", self.thread_id, e);
            return;
        }
        self.cache_enabled = true;

        let cached = match self.store.load_messages(&self.thread_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Failed to load cache for {}, starting empty: {}", self.thread_id, e);
                return;
            }
        };

        for mut message in cached {
            message.thread_id = self.thread_id.clone();
            // The send was cut off by a restart
            if message.origin == Origin::LocalPending && self.config.restore_pending_as_failed {
                message.origin = Origin::LocalFailed;
            }
            self.index.replace(message);
        }
        self.snapshot = Arc::new(self.index.snapshot());
    }

    async fn subscribe(&mut self) {
        match self.remote.subscribe(&self.thread_id, self.sink.clone()).await {
            Ok(handle) => self.subscription = Some(handle),
            Err(e) => {
                warn!("Failed to subscribe to {}: {}", self.thread_id, e);
                self.status = SyncStatus::Degraded {
                    reason: e.to_string(),
                };
            }
        }
    }

    async fn resubscribe(&mut self) -> Result<()> {
        if self.subscription.is_some() && !self.status.is_degraded() {
            return Ok(());
        }
        // A listener that reported an error may never deliver again
        if let Some(stale) = self.subscription.take() {
            if let Err(e) = self.remote.unsubscribe(stale).await {
                warn!("Failed to drop stale subscription for {}: {}", self.thread_id, e);
            }
        }
        let handle = self
            .remote
            .subscribe(&self.thread_id, self.sink.clone())
            .await?;
        info!("Resubscribed to {}", self.thread_id);
        self.subscription = Some(handle);
        Ok(())
    }

    // -- remote feed ---------------------------------------------------------

    async fn merge_batch(&mut self, batch: Vec<RemoteMessage>) {
        let received_at = now_millis();
        let mut changed = false;

        for remote in batch {
            // A redelivered copy without a timestamp keeps the one already shown
            let fallback = self
                .index
                .get(remote.identifier())
                .map(|m| m.created_at)
                .unwrap_or(received_at);
            let incoming = remote.into_message(&self.thread_id, fallback);

            if self.merge_remote(incoming.clone()) != MergeOutcome::Redelivered {
                changed = true;
                self.persist(&incoming).await;
            }
        }

        if self.status.is_degraded() {
            info!("Sync restored for {}", self.thread_id);
            self.status = SyncStatus::Live;
            self.emit(ViewEvent::SyncRestored);
        }
        if changed {
            self.publish();
        }
    }

    fn merge_remote(&mut self, incoming: Message) -> MergeOutcome {
        let outcome = match self.index.get(&incoming.id) {
            None => MergeOutcome::Inserted,
            Some(existing) if existing.origin.is_local() => MergeOutcome::Promoted,
            Some(existing) if existing.same_content(&incoming) => MergeOutcome::Redelivered,
            Some(_) => MergeOutcome::Replaced,
        };

        let id = incoming.id.clone();
        match outcome {
            MergeOutcome::Redelivered => return outcome,
            MergeOutcome::Inserted => {
                if let Err(e) = self.index.insert(incoming) {
                    debug!("Skipping {} as redelivery: {}", id, e);
                    return MergeOutcome::Redelivered;
                }
            }
            MergeOutcome::Promoted | MergeOutcome::Replaced => {
                self.index.replace(incoming);
            }
        }

        debug!("{:?} {} in {}", outcome, id, self.thread_id);
        outcome
    }

    fn degrade(&mut self, reason: String) {
        warn!("Sync degraded for {}: {}", self.thread_id, reason);
        self.status = SyncStatus::Degraded {
            reason: reason.clone(),
        };
        self.emit(ViewEvent::SyncDegraded { reason });
    }

    // -- send path -----------------------------------------------------------

    async fn append_outgoing(&mut self, draft: OutgoingDraft) -> String {
        let id = match draft.id {
            Some(id) if !id.is_empty() => id,
            _ => format!("{}{}", self.config.local_id_prefix, Uuid::new_v4().simple()),
        };

        let message = Message {
            id: id.clone(),
            thread_id: self.thread_id.clone(),
            author: Some(draft.author),
            text: draft.text,
            created_at: draft.created_at.unwrap_or_else(now_millis),
            origin: Origin::LocalPending,
            system: false,
        };

        if let Err(e) = self.index.insert(message.clone()) {
            debug!("Ignoring draft: {}", e);
            return id;
        }
        self.publish();
        self.persist(&message).await;
        self.dispatch_send(message);
        id
    }

    /// Remote write runs off the queue; its completion is queued back
    fn dispatch_send(&self, message: Message) {
        let remote = self.remote.clone();
        let thread_id = self.thread_id.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let result = remote.send_message(&thread_id, &message).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::SendCompleted {
                    message_id: message.id,
                    result,
                });
            }
        });
    }

    async fn send_completed(&mut self, message_id: &str, result: Result<()>) {
        let origin = match self.index.get(message_id) {
            Some(message) => message.origin,
            None => return,
        };
        // Anything but pending has already been settled by the echo
        if origin != Origin::LocalPending {
            debug!("Send of {} settled as {:?}", message_id, origin);
            return;
        }

        match result {
            Ok(()) => self.update_origin(message_id, Origin::LocalConfirmed).await,
            Err(e) => {
                warn!("Send of {} in {} failed: {}", message_id, self.thread_id, e);
                self.update_origin(message_id, Origin::LocalFailed).await;
                self.emit(ViewEvent::SendFailed {
                    message_id: message_id.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn retry(&mut self, message_id: &str) -> Result<()> {
        let origin = self
            .index
            .get(message_id)
            .map(|m| m.origin)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;
        if origin != Origin::LocalFailed {
            return Err(SyncError::InvalidState(format!(
                "{} is {:?}; only failed messages can be retried",
                message_id, origin
            )));
        }

        self.update_origin(message_id, Origin::LocalPending).await;
        if let Some(message) = self.index.get(message_id).cloned() {
            info!("Retrying send of {} in {}", message_id, self.thread_id);
            self.dispatch_send(message);
        }
        Ok(())
    }

    // -- shared helpers ------------------------------------------------------

    async fn update_origin(&mut self, message_id: &str, origin: Origin) {
        let updated = match self.index.set_origin(message_id, origin) {
            Some(message) => message.clone(),
            None => return,
        };
        self.persist(&updated).await;
        self.publish();
    }

    /// Best-effort cache write; failure never blocks the merge
    async fn persist(&self, message: &Message) {
        if !self.cache_enabled {
            return;
        }
        if let Err(e) = self.store.upsert_message(&self.thread_id, message).await {
            warn!("Cache write failed for {} in {}: {}", message.id, self.thread_id, e);
        }
    }

    fn publish(&mut self) {
        self.snapshot = Arc::new(self.index.snapshot());
        self.emit(ViewEvent::SequenceChanged {
            sequence: self.snapshot.clone(),
        });
    }

    fn emit(&self, event: ViewEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    async fn teardown(&mut self) {
        if let Some(handle) = self.subscription.take() {
            if let Err(e) = self.remote.unsubscribe(handle).await {
                warn!("Failed to unsubscribe from {}: {}", self.thread_id, e);
            }
        }
        if self.cache_enabled {
            self.cache_enabled = false;
            if let Err(e) = self.store.close().await {
                warn!("Failed to close cache for {}: {}", self.thread_id, e);
            }
        }
        info!("Closed thread {}", self.thread_id);
    }
}
