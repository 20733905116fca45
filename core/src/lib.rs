/// chatsync - local-first message synchronization cache
///
/// Keeps a chat thread's messages consistent across a durable local cache, a
/// remote real-time feed and optimistic local sends, with id-based dedup and
/// newest-first ordering.
pub mod config;
pub mod error;
pub mod message;
pub mod reconciler;
pub mod remote;
pub mod sequence;
pub mod store;
pub mod view;

pub use config::Config;
pub use error::{Result, SyncError};
pub use message::{Author, LatestMessage, Message, Origin, OutgoingDraft, Thread};
pub use reconciler::Reconciler;
pub use remote::{EventSink, MemoryRemote, RemoteStream};
pub use sequence::MergedSequence;
pub use store::{LocalStore, MemoryStore, SledStore};
pub use view::{SyncStatus, ViewEvent};
