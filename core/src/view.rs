/// Types published from a reconciler to the chat view
use crate::sequence::MergedSequence;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sync health of one open thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Remote subscription is delivering
    Live,
    /// Subscription failed; the displayed sequence is still valid
    Degraded { reason: String },
}

impl SyncStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SyncStatus::Degraded { .. })
    }
}

/// Real-time events for the chat view, in the order the reconciler produced them
#[derive(Debug, Clone)]
pub enum ViewEvent {
    /// The merged sequence changed; carries the full new sequence
    SequenceChanged { sequence: Arc<MergedSequence> },
    /// The remote subscription reported an error
    SyncDegraded { reason: String },
    /// A batch arrived after a degraded period
    SyncRestored,
    /// An outgoing message could not be written remotely; the view may offer retry
    SendFailed { message_id: String, reason: String },
}
