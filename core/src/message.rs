/// Chat message model shared by the cache, the remote feed and the view
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, the canonical comparable timestamp
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message author as shown in the chat view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub display_name: String,
}

impl Author {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Where the current copy of a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Composed locally, remote write in flight
    LocalPending,
    /// Remote write acknowledged, server echo not seen yet
    LocalConfirmed,
    /// Remote write failed; waiting for a caller-level retry
    LocalFailed,
    /// Delivered by the remote feed
    Remote,
}

impl Origin {
    pub fn is_local(&self) -> bool {
        !matches!(self, Origin::Remote)
    }
}

/// One chat message within a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    /// None for system messages ("chat created")
    pub author: Option<Author>,
    pub text: String,
    pub created_at: i64,
    pub origin: Origin,
    #[serde(default)]
    pub system: bool,
}

impl Message {
    /// Display fields match (origin is ignored)
    pub fn same_content(&self, other: &Message) -> bool {
        self.author == other.author
            && self.text == other.text
            && self.created_at == other.created_at
            && self.system == other.system
    }

    /// Thread preview for this message
    pub fn preview(&self) -> LatestMessage {
        LatestMessage {
            text: self.text.clone(),
            created_at: self.created_at,
        }
    }
}

/// A message composed in the chat view, before it enters the sequence
#[derive(Debug, Clone)]
pub struct OutgoingDraft {
    /// Client-chosen id; generated when absent
    pub id: Option<String>,
    pub text: String,
    pub author: Author,
    pub created_at: Option<i64>,
}

impl OutgoingDraft {
    pub fn new(text: impl Into<String>, author: Author) -> Self {
        Self {
            id: None,
            text: text.into(),
            author,
            created_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Denormalized latest-message summary kept on the thread document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMessage {
    pub text: String,
    pub created_at: i64,
}

/// Thread document as seen by list screens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub latest_message: Option<LatestMessage>,
}
