/// Remote document shapes and timestamp normalization
use crate::message::{Author, Message, Origin};
use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// `createdAt` as the remote database may hand it back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteTimestamp {
    /// Milliseconds since the epoch
    Millis(i64),
    /// Server timestamp object
    Seconds {
        seconds: i64,
        #[serde(default, alias = "nanos")]
        nanoseconds: i64,
    },
    /// RFC 3339, or a stringified millisecond count
    Text(String),
}

impl RemoteTimestamp {
    /// Canonical comparable form; None if the value cannot be read
    pub fn to_millis(&self) -> Option<i64> {
        match self {
            RemoteTimestamp::Millis(ms) => Some(*ms),
            RemoteTimestamp::Seconds {
                seconds,
                nanoseconds,
            } => seconds
                .checked_mul(1000)
                .and_then(|ms| ms.checked_add(nanoseconds / 1_000_000)),
            RemoteTimestamp::Text(raw) => {
                let raw = raw.trim();
                if let Ok(ms) = raw.parse::<i64>() {
                    return Some(ms);
                }
                DateTime::parse_from_rfc3339(raw)
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub id: String,
    pub display_name: String,
}

/// Message document in a thread's message collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDoc {
    /// Client-chosen id; survives the round trip so echoes can be matched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<RemoteTimestamp>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user: Option<UserRef>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub system: bool,
}

impl MessageDoc {
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: Some(message.id.clone()),
            created_at: Some(RemoteTimestamp::Millis(message.created_at)),
            text: message.text.clone(),
            from_user: message.author.as_ref().map(|a| UserRef {
                id: a.id.clone(),
                display_name: a.display_name.clone(),
            }),
            system: message.system,
        }
    }
}

/// A document delivered by a subscription, with its server key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub doc_id: String,
    pub doc: MessageDoc,
}

impl RemoteMessage {
    pub fn new(doc_id: impl Into<String>, doc: MessageDoc) -> Self {
        Self {
            doc_id: doc_id.into(),
            doc,
        }
    }

    /// The `id` field when present, otherwise the document key
    pub fn identifier(&self) -> &str {
        match self.doc.id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => &self.doc_id,
        }
    }

    /// Normalized timestamp, if the document carries a readable one
    pub fn created_at(&self) -> Option<i64> {
        self.doc.created_at.as_ref().and_then(|ts| ts.to_millis())
    }

    /// Convert into a `Remote` message; `fallback_created_at` fills a missing timestamp
    pub fn into_message(self, thread_id: &str, fallback_created_at: i64) -> Message {
        let id = self.identifier().to_string();
        let created_at = self.created_at().unwrap_or(fallback_created_at);
        let author = if self.doc.system {
            None
        } else {
            self.doc
                .from_user
                .map(|u| Author::new(u.id, u.display_name))
        };
        Message {
            id,
            thread_id: thread_id.to_string(),
            author,
            text: self.doc.text,
            created_at,
            origin: Origin::Remote,
            system: self.doc.system,
        }
    }
}
