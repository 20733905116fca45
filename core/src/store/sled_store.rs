/// Message cache stored in sled DB
///
/// One `messages` tree keyed by `thread_id 0x00 message_id`, so a thread is a
/// single prefix scan. Each `ensure_schema` acquires the database and each
/// `close` releases it; the last release flushes and drops the handle, which
/// lets several open threads share one store.
use super::LocalStore;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::message::{Author, Message, Origin};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

const DB_DIR: &str = "messages.db";
const MESSAGES_TREE: &str = "messages";
const META_TREE: &str = "meta";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const SCHEMA_VERSION: u8 = 1;

/// Stored row: `{createdAt, text, senderId, senderName}` plus flags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedRow {
    created_at: i64,
    text: String,
    sender_id: Option<String>,
    sender_name: Option<String>,
    #[serde(default)]
    system: bool,
    #[serde(default = "remote_origin")]
    origin: Origin,
}

fn remote_origin() -> Origin {
    Origin::Remote
}

impl CachedRow {
    fn from_message(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            text: message.text.clone(),
            sender_id: message.author.as_ref().map(|a| a.id.clone()),
            sender_name: message.author.as_ref().map(|a| a.display_name.clone()),
            system: message.system,
            origin: message.origin,
        }
    }

    fn into_message(self, thread_id: &str, id: String) -> Message {
        let author = match (self.sender_id, self.sender_name) {
            (Some(id), name) => Some(Author {
                id,
                display_name: name.unwrap_or_default(),
            }),
            (None, _) => None,
        };
        Message {
            id,
            thread_id: thread_id.to_string(),
            author,
            text: self.text,
            created_at: self.created_at,
            origin: self.origin,
            system: self.system,
        }
    }
}

fn thread_prefix(thread_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(thread_id.len() + 1);
    key.extend_from_slice(thread_id.as_bytes());
    key.push(0);
    key
}

fn row_key(thread_id: &str, message_id: &str) -> Vec<u8> {
    let mut key = thread_prefix(thread_id);
    key.extend_from_slice(message_id.as_bytes());
    key
}

struct OpenDb {
    db: sled::Db,
    messages: sled::Tree,
    users: usize,
}

pub struct SledStore {
    path: PathBuf,
    state: RwLock<Option<OpenDb>>,
}

impl SledStore {
    /// Create message store rooted at `data_dir`; nothing is opened until `ensure_schema`
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(DB_DIR),
            state: RwLock::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.data_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_db(&self) -> Result<OpenDb> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::StorageUnavailable(format!("Failed to create cache dir: {}", e))
            })?;
        }

        let db = sled::open(&self.path).map_err(|e| {
            SyncError::StorageUnavailable(format!("Failed to open messages DB: {}", e))
        })?;
        let messages = db.open_tree(MESSAGES_TREE).map_err(|e| {
            SyncError::StorageUnavailable(format!("Failed to open messages tree: {}", e))
        })?;
        let meta = db.open_tree(META_TREE).map_err(|e| {
            SyncError::StorageUnavailable(format!("Failed to open meta tree: {}", e))
        })?;

        match meta
            .get(SCHEMA_VERSION_KEY)
            .map_err(|e| SyncError::StorageUnavailable(format!("Failed to read schema: {}", e)))?
        {
            Some(version) if &version[..] == &[SCHEMA_VERSION][..] => {}
            Some(version) => {
                return Err(SyncError::StorageUnavailable(format!(
                    "Unsupported cache schema version: {:?}",
                    &version[..]
                )));
            }
            None => {
                meta.insert(SCHEMA_VERSION_KEY, vec![SCHEMA_VERSION])
                    .map_err(|e| {
                        SyncError::StorageUnavailable(format!("Failed to write schema: {}", e))
                    })?;
            }
        }

        Ok(OpenDb {
            db,
            messages,
            users: 0,
        })
    }

    async fn tree(&self) -> Result<sled::Tree> {
        let state = self.state.read().await;
        state
            .as_ref()
            .map(|open| open.messages.clone())
            .ok_or_else(|| SyncError::StorageUnavailable("message cache is not open".to_string()))
    }

    /// Number of cached messages for a thread
    pub async fn count(&self, thread_id: &str) -> Result<usize> {
        let tree = self.tree().await?;
        Ok(tree.scan_prefix(thread_prefix(thread_id)).count())
    }
}

#[async_trait]
impl LocalStore for SledStore {
    async fn ensure_schema(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.is_none() {
            *state = Some(self.open_db()?);
            info!("Message cache opened at {:?}", self.path);
        }
        if let Some(open) = state.as_mut() {
            open.users += 1;
        }
        Ok(())
    }

    async fn load_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        let tree = self.tree().await?;
        let prefix = thread_prefix(thread_id);

        let mut messages = Vec::new();
        for entry in tree.scan_prefix(&prefix) {
            let (key, value) = entry
                .map_err(|e| SyncError::StorageRead(format!("Failed to scan cache: {}", e)))?;
            let id = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| SyncError::StorageRead(format!("Corrupt message key: {}", e)))?;
            let row: CachedRow = serde_json::from_slice(&value)
                .map_err(|e| SyncError::StorageRead(format!("Corrupt row {}: {}", id, e)))?;
            messages.push(row.into_message(thread_id, id));
        }

        debug!("Loaded {} cached messages for {}", messages.len(), thread_id);
        Ok(messages)
    }

    async fn upsert_message(&self, thread_id: &str, message: &Message) -> Result<()> {
        let tree = self.tree().await?;
        let value = serde_json::to_vec(&CachedRow::from_message(message))
            .map_err(|e| SyncError::StorageWrite(format!("Failed to encode message: {}", e)))?;

        tree.insert(row_key(thread_id, &message.id), value)
            .map_err(|e| SyncError::StorageWrite(format!("Failed to save message: {}", e)))?;
        tree.flush_async()
            .await
            .map_err(|e| SyncError::StorageWrite(format!("Failed to flush cache: {}", e)))?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let last = match state.as_mut() {
            Some(open) => {
                open.users = open.users.saturating_sub(1);
                open.users == 0
            }
            None => return Ok(()),
        };

        if last {
            if let Some(open) = state.take() {
                open.db.flush_async().await.map_err(|e| {
                    SyncError::StorageWrite(format!("Failed to flush cache on close: {}", e))
                })?;
                info!("Message cache closed at {:?}", self.path);
            }
        }
        Ok(())
    }
}
