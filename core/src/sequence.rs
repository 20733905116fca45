/// Ordered, id-indexed message container behind the merged view
use crate::error::{Result, SyncError};
use crate::message::{Message, Origin};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

/// Newest first, ties by id ascending
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    created_at: Reverse<i64>,
    id: String,
}

impl SortKey {
    fn of(message: &Message) -> Self {
        Self {
            created_at: Reverse(message.created_at),
            id: message.id.clone(),
        }
    }
}

/// Messages of one thread kept in display order, with O(1) id membership
#[derive(Debug, Default)]
pub struct MessageIndex {
    ordered: BTreeMap<SortKey, Message>,
    positions: HashMap<String, SortKey>,
}

impl MessageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.positions.get(id).and_then(|key| self.ordered.get(key))
    }

    /// Insert a message whose id is not present yet
    pub fn insert(&mut self, message: Message) -> Result<()> {
        if self.contains(&message.id) {
            return Err(SyncError::DuplicateIdentifier(message.id));
        }
        let key = SortKey::of(&message);
        self.positions.insert(message.id.clone(), key.clone());
        self.ordered.insert(key, message);
        Ok(())
    }

    /// Insert or replace by id; the position follows the new timestamp.
    /// Returns the previous copy.
    pub fn replace(&mut self, message: Message) -> Option<Message> {
        let previous = self
            .positions
            .remove(&message.id)
            .and_then(|key| self.ordered.remove(&key));
        let key = SortKey::of(&message);
        self.positions.insert(message.id.clone(), key.clone());
        self.ordered.insert(key, message);
        previous
    }

    /// Change the origin in place (position is unaffected)
    pub fn set_origin(&mut self, id: &str, origin: Origin) -> Option<&Message> {
        let key = self.positions.get(id)?;
        let message = self.ordered.get_mut(key)?;
        message.origin = origin;
        Some(message)
    }

    pub fn snapshot(&self) -> MergedSequence {
        MergedSequence {
            messages: self.ordered.values().cloned().collect(),
        }
    }
}

/// Immutable ordered view handed to the chat view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergedSequence {
    messages: Vec<Message>,
}

impl MergedSequence {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Newest message, if any
    pub fn latest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.id.as_str()).collect()
    }
}

impl<'a> IntoIterator for &'a MergedSequence {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
