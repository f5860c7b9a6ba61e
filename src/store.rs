//! Message store shared by the serving layer and the background worker
//!
//! The worker never reads the live collection while processing: it takes a
//! [`MessageStore::snapshot`], which is always a copy.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::models::{validate_records, ChatType, Message, RawMessage};

pub trait MessageStore: Send + Sync {
    /// Append one message to a partition. Rejects a `message_id` that already
    /// exists for the same `chat_name`.
    fn append(&self, partition: ChatType, message: Message) -> Result<()>;

    /// Owned copy of the partition in insertion order
    fn snapshot(&self, partition: ChatType) -> Vec<Message>;

    /// Drop every message of the partition; returns how many were removed
    fn clear(&self, partition: ChatType) -> usize;
}

#[derive(Default)]
struct Partition {
    messages: Vec<Message>,
    // (chat_name, message_id)
    ids: HashSet<(String, String)>,
}

/// In-memory store guarded by a single `RwLock`
#[derive(Default)]
pub struct InMemoryMessageStore {
    partitions: RwLock<HashMap<ChatType, Partition>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a partition from a raw snapshot file written by the pipeline.
    /// A missing file is not an error; invalid records are skipped.
    /// Returns the number of messages loaded.
    pub fn rehydrate(&self, partition: ChatType, snapshot_path: &Path) -> Result<usize> {
        if !snapshot_path.exists() {
            tracing::info!(%partition, path = %snapshot_path.display(), "No message snapshot to rehydrate");
            return Ok(0);
        }

        let content = std::fs::read_to_string(snapshot_path)
            .map_err(|e| Error::io(snapshot_path, e))?;
        let records: Vec<RawMessage> = serde_json::from_str(&content)?;
        let messages = validate_records(&records);

        let mut loaded = 0;
        for msg in messages {
            match self.append(partition, msg) {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!(%partition, "Skipping snapshot record: {}", e),
            }
        }

        tracing::info!(%partition, loaded, "Rehydrated message store");
        Ok(loaded)
    }

    pub fn len(&self, partition: ChatType) -> usize {
        self.partitions
            .read()
            .map(|guard| guard.get(&partition).map(|p| p.messages.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, partition: ChatType) -> bool {
        self.len(partition) == 0
    }
}

impl MessageStore for InMemoryMessageStore {
    fn append(&self, partition: ChatType, message: Message) -> Result<()> {
        let mut guard = self
            .partitions
            .write()
            .map_err(|_| Error::Store("Failed to acquire store lock".to_string()))?;
        let slot = guard.entry(partition).or_default();

        let key = (message.chat_name.clone(), message.message_id.clone());
        if !slot.ids.insert(key) {
            return Err(Error::Store(format!(
                "Duplicate message_id '{}' in chat '{}'",
                message.message_id, message.chat_name
            )));
        }

        slot.messages.push(message);
        Ok(())
    }

    fn snapshot(&self, partition: ChatType) -> Vec<Message> {
        match self.partitions.read() {
            Ok(guard) => guard
                .get(&partition)
                .map(|p| p.messages.clone())
                .unwrap_or_default(),
            Err(_) => {
                tracing::error!(%partition, "Store lock poisoned, returning empty snapshot");
                Vec::new()
            }
        }
    }

    fn clear(&self, partition: ChatType) -> usize {
        match self.partitions.write() {
            Ok(mut guard) => guard.remove(&partition).map(|p| p.messages.len()).unwrap_or(0),
            Err(_) => {
                tracing::error!(%partition, "Store lock poisoned, nothing cleared");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sender;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn msg(chat: &str, id: &str) -> Message {
        Message::new(chat, id, None, "text", Sender::Human, Utc.timestamp_opt(0, 0).unwrap())
    }

    #[test]
    fn test_append_and_snapshot() {
        let store = InMemoryMessageStore::new();
        store.append(ChatType::ChatGpt, msg("a", "1")).unwrap();
        store.append(ChatType::ChatGpt, msg("a", "2")).unwrap();
        store.append(ChatType::Claude, msg("a", "1")).unwrap();

        assert_eq!(store.snapshot(ChatType::ChatGpt).len(), 2);
        assert_eq!(store.snapshot(ChatType::Claude).len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected_per_chat() {
        let store = InMemoryMessageStore::new();
        store.append(ChatType::ChatGpt, msg("a", "1")).unwrap();
        assert!(store.append(ChatType::ChatGpt, msg("a", "1")).is_err());
        // Same id in a different chat is fine
        store.append(ChatType::ChatGpt, msg("b", "1")).unwrap();
        assert_eq!(store.len(ChatType::ChatGpt), 2);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = InMemoryMessageStore::new();
        store.append(ChatType::ChatGpt, msg("a", "1")).unwrap();
        let snap = store.snapshot(ChatType::ChatGpt);
        store.append(ChatType::ChatGpt, msg("a", "2")).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(store.snapshot(ChatType::ChatGpt).len(), 2);
    }

    #[test]
    fn test_clear_partition() {
        let store = InMemoryMessageStore::new();
        store.append(ChatType::ChatGpt, msg("a", "1")).unwrap();
        store.append(ChatType::Claude, msg("a", "1")).unwrap();
        assert_eq!(store.clear(ChatType::ChatGpt), 1);
        assert!(store.is_empty(ChatType::ChatGpt));
        assert_eq!(store.len(ChatType::Claude), 1);
        // Cleared ids can be reused
        store.append(ChatType::ChatGpt, msg("a", "1")).unwrap();
    }

    #[test]
    fn test_rehydrate_from_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chatgpt_messages.json");
        let records: Vec<RawMessage> = vec![
            RawMessage::from(&msg("a", "1")),
            RawMessage::from(&msg("a", "2")),
            RawMessage { chat_name: Some("a".into()), ..Default::default() },
        ];
        std::fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();

        let store = InMemoryMessageStore::new();
        assert_eq!(store.rehydrate(ChatType::ChatGpt, &path).unwrap(), 2);
        assert_eq!(store.rehydrate(ChatType::Claude, &dir.path().join("missing.json")).unwrap(), 0);
    }
}
