//! Persistent Queue Store
//!
//! Durable snapshot of the scheduler's pending and active work. The scheduler
//! only ever talks to a [`QueueStore`]; the storage strategy behind it is
//! injected at construction time.
//!
//! Neither operation fails outward: a failed save is logged and the scheduler
//! keeps running, and an unreadable snapshot loads as an empty queue.

use crate::db::{Database, QUEUE_SNAPSHOT_KEY};
use crate::types::QueueItem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Serialized form of the scheduler state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedQueue {
    /// Pending items in dispatch order
    #[serde(default)]
    pub items: Vec<QueueItem>,
    /// Ids of items that were active when the snapshot was taken
    #[serde(default)]
    pub active_download_ids: Vec<String>,
    /// Full records of the active items, used to restore interrupted work
    #[serde(default)]
    pub active_items: Vec<QueueItem>,
    /// Whether dispatch was paused
    #[serde(default)]
    pub is_paused: bool,
    /// Epoch milliseconds of the snapshot
    #[serde(default)]
    pub last_processed: i64,
}

impl PersistedQueue {
    /// Decode a snapshot, keeping whatever parts are readable
    ///
    /// Malformed items are skipped one by one; a document that is not a JSON
    /// object at all decodes to the empty queue.
    pub fn decode(raw: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Queue snapshot is not valid JSON, starting empty");
                return Self::default();
            }
        };

        let Some(obj) = value.as_object() else {
            tracing::warn!("Queue snapshot is not an object, starting empty");
            return Self::default();
        };

        Self {
            items: decode_items(obj.get("items"), "items"),
            active_download_ids: obj
                .get("activeDownloadIds")
                .and_then(|v| v.as_array())
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| id.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            active_items: decode_items(obj.get("activeItems"), "activeItems"),
            is_paused: obj
                .get("isPaused")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            last_processed: obj
                .get("lastProcessed")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
        }
    }

    /// Whether the snapshot holds no work
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.active_items.is_empty() && self.active_download_ids.is_empty()
    }
}

fn decode_items(value: Option<&serde_json::Value>, field: &str) -> Vec<QueueItem> {
    let Some(array) = value.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    array
        .iter()
        .enumerate()
        .filter_map(|(position, raw)| {
            match serde_json::from_value::<QueueItem>(raw.clone()) {
                Ok(item) => Some(item),
                Err(e) => {
                    tracing::warn!(
                        field,
                        position,
                        error = %e,
                        "Skipping unreadable queue item in snapshot"
                    );
                    None
                }
            }
        })
        .collect()
}

/// Durable home of the queue snapshot
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist the snapshot; failures are logged, never returned
    async fn save(&self, queue: &PersistedQueue);

    /// Load the last snapshot, or the empty queue if none is readable
    async fn load(&self) -> PersistedQueue;
}

/// Queue store backed by the SQLite key-value table
pub struct SqliteQueueStore {
    db: Arc<Database>,
}

impl SqliteQueueStore {
    /// Create a store over an open database
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn save(&self, queue: &PersistedQueue) {
        let json = match serde_json::to_string(queue) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize queue snapshot");
                return;
            }
        };

        if let Err(e) = self.db.set_value(QUEUE_SNAPSHOT_KEY, &json).await {
            tracing::error!(error = %e, "Failed to persist queue snapshot");
        }
    }

    async fn load(&self) -> PersistedQueue {
        match self.db.get_value(QUEUE_SNAPSHOT_KEY).await {
            Ok(Some(raw)) => PersistedQueue::decode(&raw),
            Ok(None) => PersistedQueue::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read queue snapshot, starting empty");
                PersistedQueue::default()
            }
        }
    }
}

/// In-memory queue store for tests and hosts without durable storage
#[derive(Default)]
pub struct MemoryQueueStore {
    raw: Mutex<Option<String>>,
}

impl MemoryQueueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with a raw snapshot document
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: Mutex::new(Some(raw.into())),
        }
    }

    /// The last saved document, if any
    pub async fn raw(&self) -> Option<String> {
        self.raw.lock().await.clone()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn save(&self, queue: &PersistedQueue) {
        match serde_json::to_string(queue) {
            Ok(json) => *self.raw.lock().await = Some(json),
            Err(e) => tracing::error!(error = %e, "Failed to serialize queue snapshot"),
        }
    }

    async fn load(&self) -> PersistedQueue {
        match self.raw.lock().await.as_deref() {
            Some(raw) => PersistedQueue::decode(raw),
            None => PersistedQueue::default(),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample() -> PersistedQueue {
        PersistedQueue {
            items: vec![
                QueueItem::new("m", "1", "https://x.test/1", "One", 2),
                QueueItem::new("m", "2", "https://x.test/2", "Two", 1),
            ],
            active_download_ids: vec!["m_3".into()],
            active_items: vec![QueueItem::new("m", "3", "https://x.test/3", "Three", 1)],
            is_paused: true,
            last_processed: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
            SqliteQueueStore::new(db.clone()).save(&sample()).await;
            db.close().await;
        }

        let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
        let loaded = SqliteQueueStore::new(db.clone()).load().await;
        assert_eq!(loaded, sample());
        db.close().await;
    }

    #[tokio::test]
    async fn sqlite_store_loads_empty_when_nothing_saved() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
        assert!(SqliteQueueStore::new(db).load().await.is_empty());
    }

    #[tokio::test]
    async fn save_after_close_does_not_panic() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
        let store = SqliteQueueStore::new(db.clone());
        db.close().await;

        store.save(&sample()).await;
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn truncated_document_loads_as_empty() {
        let store = MemoryQueueStore::with_raw(r#"{"items":[{"id":"m_1","#);
        let loaded = store.load().await;
        assert_eq!(loaded, PersistedQueue::default());
    }

    #[test]
    fn non_object_document_loads_as_empty() {
        assert_eq!(PersistedQueue::decode("[1,2,3]"), PersistedQueue::default());
        assert_eq!(PersistedQueue::decode("null"), PersistedQueue::default());
    }

    #[test]
    fn malformed_items_are_skipped_individually() {
        let raw = r#"{
            "items": [
                {"id":"m_1","ownerId":"m","unitKey":"1","sourceUrl":"https://x.test/1","priority":1},
                {"id":42},
                "garbage",
                {"id":"m_2","ownerId":"m","unitKey":"2","sourceUrl":"https://x.test/2"}
            ],
            "isPaused": "yes"
        }"#;

        let loaded = PersistedQueue::decode(raw);
        let ids: Vec<_> = loaded.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["m_1", "m_2"]);
        // wrong type falls back to the safe default
        assert!(!loaded.is_paused);
        assert!(loaded.active_items.is_empty());
    }

    #[test]
    fn legacy_snapshot_without_active_items_is_accepted() {
        let raw = r#"{"items":[],"activeDownloadIds":["m_9"],"isPaused":false,"lastProcessed":5}"#;
        let loaded = PersistedQueue::decode(raw);
        assert_eq!(loaded.active_download_ids, vec!["m_9".to_string()]);
        assert!(loaded.active_items.is_empty());
        assert_eq!(loaded.last_processed, 5);
    }
}
