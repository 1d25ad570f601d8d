//! Core types for chapter-dl

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// Unique identifier of a queue item
///
/// Derived deterministically from the owner (title) id and unit (chapter) key,
/// so the same chapter can never be queued twice.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Id of a whole-unit download: `"{owner}_{unit}"`
    pub fn for_unit(owner_id: &str, unit_key: &str) -> Self {
        Self(format!("{}_{}", owner_id, unit_key))
    }

    /// Id of a single-piece repair download: `"{owner}_{unit}_p{index}"`
    pub fn for_piece(owner_id: &str, unit_key: &str, index: u32) -> Self {
        Self(format!("{}_{}_p{}", owner_id, unit_key, index))
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What a queue item downloads
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ItemScope {
    /// The whole chapter: resolve its page list and fetch every piece
    #[default]
    Unit,
    /// One piece of an already-downloaded chapter (repair)
    Piece {
        /// Piece index within the unit
        index: u32,
        /// File name of the piece inside the unit directory
        #[serde(rename = "fileName")]
        file_name: String,
    },
}

/// One requested download
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Unique id derived from owner and unit (see [`ItemId`])
    pub id: ItemId,
    /// Owner (title) id
    pub owner_id: String,
    /// Unit (chapter) key, e.g. the chapter number
    pub unit_key: String,
    /// Resolved source reference
    pub source_url: String,
    /// Human-readable name
    #[serde(default)]
    pub display_name: String,
    /// Higher values are dispatched sooner
    #[serde(default)]
    pub priority: i32,
    /// Admission stamp in epoch milliseconds, assigned by the scheduler
    #[serde(default)]
    pub enqueued_at: i64,
    /// Automatic retries already consumed
    #[serde(default)]
    pub retry_count: u32,
    /// Whole unit or single piece
    #[serde(default)]
    pub scope: ItemScope,
}

impl QueueItem {
    /// Create a whole-unit download request
    pub fn new(
        owner_id: impl Into<String>,
        unit_key: impl Into<String>,
        source_url: impl Into<String>,
        display_name: impl Into<String>,
        priority: i32,
    ) -> Self {
        let owner_id = owner_id.into();
        let unit_key = unit_key.into();
        Self {
            id: ItemId::for_unit(&owner_id, &unit_key),
            owner_id,
            unit_key,
            source_url: source_url.into(),
            display_name: display_name.into(),
            priority,
            enqueued_at: 0,
            retry_count: 0,
            scope: ItemScope::Unit,
        }
    }

    /// Create a single-piece re-download request for repair
    pub fn piece(
        owner_id: impl Into<String>,
        unit_key: impl Into<String>,
        index: u32,
        file_name: impl Into<String>,
        source_url: impl Into<String>,
        priority: i32,
    ) -> Self {
        let owner_id = owner_id.into();
        let unit_key = unit_key.into();
        Self {
            id: ItemId::for_piece(&owner_id, &unit_key, index),
            display_name: format!("{} / {} piece {}", owner_id, unit_key, index),
            owner_id,
            unit_key,
            source_url: source_url.into(),
            priority,
            enqueued_at: 0,
            retry_count: 0,
            scope: ItemScope::Piece {
                index,
                file_name: file_name.into(),
            },
        }
    }

    /// Whether this item belongs to the given owner and unit
    pub fn matches(&self, owner_id: &str, unit_key: &str) -> bool {
        self.owner_id == owner_id && self.unit_key == unit_key
    }

    /// Whether this item downloads a whole unit
    pub fn is_unit(&self) -> bool {
        matches!(self.scope, ItemScope::Unit)
    }
}

/// Ephemeral progress of an active item
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    /// Completion percentage within 0.0..=100.0
    pub percent: f32,
    /// Estimated remaining time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_seconds_remaining: Option<u64>,
    /// Current transfer rate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_second: Option<u64>,
    /// Last non-fatal error observed by the executor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressInfo {
    /// Progress at the given percentage, clamped to 0..=100
    pub fn at(percent: f32) -> Self {
        Self {
            percent: clamp_percent(percent),
            ..Default::default()
        }
    }

    /// Clamp the percentage into range (NaN becomes 0)
    pub fn clamped(mut self) -> Self {
        self.percent = clamp_percent(self.percent);
        self
    }
}

fn clamp_percent(percent: f32) -> f32 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// Failure reported by an executor
#[derive(Clone, Debug)]
pub struct FailureReport {
    /// The failed item's id
    pub id: ItemId,
    /// Classification deciding retry eligibility
    pub kind: FailureKind,
    /// Human-readable error
    pub message: String,
    /// The item to re-enqueue on retry; falls back to the tracked item
    pub item: Option<QueueItem>,
    /// Retries already consumed by this item
    pub retry_count: u32,
}

/// An active item as seen in a [`QueueSnapshot`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActiveDownload {
    /// The item being downloaded
    pub item: QueueItem,
    /// Dispatch time in epoch milliseconds
    pub started_at: i64,
    /// Latest progress report, if any
    pub progress: Option<ProgressInfo>,
}

/// Point-in-time view of the scheduler
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Pending items in dispatch order
    pub pending: Vec<QueueItem>,
    /// Active items, sorted by id
    pub active: Vec<ActiveDownload>,
    /// Whether dispatch is paused
    pub paused: bool,
    /// True iff anything is pending or active
    pub processing: bool,
}

impl QueueSnapshot {
    /// Whether the given id is active
    pub fn is_active(&self, id: &ItemId) -> bool {
        self.active.iter().any(|a| &a.item.id == id)
    }

    /// Whether the given id is pending
    pub fn is_pending(&self, id: &ItemId) -> bool {
        self.pending.iter().any(|i| &i.id == id)
    }
}

/// Event emitted by the pipeline
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Item admitted to the pending queue
    Queued {
        /// The admitted item (with its admission stamp)
        item: QueueItem,
    },

    /// Item handed to the executor
    Started {
        /// Item id
        id: ItemId,
        /// Owner (title) id
        owner_id: String,
        /// Unit (chapter) key
        unit_key: String,
    },

    /// Progress update for an active item
    Progress {
        /// Item id
        id: ItemId,
        /// Latest progress
        progress: ProgressInfo,
    },

    /// Item finished successfully
    Completed {
        /// The finished item
        item: QueueItem,
    },

    /// Item failed transiently and was re-enqueued
    Retrying {
        /// The re-enqueued copy (demoted priority, incremented retry count)
        item: QueueItem,
        /// Failure classification
        kind: FailureKind,
        /// Error message
        error: String,
    },

    /// Item failed permanently
    Failed {
        /// The failed item
        item: QueueItem,
        /// Failure classification
        kind: FailureKind,
        /// Error message
        error: String,
    },

    /// The executor refused the item at dispatch time
    DispatchFailed {
        /// The rejected item
        item: QueueItem,
        /// Error message
        error: String,
    },

    /// Item removed from tracking
    Removed {
        /// Item id
        id: ItemId,
        /// Owner (title) id
        owner_id: String,
        /// Unit (chapter) key
        unit_key: String,
        /// Whether the item was in flight (its transfer is not aborted)
        was_active: bool,
    },

    /// Dispatch paused
    Paused,

    /// Dispatch resumed
    Resumed,

    /// A unit was validated
    ValidationComplete {
        /// Owner (title) id
        owner_id: String,
        /// Unit (chapter) key
        unit_key: String,
        /// Composite integrity score (0-100)
        integrity_score: u8,
        /// Recommended follow-up
        action: crate::integrity::RecommendedAction,
    },

    /// A repair attempt finished
    RepairComplete {
        /// Owner (title) id
        owner_id: String,
        /// Unit (chapter) key
        unit_key: String,
        /// Whether the repair fully succeeded
        success: bool,
        /// Pieces recovered
        repaired_count: usize,
    },

    /// Background validation found more corruption than policy allows to repair silently
    CorruptionThresholdExceeded {
        /// Corrupted units found
        corrupted: usize,
        /// Units scanned
        total: usize,
    },

    /// Shutdown completed
    Shutdown,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_is_derived_from_owner_and_unit() {
        let item = QueueItem::new("manga-42", "17", "https://x.test/c/17", "Ch. 17", 1);
        assert_eq!(item.id.as_str(), "manga-42_17");
        assert_eq!(item.id, ItemId::for_unit("manga-42", "17"));
        assert!(item.matches("manga-42", "17"));
        assert!(!item.matches("manga-42", "18"));
    }

    #[test]
    fn piece_items_do_not_collide_with_unit_items() {
        let unit = QueueItem::new("m", "1", "u", "n", 0);
        let piece = QueueItem::piece("m", "1", 4, "004.png", "https://x.test/4.png", 5);
        assert_ne!(unit.id, piece.id);
        assert!(piece.matches("m", "1"));
        assert!(!piece.is_unit());
    }

    #[test]
    fn queue_item_uses_camel_case_and_tolerates_missing_fields() {
        let item = QueueItem::new("m", "1", "https://x.test/c/1", "One", 2);
        let json = serde_json::to_value(&item).unwrap();
        assert!(json.get("ownerId").is_some());
        assert!(json.get("enqueuedAt").is_some());

        let minimal: QueueItem = serde_json::from_str(
            r#"{"id":"m_1","ownerId":"m","unitKey":"1","sourceUrl":"https://x.test"}"#,
        )
        .unwrap();
        assert_eq!(minimal.priority, 0);
        assert_eq!(minimal.retry_count, 0);
        assert_eq!(minimal.scope, ItemScope::Unit);
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(ProgressInfo::at(140.0).percent, 100.0);
        assert_eq!(ProgressInfo::at(-3.0).percent, 0.0);
        assert_eq!(ProgressInfo::at(f32::NAN).percent, 0.0);
    }
}
