use tokio::sync::oneshot;

use crate::types::{FailureReport, ItemId, ProgressInfo, QueueItem, QueueSnapshot};

/// Message to the queue actor
///
/// Requests that need an answer carry a `reply` channel; executor callbacks
/// are fire-and-forget.
#[derive(Debug)]
pub(crate) enum QueueCommand {
    Enqueue {
        item: QueueItem,
        reply: oneshot::Sender<bool>,
    },
    Dispatch,
    Complete {
        id: ItemId,
    },
    Failed {
        report: FailureReport,
    },
    Progress {
        id: ItemId,
        progress: ProgressInfo,
    },
    Remove {
        owner_id: String,
        unit_key: String,
        reply: oneshot::Sender<usize>,
    },
    RemovePendingForOwner {
        owner_id: String,
        reply: oneshot::Sender<Vec<QueueItem>>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    IsQueued {
        owner_id: String,
        unit_key: String,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
