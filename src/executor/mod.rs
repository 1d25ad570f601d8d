//! Executor interface
//!
//! The scheduler hands each dispatched item to a [`DownloadExecutor`] and
//! returns immediately. The executor reports back through the
//! [`QueueHandle`] it was given, calling exactly one of
//! [`QueueHandle::on_complete`] or [`QueueHandle::on_failed`] per item, plus
//! any number of [`QueueHandle::report_progress`] calls in between.
//!
//! [`HttpExecutor`] is the bundled implementation; hosts with their own
//! transport implement the trait directly.

mod http;
mod source;

pub use http::HttpExecutor;
pub use source::{JsonPageSource, PageSource};

use crate::error::Result;
use crate::queue::QueueHandle;
use crate::types::{ItemId, QueueItem};

/// Everything an executor needs to start one item
#[derive(Clone, Debug)]
pub struct DownloadContext {
    /// Queue item id
    pub id: ItemId,
    /// Owner (title) id
    pub owner_id: String,
    /// Unit (chapter) key
    pub unit_key: String,
    /// Source reference
    pub source_url: String,
    /// Dispatch time in epoch milliseconds
    pub start_time: i64,
    /// The full item, passed back on failure
    pub item: QueueItem,
}

impl DownloadContext {
    /// Build a context for an item dispatched at `start_time`
    pub fn new(item: QueueItem, start_time: i64) -> Self {
        Self {
            id: item.id.clone(),
            owner_id: item.owner_id.clone(),
            unit_key: item.unit_key.clone(),
            source_url: item.source_url.clone(),
            start_time,
            item,
        }
    }
}

/// Performs downloads on behalf of the scheduler
pub trait DownloadExecutor: Send + Sync {
    /// Start an item without waiting for it to finish
    ///
    /// An `Err` means the item was never started; the scheduler drops it
    /// from the active set and does not expect a callback.
    fn start_download(&self, ctx: DownloadContext, queue: QueueHandle) -> Result<()>;

    /// Ask a running item to stop; returns whether it was running
    fn cancel(&self, _id: &ItemId) -> bool {
        false
    }

    /// Ask every running item to stop
    fn cancel_all(&self) {}
}
