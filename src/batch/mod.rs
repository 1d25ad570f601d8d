//! Batch Orchestrator
//!
//! Expands "download these chapters of title T" into queue items and keeps a
//! per-title [`BatchProgress`] that is folded from the queue's events by a
//! tracker task. Progress is published on a `watch` channel, so any number of
//! views can read it without coordinating with each other.

mod catalog;
mod tracker;

pub use catalog::{ChapterCatalog, ChapterRef, StaticCatalog};
pub use tracker::{BatchProgress, BatchState};

use crate::error::{Error, Result};
use crate::queue::QueueHandle;
use crate::types::{Event, ItemId, QueueItem};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracker::{BatchBook, TrackerCommand};

/// Per-title progress of every batch
pub type BatchView = HashMap<String, BatchProgress>;

/// Starts, cancels and retries batches of chapter downloads
pub struct BatchOrchestrator {
    queue: QueueHandle,
    catalog: Arc<dyn ChapterCatalog>,
    priority: i32,
    command_tx: mpsc::UnboundedSender<TrackerCommand>,
    view_rx: watch::Receiver<BatchView>,
}

impl BatchOrchestrator {
    /// Create an orchestrator and start its tracker task
    ///
    /// The tracker stops when the orchestrator is dropped or the event
    /// channel closes.
    pub fn new(
        queue: QueueHandle,
        events: &broadcast::Sender<Event>,
        catalog: Arc<dyn ChapterCatalog>,
        priority: i32,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(BatchView::new());
        tokio::spawn(run_tracker(command_rx, events.subscribe(), view_tx));

        Self {
            queue,
            catalog,
            priority,
            command_tx,
            view_rx,
        }
    }

    fn track(&self, cmd: TrackerCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .map_err(|_| Error::ShuttingDown)
    }

    /// Queue a batch for a title and reset its counters
    ///
    /// Without a selection every chapter the catalog knows for the title is
    /// queued. Returns how many chapters the batch holds.
    pub async fn start_batch_download(
        &self,
        owner_id: &str,
        selection: Option<Vec<ChapterRef>>,
    ) -> Result<usize> {
        let chapters = match selection {
            Some(chapters) => chapters,
            None => self.catalog.chapters(owner_id).await?,
        };

        let items: Vec<QueueItem> = chapters
            .into_iter()
            .map(|c| QueueItem::new(owner_id, c.unit_key, c.source_url, c.display_name, self.priority))
            .collect();

        // registered before enqueueing so no event is missed
        self.track(TrackerCommand::Start {
            owner_id: owner_id.to_string(),
            members: items.iter().map(|i| i.id.clone()).collect(),
        })?;

        let total = items.len();
        let mut admitted = 0;
        for item in items {
            if self.queue.enqueue(item).await? {
                admitted += 1;
            }
        }

        tracing::info!(
            owner_id,
            chapters = total,
            admitted,
            "Started batch download"
        );
        Ok(total)
    }

    /// Remove the title's pending chapters and stop counting the batch
    ///
    /// Chapters already downloading finish on their own. Returns how many
    /// pending chapters were removed.
    pub async fn cancel_batch_download(&self, owner_id: &str) -> Result<usize> {
        self.track(TrackerCommand::Cancel {
            owner_id: owner_id.to_string(),
        })?;
        let removed = self.queue.remove_pending_for_owner(owner_id).await?;
        tracing::info!(owner_id, removed = removed.len(), "Cancelled batch download");
        Ok(removed.len())
    }

    /// Queue every failed chapter of the title again with a fresh retry budget
    ///
    /// Returns how many chapters were re-queued.
    pub async fn retry_failed_chapters(&self, owner_id: &str) -> Result<usize> {
        let failed: Vec<QueueItem> = self
            .progress(owner_id)
            .map(|p| p.failed_items)
            .unwrap_or_default();
        if failed.is_empty() {
            return Ok(0);
        }

        let retries: Vec<QueueItem> = failed
            .into_iter()
            .map(|mut item| {
                item.retry_count = 0;
                item.priority = self.priority;
                item
            })
            .collect();

        self.track(TrackerCommand::Retry {
            owner_id: owner_id.to_string(),
            members: retries.iter().map(|i| i.id.clone()).collect::<Vec<ItemId>>(),
        })?;

        let count = retries.len();
        for item in retries {
            self.queue.enqueue(item).await?;
        }
        tracing::info!(owner_id, count, "Retrying failed chapters");
        Ok(count)
    }

    /// Current progress of a title's batch
    pub fn progress(&self, owner_id: &str) -> Option<BatchProgress> {
        self.view_rx.borrow().get(owner_id).cloned()
    }

    /// Watch the progress of every batch
    pub fn subscribe(&self) -> watch::Receiver<BatchView> {
        self.view_rx.clone()
    }
}

async fn run_tracker(
    mut command_rx: mpsc::UnboundedReceiver<TrackerCommand>,
    mut events: broadcast::Receiver<Event>,
    view_tx: watch::Sender<BatchView>,
) {
    let mut book = BatchBook::default();

    loop {
        tokio::select! {
            biased;

            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else { break };
                book.apply_command(cmd);
                view_tx.send_replace(book.view());
            }

            event = events.recv() => match event {
                Ok(event) => {
                    if book.apply_event(&event) {
                        view_tx.send_replace(book.view());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Batch tracker lagged behind queue events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::debug!("Batch tracker stopped");
}
