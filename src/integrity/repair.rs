//! Repair Engine
//!
//! Turns a [`ValidationResult`] into queue work. Partial repairs enqueue one
//! piece-scoped item per broken index and wait for each to reach a terminal
//! state; full repairs discard the unit and queue it again.

use super::{RecommendedAction, ValidationResult};
use crate::batch::ChapterCatalog;
use crate::error::{IntegrityError, Result};
use crate::library::ChapterLibrary;
use crate::queue::QueueHandle;
use crate::types::{Event, ItemId, QueueItem};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

/// Result of one repair attempt
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    /// Every requested download settled successfully
    pub success: bool,
    /// Pieces recovered, or 1 when a whole unit was re-queued
    pub repaired_count: usize,
    /// One entry per piece that could not be recovered
    pub errors: Vec<String>,
}

/// Re-fetches broken pieces or whole units through the scheduler
pub struct RepairEngine {
    library: ChapterLibrary,
    queue: QueueHandle,
    event_tx: broadcast::Sender<Event>,
    catalog: Option<Arc<dyn ChapterCatalog>>,
    priority: i32,
    timeout: Duration,
}

impl RepairEngine {
    /// Create an engine that enqueues repairs at `priority` and waits at
    /// most `timeout` for piece downloads to settle
    pub fn new(
        library: ChapterLibrary,
        queue: QueueHandle,
        event_tx: broadcast::Sender<Event>,
        priority: i32,
        timeout: Duration,
    ) -> Self {
        Self {
            library,
            queue,
            event_tx,
            catalog: None,
            priority,
            timeout,
        }
    }

    /// Fall back to `catalog` for the source of units without a manifest
    pub fn with_catalog(mut self, catalog: Arc<dyn ChapterCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Repair a unit according to its validation result
    ///
    /// `manual_check` results are refused with
    /// [`IntegrityError::ManualCheckRequired`].
    pub async fn repair_corrupted_chapter(
        &self,
        owner_id: &str,
        unit_key: &str,
        result: &ValidationResult,
    ) -> Result<RepairOutcome> {
        let outcome = match result.recommended_action {
            RecommendedAction::None => RepairOutcome {
                success: true,
                ..Default::default()
            },
            RecommendedAction::ManualCheck => {
                return Err(IntegrityError::ManualCheckRequired {
                    owner_id: owner_id.to_string(),
                    unit_key: unit_key.to_string(),
                }
                .into());
            }
            RecommendedAction::RedownloadCorrupted => {
                self.redownload_pieces(owner_id, unit_key, &result.broken_pieces())
                    .await?
            }
            RecommendedAction::RedownloadAll => self.redownload_all(owner_id, unit_key).await?,
        };

        if outcome.success {
            info!(
                owner_id,
                unit_key,
                repaired = outcome.repaired_count,
                "Repair finished"
            );
        } else {
            warn!(
                owner_id,
                unit_key,
                repaired = outcome.repaired_count,
                errors = outcome.errors.len(),
                "Repair finished with errors"
            );
        }

        self.event_tx
            .send(Event::RepairComplete {
                owner_id: owner_id.to_string(),
                unit_key: unit_key.to_string(),
                success: outcome.success,
                repaired_count: outcome.repaired_count,
            })
            .ok();
        Ok(outcome)
    }

    async fn redownload_pieces(
        &self,
        owner_id: &str,
        unit_key: &str,
        indices: &BTreeSet<u32>,
    ) -> Result<RepairOutcome> {
        let manifest = match self.library.read_manifest(owner_id, unit_key).await {
            Ok(m) => m,
            Err(e) => {
                warn!(owner_id, unit_key, error = %e, "Manifest unreadable, re-queueing whole unit");
                return self.redownload_all(owner_id, unit_key).await;
            }
        };

        let mut items = Vec::with_capacity(indices.len());
        for &index in indices {
            let Some(record) = manifest.piece(index) else {
                // a gap in the manifest has no source to re-fetch from
                warn!(owner_id, unit_key, index, "No record for piece, re-queueing whole unit");
                return self.redownload_all(owner_id, unit_key).await;
            };
            items.push(QueueItem::piece(
                owner_id,
                unit_key,
                index,
                record.file_name.clone(),
                record.source_url.clone(),
                self.priority,
            ));
        }

        // subscribed before enqueueing so no terminal event is missed
        let mut events = self.event_tx.subscribe();
        let mut pending: HashSet<ItemId> = HashSet::with_capacity(items.len());
        for item in items {
            pending.insert(item.id.clone());
            self.queue.enqueue(item).await?;
        }
        info!(owner_id, unit_key, pieces = pending.len(), "Queued piece repairs");

        let mut repaired_count = 0;
        let mut errors = Vec::new();
        let deadline = Instant::now() + self.timeout;

        while !pending.is_empty() {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    warn!(missed, "Repair lagged behind queue events");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    errors.extend(pending.drain().map(|id| format!("{}: queue stopped", id)));
                    break;
                }
                Err(_) => {
                    let timeout = IntegrityError::RepairTimedOut {
                        owner_id: owner_id.to_string(),
                        unit_key: unit_key.to_string(),
                    };
                    warn!(pending = pending.len(), "{}", timeout);
                    errors.extend(pending.drain().map(|id| format!("{}: {}", id, timeout)));
                    break;
                }
            };

            match event {
                Event::Completed { item } if pending.remove(&item.id) => repaired_count += 1,
                Event::Failed { item, error, .. } | Event::DispatchFailed { item, error }
                    if pending.remove(&item.id) =>
                {
                    errors.push(format!("{}: {}", item.id, error));
                }
                Event::Removed { id, .. } if pending.remove(&id) => {
                    errors.push(format!("{}: removed from queue", id));
                }
                _ => {}
            }
        }

        Ok(RepairOutcome {
            success: errors.is_empty(),
            repaired_count,
            errors,
        })
    }

    async fn redownload_all(&self, owner_id: &str, unit_key: &str) -> Result<RepairOutcome> {
        let (source_url, display_name) = match self.library.read_manifest(owner_id, unit_key).await {
            Ok(m) => (m.source_url, m.display_name),
            Err(_) => self.catalog_source(owner_id, unit_key).await?,
        };

        self.library.remove_unit(owner_id, unit_key).await?;
        let item = QueueItem::new(owner_id, unit_key, source_url, display_name, self.priority);
        if !self.queue.enqueue(item).await? {
            info!(owner_id, unit_key, "Unit already queued, not re-queueing");
        }

        Ok(RepairOutcome {
            success: true,
            repaired_count: 1,
            errors: Vec::new(),
        })
    }

    async fn catalog_source(&self, owner_id: &str, unit_key: &str) -> Result<(String, String)> {
        let unknown = || IntegrityError::UnknownSource {
            owner_id: owner_id.to_string(),
            unit_key: unit_key.to_string(),
        };
        let Some(catalog) = &self.catalog else {
            return Err(unknown().into());
        };
        match catalog.chapter(owner_id, unit_key).await? {
            Some(chapter) => Ok((chapter.source_url, chapter.display_name)),
            None => Err(unknown().into()),
        }
    }
}
