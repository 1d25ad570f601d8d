//! Pure scheduler state
//!
//! [`QueueState`] holds the pending sequence and the active set and performs
//! every transition of the per-item state machine. It does no I/O; the actor
//! in [`super`] owns the single instance and turns transitions into executor
//! calls, persistence and events.

use crate::error::FailureKind;
use crate::retry::demoted_priority;
use crate::store::PersistedQueue;
use crate::types::{ActiveDownload, FailureReport, ItemId, ProgressInfo, QueueItem, QueueSnapshot};
use std::collections::HashMap;

/// An item currently handed to the executor
#[derive(Clone, Debug)]
pub(crate) struct ActiveEntry {
    pub item: QueueItem,
    pub started_at: i64,
    pub progress: Option<ProgressInfo>,
}

/// Result of reporting a failure
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FailOutcome {
    /// The id was not active; nothing changed
    Untracked,
    /// A demoted copy went back to pending
    Retried(QueueItem),
    /// The item is finished for good
    Terminal(QueueItem),
}

/// Pending queue plus active set
#[derive(Debug)]
pub(crate) struct QueueState {
    pending: Vec<QueueItem>,
    active: HashMap<ItemId, ActiveEntry>,
    paused: bool,
    last_stamp: i64,
    max_retries: u32,
}

/// Whether `a` is dispatched no later than `b` (priority desc, then stamp asc)
fn runs_before_or_with(a: &QueueItem, b: &QueueItem) -> bool {
    a.priority > b.priority || (a.priority == b.priority && a.enqueued_at <= b.enqueued_at)
}

impl QueueState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            pending: Vec::new(),
            active: HashMap::new(),
            paused: false,
            last_stamp: 0,
            max_retries,
        }
    }

    /// Rebuild state from a snapshot
    ///
    /// Items that were active when the snapshot was written were interrupted;
    /// they go back to pending with their original stamps.
    pub fn from_persisted(persisted: PersistedQueue, max_retries: u32) -> Self {
        let mut state = Self::new(max_retries);
        state.paused = persisted.is_paused;

        let recorded: Vec<&str> = persisted.active_items.iter().map(|i| i.id.as_str()).collect();
        for id in &persisted.active_download_ids {
            if !recorded.contains(&id.as_str()) {
                tracing::warn!(item_id = %id, "Dropping active id without item record from snapshot");
            }
        }

        for item in persisted.items.into_iter().chain(persisted.active_items) {
            if state.contains(&item.id) {
                tracing::warn!(item_id = %item.id, "Dropping duplicate item from snapshot");
                continue;
            }
            state.last_stamp = state.last_stamp.max(item.enqueued_at);
            state.pending.push(item);
        }

        state
            .pending
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));
        state
    }

    pub fn to_persisted(&self, now: i64) -> PersistedQueue {
        let mut active: Vec<&ActiveEntry> = self.active.values().collect();
        active.sort_by(|a, b| a.item.id.cmp(&b.item.id));

        PersistedQueue {
            items: self.pending.clone(),
            active_download_ids: active.iter().map(|e| e.item.id.to_string()).collect(),
            active_items: active.iter().map(|e| e.item.clone()).collect(),
            is_paused: self.paused,
            last_processed: now,
        }
    }

    fn contains(&self, id: &ItemId) -> bool {
        self.active.contains_key(id) || self.pending.iter().any(|p| &p.id == id)
    }

    /// Non-decreasing admission stamp
    fn stamp(&mut self, now: i64) -> i64 {
        self.last_stamp = self.last_stamp.max(now);
        self.last_stamp
    }

    fn insert_sorted(&mut self, item: QueueItem) {
        let at = self.pending.partition_point(|p| runs_before_or_with(p, &item));
        self.pending.insert(at, item);
    }

    /// Admit an item; `None` if its id is already pending or active
    pub fn enqueue(&mut self, mut item: QueueItem, now: i64) -> Option<QueueItem> {
        if self.contains(&item.id) {
            return None;
        }
        item.enqueued_at = self.stamp(now);
        self.insert_sorted(item.clone());
        Some(item)
    }

    /// Move up to the free slot count from the front of pending into active
    pub fn take_dispatchable(&mut self, max_concurrent: usize, now: i64) -> Vec<QueueItem> {
        if self.paused {
            return Vec::new();
        }
        let slots = max_concurrent.saturating_sub(self.active.len());
        let take = slots.min(self.pending.len());
        let batch: Vec<QueueItem> = self.pending.drain(..take).collect();

        for item in &batch {
            self.active.insert(
                item.id.clone(),
                ActiveEntry {
                    item: item.clone(),
                    started_at: now,
                    progress: None,
                },
            );
        }
        batch
    }

    /// Forget an active item the executor refused to start
    pub fn dispatch_failed(&mut self, id: &ItemId) -> Option<QueueItem> {
        self.active.remove(id).map(|e| e.item)
    }

    pub fn complete(&mut self, id: &ItemId) -> Option<QueueItem> {
        self.active.remove(id).map(|e| e.item)
    }

    pub fn fail(&mut self, report: FailureReport, now: i64) -> FailOutcome {
        let Some(entry) = self.active.remove(&report.id) else {
            return FailOutcome::Untracked;
        };
        let item = report.item.unwrap_or(entry.item);

        if !self.retry_eligible(report.kind, report.retry_count) {
            return FailOutcome::Terminal(item);
        }

        let mut retry = item;
        retry.priority = demoted_priority(retry.priority);
        retry.retry_count = report.retry_count + 1;
        retry.enqueued_at = self.stamp(now);
        self.insert_sorted(retry.clone());
        FailOutcome::Retried(retry)
    }

    fn retry_eligible(&self, kind: FailureKind, retry_count: u32) -> bool {
        kind.is_transient() && retry_count < self.max_retries
    }

    pub fn set_progress(&mut self, id: &ItemId, progress: ProgressInfo) -> bool {
        match self.active.get_mut(id) {
            Some(entry) => {
                entry.progress = Some(progress.clamped());
                true
            }
            None => false,
        }
    }

    /// Drop every pending and active item of a unit
    ///
    /// Returns the removed items with whether each was active. Active items
    /// only leave the bookkeeping; their transfers keep running.
    pub fn remove(&mut self, owner_id: &str, unit_key: &str) -> Vec<(QueueItem, bool)> {
        let mut removed = Vec::new();

        self.pending.retain(|item| {
            if item.matches(owner_id, unit_key) {
                removed.push((item.clone(), false));
                false
            } else {
                true
            }
        });

        let active_ids: Vec<ItemId> = self
            .active
            .values()
            .filter(|e| e.item.matches(owner_id, unit_key))
            .map(|e| e.item.id.clone())
            .collect();
        for id in active_ids {
            if let Some(entry) = self.active.remove(&id) {
                removed.push((entry.item, true));
            }
        }

        removed
    }

    /// Drop every pending item of an owner, leaving active ones alone
    pub fn remove_pending_for_owner(&mut self, owner_id: &str) -> Vec<QueueItem> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|item| item.owner_id == owner_id);
        self.pending = kept;
        removed
    }

    /// Returns whether the flag changed
    pub fn pause(&mut self) -> bool {
        !std::mem::replace(&mut self.paused, true)
    }

    /// Returns whether the flag changed
    pub fn resume(&mut self) -> bool {
        std::mem::replace(&mut self.paused, false)
    }

    pub fn is_queued(&self, owner_id: &str, unit_key: &str) -> bool {
        self.pending.iter().any(|i| i.matches(owner_id, unit_key))
            || self
                .active
                .contains_key(&ItemId::for_unit(owner_id, unit_key))
    }

    pub fn processing(&self) -> bool {
        !self.pending.is_empty() || !self.active.is_empty()
    }

    #[cfg(test)]
    pub fn pending(&self) -> &[QueueItem] {
        &self.pending
    }

    #[cfg(test)]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut active: Vec<ActiveDownload> = self
            .active
            .values()
            .map(|e| ActiveDownload {
                item: e.item.clone(),
                started_at: e.started_at,
                progress: e.progress.clone(),
            })
            .collect();
        active.sort_by(|a, b| a.item.id.cmp(&b.item.id));

        QueueSnapshot {
            pending: self.pending.clone(),
            active,
            paused: self.paused,
            processing: self.processing(),
        }
    }
}
