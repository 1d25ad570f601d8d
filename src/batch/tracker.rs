//! Per-title batch progress, folded from queue events.

use crate::types::{Event, ItemId, QueueItem};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Lifecycle of a title's batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// No batch started
    #[default]
    Idle,
    /// Chapters still outstanding
    Downloading,
    /// Every chapter finished successfully
    Completed,
    /// Every chapter finished, some failed
    CompletedWithFailures,
    /// Cancelled by the user
    Cancelled,
}

/// Aggregate progress of one title's batch
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    /// Current state
    pub state: BatchState,
    /// Chapters in the batch
    pub total_chapters: usize,
    /// Chapters that reached a terminal state
    pub processed_chapters: usize,
    /// Chapters that ended in failure
    pub failed_chapters: usize,
    /// The failed items, kept for an explicit retry
    pub failed_items: Vec<QueueItem>,
}

impl BatchProgress {
    /// `total - processed`, never negative
    pub fn remaining_chapters(&self) -> usize {
        self.total_chapters.saturating_sub(self.processed_chapters)
    }
}

#[derive(Debug, Default)]
struct Batch {
    progress: BatchProgress,
    outstanding: HashSet<ItemId>,
}

/// Requests from the orchestrator, applied in order with queue events
#[derive(Debug)]
pub(crate) enum TrackerCommand {
    Start {
        owner_id: String,
        members: Vec<ItemId>,
    },
    Cancel {
        owner_id: String,
    },
    Retry {
        owner_id: String,
        members: Vec<ItemId>,
    },
}

/// Batch progress for every title
#[derive(Debug, Default)]
pub(crate) struct BatchBook {
    batches: HashMap<String, Batch>,
}

impl BatchBook {
    pub fn view(&self) -> HashMap<String, BatchProgress> {
        self.batches
            .iter()
            .map(|(owner, b)| (owner.clone(), b.progress.clone()))
            .collect()
    }

    pub fn apply_command(&mut self, cmd: TrackerCommand) {
        match cmd {
            TrackerCommand::Start { owner_id, members } => {
                let outstanding: HashSet<ItemId> = members.into_iter().collect();
                let mut batch = Batch {
                    progress: BatchProgress {
                        state: BatchState::Downloading,
                        total_chapters: outstanding.len(),
                        ..Default::default()
                    },
                    outstanding,
                };
                finish_if_done(&mut batch);
                self.batches.insert(owner_id, batch);
            }
            TrackerCommand::Cancel { owner_id } => {
                if let Some(batch) = self.batches.get_mut(&owner_id) {
                    batch.outstanding.clear();
                    batch.progress.state = BatchState::Cancelled;
                }
            }
            TrackerCommand::Retry { owner_id, members } => {
                let batch = self.batches.entry(owner_id).or_default();
                for id in members {
                    let before = batch.progress.failed_items.len();
                    batch.progress.failed_items.retain(|i| i.id != id);
                    if batch.progress.failed_items.len() < before {
                        batch.progress.failed_chapters -= 1;
                        batch.progress.processed_chapters -= 1;
                    } else {
                        // not from this batch; count it as new work
                        batch.progress.total_chapters += 1;
                    }
                    batch.outstanding.insert(id);
                }
                batch.progress.state = BatchState::Downloading;
                finish_if_done(batch);
            }
        }
    }

    /// Fold one queue event; returns whether any batch changed
    pub fn apply_event(&mut self, event: &Event) -> bool {
        let (owner_id, id, failed) = match event {
            Event::Completed { item } => (&item.owner_id, &item.id, None),
            Event::Failed { item, .. } | Event::DispatchFailed { item, .. } => {
                (&item.owner_id, &item.id, Some(item))
            }
            Event::Removed { owner_id, id, .. } => (owner_id, id, None),
            _ => return false,
        };

        let Some(batch) = self.batches.get_mut(owner_id) else {
            return false;
        };
        if !batch.outstanding.remove(id) {
            return false;
        }

        batch.progress.processed_chapters += 1;
        if let Some(item) = failed {
            batch.progress.failed_chapters += 1;
            batch.progress.failed_items.push(item.clone());
        }
        finish_if_done(batch);
        true
    }
}

fn finish_if_done(batch: &mut Batch) {
    if batch.progress.state == BatchState::Downloading && batch.outstanding.is_empty() {
        batch.progress.state = if batch.progress.failed_chapters > 0 {
            BatchState::CompletedWithFailures
        } else {
            BatchState::Completed
        };
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn item(unit: &str) -> QueueItem {
        QueueItem::new("m", unit, "u", unit, 1)
    }

    fn start(book: &mut BatchBook, units: &[&str]) {
        book.apply_command(TrackerCommand::Start {
            owner_id: "m".into(),
            members: units.iter().map(|u| ItemId::for_unit("m", u)).collect(),
        });
    }

    fn failed(unit: &str) -> Event {
        Event::Failed {
            item: item(unit),
            kind: FailureKind::TerminalInput,
            error: "404".into(),
        }
    }

    #[test]
    fn counts_completions_and_failures() {
        let mut book = BatchBook::default();
        start(&mut book, &["1", "2", "3"]);

        assert!(book.apply_event(&Event::Completed { item: item("1") }));
        assert!(book.apply_event(&failed("2")));
        // retries are not terminal
        assert!(!book.apply_event(&Event::Retrying {
            item: item("3"),
            kind: FailureKind::Transient,
            error: "reset".into(),
        }));

        let progress = book.view()["m"].clone();
        assert_eq!(progress.processed_chapters, 2);
        assert_eq!(progress.failed_chapters, 1);
        assert_eq!(progress.remaining_chapters(), 1);
        assert_eq!(progress.state, BatchState::Downloading);

        book.apply_event(&Event::Completed { item: item("3") });
        assert_eq!(book.view()["m"].state, BatchState::CompletedWithFailures);
    }

    #[test]
    fn events_outside_the_batch_are_ignored() {
        let mut book = BatchBook::default();
        start(&mut book, &["1"]);
        assert!(!book.apply_event(&Event::Completed { item: item("9") }));
        assert!(!book.apply_event(&Event::Completed {
            item: QueueItem::new("other", "1", "u", "n", 0)
        }));
        // a second completion of the same chapter counts once
        assert!(book.apply_event(&Event::Completed { item: item("1") }));
        assert!(!book.apply_event(&Event::Completed { item: item("1") }));
        assert_eq!(book.view()["m"].state, BatchState::Completed);
    }

    #[test]
    fn cancelled_batch_stops_counting() {
        let mut book = BatchBook::default();
        start(&mut book, &["1", "2"]);
        book.apply_command(TrackerCommand::Cancel {
            owner_id: "m".into(),
        });
        assert!(!book.apply_event(&Event::Completed { item: item("1") }));

        let progress = book.view()["m"].clone();
        assert_eq!(progress.state, BatchState::Cancelled);
        assert_eq!(progress.processed_chapters, 0);
    }

    #[test]
    fn restart_resets_counters() {
        let mut book = BatchBook::default();
        start(&mut book, &["1"]);
        book.apply_event(&failed("1"));
        start(&mut book, &["1", "2"]);

        let progress = book.view()["m"].clone();
        assert_eq!(progress.total_chapters, 2);
        assert_eq!(progress.processed_chapters, 0);
        assert_eq!(progress.failed_chapters, 0);
    }

    #[test]
    fn retry_moves_failures_back_to_outstanding() {
        let mut book = BatchBook::default();
        start(&mut book, &["1", "2"]);
        book.apply_event(&Event::Completed { item: item("1") });
        book.apply_event(&failed("2"));
        assert_eq!(book.view()["m"].state, BatchState::CompletedWithFailures);

        book.apply_command(TrackerCommand::Retry {
            owner_id: "m".into(),
            members: vec![ItemId::for_unit("m", "2")],
        });
        let progress = book.view()["m"].clone();
        assert_eq!(progress.state, BatchState::Downloading);
        assert_eq!(progress.processed_chapters, 1);
        assert_eq!(progress.failed_chapters, 0);
        assert!(progress.failed_items.is_empty());

        book.apply_event(&Event::Completed { item: item("2") });
        assert_eq!(book.view()["m"].state, BatchState::Completed);
    }

    #[test]
    fn empty_batch_completes_immediately() {
        let mut book = BatchBook::default();
        start(&mut book, &[]);
        let progress = book.view()["m"].clone();
        assert_eq!(progress.state, BatchState::Completed);
        assert_eq!(progress.remaining_chapters(), 0);
    }
}
