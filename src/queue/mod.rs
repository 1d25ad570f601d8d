//! Download Queue Scheduler
//!
//! A single [`QueueActor`] task owns the [`QueueState`](state::QueueState) and
//! applies every mutation. Everything else, including executor callbacks,
//! talks to it through a cloneable [`QueueHandle`] that sends
//! [`QueueCommand`]s over an unbounded channel.
//!
//! After every mutation the actor persists a snapshot through the injected
//! [`QueueStore`] and broadcasts an [`Event`]. The concurrency ceiling is read
//! from the [`SettingsProvider`] on each dispatch cycle.

mod command;
mod state;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::executor::{DownloadContext, DownloadExecutor};
use crate::settings::{SettingsProvider, effective_max_concurrent};
use crate::store::QueueStore;
use crate::types::{Event, FailureReport, ItemId, ProgressInfo, QueueItem, QueueSnapshot};
use command::QueueCommand;
use state::{FailOutcome, QueueState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cloneable handle to a running queue actor
#[derive(Clone, Debug)]
pub struct QueueHandle {
    command_tx: mpsc::UnboundedSender<QueueCommand>,
}

impl QueueHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> QueueCommand) -> Result<T> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .map_err(|_| Error::ShuttingDown)?;
        reply_rx.await.map_err(|_| Error::ShuttingDown)
    }

    fn notify(&self, cmd: QueueCommand) {
        if self.command_tx.send(cmd).is_err() {
            tracing::debug!("Queue actor has stopped, dropping callback");
        }
    }

    /// Admit an item; returns `false` if its id is already pending or active
    pub async fn enqueue(&self, item: QueueItem) -> Result<bool> {
        self.request(|reply| QueueCommand::Enqueue { item, reply })
            .await
    }

    /// Remove a unit from pending and from the active set
    ///
    /// An in-flight transfer is not aborted; its eventual result is ignored.
    /// Returns the number of items removed.
    pub async fn remove(&self, owner_id: &str, unit_key: &str) -> Result<usize> {
        self.request(|reply| QueueCommand::Remove {
            owner_id: owner_id.to_string(),
            unit_key: unit_key.to_string(),
            reply,
        })
        .await
    }

    /// Remove every pending item of an owner; active items are left running
    pub async fn remove_pending_for_owner(&self, owner_id: &str) -> Result<Vec<QueueItem>> {
        self.request(|reply| QueueCommand::RemovePendingForOwner {
            owner_id: owner_id.to_string(),
            reply,
        })
        .await
    }

    /// Stop dispatching new items
    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| QueueCommand::Pause { reply }).await
    }

    /// Resume dispatching and fill free slots immediately
    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| QueueCommand::Resume { reply }).await
    }

    /// Whether the unit is pending or active
    pub async fn is_queued(&self, owner_id: &str, unit_key: &str) -> Result<bool> {
        self.request(|reply| QueueCommand::IsQueued {
            owner_id: owner_id.to_string(),
            unit_key: unit_key.to_string(),
            reply,
        })
        .await
    }

    /// Current pending and active items
    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        self.request(|reply| QueueCommand::Snapshot { reply }).await
    }

    /// Persist a final snapshot and stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| QueueCommand::Shutdown { reply }).await
    }

    /// Executor callback: the item finished successfully
    pub fn on_complete(&self, id: ItemId) {
        self.notify(QueueCommand::Complete { id });
    }

    /// Executor callback: the item failed
    pub fn on_failed(&self, report: FailureReport) {
        self.notify(QueueCommand::Failed { report });
    }

    /// Executor callback: progress of an active item
    pub fn report_progress(&self, id: ItemId, progress: ProgressInfo) {
        self.notify(QueueCommand::Progress { id, progress });
    }

    fn request_dispatch(&self) {
        self.notify(QueueCommand::Dispatch);
    }
}

/// Owner of the scheduler state
pub struct QueueActor {
    state: QueueState,
    command_rx: mpsc::UnboundedReceiver<QueueCommand>,
    handle: QueueHandle,
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn DownloadExecutor>,
    settings: Arc<dyn SettingsProvider>,
    event_tx: broadcast::Sender<Event>,
    settle_delay: Duration,
}

impl QueueActor {
    /// Restore the persisted queue and start the actor task
    ///
    /// Work that was active when the snapshot was written is returned to
    /// pending and dispatched again unless the queue was paused.
    pub async fn spawn(
        config: &QueueConfig,
        store: Arc<dyn QueueStore>,
        executor: Arc<dyn DownloadExecutor>,
        settings: Arc<dyn SettingsProvider>,
        event_tx: broadcast::Sender<Event>,
    ) -> (QueueHandle, JoinHandle<()>) {
        let persisted = store.load().await;
        let state = QueueState::from_persisted(persisted, config.max_retries);
        let restored = state.snapshot();
        if restored.processing {
            tracing::info!(
                pending = restored.pending.len(),
                paused = restored.paused,
                "Restored download queue"
            );
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = QueueHandle { command_tx };

        let mut actor = Self {
            state,
            command_rx,
            handle: handle.clone(),
            store,
            executor,
            settings,
            event_tx,
            settle_delay: config.dispatch_settle_delay,
        };

        let task = tokio::spawn(async move {
            actor.persist().await;
            actor.dispatch().await;
            actor.run().await;
        });

        (handle, task)
    }

    async fn run(&mut self) {
        while let Some(cmd) = self.command_rx.recv().await {
            if let QueueCommand::Shutdown { reply } = cmd {
                self.persist().await;
                tracing::info!("Download queue stopped");
                reply.send(()).ok();
                break;
            }
            self.handle_command(cmd).await;
        }
    }

    async fn handle_command(&mut self, cmd: QueueCommand) {
        match cmd {
            QueueCommand::Enqueue { item, reply } => {
                let accepted = self.enqueue(item).await;
                reply.send(accepted).ok();
            }
            QueueCommand::Dispatch => self.dispatch().await,
            QueueCommand::Complete { id } => self.complete(id).await,
            QueueCommand::Failed { report } => self.fail(report).await,
            QueueCommand::Progress { id, progress } => {
                if self.state.set_progress(&id, progress.clone()) {
                    self.emit(Event::Progress {
                        id,
                        progress: progress.clamped(),
                    });
                } else {
                    tracing::debug!(item_id = %id, "Ignoring progress for untracked item");
                }
            }
            QueueCommand::Remove {
                owner_id,
                unit_key,
                reply,
            } => {
                let removed = self.state.remove(&owner_id, &unit_key);
                let count = removed.len();
                let freed_slot = removed.iter().any(|(_, was_active)| *was_active);
                if count > 0 {
                    self.persist().await;
                }
                for (item, was_active) in removed {
                    tracing::info!(item_id = %item.id, was_active, "Removed from queue");
                    self.emit(Event::Removed {
                        id: item.id,
                        owner_id: item.owner_id,
                        unit_key: item.unit_key,
                        was_active,
                    });
                }
                if freed_slot {
                    self.dispatch().await;
                }
                reply.send(count).ok();
            }
            QueueCommand::RemovePendingForOwner { owner_id, reply } => {
                let removed = self.state.remove_pending_for_owner(&owner_id);
                if !removed.is_empty() {
                    tracing::info!(owner_id = %owner_id, count = removed.len(), "Removed pending items");
                    self.persist().await;
                }
                for item in &removed {
                    self.emit(Event::Removed {
                        id: item.id.clone(),
                        owner_id: item.owner_id.clone(),
                        unit_key: item.unit_key.clone(),
                        was_active: false,
                    });
                }
                reply.send(removed).ok();
            }
            QueueCommand::Pause { reply } => {
                if self.state.pause() {
                    tracing::info!("Download queue paused");
                    self.persist().await;
                    self.emit(Event::Paused);
                }
                reply.send(()).ok();
            }
            QueueCommand::Resume { reply } => {
                if self.state.resume() {
                    tracing::info!("Download queue resumed");
                    self.persist().await;
                    self.emit(Event::Resumed);
                }
                self.dispatch().await;
                reply.send(()).ok();
            }
            QueueCommand::IsQueued {
                owner_id,
                unit_key,
                reply,
            } => {
                reply.send(self.state.is_queued(&owner_id, &unit_key)).ok();
            }
            QueueCommand::Snapshot { reply } => {
                reply.send(self.state.snapshot()).ok();
            }
            // handled in run()
            QueueCommand::Shutdown { reply } => {
                reply.send(()).ok();
            }
        }
    }

    async fn enqueue(&mut self, item: QueueItem) -> bool {
        let id = item.id.clone();
        let Some(admitted) = self.state.enqueue(item, now_millis()) else {
            tracing::debug!(item_id = %id, "Already queued, ignoring enqueue");
            return false;
        };

        tracing::debug!(
            item_id = %admitted.id,
            priority = admitted.priority,
            "Enqueued download"
        );
        self.persist().await;
        self.emit(Event::Queued { item: admitted });
        self.dispatch().await;
        true
    }

    /// Fill free slots from the front of pending
    async fn dispatch(&mut self) {
        let max_concurrent = effective_max_concurrent(self.settings.as_ref());
        let now = now_millis();
        let batch = self.state.take_dispatchable(max_concurrent, now);
        if batch.is_empty() {
            return;
        }

        let mut rejected = false;
        for item in batch {
            let ctx = DownloadContext::new(item.clone(), now);
            match self.executor.start_download(ctx, self.handle.clone()) {
                Ok(()) => {
                    tracing::info!(item_id = %item.id, "Download started");
                    self.emit(Event::Started {
                        id: item.id,
                        owner_id: item.owner_id,
                        unit_key: item.unit_key,
                    });
                }
                Err(e) => {
                    tracing::warn!(item_id = %item.id, error = %e, "Executor refused download");
                    rejected = true;
                    if let Some(item) = self.state.dispatch_failed(&item.id) {
                        self.emit(Event::DispatchFailed {
                            item,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        self.persist().await;

        // Freed slots are filled on the next cycle, not inline
        if rejected {
            self.schedule_dispatch();
        }
    }

    async fn complete(&mut self, id: ItemId) {
        let Some(item) = self.state.complete(&id) else {
            tracing::debug!(item_id = %id, "Ignoring completion for untracked item");
            return;
        };

        tracing::info!(item_id = %id, "Download complete");
        self.persist().await;
        self.emit(Event::Completed { item });
        self.schedule_dispatch();
    }

    async fn fail(&mut self, report: FailureReport) {
        let id = report.id.clone();
        let kind = report.kind;
        let message = report.message.clone();

        match self.state.fail(report, now_millis()) {
            FailOutcome::Untracked => {
                tracing::debug!(item_id = %id, "Ignoring failure for untracked item");
                return;
            }
            FailOutcome::Retried(item) => {
                tracing::warn!(
                    item_id = %id,
                    kind = %kind,
                    retry_count = item.retry_count,
                    priority = item.priority,
                    error = %message,
                    "Download failed, re-queued"
                );
                self.persist().await;
                self.emit(Event::Retrying {
                    item,
                    kind,
                    error: message,
                });
            }
            FailOutcome::Terminal(item) => {
                tracing::error!(
                    item_id = %id,
                    kind = %kind,
                    retry_count = item.retry_count,
                    error = %message,
                    "Download failed permanently"
                );
                self.persist().await;
                self.emit(Event::Failed {
                    item,
                    kind,
                    error: message,
                });
            }
        }

        self.schedule_dispatch();
    }

    /// Dispatch again after the settle delay
    fn schedule_dispatch(&self) {
        let handle = self.handle.clone();
        let delay = self.settle_delay;
        if delay.is_zero() {
            handle.request_dispatch();
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.request_dispatch();
        });
    }

    async fn persist(&self) {
        self.store.save(&self.state.to_persisted(now_millis())).await;
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}
