//! Composition root
//!
//! [`ChapterDownloader`] wires the database, queue store, scheduler, executor,
//! batch orchestrator and integrity manager together and owns their
//! background tasks.
//! - [`lifecycle`] - graceful shutdown

mod lifecycle;


use crate::batch::{BatchOrchestrator, ChapterCatalog};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::executor::{DownloadExecutor, HttpExecutor};
use crate::integrity::{CorruptionNotifier, IntegrityManager, LogNotifier, RepairEngine};
use crate::library::ChapterLibrary;
use crate::queue::{QueueActor, QueueHandle};
use crate::settings::RuntimeSettings;
use crate::store::SqliteQueueStore;
use crate::types::Event;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The chapter download pipeline
pub struct ChapterDownloader {
    /// Database instance for persistence
    /// Public for integration tests to inspect runtime markers
    pub db: Arc<Database>,
    event_tx: broadcast::Sender<Event>,
    config: Arc<Config>,
    settings: RuntimeSettings,
    library: ChapterLibrary,
    queue: QueueHandle,
    executor: Arc<dyn DownloadExecutor>,
    batch: BatchOrchestrator,
    integrity: Arc<IntegrityManager>,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChapterDownloader {
    /// Create a downloader with the bundled [`HttpExecutor`]
    ///
    /// This initializes all core components:
    /// - Opens/creates the SQLite database and runs migrations
    /// - Restores the persisted queue and dispatches interrupted work
    /// - Starts background validation (and verify-on-complete if enabled)
    pub async fn new(config: Config, catalog: Arc<dyn ChapterCatalog>) -> Result<Self> {
        let library = ChapterLibrary::new(config.download.download_dir.clone());
        let executor = Arc::new(HttpExecutor::new(
            &config.download,
            config.retry.clone(),
            library,
        )?);
        Self::with_executor(config, catalog, executor, Arc::new(LogNotifier)).await
    }

    /// Create a downloader around a host-provided executor and notifier
    pub async fn with_executor(
        config: Config,
        catalog: Arc<dyn ChapterCatalog>,
        executor: Arc<dyn DownloadExecutor>,
        notifier: Arc<dyn CorruptionNotifier>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.download.download_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download.download_dir.display(),
                        e
                    ),
                ))
            })?;

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        if db.was_unclean_shutdown().await? {
            tracing::warn!("Previous session did not shut down cleanly, restoring queue from last snapshot");
        }
        db.set_clean_start().await?;

        let (event_tx, _rx) = broadcast::channel(1000);
        let settings = RuntimeSettings::new(config.download.max_concurrent_downloads);
        let library = ChapterLibrary::new(config.download.download_dir.clone());

        let (queue, queue_task) = QueueActor::spawn(
            &config.queue,
            Arc::new(SqliteQueueStore::new(db.clone())),
            executor.clone(),
            Arc::new(settings.clone()),
            event_tx.clone(),
        )
        .await;

        let batch = BatchOrchestrator::new(
            queue.clone(),
            &event_tx,
            catalog.clone(),
            config.queue.batch_priority,
        );

        let repair = RepairEngine::new(
            library.clone(),
            queue.clone(),
            event_tx.clone(),
            config.queue.repair_priority,
            config.integrity.repair_timeout,
        )
        .with_catalog(catalog);
        let integrity = Arc::new(IntegrityManager::new(
            library.clone(),
            db.clone(),
            config.integrity.clone(),
            repair,
            event_tx.clone(),
            notifier,
        ));

        let background = CancellationToken::new();
        let mut tasks = vec![
            queue_task,
            integrity.clone().spawn_background(background.child_token()),
        ];
        if config.integrity.verify_on_complete {
            tasks.push(
                integrity
                    .clone()
                    .spawn_verify_on_complete(background.child_token()),
            );
        }

        tracing::info!(
            download_dir = %config.download.download_dir.display(),
            max_concurrent = config.download.max_concurrent_downloads,
            "Chapter downloader started"
        );

        Ok(Self {
            db,
            event_tx,
            config: Arc::new(config),
            settings,
            library,
            queue,
            executor,
            batch,
            integrity,
            background,
            tasks: Mutex::new(tasks),
        })
    }

    /// Subscribe to pipeline events
    ///
    /// Each subscriber receives every event sent after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Handle to the download queue
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// The batch orchestrator
    pub fn batch(&self) -> &BatchOrchestrator {
        &self.batch
    }

    /// The integrity manager
    pub fn integrity(&self) -> &Arc<IntegrityManager> {
        &self.integrity
    }

    /// Live settings; changing the ceiling applies on the next dispatch
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// The on-disk chapter library
    pub fn library(&self) -> &ChapterLibrary {
        &self.library
    }

    /// The configuration the downloader was started with
    pub fn config(&self) -> &Config {
        &self.config
    }
}
