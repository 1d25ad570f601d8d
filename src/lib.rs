//! # chapter-dl
//!
//! Backend library for downloading manga chapters and keeping them intact.
//!
//! ## Design Philosophy
//!
//! chapter-dl is designed to be:
//! - **Durable** - The download queue survives restarts, including work that was in flight
//! - **Bounded** - A live concurrency ceiling limits simultaneous downloads
//! - **Self-healing** - Downloaded chapters are validated and repaired through the same queue
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use chapter_dl::{ChapterDownloader, ChapterRef, Config, StaticCatalog};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = StaticCatalog::new().with_title(
//!         "one-piece",
//!         vec![ChapterRef::new("1", "https://example.com/one-piece/1/pages.json", "Romance Dawn")],
//!     );
//!     let downloader = ChapterDownloader::new(Config::default(), Arc::new(catalog)).await?;
//!
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     downloader.batch().start_batch_download("one-piece", None).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Batch Orchestrator
pub mod batch;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Composition root and lifecycle
pub mod downloader;
/// Error types
pub mod error;
/// Executor interface and the HTTP executor
pub mod executor;
/// Integrity validation and repair
pub mod integrity;
/// On-disk chapter layout
pub mod library;
/// Download Queue Scheduler
pub mod queue;
/// Retry logic with exponential backoff
pub mod retry;
/// Runtime settings provider
pub mod settings;
/// Persistent Queue Store
pub mod store;
/// Core types and events
pub mod types;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use batch::{BatchOrchestrator, BatchProgress, BatchState, ChapterCatalog, ChapterRef, StaticCatalog};
pub use config::Config;
pub use db::Database;
pub use downloader::ChapterDownloader;
pub use error::{DownloadError, Error, FailureKind, IntegrityError, Result, StorageError};
pub use executor::{DownloadContext, DownloadExecutor, HttpExecutor, JsonPageSource, PageSource};
pub use integrity::{
    CorruptionNotifier, IntegrityManager, IntegrityReport, LogNotifier, RecommendedAction,
    RepairOutcome, ValidationOptions, ValidationResult,
};
pub use library::{ChapterLibrary, ChapterManifest};
pub use queue::{QueueActor, QueueHandle};
pub use settings::{RuntimeSettings, SettingsProvider, StaticSettings};
pub use store::{MemoryQueueStore, PersistedQueue, QueueStore, SqliteQueueStore};
pub use types::{Event, FailureReport, ItemId, ItemScope, ProgressInfo, QueueItem, QueueSnapshot};

/// Helper function to run the downloader with graceful signal handling.
///
/// Waits for a termination signal and then calls the downloader's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use chapter_dl::{ChapterDownloader, Config, StaticCatalog, run_with_shutdown};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let downloader = ChapterDownloader::new(Config::default(), Arc::new(StaticCatalog::new())).await?;
///     run_with_shutdown(downloader).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(downloader: ChapterDownloader) -> Result<()> {
    wait_for_signal().await;
    downloader.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // registration can fail in restricted environments (containers, tests)
    let sigterm = signal(SignalKind::terminate());
    let sigint = signal(SignalKind::interrupt());

    match (sigterm, sigint) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C signal"),
    }
}
