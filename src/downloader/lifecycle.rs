//! Startup and shutdown coordination.

use super::ChapterDownloader;
use crate::error::Result;
use crate::types::Event;
use std::time::Duration;

/// How long to wait for background tasks to stop
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

impl ChapterDownloader {
    /// Gracefully shut down the downloader
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops background validation and verify-on-complete
    /// 2. Persists a final queue snapshot and stops the queue actor
    /// 3. Cancels in-flight transfers; they are restored to pending next start
    /// 4. Marks a clean shutdown and emits [`Event::Shutdown`]
    ///
    /// Every step is attempted even if an earlier one fails.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.background.cancel();

        if let Err(e) = self.queue.shutdown().await {
            // already stopped
            tracing::debug!(error = %e, "Queue actor not running");
        }

        self.executor.cancel_all();
        tracing::info!("Signalled cancellation to in-flight downloads");

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let joined = tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, futures::future::join_all(tasks)).await;
        if joined.is_err() {
            tracing::warn!("Timeout waiting for background tasks, proceeding with shutdown");
        }

        if let Err(e) = self.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown in database");
        } else {
            tracing::info!("Marked clean shutdown in database");
        }

        self.event_tx.send(Event::Shutdown).ok();
        self.db.close().await;

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
