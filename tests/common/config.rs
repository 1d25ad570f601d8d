//! Test configuration helpers

use chapter_dl::config::RetryConfig;
use chapter_dl::{ChapterCatalog, ChapterDownloader, Config, CorruptionNotifier, HttpExecutor};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Configuration rooted in `dir` with timings that keep tests fast
///
/// - no settle delay between a callback and the next dispatch
/// - one attempt per HTTP request
/// - a short inter-batch delay for library scans
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.download_dir = dir.path().join("downloads");
    config.download.max_concurrent_downloads = 2;
    config.download.request_timeout = Duration::from_secs(5);
    config.persistence.database_path = dir.path().join("chapter-dl.db");
    config.queue.dispatch_settle_delay = Duration::ZERO;
    config.retry = RetryConfig {
        max_attempts: 1,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config.integrity.inter_batch_delay = Duration::from_millis(1);
    config.integrity.repair_timeout = Duration::from_secs(15);
    config
}

/// Start a downloader with the bundled HTTP executor
pub async fn start_downloader(
    config: Config,
    catalog: Arc<dyn ChapterCatalog>,
) -> ChapterDownloader {
    ChapterDownloader::new(config, catalog)
        .await
        .expect("Failed to create downloader")
}

/// Start a downloader that reports corruption to `notifier`
pub async fn start_downloader_with_notifier(
    config: Config,
    catalog: Arc<dyn ChapterCatalog>,
    notifier: Arc<dyn CorruptionNotifier>,
) -> ChapterDownloader {
    let library = chapter_dl::ChapterLibrary::new(config.download.download_dir.clone());
    let executor = HttpExecutor::new(&config.download, config.retry.clone(), library)
        .expect("Failed to create executor");
    ChapterDownloader::with_executor(config, catalog, Arc::new(executor), notifier)
        .await
        .expect("Failed to create downloader")
}
