//! Runtime settings consumed by the scheduler.
//!
//! The concurrency ceiling is read through [`SettingsProvider`] on every
//! dispatch cycle and never cached, so a change takes effect on the next
//! dispatch without restarting the queue.

use crate::config::DEFAULT_MAX_CONCURRENT_DOWNLOADS;
use crate::error::Result;
use tokio::sync::watch;

/// Source of the live concurrency ceiling
pub trait SettingsProvider: Send + Sync {
    /// Current `maxConcurrentDownloads`; implementations may fail
    fn max_concurrent_downloads(&self) -> Result<usize>;
}

/// Read the ceiling, falling back to the default on error or a zero value
pub(crate) fn effective_max_concurrent(provider: &dyn SettingsProvider) -> usize {
    match provider.max_concurrent_downloads() {
        Ok(0) => {
            tracing::warn!(
                default = DEFAULT_MAX_CONCURRENT_DOWNLOADS,
                "max_concurrent_downloads is 0, using default"
            );
            DEFAULT_MAX_CONCURRENT_DOWNLOADS
        }
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(
                error = %e,
                default = DEFAULT_MAX_CONCURRENT_DOWNLOADS,
                "Failed to read max_concurrent_downloads, using default"
            );
            DEFAULT_MAX_CONCURRENT_DOWNLOADS
        }
    }
}

/// Fixed ceiling, mostly useful in tests
#[derive(Debug, Clone, Copy)]
pub struct StaticSettings(pub usize);

impl SettingsProvider for StaticSettings {
    fn max_concurrent_downloads(&self) -> Result<usize> {
        Ok(self.0)
    }
}

/// Runtime-mutable settings backed by a watch channel
///
/// Cloning is cheap; all clones observe the same value.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    tx: std::sync::Arc<watch::Sender<usize>>,
    rx: watch::Receiver<usize>,
}

impl RuntimeSettings {
    /// Create settings with the given initial ceiling
    pub fn new(max_concurrent_downloads: usize) -> Self {
        let (tx, rx) = watch::channel(max_concurrent_downloads);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Change the ceiling; picked up by the next dispatch cycle
    pub fn set_max_concurrent_downloads(&self, value: usize) {
        tracing::info!(max_concurrent_downloads = value, "Updating concurrency ceiling");
        self.tx.send_replace(value);
    }

    /// Subscribe to ceiling changes
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.tx.subscribe()
    }
}

impl SettingsProvider for RuntimeSettings {
    fn max_concurrent_downloads(&self) -> Result<usize> {
        Ok(*self.rx.borrow())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSettings;

    impl SettingsProvider for FailingSettings {
        fn max_concurrent_downloads(&self) -> Result<usize> {
            Err(crate::Error::Other("settings store unavailable".into()))
        }
    }

    #[test]
    fn runtime_settings_reflect_updates_immediately() {
        let settings = RuntimeSettings::new(2);
        let clone = settings.clone();
        assert_eq!(effective_max_concurrent(&clone), 2);

        settings.set_max_concurrent_downloads(6);
        assert_eq!(effective_max_concurrent(&clone), 6);
    }

    #[test]
    fn read_failure_falls_back_to_default() {
        assert_eq!(
            effective_max_concurrent(&FailingSettings),
            DEFAULT_MAX_CONCURRENT_DOWNLOADS
        );
    }

    #[test]
    fn zero_falls_back_to_default() {
        assert_eq!(
            effective_max_concurrent(&StaticSettings(0)),
            DEFAULT_MAX_CONCURRENT_DOWNLOADS
        );
    }
}
