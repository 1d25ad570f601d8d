//! Runtime state tracking: shutdown detection and the last full validation marker.

use crate::error::StorageError;
use crate::{Error, Result};

use super::Database;

const CLEAN_SHUTDOWN_KEY: &str = "clean_shutdown";
const LAST_FULL_VALIDATION_KEY: &str = "last_full_validation";

impl Database {
    async fn get_runtime_state(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Storage(StorageError::QueryFailed(format!(
                    "Failed to read runtime state {}: {}",
                    key, e
                )))
            })
    }

    async fn set_runtime_state(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Storage(StorageError::QueryFailed(format!(
                "Failed to write runtime state {}: {}",
                key, e
            )))
        })?;

        Ok(())
    }

    /// Check if the last shutdown was unclean
    ///
    /// Returns true if the previous session did not call set_clean_shutdown(),
    /// indicating a crash or forced termination.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value = self.get_runtime_state(CLEAN_SHUTDOWN_KEY).await?;
        Ok(value.is_none_or(|v| v != "true"))
    }

    /// Mark that the application has started
    pub async fn set_clean_start(&self) -> Result<()> {
        self.set_runtime_state(CLEAN_SHUTDOWN_KEY, "false").await
    }

    /// Mark that the application is shutting down cleanly
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_runtime_state(CLEAN_SHUTDOWN_KEY, "true").await
    }

    /// Timestamp (epoch milliseconds) of the last successful full validation
    pub async fn last_full_validation(&self) -> Result<Option<i64>> {
        let value = self.get_runtime_state(LAST_FULL_VALIDATION_KEY).await?;
        match value {
            Some(v) => v.parse::<i64>().map(Some).map_err(|e| {
                Error::Storage(StorageError::CorruptRecord {
                    key: LAST_FULL_VALIDATION_KEY.to_string(),
                    reason: e.to_string(),
                })
            }),
            None => Ok(None),
        }
    }

    /// Record a successful full validation
    pub async fn set_last_full_validation(&self, epoch_millis: i64) -> Result<()> {
        self.set_runtime_state(LAST_FULL_VALIDATION_KEY, &epoch_millis.to_string())
            .await
    }
}
