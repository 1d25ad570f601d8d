//! Key-value records: durable storage for serialized snapshots.

use crate::error::StorageError;
use crate::{Error, Result};

use super::Database;

impl Database {
    /// Read the raw value stored under `key`
    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Storage(StorageError::QueryFailed(format!(
                    "Failed to read key {}: {}",
                    key, e
                )))
            })
    }

    /// Insert or replace the value stored under `key`
    pub async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
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
                "Failed to write key {}: {}",
                key, e
            )))
        })?;

        Ok(())
    }

    /// Delete the value stored under `key`; returns whether a row existed
    pub async fn delete_value(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Storage(StorageError::QueryFailed(format!(
                    "Failed to delete key {}: {}",
                    key, e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
