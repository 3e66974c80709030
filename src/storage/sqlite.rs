// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed durable key-value store.
//!
//! One table holds every namespace (`cache:`, `ratelimit:`, `offline_queue:`,
//! `sync:`):
//!
//! ```sql
//! CREATE TABLE kv_store (
//!   kv_key     TEXT PRIMARY KEY,
//!   kv_value   TEXT NOT NULL,
//!   updated_at INTEGER NOT NULL   -- epoch millis of last write
//! )
//! ```
//!
//! Each `set` is a single upsert statement, so a value is either fully
//! written or not written at all.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::path::Path;
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{KvStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(context: &str, err: sqlx::Error) -> StorageError {
    crate::metrics::record_storage_error(context);
    StorageError::Backend(format!("{}: {}", context, err))
}

pub struct SqliteKvStore {
    pool: AnyPool,
    path: String,
}

impl SqliteKvStore {
    /// Open (or create) the store at `path` with startup-mode retry.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        install_drivers();

        let path = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path);

        let pool = retry("sqlite_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(5))
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        // Per-connection; journal_mode is stored in the file itself
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(conn).await?;
                        Ok(())
                    })
                })
                .connect(&url)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, path };
        store.enable_wal_mode().await?;
        store.init_schema().await?;

        info!(path = %store.path, "Durable key-value store opened");
        Ok(store)
    }

    /// Path of the underlying SQLite file.
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| backend("enable WAL mode", e))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                kv_key TEXT PRIMARY KEY,
                kv_value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| backend("create kv_store table", e))?;

        Ok(())
    }

    /// Number of stored keys.
    pub async fn count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM kv_store")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| backend("count", e))?;
        let n: i64 = row.try_get("n").map_err(|e| backend("count", e))?;
        Ok(n as u64)
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT kv_value FROM kv_store WHERE kv_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("get", e))?;

        match row {
            Some(row) => {
                let value: String = row.try_get("kv_value").map_err(|e| backend("get", e))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv_store (kv_key, kv_value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(kv_key) DO UPDATE SET
                kv_value = excluded.kv_value,
                updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(crate::clock::unix_now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| backend("set", e))?;

        debug!(key, bytes = value.len(), "Durable value written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE kv_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| backend("delete", e))?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // substr() avoids LIKE wildcard escaping for '_' and '%' in keys
        let rows = sqlx::query(
            "SELECT kv_key FROM kv_store WHERE substr(kv_key, 1, ?) = ? ORDER BY kv_key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("keys_with_prefix", e))?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("kv_key").map_err(|e| backend("keys_with_prefix", e)))
            .collect()
    }
}
