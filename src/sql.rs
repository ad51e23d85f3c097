// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Plugstore.
//
// Plugstore is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Plugstore is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Plugstore. If not, see <https://www.gnu.org/licenses/>.

//! SQLite storage backend.
//!
//! ## Purpose
//! Provides persistent, queryable storage over a `sqlx` SQLite pool.
//!
//! ## Features
//! - **Persistent**: data survives process restarts
//! - **TTL support**: liveness predicate on every read plus a periodic
//!   bulk sweep of expired rows
//! - **Batched writes**: `set_batch`/`delete_batch` run in one SQL
//!   transaction
//! - **Pattern queries**: `find`/`count`/`keys` translate the `*` wildcard
//!   to an escaped `LIKE`
//!
//! ## Schema
//! ```sql
//! CREATE TABLE storage_entries (
//!     key TEXT PRIMARY KEY,
//!     value TEXT NOT NULL,           -- JSON
//!     expire_at INTEGER,             -- unix seconds, NULL = no expiry
//!     created_at INTEGER NOT NULL,
//!     updated_at INTEGER NOT NULL
//! );
//! ```
//! Pool sizing and pragmas (journal mode, synchronous, busy timeout, cache
//! size, auto vacuum, foreign keys) come from [`SqliteBackendConfig`] and
//! are applied when the pool is opened.

use crate::pattern::KeyPattern;
use crate::{
    now_timestamp, validate_key, BackendStats, OpCounters, StorageBackend, StorageError,
    StorageResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// Period of the bulk delete of expired rows.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Configuration for [`SqliteBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteBackendConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Maximum pool connections.
    pub max_connections: u32,
    /// Journal mode pragma ("WAL", "DELETE", ...).
    pub journal_mode: String,
    /// Synchronous pragma ("NORMAL", "FULL", ...).
    pub synchronous: String,
    /// Page cache size in KiB.
    pub cache_size_kb: u32,
    /// Busy timeout before a locked database errors out.
    pub busy_timeout: Duration,
    /// Auto-vacuum pragma ("NONE", "FULL", "INCREMENTAL").
    pub auto_vacuum: String,
    /// Enforce foreign keys.
    pub foreign_keys: bool,
}

impl Default for SqliteBackendConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/storage.db"),
            max_connections: 10,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size_kb: 8192,
            busy_timeout: Duration::from_secs(30),
            auto_vacuum: "FULL".to_string(),
            foreign_keys: true,
        }
    }
}

impl SqliteBackendConfig {
    fn connect_options(&self) -> StorageResult<SqliteConnectOptions> {
        let journal_mode: SqliteJournalMode = self
            .journal_mode
            .parse()
            .map_err(|_| StorageError::ConfigError(format!(
                "invalid journal_mode: {}",
                self.journal_mode
            )))?;
        let synchronous: SqliteSynchronous = self
            .synchronous
            .parse()
            .map_err(|_| StorageError::ConfigError(format!(
                "invalid synchronous: {}",
                self.synchronous
            )))?;
        let auto_vacuum: SqliteAutoVacuum = self
            .auto_vacuum
            .parse()
            .map_err(|_| StorageError::ConfigError(format!(
                "invalid auto_vacuum: {}",
                self.auto_vacuum
            )))?;

        Ok(SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .synchronous(synchronous)
            .auto_vacuum(auto_vacuum)
            .busy_timeout(self.busy_timeout)
            .foreign_keys(self.foreign_keys)
            // Negative cache_size selects KiB instead of pages.
            .pragma("cache_size", format!("-{}", self.cache_size_kb)))
    }
}

/// SQLite-based storage backend.
///
/// ## Example
/// ```rust,no_run
/// use plugstore::{SqliteBackend, SqliteBackendConfig, StorageBackend};
/// use serde_json::json;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = SqliteBackend::new(SqliteBackendConfig::default());
/// backend.initialize().await?;
///
/// backend.set("key", json!("value"), Duration::ZERO).await?;
/// assert_eq!(backend.get("key").await?, json!("value"));
/// backend.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SqliteBackend {
    config: SqliteBackendConfig,
    pool: Arc<RwLock<Option<SqlitePool>>>,
    counters: Arc<OpCounters>,
    shutdown: watch::Sender<bool>,
}

impl SqliteBackend {
    /// Create a new SQLite backend. Call
    /// [`initialize`](StorageBackend::initialize) before use.
    pub fn new(config: SqliteBackendConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            pool: Arc::new(RwLock::new(None)),
            counters: Arc::new(OpCounters::default()),
            shutdown,
        }
    }

    /// The live pool, or `BackendClosed` when uninitialized or closed.
    pub(crate) async fn pool_handle(&self) -> StorageResult<SqlitePool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(StorageError::BackendClosed)
    }

    async fn create_schema(pool: &SqlitePool) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS storage_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expire_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_storage_entries_expire_at \
             ON storage_entries(expire_at) WHERE expire_at IS NOT NULL",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_storage_entries_created_at \
             ON storage_entries(created_at)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_storage_entries_updated_at \
             ON storage_entries(updated_at)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Seed the version table so a fresh database reports version 1.
        sqlx::query(
            "INSERT INTO schema_versions (version, description, applied_at) \
             SELECT 1, 'initial schema', ? \
             WHERE NOT EXISTS (SELECT 1 FROM schema_versions)",
        )
        .bind(now_timestamp())
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Bulk delete of expired rows; returns the number removed.
    async fn sweep_expired(pool: &SqlitePool) -> StorageResult<u64> {
        let result = sqlx::query(
            "DELETE FROM storage_entries WHERE expire_at IS NOT NULL AND expire_at <= ?",
        )
        .bind(now_timestamp())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    fn upsert_sql() -> &'static str {
        r#"
        INSERT INTO storage_entries (key, value, expire_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            expire_at = excluded.expire_at,
            updated_at = excluded.updated_at
        "#
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn initialize(&self) -> StorageResult<()> {
        let mut slot = self.pool.write().await;
        if slot.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(self.config.max_connections)
            .connect_with(self.config.connect_options()?)
            .await?;

        Self::create_schema(&pool).await?;

        let sweep_pool = pool.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match Self::sweep_expired(&sweep_pool).await {
                            Ok(0) => {}
                            Ok(removed) => {
                                tracing::debug!(removed, "sqlite backend sweep removed expired rows");
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "sqlite backend sweep failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *slot = Some(pool);
        tracing::info!(path = %self.config.path.display(), "sqlite backend initialized");
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            let _ = self.shutdown.send(true);
            pool.close().await;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Value> {
        let pool = self.pool_handle().await?;
        self.counters.record_read();

        let row = sqlx::query(
            "SELECT value FROM storage_entries \
             WHERE key = ? AND (expire_at IS NULL OR expire_at > ?)",
        )
        .bind(key)
        .bind(now_timestamp())
        .fetch_optional(&pool)
        .await?;

        match row {
            Some(row) => Ok(serde_json::from_str(&row.get::<String, _>("value"))?),
            None => Err(StorageError::KeyNotFound(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> StorageResult<()> {
        let pool = self.pool_handle().await?;
        validate_key(key)?;
        self.counters.record_write();

        let now = now_timestamp();
        sqlx::query(Self::upsert_sql())
            .bind(key)
            .bind(serde_json::to_string(&value)?)
            .bind(crate::expiry_from_ttl(ttl))
            .bind(now)
            .bind(now)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let pool = self.pool_handle().await?;
        self.counters.record_delete();

        sqlx::query("DELETE FROM storage_entries WHERE key = ?")
            .bind(key)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let pool = self.pool_handle().await?;
        self.counters.record_read();

        let row = sqlx::query(
            "SELECT 1 FROM storage_entries \
             WHERE key = ? AND (expire_at IS NULL OR expire_at > ?)",
        )
        .bind(key)
        .bind(now_timestamp())
        .fetch_optional(&pool)
        .await?;
        Ok(row.is_some())
    }

    async fn get_batch(&self, keys: &[String]) -> StorageResult<HashMap<String, Value>> {
        let pool = self.pool_handle().await?;
        self.counters.record_read();

        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "SELECT key, value FROM storage_entries \
             WHERE key IN ({placeholders}) AND (expire_at IS NULL OR expire_at > ?)"
        );
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key);
        }
        let rows = query.bind(now_timestamp()).fetch_all(&pool).await?;

        let mut results = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let value: Value = serde_json::from_str(&row.get::<String, _>("value"))?;
            results.insert(key, value);
        }
        Ok(results)
    }

    async fn set_batch(
        &self,
        entries: &HashMap<String, Value>,
        ttl: Duration,
    ) -> StorageResult<()> {
        let pool = self.pool_handle().await?;
        for key in entries.keys() {
            validate_key(key)?;
        }
        self.counters.record_write();

        if entries.is_empty() {
            return Ok(());
        }

        let now = now_timestamp();
        let expire_at = crate::expiry_from_ttl(ttl);
        let mut tx = pool.begin().await?;
        for (key, value) in entries {
            sqlx::query(Self::upsert_sql())
                .bind(key)
                .bind(serde_json::to_string(value)?)
                .bind(expire_at)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        let pool = self.pool_handle().await?;
        self.counters.record_delete();

        if keys.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!("DELETE FROM storage_entries WHERE key IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key);
        }
        query.execute(&pool).await?;
        Ok(())
    }

    async fn find(&self, pattern: &str, limit: usize) -> StorageResult<HashMap<String, Value>> {
        let pool = self.pool_handle().await?;
        self.counters.record_read();

        let like = KeyPattern::parse(pattern).to_sql_like();
        let mut sql = String::from(
            "SELECT key, value FROM storage_entries \
             WHERE key LIKE ? ESCAPE '\\' AND (expire_at IS NULL OR expire_at > ?)",
        );
        if limit > 0 {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(like).bind(now_timestamp());
        if limit > 0 {
            query = query.bind(limit as i64);
        }
        let rows = query.fetch_all(&pool).await?;

        let mut results = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let value: Value = serde_json::from_str(&row.get::<String, _>("value"))?;
            results.insert(key, value);
        }
        Ok(results)
    }

    async fn count(&self, pattern: &str) -> StorageResult<usize> {
        let pool = self.pool_handle().await?;
        self.counters.record_read();

        let like = KeyPattern::parse(pattern).to_sql_like();
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM storage_entries \
             WHERE key LIKE ? ESCAPE '\\' AND (expire_at IS NULL OR expire_at > ?)",
        )
        .bind(like)
        .bind(now_timestamp())
        .fetch_one(&pool)
        .await?;
        Ok(row.get::<i64, _>("count") as usize)
    }

    async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>> {
        let pool = self.pool_handle().await?;
        self.counters.record_read();

        let like = KeyPattern::parse(pattern).to_sql_like();
        let rows = sqlx::query(
            "SELECT key FROM storage_entries \
             WHERE key LIKE ? ESCAPE '\\' AND (expire_at IS NULL OR expire_at > ?) \
             ORDER BY key",
        )
        .bind(like)
        .bind(now_timestamp())
        .fetch_all(&pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.get("key")).collect())
    }

    async fn stats(&self) -> StorageResult<BackendStats> {
        let pool = self.pool_handle().await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS count, SUM(LENGTH(key) + LENGTH(value)) AS size \
             FROM storage_entries WHERE expire_at IS NULL OR expire_at > ?",
        )
        .bind(now_timestamp())
        .fetch_one(&pool)
        .await?;

        Ok(BackendStats {
            backend_type: "sqlite".to_string(),
            key_count: row.get::<i64, _>("count") as usize,
            storage_size_bytes: row.get::<Option<i64>, _>("size").unwrap_or(0) as u64,
            read_count: self.counters.reads(),
            write_count: self.counters.writes(),
            delete_count: self.counters.deletes(),
            last_access: self.counters.last_access(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> SqliteBackendConfig {
        SqliteBackendConfig {
            path: dir.path().join("test.db"),
            max_connections: 2,
            ..SqliteBackendConfig::default()
        }
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend
            .set("key1", json!({"a": [1, 2]}), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(backend.get("key1").await.unwrap(), json!({"a": [1, 2]}));
        assert!(backend.exists("key1").await.unwrap());

        backend.delete("key1").await.unwrap();
        assert!(matches!(
            backend.get("key1").await,
            Err(StorageError::KeyNotFound(_))
        ));

        // Idempotent delete
        backend.delete("key1").await.unwrap();
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ttl_predicate() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend
            .set("short", json!(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(backend.exists("short").await.unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        // The row may still be on disk, but every read filters it out.
        assert!(!backend.exists("short").await.unwrap());
        assert!(matches!(
            backend.get("short").await,
            Err(StorageError::KeyNotFound(_))
        ));
        assert_eq!(backend.count("*").await.unwrap(), 0);

        let removed = SqliteBackend::sweep_expired(&backend.pool_handle().await.unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_preserves_created_at() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend.set("k", json!(1), Duration::ZERO).await.unwrap();
        let pool = backend.pool_handle().await.unwrap();
        let created: i64 = sqlx::query("SELECT created_at FROM storage_entries WHERE key = 'k'")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);

        backend.set("k", json!(2), Duration::ZERO).await.unwrap();
        let after: i64 = sqlx::query("SELECT created_at FROM storage_entries WHERE key = 'k'")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(created, after);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        let mut entries = HashMap::new();
        for i in 0..5 {
            entries.insert(format!("batch:{i}"), json!(i));
        }
        backend.set_batch(&entries, Duration::ZERO).await.unwrap();

        let keys: Vec<String> = (0..6).map(|i| format!("batch:{i}")).collect();
        let found = backend.get_batch(&keys).await.unwrap();
        assert_eq!(found.len(), 5);
        assert_eq!(found["batch:3"], json!(3));

        backend.delete_batch(&keys[..2].to_vec()).await.unwrap();
        assert_eq!(backend.count("batch:*").await.unwrap(), 3);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pattern_queries() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend.set("song:1", json!("a"), Duration::ZERO).await.unwrap();
        backend.set("song:2", json!("b"), Duration::ZERO).await.unwrap();
        backend.set("list:1", json!("c"), Duration::ZERO).await.unwrap();
        // Key with LIKE metacharacters must be matched literally.
        backend
            .set("odd%_key", json!("d"), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(backend.count("song:*").await.unwrap(), 2);
        assert_eq!(
            backend.keys("song:*").await.unwrap(),
            vec!["song:1".to_string(), "song:2".to_string()]
        );
        assert_eq!(backend.find("song:*", 1).await.unwrap().len(), 1);

        // "odd%_key" matches only itself, and "odd*" still finds it.
        assert_eq!(backend.count("odd%_key").await.unwrap(), 1);
        assert_eq!(backend.count("odd*").await.unwrap(), 1);
        assert_eq!(backend.count("o%_*").await.unwrap(), 0);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        assert!(matches!(
            backend.set("", json!(1), Duration::ZERO).await,
            Err(StorageError::InvalidKey(_))
        ));

        let mut entries = HashMap::new();
        entries.insert(String::new(), json!(1));
        assert!(matches!(
            backend.set_batch(&entries, Duration::ZERO).await,
            Err(StorageError::InvalidKey(_))
        ));
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();
        backend.close().await.unwrap();
        backend.close().await.unwrap();

        assert!(matches!(
            backend.get("k").await,
            Err(StorageError::BackendClosed)
        ));
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend.set("k1", json!("v1"), Duration::ZERO).await.unwrap();
        backend.set("k2", json!("v2"), Duration::ZERO).await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.backend_type, "sqlite");
        assert_eq!(stats.key_count, 2);
        assert_eq!(stats.write_count, 2);
        assert!(stats.storage_size_bytes > 0);
        backend.close().await.unwrap();
    }
}
