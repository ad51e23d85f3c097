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

//! Local storage backend: SQLite with migrations and backups.
//!
//! ## Purpose
//! The full-featured persistent backend. It wraps [`SqliteBackend`] and
//! wires in the [`MigrationManager`] and [`BackupManager`], plus database
//! maintenance (VACUUM, ANALYZE, size introspection).
//!
//! ## Initialization Order
//! `initialize` is strict about sequencing: the SQLite backend comes up
//! first, then migrations are validated (a validation failure is fatal) and
//! optionally applied, then the backup manager is prepared, and only then
//! does the optional auto-backup loop start.

use crate::backup::{BackupFormat, BackupInfo, BackupManager, BackupOptions, BackupType};
use crate::migration::{Migration, MigrationManager, MigrationRecord, MigrationStatus};
use crate::{BackendStats, StorageBackend, StorageError, StorageResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// Name prefix of backups created by the auto-backup loop.
const AUTO_BACKUP_PREFIX: &str = "auto_backup_";

/// Configuration for [`LocalStorageBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    /// Inner SQLite backend configuration.
    pub sqlite: crate::SqliteBackendConfig,
    /// Directory for backup files.
    pub backup_dir: PathBuf,
    /// Apply pending migrations during `initialize`.
    pub auto_migrate: bool,
    /// Run the periodic auto-backup loop.
    pub auto_backup: bool,
    /// Period of the auto-backup loop.
    pub backup_interval: Duration,
    /// How many auto-backups to retain; older ones are pruned.
    pub max_backups: usize,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            sqlite: crate::SqliteBackendConfig::default(),
            backup_dir: PathBuf::from("./data/backups"),
            auto_migrate: true,
            auto_backup: false,
            backup_interval: Duration::from_secs(24 * 60 * 60),
            max_backups: 7,
        }
    }
}

/// Database size and schema introspection.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    /// `page_count * page_size`.
    pub size_bytes: u64,
    /// SQLite page count.
    pub page_count: i64,
    /// SQLite page size in bytes.
    pub page_size: i64,
    /// Number of tables.
    pub table_count: i64,
    /// Number of indexes.
    pub index_count: i64,
    /// Current schema version.
    pub schema_version: i64,
}

struct Managers {
    migrations: MigrationManager,
    backups: BackupManager,
}

/// SQLite storage backend with schema migrations and backups.
#[derive(Clone)]
pub struct LocalStorageBackend {
    config: LocalStorageConfig,
    inner: crate::SqliteBackend,
    managers: Arc<RwLock<Option<Managers>>>,
    shutdown: watch::Sender<bool>,
}

impl LocalStorageBackend {
    /// Create a new local backend. Call
    /// [`initialize`](StorageBackend::initialize) before use.
    pub fn new(config: LocalStorageConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = crate::SqliteBackend::new(config.sqlite.clone());
        Self {
            config,
            inner,
            managers: Arc::new(RwLock::new(None)),
            shutdown,
        }
    }

    async fn migration_manager(&self) -> StorageResult<MigrationManager> {
        self.managers
            .read()
            .await
            .as_ref()
            .map(|m| m.migrations.clone())
            .ok_or(StorageError::BackendClosed)
    }

    async fn backup_manager(&self) -> StorageResult<BackupManager> {
        self.managers
            .read()
            .await
            .as_ref()
            .map(|m| m.backups.clone())
            .ok_or(StorageError::BackendClosed)
    }

    /// Register an extra migration (before or after `initialize`; pending
    /// migrations apply on the next `migrate_to_latest`).
    pub async fn add_migration(&self, migration: Migration) -> StorageResult<()> {
        let mut managers = self.managers.write().await;
        match managers.as_mut() {
            Some(m) => {
                m.migrations.add_migration(migration);
                Ok(())
            }
            None => Err(StorageError::BackendClosed),
        }
    }

    /// Current vs. registered migration state.
    pub async fn migration_status(&self) -> StorageResult<MigrationStatus> {
        self.migration_manager().await?.status().await
    }

    /// Migrate the schema up or down to `version`.
    pub async fn migrate_to(&self, version: i64) -> StorageResult<()> {
        self.migration_manager().await?.migrate_to(version).await
    }

    /// Apply every pending migration.
    pub async fn migrate_to_latest(&self) -> StorageResult<()> {
        self.migration_manager().await?.migrate_to_latest().await
    }

    /// History of applied migrations.
    pub async fn applied_migrations(&self) -> StorageResult<Vec<MigrationRecord>> {
        self.migration_manager().await?.applied_migrations().await
    }

    /// Create a backup; see [`BackupManager::create_backup`].
    pub async fn create_backup(&self, options: &BackupOptions) -> StorageResult<BackupInfo> {
        self.backup_manager().await?.create_backup(options).await
    }

    /// Restore a JSON backup; see [`BackupManager::restore_backup`].
    pub async fn restore_backup(&self, id: &str, password: Option<&str>) -> StorageResult<usize> {
        self.backup_manager().await?.restore_backup(id, password).await
    }

    /// All backup records, newest first.
    pub async fn list_backups(&self) -> StorageResult<Vec<BackupInfo>> {
        self.backup_manager().await?.list_backups().await
    }

    /// Look up one backup record.
    pub async fn get_backup(&self, id: &str) -> StorageResult<Option<BackupInfo>> {
        self.backup_manager().await?.get_backup(id).await
    }

    /// Delete a backup file and its record.
    pub async fn delete_backup(&self, id: &str) -> StorageResult<()> {
        self.backup_manager().await?.delete_backup(id).await
    }

    /// Reclaim free pages (`VACUUM`).
    pub async fn compact(&self) -> StorageResult<()> {
        let pool = self.inner.pool_handle().await?;
        sqlx::query("VACUUM").execute(&pool).await?;
        Ok(())
    }

    /// Refresh the query planner statistics (`ANALYZE`).
    pub async fn analyze(&self) -> StorageResult<()> {
        let pool = self.inner.pool_handle().await?;
        sqlx::query("ANALYZE").execute(&pool).await?;
        Ok(())
    }

    /// Size and schema information about the database file.
    pub async fn database_info(&self) -> StorageResult<DatabaseInfo> {
        let pool = self.inner.pool_handle().await?;

        let page_count: i64 = sqlx::query("PRAGMA page_count")
            .fetch_one(&pool)
            .await?
            .get(0);
        let page_size: i64 = sqlx::query("PRAGMA page_size")
            .fetch_one(&pool)
            .await?
            .get(0);
        let table_count: i64 = sqlx::query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_one(&pool)
        .await?
        .get(0);
        let index_count: i64 =
            sqlx::query("SELECT COUNT(*) FROM sqlite_master WHERE type = 'index'")
                .fetch_one(&pool)
                .await?
                .get(0);
        let schema_version = self.migration_manager().await?.current_version().await?;

        Ok(DatabaseInfo {
            size_bytes: (page_count * page_size) as u64,
            page_count,
            page_size,
            table_count,
            index_count,
            schema_version,
        })
    }

    /// One pass of the auto-backup loop: take a compressed full backup and
    /// prune auto-backups beyond the retention limit.
    async fn run_auto_backup(backups: &BackupManager, max_backups: usize) -> StorageResult<()> {
        let options = BackupOptions {
            name: format!("{}{}", AUTO_BACKUP_PREFIX, crate::now_timestamp()),
            backup_type: BackupType::Full,
            format: BackupFormat::Json,
            compress: true,
            ..BackupOptions::default()
        };
        backups.create_backup(&options).await?;

        // list_backups is newest-first; everything past the limit goes.
        let auto_backups: Vec<BackupInfo> = backups
            .list_backups()
            .await?
            .into_iter()
            .filter(|b| b.name.starts_with(AUTO_BACKUP_PREFIX))
            .collect();
        for stale in auto_backups.iter().skip(max_backups) {
            if let Err(err) = backups.delete_backup(&stale.id).await {
                tracing::warn!(id = %stale.id, error = %err, "failed to prune old auto-backup");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    async fn initialize(&self) -> StorageResult<()> {
        self.inner.initialize().await?;
        let pool = self.inner.pool_handle().await?;

        let migrations = MigrationManager::new(pool.clone());
        // A broken migration set must never come up half-migrated.
        migrations.validate()?;
        if self.config.auto_migrate {
            migrations.migrate_to_latest().await?;
        }

        let backups = BackupManager::new(pool, &self.config.backup_dir);
        backups.initialize().await?;

        if self.config.auto_backup {
            let loop_backups = backups.clone();
            let interval = self.config.backup_interval;
            let max_backups = self.config.max_backups;
            let mut shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(err) = Self::run_auto_backup(&loop_backups, max_backups).await {
                                tracing::warn!(error = %err, "auto-backup failed");
                            }
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
            });
        }

        let mut managers = self.managers.write().await;
        *managers = Some(Managers {
            migrations,
            backups,
        });

        tracing::info!("local storage backend initialized");
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        let _ = self.shutdown.send(true);
        self.managers.write().await.take();
        self.inner.close().await
    }

    async fn get(&self, key: &str) -> StorageResult<Value> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> StorageResult<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn get_batch(&self, keys: &[String]) -> StorageResult<HashMap<String, Value>> {
        self.inner.get_batch(keys).await
    }

    async fn set_batch(
        &self,
        entries: &HashMap<String, Value>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.inner.set_batch(entries, ttl).await
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        self.inner.delete_batch(keys).await
    }

    async fn find(&self, pattern: &str, limit: usize) -> StorageResult<HashMap<String, Value>> {
        self.inner.find(pattern, limit).await
    }

    async fn count(&self, pattern: &str) -> StorageResult<usize> {
        self.inner.count(pattern).await
    }

    async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>> {
        self.inner.keys(pattern).await
    }

    async fn stats(&self) -> StorageResult<BackendStats> {
        let mut stats = self.inner.stats().await?;
        stats.backend_type = "local".to_string();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> LocalStorageConfig {
        LocalStorageConfig {
            sqlite: crate::SqliteBackendConfig {
                path: dir.path().join("local.db"),
                max_connections: 2,
                ..crate::SqliteBackendConfig::default()
            },
            backup_dir: dir.path().join("backups"),
            ..LocalStorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_runs_migrations() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStorageBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        let status = backend.migration_status().await.unwrap();
        assert_eq!(status.current_version, 3);
        assert!(!status.needs_migration);

        let history = backend.applied_migrations().await.unwrap();
        assert_eq!(history.len(), 3);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_operations_delegate() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStorageBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend
            .set("track:1", json!({"title": "intro"}), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            backend.get("track:1").await.unwrap(),
            json!({"title": "intro"})
        );
        assert_eq!(backend.count("track:*").await.unwrap(), 1);

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.backend_type, "local");
        assert_eq!(stats.key_count, 1);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_database_info_and_maintenance() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStorageBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend.set("k", json!(1), Duration::ZERO).await.unwrap();
        backend.compact().await.unwrap();
        backend.analyze().await.unwrap();

        let info = backend.database_info().await.unwrap();
        assert!(info.page_count > 0);
        assert!(info.page_size > 0);
        assert_eq!(info.size_bytes, (info.page_count * info.page_size) as u64);
        // storage_entries, schema_versions, storage_metadata, storage_backups
        assert!(info.table_count >= 4);
        assert_eq!(info.schema_version, 3);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_backup_passthrough() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStorageBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend.set("k", json!("v"), Duration::ZERO).await.unwrap();

        let info = backend
            .create_backup(&BackupOptions {
                name: "manual".to_string(),
                ..BackupOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(backend.list_backups().await.unwrap().len(), 1);
        assert!(backend.get_backup(&info.id).await.unwrap().is_some());

        backend.delete("k").await.unwrap();
        let restored = backend.restore_backup(&info.id, None).await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(backend.get("k").await.unwrap(), json!("v"));

        backend.delete_backup(&info.id).await.unwrap();
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrate_down_and_back() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStorageBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend.migrate_to(1).await.unwrap();
        assert_eq!(backend.migration_status().await.unwrap().current_version, 1);

        backend.migrate_to_latest().await.unwrap();
        assert_eq!(backend.migration_status().await.unwrap().current_version, 3);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_backup_loop_prunes() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.auto_backup = true;
        config.backup_interval = Duration::from_millis(300);
        config.max_backups = 1;

        let backend = LocalStorageBackend::new(config);
        backend.initialize().await.unwrap();
        backend.set("k", json!(1), Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;

        let auto_backups: Vec<_> = backend
            .list_backups()
            .await
            .unwrap()
            .into_iter()
            .filter(|b| b.name.starts_with(AUTO_BACKUP_PREFIX))
            .collect();
        assert!(!auto_backups.is_empty());
        // Retention keeps at most max_backups, plus possibly the one
        // created between the last prune and this check.
        assert!(auto_backups.len() <= 2);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStorageBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend.close().await.unwrap();
        backend.close().await.unwrap();
        assert!(matches!(
            backend.migration_status().await,
            Err(StorageError::BackendClosed)
        ));
    }
}
