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

//! Schema migrations for the SQLite store.
//!
//! ## Purpose
//! Tracks the database schema version in `schema_versions` and applies
//! ordered, reversible migrations. Each migration executes together with
//! its bookkeeping row inside a single SQL transaction, so a failed
//! migration leaves the version table untouched.

use crate::{now_timestamp, StorageError, StorageResult};
use futures::future::BoxFuture;
use sqlx::{Executor, Row, SqliteConnection, SqlitePool};

/// Programmatic migration step run inside the migration's transaction.
pub type MigrationFunc =
    for<'c> fn(&'c mut SqliteConnection) -> BoxFuture<'c, StorageResult<()>>;

/// A single schema migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Schema version this migration produces when applied.
    pub version: i64,
    /// Human-readable summary, stored in `schema_versions`.
    pub description: String,
    /// SQL applied on upgrade (may hold multiple statements).
    pub up_sql: Option<String>,
    /// SQL applied on downgrade.
    pub down_sql: Option<String>,
    /// Programmatic upgrade step, run after `up_sql` when both are set.
    pub up_func: Option<MigrationFunc>,
    /// Programmatic downgrade step.
    pub down_func: Option<MigrationFunc>,
}

impl Migration {
    /// Build a SQL-only migration.
    pub fn sql(
        version: i64,
        description: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: impl Into<String>,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            up_sql: Some(up_sql.into()),
            down_sql: Some(down_sql.into()),
            up_func: None,
            down_func: None,
        }
    }

    fn has_up(&self) -> bool {
        self.up_sql.is_some() || self.up_func.is_some()
    }

    fn has_down(&self) -> bool {
        self.down_sql.is_some() || self.down_func.is_some()
    }
}

/// A row from the `schema_versions` table.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    /// Applied schema version.
    pub version: i64,
    /// Description recorded when it was applied.
    pub description: String,
    /// Unix timestamp of application.
    pub applied_at: i64,
}

/// Result of [`MigrationManager::status`].
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Highest applied version (0 for a fresh database).
    pub current_version: i64,
    /// Highest registered version.
    pub latest_version: i64,
    /// Number of registered migrations not yet applied.
    pub pending_count: usize,
    /// Whether an upgrade is needed.
    pub needs_migration: bool,
    /// Pending migrations as `(version, description)` pairs.
    pub pending: Vec<(i64, String)>,
}

/// Manages ordered schema migrations over a SQLite pool.
#[derive(Debug, Clone)]
pub struct MigrationManager {
    pool: SqlitePool,
    migrations: Vec<Migration>,
}

impl MigrationManager {
    /// Create a manager pre-loaded with the built-in migrations.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            migrations: builtin_migrations(),
        }
    }

    /// Create a manager with no registered migrations.
    pub fn empty(pool: SqlitePool) -> Self {
        Self {
            pool,
            migrations: Vec::new(),
        }
    }

    /// Register an additional migration, keeping the list version-sorted.
    pub fn add_migration(&mut self, migration: Migration) {
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version);
    }

    /// Registered migrations in version order.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Check the registered migrations: versions must be positive and
    /// strictly increasing, descriptions non-empty, and every migration
    /// must define an up action.
    pub fn validate(&self) -> StorageResult<()> {
        let mut prev = 0i64;
        for m in &self.migrations {
            if m.version <= 0 {
                return Err(StorageError::MigrationError(format!(
                    "migration version must be positive, got {}",
                    m.version
                )));
            }
            if m.version <= prev {
                return Err(StorageError::MigrationError(format!(
                    "migration versions must be strictly increasing: {} after {}",
                    m.version, prev
                )));
            }
            if m.description.trim().is_empty() {
                return Err(StorageError::MigrationError(format!(
                    "migration {} has an empty description",
                    m.version
                )));
            }
            if !m.has_up() {
                return Err(StorageError::MigrationError(format!(
                    "migration {} has no up action",
                    m.version
                )));
            }
            prev = m.version;
        }
        Ok(())
    }

    async fn ensure_version_table(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Highest applied schema version; 0 for a fresh database.
    pub async fn current_version(&self) -> StorageResult<i64> {
        self.ensure_version_table().await?;
        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS version FROM schema_versions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("version"))
    }

    /// Highest registered version; 0 when no migrations are registered.
    pub fn latest_version(&self) -> i64 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    /// Apply all migrations up to and including `target`.
    pub async fn migrate_up(&self, target: i64) -> StorageResult<()> {
        self.validate()?;
        let current = self.current_version().await?;

        for m in self
            .migrations
            .iter()
            .filter(|m| m.version > current && m.version <= target)
        {
            tracing::info!(version = m.version, description = %m.description, "applying migration");
            let mut tx = self.pool.begin().await?;
            if let Some(sql) = &m.up_sql {
                // Equivalent to `raw_sql(sql).execute(&mut *tx)`, but the
                // inverted call keeps the future `Send` (rustc can't prove
                // it for `RawSql::execute`'s extra `'q: 'e` bound).
                (&mut *tx).execute(sqlx::raw_sql(sql)).await?;
            }
            if let Some(func) = m.up_func {
                func(&mut *tx).await?;
            }
            sqlx::query(
                "INSERT INTO schema_versions (version, description, applied_at) VALUES (?, ?, ?)",
            )
            .bind(m.version)
            .bind(&m.description)
            .bind(now_timestamp())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Revert migrations down to (and keeping) `target`.
    pub async fn migrate_down(&self, target: i64) -> StorageResult<()> {
        self.validate()?;
        let current = self.current_version().await?;

        for m in self
            .migrations
            .iter()
            .rev()
            .filter(|m| m.version <= current && m.version > target)
        {
            if !m.has_down() {
                return Err(StorageError::MigrationError(format!(
                    "migration {} is not reversible",
                    m.version
                )));
            }
            tracing::info!(version = m.version, description = %m.description, "reverting migration");
            let mut tx = self.pool.begin().await?;
            if let Some(sql) = &m.down_sql {
                // See migrate_up for why the call is inverted.
                (&mut *tx).execute(sqlx::raw_sql(sql)).await?;
            }
            if let Some(func) = m.down_func {
                func(&mut *tx).await?;
            }
            sqlx::query("DELETE FROM schema_versions WHERE version = ?")
                .bind(m.version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Migrate up or down to `target`, whichever applies. A no-op when the
    /// database is already at `target`.
    pub async fn migrate_to(&self, target: i64) -> StorageResult<()> {
        let current = self.current_version().await?;
        if target > current {
            self.migrate_up(target).await
        } else if target < current {
            self.migrate_down(target).await
        } else {
            Ok(())
        }
    }

    /// Apply every pending migration. A no-op when already current.
    pub async fn migrate_to_latest(&self) -> StorageResult<()> {
        let latest = self.latest_version();
        let current = self.current_version().await?;
        if current >= latest {
            return Ok(());
        }
        self.migrate_up(latest).await
    }

    /// Summarize applied vs. registered migrations.
    pub async fn status(&self) -> StorageResult<MigrationStatus> {
        let current_version = self.current_version().await?;
        let latest_version = self.latest_version();
        let pending: Vec<(i64, String)> = self
            .migrations
            .iter()
            .filter(|m| m.version > current_version)
            .map(|m| (m.version, m.description.clone()))
            .collect();

        Ok(MigrationStatus {
            current_version,
            latest_version,
            pending_count: pending.len(),
            needs_migration: !pending.is_empty(),
            pending,
        })
    }

    /// History of applied migrations in version order.
    pub async fn applied_migrations(&self) -> StorageResult<Vec<MigrationRecord>> {
        self.ensure_version_table().await?;
        let rows = sqlx::query(
            "SELECT version, description, applied_at FROM schema_versions ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| MigrationRecord {
                version: row.get("version"),
                description: row.get("description"),
                applied_at: row.get("applied_at"),
            })
            .collect())
    }
}

/// The migrations every database managed by this crate goes through.
fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration::sql(
            1,
            "initial schema",
            r#"
            CREATE TABLE IF NOT EXISTS storage_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expire_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_storage_entries_expire_at
                ON storage_entries(expire_at) WHERE expire_at IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_storage_entries_created_at
                ON storage_entries(created_at);
            CREATE INDEX IF NOT EXISTS idx_storage_entries_updated_at
                ON storage_entries(updated_at);
            "#,
            "DROP TABLE IF EXISTS storage_entries;",
        ),
        Migration::sql(
            2,
            "add storage metadata table",
            r#"
            CREATE TABLE IF NOT EXISTS storage_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
            "DROP TABLE IF EXISTS storage_metadata;",
        ),
        Migration::sql(
            3,
            "add backup records table",
            r#"
            CREATE TABLE IF NOT EXISTS storage_backups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                backup_type TEXT NOT NULL,
                format TEXT NOT NULL,
                path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                checksum TEXT NOT NULL DEFAULT '',
                entry_count INTEGER NOT NULL DEFAULT 0,
                compressed INTEGER NOT NULL DEFAULT 0,
                encrypted INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            );
            "#,
            "DROP TABLE IF EXISTS storage_backups;",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;

    async fn test_pool(dir: &TempDir) -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(dir.path().join("migrations.db"))
                    .create_if_missing(true),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrate_to_latest_from_fresh_database() {
        let dir = TempDir::new().unwrap();
        let manager = MigrationManager::new(test_pool(&dir).await);

        assert_eq!(manager.current_version().await.unwrap(), 0);
        manager.migrate_to_latest().await.unwrap();
        assert_eq!(manager.current_version().await.unwrap(), 3);

        // Second run is a no-op
        manager.migrate_to_latest().await.unwrap();

        let history = manager.applied_migrations().await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[2].description, "add backup records table");
    }

    #[tokio::test]
    async fn test_status_reports_pending() {
        let dir = TempDir::new().unwrap();
        let manager = MigrationManager::new(test_pool(&dir).await);

        let status = manager.status().await.unwrap();
        assert_eq!(status.current_version, 0);
        assert_eq!(status.latest_version, 3);
        assert_eq!(status.pending_count, 3);
        assert!(status.needs_migration);

        manager.migrate_up(2).await.unwrap();
        let status = manager.status().await.unwrap();
        assert_eq!(status.current_version, 2);
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.pending[0].0, 3);
    }

    #[tokio::test]
    async fn test_migrate_down() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let manager = MigrationManager::new(pool.clone());

        manager.migrate_to_latest().await.unwrap();
        manager.migrate_to(1).await.unwrap();
        assert_eq!(manager.current_version().await.unwrap(), 1);

        // The backups table is gone after reverting v3
        let err = sqlx::query("SELECT COUNT(*) FROM storage_backups")
            .fetch_one(&pool)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_sets() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;

        let mut manager = MigrationManager::empty(pool.clone());
        manager.add_migration(Migration::sql(0, "bad version", "SELECT 1;", ""));
        assert!(matches!(
            manager.validate(),
            Err(StorageError::MigrationError(_))
        ));

        let mut manager = MigrationManager::empty(pool.clone());
        manager.add_migration(Migration::sql(1, "a", "SELECT 1;", ""));
        manager.add_migration(Migration::sql(1, "duplicate", "SELECT 1;", ""));
        assert!(manager.validate().is_err());

        let mut manager = MigrationManager::empty(pool.clone());
        manager.add_migration(Migration::sql(1, "   ", "SELECT 1;", ""));
        assert!(manager.validate().is_err());

        let mut manager = MigrationManager::empty(pool);
        manager.add_migration(Migration {
            version: 1,
            description: "no up action".to_string(),
            up_sql: None,
            down_sql: None,
            up_func: None,
            down_func: None,
        });
        assert!(manager.validate().is_err());
    }

    #[tokio::test]
    async fn test_custom_migration_ordering() {
        let dir = TempDir::new().unwrap();
        let mut manager = MigrationManager::new(test_pool(&dir).await);

        manager.add_migration(Migration::sql(
            4,
            "add play counts",
            "CREATE TABLE IF NOT EXISTS play_counts (key TEXT PRIMARY KEY, count INTEGER);",
            "DROP TABLE IF EXISTS play_counts;",
        ));

        manager.migrate_to_latest().await.unwrap();
        assert_eq!(manager.current_version().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back_version_row() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let mut manager = MigrationManager::empty(pool);
        manager.add_migration(Migration::sql(1, "broken", "THIS IS NOT SQL;", ""));

        assert!(manager.migrate_to_latest().await.is_err());
        assert_eq!(manager.current_version().await.unwrap(), 0);
    }
}

