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

//! # Plugstore
//!
//! ## Purpose
//! An embeddable, pluggable key-value storage engine for host applications
//! that need durable local state: settings, session data, playlists, caches
//! of remote lookups, and similar single-node workloads.
//!
//! ## Key Components
//!
//! - [`StorageBackend`]: trait every backend implements
//! - [`MemoryBackend`]: HashMap-based, volatile
//! - [`FileBackend`]: single JSON document with write-back caching
//! - [`SqliteBackend`]: persistent SQLite store
//! - [`LocalStorageBackend`]: SQLite plus schema migrations and backups
//! - [`Storage`]: caching façade with transactions
//! - [`StorageError`]: error types for all operations
//!
//! ## Backend Contract
//!
//! All backends share the same semantics:
//! - Values are JSON ([`serde_json::Value`]); keys are UTF-8 strings.
//! - A zero TTL means the entry never expires.
//! - A `get` on an absent key and on an expired key are indistinguishable:
//!   both fail with [`StorageError::KeyNotFound`].
//! - `delete` is idempotent; deleting an absent key succeeds.
//! - Batch operations carry no cross-key atomicity guarantee at the trait
//!   level (the SQLite backend happens to apply them in one transaction).
//! - Every operation on a closed backend fails with
//!   [`StorageError::BackendClosed`]; `close` itself is idempotent.
//!
//! ## Examples
//!
//! ### Basic Usage
//! ```rust
//! use plugstore::{MemoryBackend, StorageBackend};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = MemoryBackend::new();
//! backend.initialize().await?;
//!
//! backend.set("greeting", json!("hello"), Duration::ZERO).await?;
//! let value = backend.get("greeting").await?;
//! assert_eq!(value, json!("hello"));
//!
//! backend.delete("greeting").await?;
//! assert!(!backend.exists("greeting").await?);
//! backend.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Through the Façade
//! ```rust,no_run
//! use plugstore::{Storage, StorageConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Storage::new(StorageConfig::default())?;
//! storage.initialize().await?;
//!
//! storage.set("user:42", json!({"name": "alice"}), Duration::ZERO).await?;
//!
//! let tx = storage.begin_transaction().await;
//! tx.set("user:42", json!({"name": "bob"})).await?;
//! tx.commit().await?;
//!
//! storage.cleanup().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod config;
pub mod error;
pub mod file;
pub mod local;
pub mod memory;
pub mod migration;
pub mod pattern;
pub mod sql;
pub mod store;
pub mod transaction;

pub use backup::{BackupFormat, BackupInfo, BackupManager, BackupOptions, BackupStatus, BackupType};
pub use config::{create_backend_from_config, BackendType, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, FileBackendConfig};
pub use local::{DatabaseInfo, LocalStorageBackend, LocalStorageConfig};
pub use memory::MemoryBackend;
pub use migration::{Migration, MigrationManager, MigrationRecord, MigrationStatus};
pub use pattern::KeyPattern;
pub use sql::{SqliteBackend, SqliteBackendConfig};
pub use store::{CacheStats, CachedTransaction, Storage};
pub use transaction::{OpKind, Transaction, TransactionOp, TransactionState};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A stored entry with its bookkeeping timestamps (unix seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Key under which the entry is stored.
    pub key: String,
    /// JSON value.
    pub value: Value,
    /// Expiry timestamp; `None` means the entry never expires.
    pub expire_at: Option<i64>,
    /// Creation timestamp, preserved across updates.
    pub created_at: i64,
    /// Last-update timestamp.
    pub updated_at: i64,
}

impl Entry {
    /// Build a new entry; a zero TTL yields no expiry.
    pub fn new(key: impl Into<String>, value: Value, ttl: Duration) -> Self {
        let now = now_timestamp();
        Self {
            key: key.into(),
            value,
            expire_at: expiry_from_ttl(ttl),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the entry is expired at `now` (unix seconds).
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expire_at.is_some_and(|exp| exp <= now)
    }

    /// Whether the entry is expired right now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_timestamp())
    }
}

/// Statistics reported by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStats {
    /// Backend type name ("memory", "file", "sqlite", "local").
    pub backend_type: String,
    /// Number of live (non-expired) keys.
    pub key_count: usize,
    /// Approximate storage footprint in bytes.
    pub storage_size_bytes: u64,
    /// Reads served since the backend was created.
    pub read_count: u64,
    /// Writes applied since the backend was created.
    pub write_count: u64,
    /// Deletes applied since the backend was created.
    pub delete_count: u64,
    /// Timestamp of the most recent operation, if any.
    pub last_access: Option<i64>,
}

/// Pluggable storage backend.
///
/// See the crate-level docs for the shared contract all implementations
/// honor (TTL semantics, idempotent delete/close, closed-backend errors).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Prepare the backend for use (open files, create schema, spawn
    /// maintenance tasks). Must be called before any other operation.
    async fn initialize(&self) -> StorageResult<()>;

    /// Release resources and stop maintenance tasks. Idempotent.
    async fn close(&self) -> StorageResult<()>;

    /// Fetch a value. Absent and expired keys both yield
    /// [`StorageError::KeyNotFound`].
    async fn get(&self, key: &str) -> StorageResult<Value>;

    /// Store a value. A zero `ttl` means no expiry. Updating an existing
    /// key preserves its creation timestamp.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> StorageResult<()>;

    /// Remove a key. Succeeds whether or not the key exists.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Whether a live (non-expired) entry exists for `key`.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Fetch several keys at once; the result contains only the keys that
    /// were found live.
    async fn get_batch(&self, keys: &[String]) -> StorageResult<HashMap<String, Value>>;

    /// Store several entries with a shared TTL.
    async fn set_batch(&self, entries: &HashMap<String, Value>, ttl: Duration)
        -> StorageResult<()>;

    /// Remove several keys. No cross-key atomicity is guaranteed.
    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()>;

    /// Return live entries whose keys match `pattern` (single `*`
    /// wildcard). A `limit` of zero means unlimited.
    async fn find(&self, pattern: &str, limit: usize) -> StorageResult<HashMap<String, Value>>;

    /// Count live keys matching `pattern`.
    async fn count(&self, pattern: &str) -> StorageResult<usize>;

    /// Return the sorted list of live keys matching `pattern`.
    async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>>;

    /// Backend statistics.
    async fn stats(&self) -> StorageResult<BackendStats>;
}

/// Read/write/delete counters shared by the backend implementations.
#[derive(Debug, Default)]
pub(crate) struct OpCounters {
    reads: std::sync::atomic::AtomicU64,
    writes: std::sync::atomic::AtomicU64,
    deletes: std::sync::atomic::AtomicU64,
    // Unix seconds; zero means no operation has happened yet.
    last_access: std::sync::atomic::AtomicI64,
}

impl OpCounters {
    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn record_delete(&self) {
        self.deletes
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_access
            .store(now_timestamp(), std::sync::atomic::Ordering::Relaxed);
    }

    pub(crate) fn reads(&self) -> u64 {
        self.reads.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn writes(&self) -> u64 {
        self.writes.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn deletes(&self) -> u64 {
        self.deletes.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn last_access(&self) -> Option<i64> {
        match self.last_access.load(std::sync::atomic::Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }
}

/// Current unix timestamp in seconds.
pub(crate) fn now_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Expiry timestamp for a TTL; zero TTL means no expiry.
///
/// Sub-second fractions round up, so a positive TTL never yields an entry
/// that is already expired when written.
pub(crate) fn expiry_from_ttl(ttl: Duration) -> Option<i64> {
    if ttl.is_zero() {
        return None;
    }
    let mut secs = ttl.as_secs() as i64;
    if ttl.subsec_nanos() > 0 {
        secs += 1;
    }
    Some(now_timestamp() + secs)
}

/// Reject keys no backend can store.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey(
            "key must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subsecond_ttl_rounds_up() {
        let entry = Entry::new("k", json!(1), Duration::from_millis(500));
        assert!(!entry.is_expired());
        assert_eq!(entry.expire_at, Some(entry.created_at + 1));
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let entry = Entry::new("k", json!(1), Duration::ZERO);
        assert_eq!(entry.expire_at, None);
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_empty_key_is_invalid() {
        assert!(matches!(
            validate_key(""),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(validate_key("k").is_ok());
    }
}
