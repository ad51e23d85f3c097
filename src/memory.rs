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

//! In-memory storage backend.
//!
//! ## Purpose
//! Provides a HashMap-based implementation for testing and single-process
//! scenarios where persistence is not needed.
//!
//! ## Features
//! - Fast in-memory operations
//! - TTL support: lazy expiry on read plus a periodic background sweep
//!
//! ## Limitations
//! - Not persistent (data lost on restart)
//! - Limited scalability (all data in RAM)

use crate::pattern::KeyPattern;
use crate::{
    now_timestamp, validate_key, BackendStats, Entry, OpCounters, StorageBackend, StorageError,
    StorageResult,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// Period of the background sweep that removes expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Rough per-entry bookkeeping overhead used for the size estimate.
const ENTRY_OVERHEAD_BYTES: usize = 100;

/// In-memory storage backend.
///
/// ## Example
/// ```rust
/// use plugstore::{MemoryBackend, StorageBackend};
/// use serde_json::json;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MemoryBackend::new();
/// backend.initialize().await?;
///
/// backend.set("key", json!("value"), Duration::ZERO).await?;
/// assert_eq!(backend.get("key").await?, json!("value"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<HashMap<String, Entry>>>,
    counters: Arc<OpCounters>,
    initialized: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl MemoryBackend {
    /// Create a new in-memory backend. Call
    /// [`initialize`](StorageBackend::initialize) before use.
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(OpCounters::default()),
            initialized: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::BackendClosed);
        }
        Ok(())
    }

    /// Remove all expired entries; returns how many were dropped.
    async fn sweep_expired(&self) -> usize {
        let now = now_timestamp();
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|_, entry| !entry.is_expired_at(now));
        before - data.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn initialize(&self) -> StorageResult<()> {
        self.ensure_open()?;
        // Initializing twice must not spawn a second sweep task.
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let backend = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let dropped = backend.sweep_expired().await;
                        if dropped > 0 {
                            tracing::debug!(dropped, "memory backend sweep removed expired entries");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);
        self.data.write().await.clear();
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Value> {
        self.ensure_open()?;
        self.counters.record_read();

        let now = now_timestamp();
        {
            let data = self.data.read().await;
            match data.get(key) {
                Some(entry) if !entry.is_expired_at(now) => return Ok(entry.value.clone()),
                None => return Err(StorageError::KeyNotFound(key.to_string())),
                Some(_) => {} // expired, delete below
            }
        }

        // Lazy expiry: drop the stale entry on the way out.
        let mut data = self.data.write().await;
        if data.get(key).is_some_and(|e| e.is_expired_at(now)) {
            data.remove(key);
        }
        Err(StorageError::KeyNotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> StorageResult<()> {
        self.ensure_open()?;
        validate_key(key)?;
        self.counters.record_write();

        let mut entry = Entry::new(key, value, ttl);
        let mut data = self.data.write().await;
        if let Some(existing) = data.get(key) {
            entry.created_at = existing.created_at;
        }
        data.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.counters.record_delete();

        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        self.counters.record_read();

        let now = now_timestamp();
        let data = self.data.read().await;
        Ok(data.get(key).is_some_and(|e| !e.is_expired_at(now)))
    }

    async fn get_batch(&self, keys: &[String]) -> StorageResult<HashMap<String, Value>> {
        self.ensure_open()?;
        self.counters.record_read();

        let now = now_timestamp();
        let data = self.data.read().await;
        let mut results = HashMap::new();
        for key in keys {
            if let Some(entry) = data.get(key) {
                if !entry.is_expired_at(now) {
                    results.insert(key.clone(), entry.value.clone());
                }
            }
        }
        Ok(results)
    }

    async fn set_batch(
        &self,
        entries: &HashMap<String, Value>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        for key in entries.keys() {
            validate_key(key)?;
        }
        self.counters.record_write();

        let mut data = self.data.write().await;
        for (key, value) in entries {
            let mut entry = Entry::new(key.clone(), value.clone(), ttl);
            if let Some(existing) = data.get(key) {
                entry.created_at = existing.created_at;
            }
            data.insert(key.clone(), entry);
        }
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        self.ensure_open()?;
        self.counters.record_delete();

        let mut data = self.data.write().await;
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    async fn find(&self, pattern: &str, limit: usize) -> StorageResult<HashMap<String, Value>> {
        self.ensure_open()?;
        self.counters.record_read();

        let pattern = KeyPattern::parse(pattern);
        let now = now_timestamp();
        let data = self.data.read().await;
        let mut results = HashMap::new();
        for (key, entry) in data.iter() {
            if pattern.matches(key) && !entry.is_expired_at(now) {
                results.insert(key.clone(), entry.value.clone());
                if limit > 0 && results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }

    async fn count(&self, pattern: &str) -> StorageResult<usize> {
        self.ensure_open()?;
        self.counters.record_read();

        let pattern = KeyPattern::parse(pattern);
        let now = now_timestamp();
        let data = self.data.read().await;
        Ok(data
            .iter()
            .filter(|(key, entry)| pattern.matches(key) && !entry.is_expired_at(now))
            .count())
    }

    async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        self.counters.record_read();

        let pattern = KeyPattern::parse(pattern);
        let now = now_timestamp();
        let data = self.data.read().await;
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(key, entry)| pattern.matches(key) && !entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn stats(&self) -> StorageResult<BackendStats> {
        self.ensure_open()?;

        let now = now_timestamp();
        let data = self.data.read().await;
        let key_count = data.values().filter(|e| !e.is_expired_at(now)).count();
        let storage_size_bytes: u64 = data
            .iter()
            .filter(|(_, e)| !e.is_expired_at(now))
            .map(|(k, e)| (k.len() + e.value.to_string().len() + ENTRY_OVERHEAD_BYTES) as u64)
            .sum();

        Ok(BackendStats {
            backend_type: "memory".to_string(),
            key_count,
            storage_size_bytes,
            read_count: self.counters.reads(),
            write_count: self.counters.writes(),
            delete_count: self.counters.deletes(),
            last_access: self.counters.last_access(),
        })
    }
}
