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

//! File-based storage backend.
//!
//! ## Purpose
//! Persists the whole store as one JSON document under a data directory,
//! with an in-memory write-back cache in front of it. Suited to small
//! datasets (settings, session state) where human-inspectable storage
//! matters more than throughput.
//!
//! ## Durability Model
//! Reads never touch the disk; mutations mark the cache dirty. A background
//! task flushes dirty state every `flush_interval`; with `sync_mode` every
//! mutation flushes before returning. Flushes are atomic: the document is
//! written to `data.json.tmp` and renamed over `data.json`, so a crash
//! leaves either the old or the new document, never a torn one.

use crate::pattern::KeyPattern;
use crate::{
    now_timestamp, validate_key, BackendStats, Entry, OpCounters, StorageBackend, StorageError,
    StorageResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

const DATA_FILE: &str = "data.json";
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const ENTRY_OVERHEAD_BYTES: usize = 200;

/// Configuration for [`FileBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBackendConfig {
    /// Directory holding the data document.
    pub data_dir: PathBuf,
    /// Flush after every mutation instead of on an interval.
    pub sync_mode: bool,
    /// How often dirty state is flushed when `sync_mode` is off.
    pub flush_interval: Duration,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/storage"),
            sync_mode: false,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// File-based storage backend over a single JSON document.
#[derive(Clone)]
pub struct FileBackend {
    config: FileBackendConfig,
    data: Arc<RwLock<HashMap<String, Entry>>>,
    dirty: Arc<AtomicBool>,
    counters: Arc<OpCounters>,
    initialized: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl FileBackend {
    /// Create a new file backend. Call
    /// [`initialize`](StorageBackend::initialize) before use.
    pub fn new(config: FileBackendConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            data: Arc::new(RwLock::new(HashMap::new())),
            dirty: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(OpCounters::default()),
            initialized: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    fn data_path(&self) -> PathBuf {
        self.config.data_dir.join(DATA_FILE)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::BackendClosed);
        }
        Ok(())
    }

    /// Load the document from disk, dropping entries that expired while the
    /// process was down.
    async fn load(&self) -> StorageResult<()> {
        let path = self.data_path();
        if !path.exists() {
            return Ok(());
        }

        let raw = tokio::fs::read_to_string(&path).await?;
        let mut loaded: HashMap<String, Entry> = serde_json::from_str(&raw)?;

        let now = now_timestamp();
        let before = loaded.len();
        loaded.retain(|_, entry| !entry.is_expired_at(now));
        if loaded.len() < before {
            // Expired entries were dropped; persist the pruned document.
            self.dirty.store(true, Ordering::SeqCst);
        }

        let mut data = self.data.write().await;
        *data = loaded;
        Ok(())
    }

    /// Write the current document atomically (tmp file + rename).
    async fn flush(&self) -> StorageResult<()> {
        let snapshot = {
            let data = self.data.read().await;
            serde_json::to_vec_pretty(&*data)?
        };

        let path = self.data_path();
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &snapshot).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Flush if there are unsaved changes.
    async fn flush_if_dirty(&self) -> StorageResult<()> {
        if self.dirty.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.flush().await {
                // Keep the dirty flag so the next flush retries.
                self.dirty.store(true, Ordering::SeqCst);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn sweep_expired(&self) -> usize {
        let now = now_timestamp();
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|_, entry| !entry.is_expired_at(now));
        let dropped = before - data.len();
        if dropped > 0 {
            self.dirty.store(true, Ordering::SeqCst);
        }
        dropped
    }

    async fn mark_dirty(&self) -> StorageResult<()> {
        self.dirty.store(true, Ordering::SeqCst);
        if self.config.sync_mode {
            self.flush_if_dirty().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn initialize(&self) -> StorageResult<()> {
        self.ensure_open()?;
        // Initializing twice must not reload the document over live state
        // or spawn a second flush/sweep task.
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.config.data_dir).await?;
        self.load().await?;

        let backend = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let flush_interval = self.config.flush_interval;
        tokio::spawn(async move {
            let mut flush_tick = tokio::time::interval(flush_interval);
            let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);
            flush_tick.tick().await;
            sweep_tick.tick().await;
            loop {
                tokio::select! {
                    _ = flush_tick.tick() => {
                        if let Err(err) = backend.flush_if_dirty().await {
                            tracing::warn!(error = %err, "file backend flush failed");
                        }
                    }
                    _ = sweep_tick.tick() => {
                        let dropped = backend.sweep_expired().await;
                        if dropped > 0 {
                            tracing::debug!(dropped, "file backend sweep removed expired entries");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        tracing::info!(path = %self.data_path().display(), "file backend initialized");
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);
        self.flush_if_dirty().await?;
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
                Some(_) => {}
            }
        }

        let mut data = self.data.write().await;
        if data.get(key).is_some_and(|e| e.is_expired_at(now)) {
            data.remove(key);
            self.dirty.store(true, Ordering::SeqCst);
        }
        Err(StorageError::KeyNotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> StorageResult<()> {
        self.ensure_open()?;
        validate_key(key)?;
        self.counters.record_write();

        let mut entry = Entry::new(key, value, ttl);
        {
            let mut data = self.data.write().await;
            if let Some(existing) = data.get(key) {
                entry.created_at = existing.created_at;
            }
            data.insert(key.to_string(), entry);
        }
        self.mark_dirty().await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.counters.record_delete();

        let removed = {
            let mut data = self.data.write().await;
            data.remove(key).is_some()
        };
        if removed {
            self.mark_dirty().await?;
        }
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

        {
            let mut data = self.data.write().await;
            for (key, value) in entries {
                let mut entry = Entry::new(key.clone(), value.clone(), ttl);
                if let Some(existing) = data.get(key) {
                    entry.created_at = existing.created_at;
                }
                data.insert(key.clone(), entry);
            }
        }
        self.mark_dirty().await
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        self.ensure_open()?;
        self.counters.record_delete();

        let removed_any = {
            let mut data = self.data.write().await;
            let before = data.len();
            for key in keys {
                data.remove(key);
            }
            data.len() < before
        };
        if removed_any {
            self.mark_dirty().await?;
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
            backend_type: "file".to_string(),
            key_count,
            storage_size_bytes,
            read_count: self.counters.reads(),
            write_count: self.counters.writes(),
            delete_count: self.counters.deletes(),
            last_access: self.counters.last_access(),
        })
    }
}

/// Path of the data document for a directory (used by tests and tooling).
pub fn data_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DATA_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> FileBackendConfig {
        FileBackendConfig {
            data_dir: dir.path().to_path_buf(),
            sync_mode: true,
            flush_interval: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend
            .set("key1", json!({"n": 1}), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(backend.get("key1").await.unwrap(), json!({"n": 1}));
        assert!(backend.exists("key1").await.unwrap());

        backend.delete("key1").await.unwrap();
        assert!(!backend.exists("key1").await.unwrap());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.sync_mode = false;
        config.flush_interval = Duration::from_secs(3600);

        let backend = FileBackend::new(config);
        backend.initialize().await.unwrap();
        backend.set("k", json!(1), Duration::ZERO).await.unwrap();

        // A second initialize is a no-op; the unflushed write survives.
        backend.initialize().await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let dir = TempDir::new().unwrap();

        let backend = FileBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();
        backend.set("kept", json!("v"), Duration::ZERO).await.unwrap();
        backend
            .set("expired", json!("x"), Duration::from_secs(1))
            .await
            .unwrap();
        backend.close().await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        // A fresh instance loads the document and drops the expired entry.
        let reloaded = FileBackend::new(test_config(&dir));
        reloaded.initialize().await.unwrap();
        assert_eq!(reloaded.get("kept").await.unwrap(), json!("v"));
        assert!(matches!(
            reloaded.get("expired").await,
            Err(StorageError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_mode_writes_document() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend.set("k", json!(1), Duration::ZERO).await.unwrap();

        let path = data_file_path(dir.path());
        assert!(path.exists());
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"k\""));
    }

    #[tokio::test]
    async fn test_close_flushes_pending_writes() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.sync_mode = false;
        config.flush_interval = Duration::from_secs(3600); // never fires in test

        let backend = FileBackend::new(config);
        backend.initialize().await.unwrap();
        backend.set("k", json!(1), Duration::ZERO).await.unwrap();
        assert!(!data_file_path(dir.path()).exists());

        backend.close().await.unwrap();
        assert!(data_file_path(dir.path()).exists());

        // Closing twice is a no-op
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pattern_queries() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();

        backend.set("a:1", json!(1), Duration::ZERO).await.unwrap();
        backend.set("a:2", json!(2), Duration::ZERO).await.unwrap();
        backend.set("b:1", json!(3), Duration::ZERO).await.unwrap();

        assert_eq!(backend.count("a:*").await.unwrap(), 2);
        assert_eq!(
            backend.keys("a:*").await.unwrap(),
            vec!["a:1".to_string(), "a:2".to_string()]
        );
        assert_eq!(backend.find("*", 0).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(test_config(&dir));
        backend.initialize().await.unwrap();
        backend.close().await.unwrap();

        assert!(matches!(
            backend.set("k", json!(1), Duration::ZERO).await,
            Err(StorageError::BackendClosed)
        ));
    }
}
