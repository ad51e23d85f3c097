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

//! Caching storage façade with transaction bookkeeping.
//!
//! ## Purpose
//! [`Storage`] fronts any backend with an optional read cache and hands out
//! [`CachedTransaction`]s that keep the cache coherent on commit. Reads are
//! cache-first; writes go through to the backend and then update or evict
//! the cached copy.
//!
//! ## Cache Coherence
//! Values written without a TTL are cached write-through. Values written
//! with a TTL are evicted instead, so expiry stays the backend's decision.
//! Committing a transaction evicts every key it touched.

use crate::config::create_backend_from_config;
use crate::transaction::{Transaction, TransactionState};
use crate::{BackendStats, StorageBackend, StorageConfig, StorageError, StorageResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

/// How often terminal transactions are swept from the registry.
const TX_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Cache hit/miss counters and occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads that fell through to the backend.
    pub misses: u64,
    /// `hits / (hits + misses)`; 0 when nothing has been looked up yet.
    pub hit_rate: f64,
    /// Current number of cached entries.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
}

struct CacheEntry {
    value: Value,
    inserted_at: Instant,
}

/// Bounded TTL cache. Eviction at capacity picks an arbitrary entry; the
/// workload this fronts is small enough that LRU bookkeeping is not worth
/// the locking.
struct Cache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    max_size: usize,
    ttl: Duration,
}

impl Cache {
    fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            max_size,
            ttl,
        }
    }

    async fn get(&self, key: &str) -> Option<Value> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }
        // Expired under the read lock; drop it for real now.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.inserted_at.elapsed() >= self.ttl {
                entries.remove(key);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn insert(&self, key: &str, value: Value) {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) && entries.len() >= self.max_size {
            if let Some(victim) = entries.keys().next().cloned() {
                entries.remove(&victim);
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn prune_expired(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: self.entries.read().await.len(),
            max_size: self.max_size,
        }
    }
}

/// Caching façade over a [`StorageBackend`].
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
    config: StorageConfig,
    cache: Option<Arc<Cache>>,
    transactions: Arc<RwLock<HashMap<Uuid, Transaction>>>,
    shutdown: watch::Sender<bool>,
}

impl Storage {
    /// Build a storage façade from a configuration. The configuration is
    /// validated and the selected backend instantiated; call
    /// [`initialize`](Storage::initialize) before use.
    pub fn new(config: StorageConfig) -> StorageResult<Self> {
        let backend = create_backend_from_config(&config)?;
        Ok(Self::with_backend(backend, config))
    }

    /// Build a façade over an already-constructed backend, e.g. a custom
    /// [`StorageBackend`] implementation.
    pub fn with_backend(backend: Arc<dyn StorageBackend>, config: StorageConfig) -> Self {
        let cache = config
            .cache_enabled
            .then(|| Arc::new(Cache::new(config.cache_max_size, config.cache_ttl)));
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            config,
            cache,
            transactions: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    /// The backend behind the façade.
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    /// Initialize the backend and start the cache sweep and transaction
    /// garbage collection tasks.
    pub async fn initialize(&self) -> StorageResult<()> {
        self.backend.initialize().await?;

        if let Some(cache) = &self.cache {
            let sweep_cache = cache.clone();
            let period = (self.config.cache_ttl / 2).max(Duration::from_secs(1));
            let mut shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => sweep_cache.prune_expired().await,
                        _ = shutdown_rx.changed() => break,
                    }
                }
            });
        }

        let transactions = self.transactions.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TX_GC_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot: Vec<(Uuid, Transaction)> = {
                            let txs = transactions.read().await;
                            txs.iter().map(|(id, tx)| (*id, tx.clone())).collect()
                        };
                        let mut terminal = Vec::new();
                        for (id, tx) in snapshot {
                            if tx.state().await != TransactionState::Active {
                                terminal.push(id);
                            }
                        }
                        if !terminal.is_empty() {
                            let mut txs = transactions.write().await;
                            for id in terminal {
                                txs.remove(&id);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Ok(())
    }

    /// Read a value, serving from the cache when possible.
    pub async fn get(&self, key: &str) -> StorageResult<Value> {
        if let Some(cache) = &self.cache {
            if let Some(value) = cache.get(key).await {
                return Ok(value);
            }
        }
        let value = self.backend.get(key).await?;
        if let Some(cache) = &self.cache {
            cache.insert(key, value.clone()).await;
        }
        Ok(value)
    }

    /// Write a value through to the backend and keep the cache coherent.
    pub async fn set(&self, key: &str, value: Value, ttl: Duration) -> StorageResult<()> {
        self.backend.set(key, value.clone(), ttl).await?;
        if let Some(cache) = &self.cache {
            if ttl.is_zero() {
                cache.insert(key, value).await;
            } else {
                cache.remove(key).await;
            }
        }
        Ok(())
    }

    /// Delete a key from the backend and the cache.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        self.backend.delete(key).await?;
        if let Some(cache) = &self.cache {
            cache.remove(key).await;
        }
        Ok(())
    }

    /// Whether a live entry exists. A fresh cached copy counts.
    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        if let Some(cache) = &self.cache {
            if cache.get(key).await.is_some() {
                return Ok(true);
            }
        }
        self.backend.exists(key).await
    }

    /// Fetch several keys, mixing cached copies with one backend batch
    /// read for the rest.
    pub async fn get_batch(&self, keys: &[String]) -> StorageResult<HashMap<String, Value>> {
        let mut found = HashMap::new();
        let mut missing = Vec::new();

        if let Some(cache) = &self.cache {
            for key in keys {
                match cache.get(key).await {
                    Some(value) => {
                        found.insert(key.clone(), value);
                    }
                    None => missing.push(key.clone()),
                }
            }
        } else {
            missing = keys.to_vec();
        }

        if !missing.is_empty() {
            let fetched = self.backend.get_batch(&missing).await?;
            if let Some(cache) = &self.cache {
                for (key, value) in &fetched {
                    cache.insert(key, value.clone()).await;
                }
            }
            found.extend(fetched);
        }
        Ok(found)
    }

    /// Write several entries with a shared TTL.
    pub async fn set_batch(
        &self,
        entries: &HashMap<String, Value>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.backend.set_batch(entries, ttl).await?;
        if let Some(cache) = &self.cache {
            for (key, value) in entries {
                if ttl.is_zero() {
                    cache.insert(key, value.clone()).await;
                } else {
                    cache.remove(key).await;
                }
            }
        }
        Ok(())
    }

    /// Delete several keys.
    pub async fn delete_batch(&self, keys: &[String]) -> StorageResult<()> {
        self.backend.delete_batch(keys).await?;
        if let Some(cache) = &self.cache {
            for key in keys {
                cache.remove(key).await;
            }
        }
        Ok(())
    }

    /// Pattern queries always go to the backend; the cache cannot answer
    /// them completely.
    pub async fn find(&self, pattern: &str, limit: usize) -> StorageResult<HashMap<String, Value>> {
        self.backend.find(pattern, limit).await
    }

    /// Count live keys matching `pattern`.
    pub async fn count(&self, pattern: &str) -> StorageResult<usize> {
        self.backend.count(pattern).await
    }

    /// Sorted live keys matching `pattern`.
    pub async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>> {
        self.backend.keys(pattern).await
    }

    /// Start a transaction and register it for lifecycle tracking.
    pub async fn begin_transaction(&self) -> CachedTransaction {
        let tx = Transaction::new(self.backend.clone());
        self.transactions.write().await.insert(tx.id(), tx.clone());
        CachedTransaction {
            tx,
            cache: self.cache.clone(),
        }
    }

    /// Number of transactions currently tracked.
    pub async fn transaction_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    /// Drop every cached entry and reset the hit/miss counters.
    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear().await;
        }
    }

    /// Cache counters, or `None` when the cache is disabled.
    pub async fn cache_stats(&self) -> Option<CacheStats> {
        match &self.cache {
            Some(cache) => Some(cache.stats().await),
            None => None,
        }
    }

    /// Backend statistics.
    pub async fn stats(&self) -> StorageResult<BackendStats> {
        self.backend.stats().await
    }

    /// Roll back every active transaction and stop the background tasks.
    /// The backend stays open; calling `stop` twice is harmless.
    pub async fn stop(&self) -> StorageResult<()> {
        let txs: Vec<Transaction> = {
            let mut registry = self.transactions.write().await;
            registry.drain().map(|(_, tx)| tx).collect()
        };
        for tx in txs {
            match tx.rollback().await {
                Ok(()) | Err(StorageError::TransactionInactive(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let _ = self.shutdown.send(true);
        Ok(())
    }

    /// Stop the façade, drop the cache contents, and close the backend.
    pub async fn cleanup(&self) -> StorageResult<()> {
        self.stop().await?;
        self.clear_cache().await;
        self.backend.close().await
    }
}

/// A [`Transaction`] that evicts the keys it touched from the façade's
/// cache when it commits.
#[derive(Clone)]
pub struct CachedTransaction {
    tx: Transaction,
    cache: Option<Arc<Cache>>,
}

impl CachedTransaction {
    /// Unique transaction id.
    pub fn id(&self) -> Uuid {
        self.tx.id()
    }

    /// Current state.
    pub async fn state(&self) -> TransactionState {
        self.tx.state().await
    }

    /// Read a key with read-your-writes semantics; see [`Transaction::get`].
    pub async fn get(&self, key: &str) -> StorageResult<Value> {
        self.tx.get(key).await
    }

    /// Buffer a set.
    pub async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.tx.set(key, value).await
    }

    /// Buffer a delete.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        self.tx.delete(key).await
    }

    /// Commit and evict every touched key from the cache so later reads
    /// see the committed values.
    pub async fn commit(&self) -> StorageResult<()> {
        self.tx.commit().await?;
        if let Some(cache) = &self.cache {
            for op in self.tx.operations().await {
                cache.remove(&op.key).await;
            }
        }
        Ok(())
    }

    /// Discard the buffered operations.
    pub async fn rollback(&self) -> StorageResult<()> {
        self.tx.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackendType;
    use serde_json::json;

    fn memory_config() -> StorageConfig {
        StorageConfig {
            backend: BackendType::Memory,
            ..StorageConfig::default()
        }
    }

    async fn storage() -> Storage {
        let storage = Storage::new(memory_config()).unwrap();
        storage.initialize().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_reads_are_served_from_cache() {
        let storage = storage().await;
        storage.set("k", json!("v"), Duration::ZERO).await.unwrap();

        // Remove behind the façade's back; the cached copy still answers.
        storage.backend().delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), json!("v"));
        assert!(storage.exists("k").await.unwrap());

        let stats = storage.cache_stats().await.unwrap();
        assert!(stats.hits >= 2);
        assert!(stats.hit_rate > 0.0);
        assert_eq!(stats.size, 1);

        storage.clear_cache().await;
        let stats = storage.cache_stats().await.unwrap();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        // No lookups since the reset: the rate is defined as zero.
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.size, 0);
        assert!(matches!(
            storage.get("k").await,
            Err(StorageError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ttl_writes_are_not_cached() {
        let storage = storage().await;
        storage
            .set("k", json!("v"), Duration::from_secs(60))
            .await
            .unwrap();

        storage.backend().delete("k").await.unwrap();
        assert!(matches!(
            storage.get("k").await,
            Err(StorageError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_evicts_cache() {
        let storage = storage().await;
        storage.set("k", json!("v"), Duration::ZERO).await.unwrap();
        storage.delete("k").await.unwrap();
        assert!(!storage.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_capacity_eviction() {
        let mut config = memory_config();
        config.cache_max_size = 2;
        let storage = Storage::new(config).unwrap();
        storage.initialize().await.unwrap();

        for i in 0..5 {
            storage
                .set(&format!("k{}", i), json!(i), Duration::ZERO)
                .await
                .unwrap();
        }
        let stats = storage.cache_stats().await.unwrap();
        assert!(stats.size <= 2);
        // Every key is still readable through the backend.
        assert_eq!(storage.get("k0").await.unwrap(), json!(0));
    }

    #[tokio::test]
    async fn test_batch_operations_keep_cache_coherent() {
        let storage = storage().await;
        let entries: HashMap<String, Value> = [
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
        ]
        .into();
        storage.set_batch(&entries, Duration::ZERO).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let found = storage.get_batch(&keys).await.unwrap();
        assert_eq!(found.len(), 2);

        storage.delete_batch(&keys).await.unwrap();
        assert!(storage.get_batch(&keys).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_commit_evicts_touched_keys() {
        let storage = storage().await;
        storage.set("k", json!("old"), Duration::ZERO).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), json!("old"));

        let tx = storage.begin_transaction().await;
        tx.set("k", json!("new")).await.unwrap();
        // Still the cached old value outside the transaction.
        assert_eq!(storage.get("k").await.unwrap(), json!("old"));

        tx.commit().await.unwrap();
        assert_eq!(tx.state().await, TransactionState::Committed);
        assert_eq!(storage.get("k").await.unwrap(), json!("new"));
    }

    #[tokio::test]
    async fn test_stop_rolls_back_active_transactions() {
        let storage = storage().await;
        let tx = storage.begin_transaction().await;
        tx.set("k", json!(1)).await.unwrap();
        assert_eq!(storage.transaction_count().await, 1);

        storage.stop().await.unwrap();
        assert_eq!(tx.state().await, TransactionState::RolledBack);
        assert_eq!(storage.transaction_count().await, 0);
        assert!(!storage.exists("k").await.unwrap());

        // Backend still usable after stop; stop is idempotent.
        storage.set("k", json!(2), Duration::ZERO).await.unwrap();
        storage.stop().await.unwrap();
        storage.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_cache() {
        let mut config = memory_config();
        config.cache_enabled = false;
        let storage = Storage::new(config).unwrap();
        storage.initialize().await.unwrap();

        storage.set("k", json!(1), Duration::ZERO).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), json!(1));
        assert!(storage.cache_stats().await.is_none());

        storage.backend().delete("k").await.unwrap();
        assert!(matches!(
            storage.get("k").await,
            Err(StorageError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_entries_expire() {
        let mut config = memory_config();
        config.cache_ttl = Duration::from_millis(50);
        let storage = Storage::new(config).unwrap();
        storage.initialize().await.unwrap();

        storage.set("k", json!("v"), Duration::ZERO).await.unwrap();
        storage.backend().delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), json!("v"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            storage.get("k").await,
            Err(StorageError::KeyNotFound(_))
        ));
    }
}
