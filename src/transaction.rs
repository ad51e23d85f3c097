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

//! Operation-log transactions over any [`StorageBackend`].
//!
//! ## Purpose
//! A [`Transaction`] buffers writes in an operation log and replays them on
//! commit. Reads inside the transaction see the buffered operations first
//! (read-your-writes), then fall through to the backend.
//!
//! ## Caveats
//! Commit replays operations one by one against the backend; it is NOT
//! atomic. If a replay step fails, the transaction is marked aborted and
//! earlier steps stay applied. Transactions that outlive their timeout are
//! aborted lazily on the next use.

use crate::{StorageBackend, StorageError, StorageResult};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Default lifetime after which an unused transaction aborts.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting operations.
    Active,
    /// Successfully committed.
    Committed,
    /// Explicitly rolled back by the caller.
    RolledBack,
    /// Timed out or failed during commit.
    Aborted,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "active"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::RolledBack => write!(f, "rolled_back"),
            TransactionState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Kind of a buffered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Write a value.
    Set,
    /// Remove a key.
    Delete,
}

/// One buffered operation in a transaction's log.
#[derive(Debug, Clone)]
pub struct TransactionOp {
    /// Set or delete.
    pub kind: OpKind,
    /// Target key.
    pub key: String,
    /// Value for sets, `None` for deletes.
    pub value: Option<Value>,
    /// When the operation was buffered (unix seconds).
    pub timestamp: i64,
}

struct TxInner {
    state: TransactionState,
    ops: Vec<TransactionOp>,
    created_at: Instant,
    timeout: Duration,
}

/// A buffered-write transaction. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Transaction {
    id: Uuid,
    backend: Arc<dyn StorageBackend>,
    inner: Arc<Mutex<TxInner>>,
}

impl Transaction {
    /// Start a transaction with the default timeout.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_timeout(backend, DEFAULT_TRANSACTION_TIMEOUT)
    }

    /// Start a transaction with a custom timeout.
    pub fn with_timeout(backend: Arc<dyn StorageBackend>, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            inner: Arc::new(Mutex::new(TxInner {
                state: TransactionState::Active,
                ops: Vec::new(),
                created_at: Instant::now(),
                timeout,
            })),
        }
    }

    /// Unique transaction id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state (a timed-out transaction reports `Aborted`).
    pub async fn state(&self) -> TransactionState {
        let mut inner = self.inner.lock().await;
        Self::expire_if_needed(&mut inner);
        inner.state
    }

    /// Number of buffered operations.
    pub async fn operation_count(&self) -> usize {
        self.inner.lock().await.ops.len()
    }

    /// Snapshot of the buffered operations, oldest first.
    pub async fn operations(&self) -> Vec<TransactionOp> {
        self.inner.lock().await.ops.clone()
    }

    fn expire_if_needed(inner: &mut TxInner) {
        if inner.state == TransactionState::Active && inner.created_at.elapsed() > inner.timeout {
            inner.state = TransactionState::Aborted;
        }
    }

    fn ensure_active(inner: &mut TxInner, id: Uuid) -> StorageResult<()> {
        Self::expire_if_needed(inner);
        if inner.state != TransactionState::Active {
            return Err(StorageError::TransactionInactive(format!(
                "transaction {} is {}",
                id, inner.state
            )));
        }
        Ok(())
    }

    /// Read a key. Buffered operations win over the backend: the newest
    /// buffered set returns its value, the newest buffered delete reports
    /// the key as missing.
    pub async fn get(&self, key: &str) -> StorageResult<Value> {
        {
            let mut inner = self.inner.lock().await;
            Self::ensure_active(&mut inner, self.id)?;
            for op in inner.ops.iter().rev() {
                if op.key != key {
                    continue;
                }
                return match op.kind {
                    OpKind::Set => Ok(op.value.clone().unwrap_or(Value::Null)),
                    OpKind::Delete => Err(StorageError::KeyNotFound(key.to_string())),
                };
            }
        }
        self.backend.get(key).await
    }

    /// Buffer a set. Nothing reaches the backend until commit.
    pub async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        Self::ensure_active(&mut inner, self.id)?;
        inner.ops.push(TransactionOp {
            kind: OpKind::Set,
            key: key.to_string(),
            value: Some(value),
            timestamp: crate::now_timestamp(),
        });
        Ok(())
    }

    /// Buffer a delete.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        Self::ensure_active(&mut inner, self.id)?;
        inner.ops.push(TransactionOp {
            kind: OpKind::Delete,
            key: key.to_string(),
            value: None,
            timestamp: crate::now_timestamp(),
        });
        Ok(())
    }

    /// Replay the buffered operations against the backend in order.
    ///
    /// Stored values carry no TTL. On the first replay failure the
    /// transaction is marked aborted and the error is returned; operations
    /// already replayed stay applied.
    pub async fn commit(&self) -> StorageResult<()> {
        let ops = {
            let mut inner = self.inner.lock().await;
            Self::ensure_active(&mut inner, self.id)?;
            inner.ops.clone()
        };

        for op in &ops {
            let result = match op.kind {
                OpKind::Set => {
                    let value = op.value.clone().unwrap_or(Value::Null);
                    self.backend.set(&op.key, value, Duration::ZERO).await
                }
                OpKind::Delete => self.backend.delete(&op.key).await,
            };
            if let Err(err) = result {
                let mut inner = self.inner.lock().await;
                inner.state = TransactionState::Aborted;
                tracing::warn!(id = %self.id, key = %op.key, error = %err,
                    "transaction commit failed mid-replay");
                return Err(err);
            }
        }

        let mut inner = self.inner.lock().await;
        inner.state = TransactionState::Committed;
        tracing::debug!(id = %self.id, ops = ops.len(), "transaction committed");
        Ok(())
    }

    /// Discard the buffered operations.
    pub async fn rollback(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        Self::ensure_active(&mut inner, self.id)?;
        inner.state = TransactionState::RolledBack;
        inner.ops.clear();
        Ok(())
    }
}
