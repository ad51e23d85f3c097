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

//! End-to-end tests: the caching façade over the local (SQLite +
//! migrations + backups) backend.

use plugstore::{
    BackendType, BackupFormat, BackupOptions, BackupType, LocalStorageBackend, LocalStorageConfig,
    SqliteBackendConfig, Storage, StorageBackend, StorageConfig, StorageError, TransactionState,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn local_config(dir: &TempDir) -> LocalStorageConfig {
    LocalStorageConfig {
        sqlite: SqliteBackendConfig {
            path: dir.path().join("storage.db"),
            max_connections: 2,
            ..SqliteBackendConfig::default()
        },
        backup_dir: dir.path().join("backups"),
        ..LocalStorageConfig::default()
    }
}

fn storage_over(backend: &LocalStorageBackend, config: &LocalStorageConfig) -> Storage {
    let storage_config = StorageConfig {
        backend: BackendType::Local,
        local: config.clone(),
        ..StorageConfig::default()
    };
    Storage::with_backend(Arc::new(backend.clone()), storage_config)
}

#[tokio::test]
async fn test_local_lifecycle_with_backup_and_restore() {
    let dir = TempDir::new().unwrap();
    let config = local_config(&dir);
    let backend = LocalStorageBackend::new(config.clone());
    let storage = storage_over(&backend, &config);
    storage.initialize().await.unwrap();

    // Migrations ran as part of initialization.
    let status = backend.migration_status().await.unwrap();
    assert!(!status.needs_migration);

    // Plain writes, batch writes, and pattern queries through the façade.
    storage
        .set("user:1", json!({"name": "alice"}), Duration::ZERO)
        .await
        .unwrap();
    let batch: HashMap<String, serde_json::Value> = [
        ("user:2".to_string(), json!({"name": "bob"})),
        ("session:9".to_string(), json!({"user": 2})),
    ]
    .into();
    storage.set_batch(&batch, Duration::ZERO).await.unwrap();

    assert_eq!(storage.count("user:*").await.unwrap(), 2);
    assert_eq!(
        storage.keys("user:*").await.unwrap(),
        vec!["user:1".to_string(), "user:2".to_string()]
    );

    // A committed transaction is visible through the façade afterwards.
    let tx = storage.begin_transaction().await;
    tx.set("user:1", json!({"name": "alice", "admin": true}))
        .await
        .unwrap();
    tx.delete("session:9").await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(tx.state().await, TransactionState::Committed);
    assert_eq!(
        storage.get("user:1").await.unwrap(),
        json!({"name": "alice", "admin": true})
    );
    assert!(!storage.exists("session:9").await.unwrap());

    // Back up, lose the data, restore, and read it back.
    let info = backend
        .create_backup(&BackupOptions {
            name: "pre-wipe".to_string(),
            backup_type: BackupType::Full,
            format: BackupFormat::Json,
            compress: true,
            ..BackupOptions::default()
        })
        .await
        .unwrap();

    storage
        .delete_batch(&["user:1".to_string(), "user:2".to_string()])
        .await
        .unwrap();
    assert_eq!(storage.count("user:*").await.unwrap(), 0);

    let restored = backend.restore_backup(&info.id, None).await.unwrap();
    assert_eq!(restored, 2);
    storage.clear_cache().await;
    assert_eq!(
        storage.get("user:1").await.unwrap(),
        json!({"name": "alice", "admin": true})
    );

    storage.cleanup().await.unwrap();
    assert!(matches!(
        storage.get("user:1").await,
        Err(StorageError::BackendClosed)
    ));
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = local_config(&dir);

    {
        let backend = LocalStorageBackend::new(config.clone());
        backend.initialize().await.unwrap();
        backend
            .set("persistent", json!(42), Duration::ZERO)
            .await
            .unwrap();
        backend.close().await.unwrap();
    }

    let backend = LocalStorageBackend::new(config);
    backend.initialize().await.unwrap();
    assert_eq!(backend.get("persistent").await.unwrap(), json!(42));

    // Schema is already at the latest version; re-initialization is a no-op.
    let status = backend.migration_status().await.unwrap();
    assert_eq!(status.pending_count, 0);
    backend.close().await.unwrap();
}

#[tokio::test]
async fn test_encrypted_backup_roundtrip() {
    let dir = TempDir::new().unwrap();
    let config = local_config(&dir);
    let backend = LocalStorageBackend::new(config.clone());
    backend.initialize().await.unwrap();

    backend
        .set("secret", json!({"token": "hunter2"}), Duration::ZERO)
        .await
        .unwrap();

    let info = backend
        .create_backup(&BackupOptions {
            name: "vault".to_string(),
            compress: true,
            encrypt: true,
            password: Some("correct horse".to_string()),
            ..BackupOptions::default()
        })
        .await
        .unwrap();

    backend.delete("secret").await.unwrap();

    assert!(matches!(
        backend.restore_backup(&info.id, Some("wrong")).await,
        Err(StorageError::CryptoError(_))
    ));

    let restored = backend
        .restore_backup(&info.id, Some("correct horse"))
        .await
        .unwrap();
    assert_eq!(restored, 1);
    assert_eq!(
        backend.get("secret").await.unwrap(),
        json!({"token": "hunter2"})
    );
    backend.close().await.unwrap();
}

#[tokio::test]
async fn test_facade_over_each_backend_type() {
    for backend_type in [BackendType::Memory, BackendType::File, BackendType::Sqlite] {
        let dir = TempDir::new().unwrap();
        let mut config = StorageConfig {
            backend: backend_type,
            ..StorageConfig::default()
        };
        config.file.data_dir = dir.path().join("files");
        config.sqlite.path = dir.path().join("storage.db");
        config.sqlite.max_connections = 2;

        let storage = Storage::new(config).unwrap();
        storage.initialize().await.unwrap();

        storage
            .set("shared:key", json!("value"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(storage.get("shared:key").await.unwrap(), json!("value"));
        assert_eq!(storage.count("shared:*").await.unwrap(), 1);
        assert_eq!(
            storage.stats().await.unwrap().backend_type,
            backend_type.to_string()
        );

        storage.cleanup().await.unwrap();
    }
}
