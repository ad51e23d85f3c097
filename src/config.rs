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

//! Storage configuration and the backend factory.
//!
//! ## Purpose
//! [`StorageConfig`] selects and configures a backend plus the read cache
//! of the [`Storage`](crate::Storage) façade. It can be built in code,
//! deserialized, or read from `PLUGSTORE_*` environment variables.

use crate::{
    FileBackend, FileBackendConfig, LocalStorageBackend, LocalStorageConfig, MemoryBackend,
    SqliteBackend, SqliteBackendConfig, StorageBackend, StorageError, StorageResult,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Which backend implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// In-memory HashMap, volatile.
    Memory,
    /// Single JSON document on disk.
    File,
    /// Plain SQLite.
    Sqlite,
    /// SQLite with migrations and backups.
    Local,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendType::Memory => "memory",
            BackendType::File => "file",
            BackendType::Sqlite => "sqlite",
            BackendType::Local => "local",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for BackendType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendType::Memory),
            "file" => Ok(BackendType::File),
            "sqlite" => Ok(BackendType::Sqlite),
            "local" => Ok(BackendType::Local),
            other => Err(StorageError::ConfigError(format!(
                "unknown backend type: {}",
                other
            ))),
        }
    }
}

/// Top-level storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection. Defaults to `memory` so an unconfigured store
    /// works out of the box.
    pub backend: BackendType,
    /// Enable the façade's read cache.
    pub cache_enabled: bool,
    /// Maximum number of cached entries.
    pub cache_max_size: usize,
    /// Cache entry lifetime.
    pub cache_ttl: Duration,
    /// File backend settings (used when `backend` is `file`).
    pub file: FileBackendConfig,
    /// SQLite backend settings (used when `backend` is `sqlite`).
    pub sqlite: SqliteBackendConfig,
    /// Local backend settings (used when `backend` is `local`).
    pub local: LocalStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Memory,
            cache_enabled: true,
            cache_max_size: 1000,
            cache_ttl: Duration::from_secs(300),
            file: FileBackendConfig::default(),
            sqlite: SqliteBackendConfig::default(),
            local: LocalStorageConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> StorageResult<()> {
        if self.cache_enabled && self.cache_max_size == 0 {
            return Err(StorageError::ConfigError(
                "cache_max_size must be positive when the cache is enabled".to_string(),
            ));
        }
        if self.cache_enabled && self.cache_ttl.is_zero() {
            return Err(StorageError::ConfigError(
                "cache_ttl must be positive when the cache is enabled".to_string(),
            ));
        }
        match self.backend {
            BackendType::File => {
                if self.file.data_dir.as_os_str().is_empty() {
                    return Err(StorageError::ConfigError(
                        "file backend requires a data_dir".to_string(),
                    ));
                }
            }
            BackendType::Sqlite => validate_sqlite(&self.sqlite)?,
            BackendType::Local => {
                validate_sqlite(&self.local.sqlite)?;
                if self.local.backup_dir.as_os_str().is_empty() {
                    return Err(StorageError::ConfigError(
                        "local backend requires a backup_dir".to_string(),
                    ));
                }
                if self.local.auto_backup && self.local.backup_interval.is_zero() {
                    return Err(StorageError::ConfigError(
                        "backup_interval must be positive when auto_backup is enabled".to_string(),
                    ));
                }
            }
            BackendType::Memory => {}
        }
        Ok(())
    }

    /// Build a configuration from `PLUGSTORE_*` environment variables,
    /// starting from the defaults. Unset variables keep their defaults;
    /// set-but-invalid values are errors.
    ///
    /// Recognized variables: `PLUGSTORE_BACKEND`, `PLUGSTORE_CACHE_ENABLED`,
    /// `PLUGSTORE_CACHE_MAX_SIZE`, `PLUGSTORE_CACHE_TTL_SECS`,
    /// `PLUGSTORE_FILE_DIR`, `PLUGSTORE_SQLITE_PATH`, `PLUGSTORE_BACKUP_DIR`.
    pub fn from_env() -> StorageResult<Self> {
        let mut config = Self::default();

        if let Some(backend) = env_var("PLUGSTORE_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(enabled) = env_var("PLUGSTORE_CACHE_ENABLED") {
            config.cache_enabled = parse_env("PLUGSTORE_CACHE_ENABLED", &enabled)?;
        }
        if let Some(size) = env_var("PLUGSTORE_CACHE_MAX_SIZE") {
            config.cache_max_size = parse_env("PLUGSTORE_CACHE_MAX_SIZE", &size)?;
        }
        if let Some(secs) = env_var("PLUGSTORE_CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(parse_env("PLUGSTORE_CACHE_TTL_SECS", &secs)?);
        }
        if let Some(dir) = env_var("PLUGSTORE_FILE_DIR") {
            config.file.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_var("PLUGSTORE_SQLITE_PATH") {
            config.sqlite.path = PathBuf::from(&path);
            config.local.sqlite.path = PathBuf::from(path);
        }
        if let Some(dir) = env_var("PLUGSTORE_BACKUP_DIR") {
            config.local.backup_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }
}

fn validate_sqlite(config: &SqliteBackendConfig) -> StorageResult<()> {
    if config.path.as_os_str().is_empty() {
        return Err(StorageError::ConfigError(
            "sqlite backend requires a database path".to_string(),
        ));
    }
    if config.max_connections == 0 {
        return Err(StorageError::ConfigError(
            "max_connections must be positive".to_string(),
        ));
    }
    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> StorageResult<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err| {
        StorageError::ConfigError(format!("invalid value for {}: {}", name, err))
    })
}

/// Instantiate the backend a configuration selects. The backend is not yet
/// initialized; callers run [`StorageBackend::initialize`].
pub fn create_backend_from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    config.validate()?;
    let backend: Arc<dyn StorageBackend> = match config.backend {
        BackendType::Memory => Arc::new(MemoryBackend::new()),
        BackendType::File => Arc::new(FileBackend::new(config.file.clone())),
        BackendType::Sqlite => Arc::new(SqliteBackend::new(config.sqlite.clone())),
        BackendType::Local => Arc::new(LocalStorageBackend::new(config.local.clone())),
    };
    Ok(backend)
}
