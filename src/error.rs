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

//! Error types for storage operations.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors returned by backends, the façade, and the managers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The key does not exist or has expired.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The backend was closed or never initialized.
    #[error("Backend is closed")]
    BackendClosed,

    /// The key is not usable (e.g. empty).
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The configuration cannot work as given.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// An operation was attempted on a committed, aborted or timed-out
    /// transaction.
    #[error("Transaction is not active: {0}")]
    TransactionInactive(String),

    /// A schema migration failed or the migration set is invalid.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// A backup or restore failed.
    #[error("Backup error: {0}")]
    BackupError(String),

    /// Encryption or decryption failed.
    #[error("Crypto error: {0}")]
    CryptoError(String),

    /// A value could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The underlying storage engine reported an error.
    #[error("Backend error: {0}")]
    BackendError(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::BackendError(format!("SQL error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::KeyNotFound("user:42".to_string());
        assert_eq!(err.to_string(), "Key not found: user:42");
        assert_eq!(StorageError::BackendClosed.to_string(), "Backend is closed");
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: StorageError = parse_err.into();
        assert!(matches!(err, StorageError::SerializationError(_)));
    }

    #[test]
    fn test_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StorageError = io_err.into();
        assert!(matches!(err, StorageError::IOError(_)));
    }
}
