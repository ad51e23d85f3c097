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

//! Backup and restore for the SQLite store.
//!
//! ## Purpose
//! Creates full or incremental snapshots of the live entries in JSON, SQL
//! or CSV form, optionally gzip-compressed and password-encrypted, and
//! restores JSON snapshots back into the store. Every backup is recorded in
//! `storage_backups` with its file path, size and sha256 checksum; names
//! are unique across records, and failed attempts keep their record for
//! diagnosis.
//!
//! ## Encryption Format
//! Encrypted files are laid out as `salt(16) || nonce(12) || ciphertext`.
//! The AES-256-GCM key is derived from the password with Argon2id over the
//! per-backup random salt.
//!
//! SQL and CSV are export formats; only JSON backups can be restored.

use crate::{now_timestamp, Entry, StorageError, StorageResult};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// On-disk format version of the JSON payload.
const PAYLOAD_VERSION: u32 = 1;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// What a backup covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Every live entry.
    Full,
    /// Live entries updated after [`BackupOptions::since`].
    Incremental,
}

impl BackupType {
    fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }

    fn parse(s: &str) -> StorageResult<Self> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            other => Err(StorageError::BackupError(format!(
                "unknown backup type: {other}"
            ))),
        }
    }
}

/// Serialization format of a backup file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    /// Restorable JSON envelope.
    Json,
    /// `INSERT OR REPLACE` statements (export only).
    Sql,
    /// Comma-separated values (export only).
    Csv,
}

impl BackupFormat {
    fn as_str(&self) -> &'static str {
        match self {
            BackupFormat::Json => "json",
            BackupFormat::Sql => "sql",
            BackupFormat::Csv => "csv",
        }
    }

    fn parse(s: &str) -> StorageResult<Self> {
        match s {
            "json" => Ok(BackupFormat::Json),
            "sql" => Ok(BackupFormat::Sql),
            "csv" => Ok(BackupFormat::Csv),
            other => Err(StorageError::BackupError(format!(
                "unknown backup format: {other}"
            ))),
        }
    }
}

/// Lifecycle state of a backup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Recorded, file not finished yet.
    Pending,
    /// File written and checksummed.
    Completed,
    /// Creation failed; the record is kept for diagnosis.
    Failed,
}

impl BackupStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> StorageResult<Self> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(StorageError::BackupError(format!(
                "unknown backup status: {other}"
            ))),
        }
    }
}

/// Options for [`BackupManager::create_backup`].
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Backup name; unique across records, becomes part of the file name.
    /// Required.
    pub name: String,
    /// Free-form description stored with the record.
    pub description: String,
    /// Full or incremental.
    pub backup_type: BackupType,
    /// Output format.
    pub format: BackupFormat,
    /// Gzip the payload.
    pub compress: bool,
    /// Encrypt the payload; requires `password`.
    pub encrypt: bool,
    /// Password for encryption.
    pub password: Option<String>,
    /// Lower bound (exclusive, unix seconds) for incremental backups.
    pub since: Option<i64>,
    /// Write here instead of the manager's backup directory.
    pub output_path: Option<PathBuf>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            backup_type: BackupType::Full,
            format: BackupFormat::Json,
            compress: false,
            encrypt: false,
            password: None,
            since: None,
            output_path: None,
        }
    }
}

/// A backup record from `storage_backups`.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    /// Record id.
    pub id: String,
    /// Name given at creation; unique across records.
    pub name: String,
    /// Description given at creation.
    pub description: String,
    /// Full or incremental.
    pub backup_type: BackupType,
    /// File format.
    pub format: BackupFormat,
    /// Backup file location.
    pub path: PathBuf,
    /// Size of the final file in bytes.
    pub size_bytes: u64,
    /// sha256 of the final file, hex-encoded.
    pub checksum: String,
    /// Number of entries captured.
    pub entry_count: usize,
    /// Whether the payload is gzipped.
    pub compressed: bool,
    /// Whether the payload is encrypted.
    pub encrypted: bool,
    /// Record status.
    pub status: BackupStatus,
    /// Creation timestamp.
    pub created_at: i64,
    /// Completion timestamp, when finished.
    pub completed_at: Option<i64>,
}

/// JSON envelope written by JSON-format backups.
#[derive(Debug, Serialize, Deserialize)]
struct BackupPayload {
    version: u32,
    created_at: i64,
    entry_count: usize,
    entries: Vec<Entry>,
}

/// Creates, lists, restores and deletes backups of a SQLite store.
#[derive(Debug, Clone)]
pub struct BackupManager {
    pool: SqlitePool,
    backup_dir: PathBuf,
}

impl BackupManager {
    /// Create a manager writing to `backup_dir`.
    pub fn new(pool: SqlitePool, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            backup_dir: backup_dir.into(),
        }
    }

    /// Create the backup directory and the records table if missing.
    pub async fn initialize(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        sqlx::query(
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
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn validate_options(options: &BackupOptions) -> StorageResult<()> {
        if options.name.trim().is_empty() {
            return Err(StorageError::BackupError(
                "backup name is required".to_string(),
            ));
        }
        if options.encrypt && options.password.as_deref().unwrap_or("").is_empty() {
            return Err(StorageError::BackupError(
                "encryption requires a non-empty password".to_string(),
            ));
        }
        if options.backup_type == BackupType::Incremental && options.since.is_none() {
            return Err(StorageError::BackupError(
                "incremental backup requires a since timestamp".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a backup. The record is inserted as pending first; on any
    /// failure it is marked failed (and kept) before the error is returned.
    pub async fn create_backup(&self, options: &BackupOptions) -> StorageResult<BackupInfo> {
        Self::validate_options(options)?;

        // Names are unique; a rejected attempt leaves no record behind.
        let taken = sqlx::query("SELECT 1 FROM storage_backups WHERE name = ?")
            .bind(&options.name)
            .fetch_optional(&self.pool)
            .await?;
        if taken.is_some() {
            return Err(StorageError::BackupError(format!(
                "backup name already exists: {}",
                options.name
            )));
        }

        let id = Uuid::new_v4().to_string();
        let created_at = now_timestamp();

        let mut file_name = format!(
            "{}_{}.{}",
            options.name,
            created_at,
            options.format.as_str()
        );
        if options.compress {
            file_name.push_str(".gz");
        }
        if options.encrypt {
            file_name.push_str(".enc");
        }
        let path = options
            .output_path
            .clone()
            .unwrap_or_else(|| self.backup_dir.join(file_name));

        sqlx::query(
            r#"
            INSERT INTO storage_backups
                (id, name, description, backup_type, format, path, compressed, encrypted,
                 status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&options.name)
        .bind(&options.description)
        .bind(options.backup_type.as_str())
        .bind(options.format.as_str())
        .bind(path.to_string_lossy().as_ref())
        .bind(options.compress)
        .bind(options.encrypt)
        .bind(BackupStatus::Pending.as_str())
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        match self.perform_backup(options, &path, created_at).await {
            Ok((entry_count, size_bytes, checksum)) => {
                let completed_at = now_timestamp();
                sqlx::query(
                    "UPDATE storage_backups SET status = ?, size_bytes = ?, checksum = ?, \
                     entry_count = ?, completed_at = ? WHERE id = ?",
                )
                .bind(BackupStatus::Completed.as_str())
                .bind(size_bytes as i64)
                .bind(&checksum)
                .bind(entry_count as i64)
                .bind(completed_at)
                .bind(&id)
                .execute(&self.pool)
                .await?;

                tracing::info!(id = %id, name = %options.name, entries = entry_count, "backup completed");
                Ok(BackupInfo {
                    id,
                    name: options.name.clone(),
                    description: options.description.clone(),
                    backup_type: options.backup_type,
                    format: options.format,
                    path,
                    size_bytes,
                    checksum,
                    entry_count,
                    compressed: options.compress,
                    encrypted: options.encrypt,
                    status: BackupStatus::Completed,
                    created_at,
                    completed_at: Some(completed_at),
                })
            }
            Err(err) => {
                tracing::error!(id = %id, name = %options.name, error = %err, "backup failed");
                sqlx::query("UPDATE storage_backups SET status = ? WHERE id = ?")
                    .bind(BackupStatus::Failed.as_str())
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
                Err(err)
            }
        }
    }

    async fn perform_backup(
        &self,
        options: &BackupOptions,
        path: &Path,
        created_at: i64,
    ) -> StorageResult<(usize, u64, String)> {
        let entries = self.select_entries(options).await?;
        let entry_count = entries.len();

        let mut data = match options.format {
            BackupFormat::Json => {
                let payload = BackupPayload {
                    version: PAYLOAD_VERSION,
                    created_at,
                    entry_count,
                    entries,
                };
                serde_json::to_vec_pretty(&payload)?
            }
            BackupFormat::Sql => render_sql(&options.name, created_at, &entries).into_bytes(),
            BackupFormat::Csv => render_csv(&entries).into_bytes(),
        };

        if options.compress {
            data = gzip(&data)?;
        }
        if options.encrypt {
            // Validated earlier: encrypt implies a non-empty password.
            let password = options.password.as_deref().unwrap_or_default();
            data = encrypt_payload(&data, password)?;
        }

        tokio::fs::write(path, &data).await?;

        let checksum = hex::encode(Sha256::digest(&data));
        Ok((entry_count, data.len() as u64, checksum))
    }

    async fn select_entries(&self, options: &BackupOptions) -> StorageResult<Vec<Entry>> {
        let now = now_timestamp();
        let rows = match options.backup_type {
            BackupType::Full => {
                sqlx::query(
                    "SELECT key, value, expire_at, created_at, updated_at FROM storage_entries \
                     WHERE expire_at IS NULL OR expire_at > ? ORDER BY key",
                )
                .bind(now)
                .fetch_all(&self.pool)
                .await?
            }
            BackupType::Incremental => {
                sqlx::query(
                    "SELECT key, value, expire_at, created_at, updated_at FROM storage_entries \
                     WHERE updated_at > ? AND (expire_at IS NULL OR expire_at > ?) ORDER BY key",
                )
                .bind(options.since.unwrap_or(0))
                .bind(now)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(Entry {
                key: row.get("key"),
                value: serde_json::from_str(&row.get::<String, _>("value"))?,
                expire_at: row.get("expire_at"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            });
        }
        Ok(entries)
    }

    /// Restore a JSON backup by id. The file checksum is verified against
    /// the record before anything is applied, and all entries are upserted
    /// in one SQL transaction. Restore is additive: keys absent from the
    /// backup are left untouched.
    pub async fn restore_backup(&self, id: &str, password: Option<&str>) -> StorageResult<usize> {
        let info = self
            .get_backup(id)
            .await?
            .ok_or_else(|| StorageError::BackupError(format!("backup not found: {id}")))?;

        if info.status != BackupStatus::Completed {
            return Err(StorageError::BackupError(format!(
                "backup {id} is not restorable (status: {})",
                info.status.as_str()
            )));
        }
        if info.format != BackupFormat::Json {
            return Err(StorageError::BackupError(format!(
                "only json backups can be restored, this one is {}",
                info.format.as_str()
            )));
        }

        let mut data = tokio::fs::read(&info.path).await?;

        let checksum = hex::encode(Sha256::digest(&data));
        if checksum != info.checksum {
            return Err(StorageError::BackupError(format!(
                "checksum mismatch for backup {id}: file is corrupt or was modified"
            )));
        }

        if info.encrypted {
            let password = password.ok_or_else(|| {
                StorageError::BackupError(format!("backup {id} is encrypted, password required"))
            })?;
            data = decrypt_payload(&data, password)?;
        }
        if info.compressed {
            data = gunzip(&data)?;
        }

        let payload: BackupPayload = serde_json::from_slice(&data)?;
        if payload.version != PAYLOAD_VERSION {
            return Err(StorageError::BackupError(format!(
                "unsupported backup payload version: {}",
                payload.version
            )));
        }

        let now = now_timestamp();
        let mut restored = 0usize;
        let mut tx = self.pool.begin().await?;
        for entry in &payload.entries {
            if entry.is_expired_at(now) {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO storage_entries (key, value, expire_at, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expire_at = excluded.expire_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entry.key)
            .bind(serde_json::to_string(&entry.value)?)
            .bind(entry.expire_at)
            .bind(entry.created_at)
            .bind(entry.updated_at)
            .execute(&mut *tx)
            .await?;
            restored += 1;
        }
        tx.commit().await?;

        tracing::info!(id = %id, restored, "backup restored");
        Ok(restored)
    }

    /// All backup records, newest first.
    pub async fn list_backups(&self) -> StorageResult<Vec<BackupInfo>> {
        let rows = sqlx::query(
            "SELECT id, name, description, backup_type, format, path, size_bytes, checksum, \
             entry_count, compressed, encrypted, status, created_at, completed_at \
             FROM storage_backups ORDER BY created_at DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(backup_info_from_row).collect()
    }

    /// Look up one backup record.
    pub async fn get_backup(&self, id: &str) -> StorageResult<Option<BackupInfo>> {
        let row = sqlx::query(
            "SELECT id, name, description, backup_type, format, path, size_bytes, checksum, \
             entry_count, compressed, encrypted, status, created_at, completed_at \
             FROM storage_backups WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(backup_info_from_row).transpose()
    }

    /// Delete a backup: the file first (tolerating one that is already
    /// gone), then the record.
    pub async fn delete_backup(&self, id: &str) -> StorageResult<()> {
        let info = self
            .get_backup(id)
            .await?
            .ok_or_else(|| StorageError::BackupError(format!("backup not found: {id}")))?;

        match tokio::fs::remove_file(&info.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        sqlx::query("DELETE FROM storage_backups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn backup_info_from_row(row: sqlx::sqlite::SqliteRow) -> StorageResult<BackupInfo> {
    Ok(BackupInfo {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        backup_type: BackupType::parse(&row.get::<String, _>("backup_type"))?,
        format: BackupFormat::parse(&row.get::<String, _>("format"))?,
        path: PathBuf::from(row.get::<String, _>("path")),
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        checksum: row.get("checksum"),
        entry_count: row.get::<i64, _>("entry_count") as usize,
        compressed: row.get("compressed"),
        encrypted: row.get("encrypted"),
        status: BackupStatus::parse(&row.get::<String, _>("status"))?,
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

fn render_sql(name: &str, created_at: i64, entries: &[Entry]) -> String {
    let mut out = String::new();
    out.push_str("-- plugstore backup\n");
    out.push_str(&format!("-- name: {name}\n"));
    out.push_str(&format!("-- created_at: {created_at}\n"));
    out.push_str(&format!("-- entries: {}\n\n", entries.len()));
    out.push_str("BEGIN TRANSACTION;\n");
    for entry in entries {
        let expire = entry
            .expire_at
            .map(|e| e.to_string())
            .unwrap_or_else(|| "NULL".to_string());
        out.push_str(&format!(
            "INSERT OR REPLACE INTO storage_entries (key, value, expire_at, created_at, updated_at) \
             VALUES ('{}', '{}', {}, {}, {});\n",
            sql_escape(&entry.key),
            sql_escape(&entry.value.to_string()),
            expire,
            entry.created_at,
            entry.updated_at,
        ));
    }
    out.push_str("COMMIT;\n");
    out
}

fn sql_escape(s: &str) -> String {
    s.replace('\'', "''")
}

fn render_csv(entries: &[Entry]) -> String {
    let mut out = String::from("key,value,expire_at,created_at,updated_at\n");
    for entry in entries {
        let expire = entry
            .expire_at
            .map(|e| e.to_string())
            .unwrap_or_default();
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            csv_escape(&entry.key),
            csv_escape(&entry.value.to_string()),
            expire,
            entry.created_at,
            entry.updated_at,
        ));
    }
    out
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn gzip(data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn derive_key(password: &str, salt: &[u8]) -> StorageResult<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| StorageError::CryptoError(format!("key derivation failed: {e}")))?;
    Ok(key)
}

fn encrypt_payload(data: &[u8], password: &str) -> StorageResult<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(password, &salt)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, data)
        .map_err(|_| StorageError::CryptoError("encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_payload(data: &[u8], password: &str) -> StorageResult<Vec<u8>> {
    if data.len() < SALT_LEN + NONCE_LEN {
        return Err(StorageError::CryptoError(
            "encrypted payload too short".to_string(),
        ));
    }
    let (salt, rest) = data.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let key = derive_key(password, salt)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| {
            StorageError::CryptoError("decryption failed: wrong password or corrupt data".to_string())
        })
}
