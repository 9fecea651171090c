// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Snapshot lifecycle for the embedded datastore.
//!
//! `save` produces a consistent single-file image with `VACUUM INTO`, which
//! is safe against a live WAL-mode database. `restore` swaps the image in
//! while the server is stopped; other server nodes of a shared datastore
//! must be wiped and rejoined afterwards. External datastores are not
//! snapshotted here; their own tooling owns that.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::ConnectOptions;
use tracing::info;

use crate::infrastructure::datastore::{embedded_db_path, parse_endpoint, snapshot_dir, EndpointKind};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshots require the embedded datastore; use the external datastore's own tooling")]
    Unsupported,

    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("invalid snapshot name: {0}")]
    InvalidName(String),

    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub struct SnapshotManager {
    db_path: PathBuf,
    dir: PathBuf,
}

impl SnapshotManager {
    /// Fails up front unless the endpoint selects the embedded store.
    pub fn new(data_dir: &Path, datastore_endpoint: &str) -> Result<Self, SnapshotError> {
        match parse_endpoint(datastore_endpoint) {
            Ok(EndpointKind::Embedded) => {}
            _ => return Err(SnapshotError::Unsupported),
        }
        Ok(Self {
            db_path: embedded_db_path(data_dir),
            dir: snapshot_dir(data_dir),
        })
    }

    fn snapshot_path(&self, name: &str) -> Result<PathBuf, SnapshotError> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(SnapshotError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }

    /// Take a consistent snapshot. A `None` name is stamped with the time.
    pub async fn save(&self, name: Option<String>) -> Result<SnapshotInfo, SnapshotError> {
        let name =
            name.unwrap_or_else(|| format!("on-demand-{}", Utc::now().format("%Y%m%d-%H%M%S")));
        let path = self.snapshot_path(&name)?;
        fs::create_dir_all(&self.dir)?;
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let mut conn = SqliteConnectOptions::from_str(&format!("sqlite://{}", self.db_path.display()))
            .map_err(|e| SnapshotError::Database(e.to_string()))?
            .connect()
            .await
            .map_err(|e| SnapshotError::Database(e.to_string()))?;
        // VACUUM INTO takes a literal path; escape embedded quotes.
        let escaped = path.display().to_string().replace('\'', "''");
        sqlx::query(&format!("VACUUM INTO '{escaped}'"))
            .execute(&mut conn)
            .await
            .map_err(|e| SnapshotError::Database(e.to_string()))?;

        let size = fs::metadata(&path)?.len();
        info!(snapshot = %name, size, "snapshot saved");
        Ok(SnapshotInfo {
            name,
            size_bytes: size,
            created_at: Utc::now(),
        })
    }

    pub fn list(&self) -> Result<Vec<SnapshotInfo>, SnapshotError> {
        let mut snapshots = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            snapshots.push(SnapshotInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                size_bytes: metadata.len(),
                created_at: metadata.modified().map(DateTime::<Utc>::from)?,
            });
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snapshots)
    }

    pub fn delete(&self, name: &str) -> Result<(), SnapshotError> {
        let path = self.snapshot_path(name)?;
        if !path.exists() {
            return Err(SnapshotError::NotFound(name.to_string()));
        }
        fs::remove_file(path)?;
        info!(snapshot = %name, "snapshot deleted");
        Ok(())
    }

    /// Keep the newest `retention` snapshots, delete the rest.
    pub fn prune(&self, retention: usize) -> Result<Vec<String>, SnapshotError> {
        let snapshots = self.list()?;
        let mut removed = Vec::new();
        if snapshots.len() <= retention {
            return Ok(removed);
        }
        for snapshot in &snapshots[..snapshots.len() - retention] {
            self.delete(&snapshot.name)?;
            removed.push(snapshot.name.clone());
        }
        Ok(removed)
    }

    /// Replace the live database with a snapshot. The server must be
    /// stopped; the previous database is kept aside under a `.pre-restore`
    /// suffix.
    pub fn restore(&self, name: &str) -> Result<(), SnapshotError> {
        let path = self.snapshot_path(name)?;
        if !path.exists() {
            return Err(SnapshotError::NotFound(name.to_string()));
        }
        if self.db_path.exists() {
            let backup = self.db_path.with_extension("db.pre-restore");
            let _ = fs::remove_file(&backup);
            fs::rename(&self.db_path, &backup)?;
        }
        // Stale WAL segments must not be replayed over the restored image.
        for suffix in ["-wal", "-shm"] {
            let side = PathBuf::from(format!("{}{}", self.db_path.display(), suffix));
            let _ = fs::remove_file(side);
        }
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&path, &self.db_path)?;
        info!(snapshot = %name, "datastore restored from snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::datastore::Datastore;
    use crate::infrastructure::datastore::sqlite::SqliteBackend;
    use crate::infrastructure::datastore::{DriverOptions, SqlDriver};
    use std::sync::Arc;

    async fn open(dir: &tempfile::TempDir) -> Arc<dyn Datastore> {
        let backend = SqliteBackend::open(&embedded_db_path(dir.path())).await.unwrap();
        SqlDriver::open(backend, DriverOptions::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_save_write_restore() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), "").unwrap();

        let store = open(&dir).await;
        store.create("/a", b"1", 0).await.unwrap();
        store.close().await;

        let info = manager.save(Some("pre-b".to_string())).await.unwrap();
        assert!(info.size_bytes > 0);

        let store = open(&dir).await;
        store.create("/b", b"2", 0).await.unwrap();
        store.close().await;

        manager.restore("pre-b").unwrap();

        let store = open(&dir).await;
        let (_, a) = store.get("/a", 0).await.unwrap();
        assert_eq!(a.unwrap().value, b"1");
        let (_, b) = store.get("/b", 0).await.unwrap();
        assert!(b.is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), "").unwrap();
        let store = open(&dir).await;
        store.create("/a", b"1", 0).await.unwrap();
        store.close().await;

        for name in ["s1", "s2", "s3"] {
            manager.save(Some(name.to_string())).await.unwrap();
            // Modified-time granularity orders the listing.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let removed = manager.prune(2).unwrap();
        assert_eq!(removed, vec!["s1".to_string()]);
        let left: Vec<_> = manager.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(left, vec!["s2".to_string(), "s3".to_string()]);
    }

    #[test]
    fn test_external_endpoint_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = SnapshotManager::new(dir.path(), "postgres://db/kv").unwrap_err();
        assert!(matches!(err, SnapshotError::Unsupported));
    }

    #[test]
    fn test_snapshot_names_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path(), "").unwrap();
        assert!(matches!(
            manager.delete("../escape"),
            Err(SnapshotError::InvalidName(_))
        ));
    }
}
