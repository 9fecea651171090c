// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Embedded single-server backend: one SQLite database in WAL mode.
//!
//! The write-ahead log gives atomic appends and lets snapshot tooling read a
//! consistent image while the server runs. Revisions are the AUTOINCREMENT
//! row ids, which SQLite guarantees are monotone and never reused.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use tracing::info;

use crate::domain::datastore::DatastoreError;
use crate::infrastructure::datastore::sql::{InsertOutcome, KvRow, NewKvRow, SqlBackend};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kv (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        created INTEGER NOT NULL,
        deleted INTEGER NOT NULL,
        create_revision INTEGER NOT NULL,
        prev_revision INTEGER NOT NULL,
        version INTEGER NOT NULL,
        lease INTEGER NOT NULL,
        value BLOB NOT NULL,
        old_value BLOB
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS kv_name_prev_revision_uindex ON kv (name, prev_revision)",
    "CREATE INDEX IF NOT EXISTS kv_name_id_index ON kv (name, id)",
    "CREATE INDEX IF NOT EXISTS kv_id_deleted_index ON kv (id, deleted)",
    "CREATE TABLE IF NOT EXISTS compaction (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        compact_revision INTEGER NOT NULL
    )",
    "INSERT OR IGNORE INTO compaction (id, compact_revision) VALUES (1, 0)",
];

const ROW_COLUMNS: &str =
    "id, name, created, deleted, create_revision, prev_revision, version, lease, value, old_value";

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, DatastoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatastoreError::Unavailable(e.to_string()))?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(DatastoreError::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "sqlite datastore open");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_from_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<KvRow, DatastoreError> {
    Ok(KvRow {
        id: row.try_get::<i64, _>("id")?,
        name: row.try_get::<String, _>("name")?,
        created: row.try_get::<i64, _>("created")? != 0,
        deleted: row.try_get::<i64, _>("deleted")? != 0,
        create_revision: row.try_get::<i64, _>("create_revision")?,
        prev_revision: row.try_get::<i64, _>("prev_revision")?,
        version: row.try_get::<i64, _>("version")?,
        lease: row.try_get::<i64, _>("lease")?,
        value: row.try_get::<Vec<u8>, _>("value")?,
        old_value: row.try_get::<Option<Vec<u8>>, _>("old_value")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn migrate(&self) -> Result<(), DatastoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert(&self, row: &NewKvRow) -> Result<InsertOutcome, DatastoreError> {
        let result = sqlx::query(
            "INSERT INTO kv (name, created, deleted, create_revision, prev_revision, version, lease, value, old_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&row.name)
        .bind(row.created as i64)
        .bind(row.deleted as i64)
        .bind(row.create_revision)
        .bind(row.prev_revision)
        .bind(row.version)
        .bind(row.lease)
        .bind(&row.value)
        .bind(row.old_value.as_deref())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(InsertOutcome::Committed(done.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn latest(&self, name: &str, max_id: i64) -> Result<Option<KvRow>, DatastoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM kv
             WHERE name = ?1 AND (?2 = 0 OR id <= ?2)
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(name)
        .bind(max_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_from_sqlite).transpose()
    }

    async fn list_current(
        &self,
        start: &str,
        range_end: &str,
        limit: i64,
        max_id: i64,
    ) -> Result<Vec<KvRow>, DatastoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM kv AS a
             WHERE a.name >= ?1 AND (?2 = '' OR a.name < ?2)
               AND a.id = (SELECT MAX(b.id) FROM kv AS b
                           WHERE b.name = a.name AND (?3 = 0 OR b.id <= ?3))
               AND a.deleted = 0
             ORDER BY a.name ASC
             LIMIT ?4"
        ))
        .bind(start)
        .bind(range_end)
        .bind(max_id)
        .bind(if limit > 0 { limit } else { -1 })
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_from_sqlite).collect()
    }

    async fn count_current(&self, start: &str, range_end: &str) -> Result<i64, DatastoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM kv AS a
             WHERE a.name >= ?1 AND (?2 = '' OR a.name < ?2)
               AND a.id = (SELECT MAX(b.id) FROM kv AS b WHERE b.name = a.name)
               AND a.deleted = 0",
        )
        .bind(start)
        .bind(range_end)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    async fn after(&self, revision: i64, limit: i64) -> Result<Vec<KvRow>, DatastoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM kv WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
        ))
        .bind(revision)
        .bind(if limit > 0 { limit } else { -1 })
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_from_sqlite).collect()
    }

    async fn current_by_lease(&self, lease: i64) -> Result<Vec<KvRow>, DatastoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM kv AS a
             WHERE a.lease = ?1
               AND a.id = (SELECT MAX(b.id) FROM kv AS b WHERE b.name = a.name)
               AND a.deleted = 0
             ORDER BY a.name ASC"
        ))
        .bind(lease)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_from_sqlite).collect()
    }

    async fn current_id(&self) -> Result<i64, DatastoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS id FROM kv")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("id")?)
    }

    async fn compact_revision(&self) -> Result<i64, DatastoreError> {
        let row = sqlx::query("SELECT compact_revision FROM compaction WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("compact_revision")?)
    }

    async fn set_compact_revision(&self, revision: i64) -> Result<(), DatastoreError> {
        sqlx::query("UPDATE compaction SET compact_revision = ?1 WHERE id = 1 AND compact_revision < ?1")
            .bind(revision)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune(&self, watermark: i64) -> Result<u64, DatastoreError> {
        let done = sqlx::query(
            "DELETE FROM kv
             WHERE id <= ?1
               AND (deleted != 0
                    OR id NOT IN (SELECT MAX(b.id) FROM kv AS b GROUP BY b.name))",
        )
        .bind(watermark)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn db_size(&self) -> Result<i64, DatastoreError> {
        let row = sqlx::query(
            "SELECT page_count * page_size AS size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("size")?)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::datastore::{Datastore, DatastoreError};
    use crate::domain::kv::EventKind;
    use crate::infrastructure::datastore::sql::{DriverOptions, SqlDriver};
    use std::sync::Arc;
    use std::time::Duration;

    async fn open_driver(dir: &tempfile::TempDir) -> Arc<SqlDriver<SqliteBackend>> {
        let backend = SqliteBackend::open(&dir.path().join("state.db"))
            .await
            .unwrap();
        SqlDriver::open(backend, DriverOptions::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_then_get_returns_value_at_version_one() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let rev = driver.create("/a", b"1", 0).await.unwrap();
        assert!(rev > 0);
        let (current, kv) = driver.get("/a", 0).await.unwrap();
        let kv = kv.unwrap();
        assert_eq!(current, rev);
        assert_eq!(kv.value, b"1");
        assert_eq!(kv.version, 1);
        assert_eq!(kv.create_revision, rev);
        assert_eq!(kv.mod_revision, rev);
        driver.close().await;
    }

    #[tokio::test]
    async fn test_create_existing_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        driver.create("/a", b"1", 0).await.unwrap();
        let err = driver.create("/a", b"2", 0).await.unwrap_err();
        assert!(matches!(err, DatastoreError::AlreadyExists(_)));
        driver.close().await;
    }

    #[tokio::test]
    async fn test_revisions_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let mut last = 0;
        for i in 0..5 {
            let rev = driver
                .create(&format!("/k{}", i), b"v", 0)
                .await
                .unwrap();
            assert!(rev > last);
            last = rev;
        }
        driver.close().await;
    }

    #[tokio::test]
    async fn test_update_cas_mismatch_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let rev = driver.create("/a", b"1", 0).await.unwrap();
        let (_, kv, ok) = driver.update("/a", b"2", rev + 100, 0).await.unwrap();
        assert!(!ok);
        assert_eq!(kv.unwrap().value, b"1");

        let (_, kv, ok) = driver.update("/a", b"2", rev, 0).await.unwrap();
        assert!(ok);
        let kv = kv.unwrap();
        assert_eq!(kv.version, 2);
        assert_eq!(kv.create_revision, rev);
        driver.close().await;
    }

    #[tokio::test]
    async fn test_delete_leaves_pre_delete_value_readable_at_old_revision() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let rev = driver.create("/a", b"1", 0).await.unwrap();
        let (_, prior, deleted) = driver.delete("/a", rev).await.unwrap();
        assert!(deleted);
        assert_eq!(prior.unwrap().value, b"1");

        let (_, now) = driver.get("/a", 0).await.unwrap();
        assert!(now.is_none());
        let (_, old) = driver.get("/a", rev).await.unwrap();
        assert_eq!(old.unwrap().value, b"1");
        driver.close().await;
    }

    #[tokio::test]
    async fn test_delete_cas_mismatch_reports_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let rev = driver.create("/a", b"1", 0).await.unwrap();
        let (_, _, deleted) = driver.delete("/a", rev + 1).await.unwrap();
        assert!(!deleted);
        let (_, kv) = driver.get("/a", 0).await.unwrap();
        assert!(kv.is_some());
        driver.close().await;
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        for key in ["/r/c", "/r/a", "/r/b", "/other"] {
            driver.create(key, b"v", 0).await.unwrap();
        }
        let (_, page) = driver.list("/r/", "", 2, 0).await.unwrap();
        let names: Vec<_> = page.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(names, vec!["/r/a", "/r/b"]);

        // Resume after the last returned key, etcd-style.
        let (_, rest) = driver.list("/r/", "/r/b\0", 0, 0).await.unwrap();
        let names: Vec<_> = rest.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(names, vec!["/r/c"]);

        let (_, count) = driver.count("/r/").await.unwrap();
        assert_eq!(count, 3);
        driver.close().await;
    }

    #[tokio::test]
    async fn test_list_at_historic_revision() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let r1 = driver.create("/a", b"1", 0).await.unwrap();
        driver.update("/a", b"2", r1, 0).await.unwrap();
        let (_, at_r1) = driver.list("/", "", 0, r1).await.unwrap();
        assert_eq!(at_r1.len(), 1);
        assert_eq!(at_r1[0].value, b"1");
        driver.close().await;
    }

    #[tokio::test]
    async fn test_watch_backfills_then_streams() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let r1 = driver.create("/w/a", b"1", 0).await.unwrap();
        driver.create("/other", b"x", 0).await.unwrap();

        let mut watcher = driver.watch("/w/", r1).await.unwrap();
        let batch = watcher.recv().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, EventKind::Create);
        assert_eq!(batch[0].kv.key, "/w/a");
        assert_eq!(batch[0].revision(), r1);

        let r3 = driver.create("/w/b", b"2", 0).await.unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].kv.key, "/w/b");
        assert_eq!(batch[0].revision(), r3);
        driver.close().await;
    }

    #[tokio::test]
    async fn test_watch_events_arrive_in_revision_order() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let first = driver.create("/w/0", b"v", 0).await.unwrap();
        for i in 1..10 {
            driver.create(&format!("/w/{}", i), b"v", 0).await.unwrap();
        }
        let mut watcher = driver.watch("/w/", first).await.unwrap();
        let mut seen = Vec::new();
        while seen.len() < 10 {
            let batch = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.extend(batch.into_iter().map(|e| e.revision()));
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);
        driver.close().await;
    }

    #[tokio::test]
    async fn test_watch_from_compacted_revision_fails() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let r1 = driver.create("/a", b"1", 0).await.unwrap();
        driver.update("/a", b"2", r1, 0).await.unwrap();
        let current = driver.current_revision().await.unwrap();
        driver.compact(current).await.unwrap();

        let err = driver.watch("/", r1).await.unwrap_err();
        assert!(matches!(err, DatastoreError::Compacted { .. }));
        driver.close().await;
    }

    #[tokio::test]
    async fn test_compaction_cancels_live_watch_before_new_events() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let r1 = driver.create("/a", b"1", 0).await.unwrap();
        let mut watcher = driver.watch("/", r1).await.unwrap();
        // Drain the backfilled create.
        let _ = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .unwrap();

        let current = driver.current_revision().await.unwrap();
        driver.compact(current).await.unwrap();
        driver.create("/b", b"2", 0).await.unwrap();

        // The subscription ends with Compacted instead of delivering /b.
        let mut outcome = None;
        while let Some(batch) = watcher.recv().await {
            match batch {
                Ok(events) => {
                    assert!(events.iter().all(|e| e.kv.key != "/b"));
                }
                Err(e) => {
                    outcome = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(outcome, Some(DatastoreError::Compacted { .. })));

        // A fresh live-only watch sees subsequent writes.
        let mut fresh = driver.watch("/", 0).await.unwrap();
        driver.create("/c", b"3", 0).await.unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(5), fresh.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].kv.key, "/c");
        driver.close().await;
    }

    #[tokio::test]
    async fn test_compaction_preserves_current_values() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let r1 = driver.create("/a", b"1", 0).await.unwrap();
        driver.update("/a", b"2", r1, 0).await.unwrap();
        driver.create("/b", b"x", 0).await.unwrap();
        let current = driver.current_revision().await.unwrap();
        driver.compact(current).await.unwrap();

        let (_, a) = driver.get("/a", 0).await.unwrap();
        assert_eq!(a.unwrap().value, b"2");
        let (_, b) = driver.get("/b", 0).await.unwrap();
        assert_eq!(b.unwrap().value, b"x");

        // The superseded first version is gone.
        let err = driver.get("/a", r1).await.unwrap_err();
        assert!(matches!(err, DatastoreError::Compacted { .. }));
        driver.close().await;
    }

    #[tokio::test]
    async fn test_lease_revoke_deletes_attached_keys() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let lease = driver.lease_grant(60).await.unwrap();
        driver.create("/l/a", b"1", lease.id).await.unwrap();
        driver.create("/l/b", b"2", lease.id).await.unwrap();
        driver.create("/keep", b"3", 0).await.unwrap();

        let status = driver.lease_time_to_live(lease.id, true).await.unwrap();
        assert_eq!(status.granted_ttl, 60);
        assert_eq!(status.keys.len(), 2);

        driver.lease_revoke(lease.id).await.unwrap();
        assert!(driver.get("/l/a", 0).await.unwrap().1.is_none());
        assert!(driver.get("/l/b", 0).await.unwrap().1.is_none());
        assert!(driver.get("/keep", 0).await.unwrap().1.is_some());

        let err = driver.lease_time_to_live(lease.id, false).await.unwrap_err();
        assert!(matches!(err, DatastoreError::LeaseNotFound(_)));
        driver.close().await;
    }

    #[tokio::test]
    async fn test_lease_renew_refreshes_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_driver(&dir).await;

        let lease = driver.lease_grant(30).await.unwrap();
        let renewed = driver.lease_renew(lease.id).await.unwrap();
        assert_eq!(renewed.ttl_seconds, 30);
        let status = driver.lease_time_to_live(lease.id, false).await.unwrap();
        assert!(status.remaining_ttl > 0 && status.remaining_ttl <= 30);
        driver.close().await;
    }

    #[tokio::test]
    async fn test_revisions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let rev = {
            let driver = open_driver(&dir).await;
            let rev = driver.create("/a", b"1", 0).await.unwrap();
            driver.close().await;
            rev
        };
        let driver = open_driver(&dir).await;
        let (current, kv) = driver.get("/a", 0).await.unwrap();
        assert_eq!(current, rev);
        assert_eq!(kv.unwrap().value, b"1");
        // New writes continue above the persisted revision.
        let next = driver.create("/b", b"2", 0).await.unwrap();
        assert!(next > rev);
        driver.close().await;
    }
}
