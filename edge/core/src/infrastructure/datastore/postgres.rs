// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Networked relational backend: one table in an external PostgreSQL
//! database, shared by every control-plane server. Revisions are the
//! BIGSERIAL primary key, so the database itself arbitrates write order
//! between servers.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use crate::domain::datastore::DatastoreError;
use crate::infrastructure::datastore::sql::{InsertOutcome, KvRow, NewKvRow, SqlBackend};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kv (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(630) NOT NULL,
        created BOOLEAN NOT NULL,
        deleted BOOLEAN NOT NULL,
        create_revision BIGINT NOT NULL,
        prev_revision BIGINT NOT NULL,
        version BIGINT NOT NULL,
        lease BIGINT NOT NULL,
        value BYTEA NOT NULL,
        old_value BYTEA
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS kv_name_prev_revision_uindex ON kv (name, prev_revision)",
    "CREATE INDEX IF NOT EXISTS kv_name_id_index ON kv (name, id)",
    "CREATE TABLE IF NOT EXISTS compaction (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        compact_revision BIGINT NOT NULL
    )",
    "INSERT INTO compaction (id, compact_revision) VALUES (1, 0) ON CONFLICT (id) DO NOTHING",
];

const ROW_COLUMNS: &str =
    "id, name, created, deleted, create_revision, prev_revision, version, lease, value, old_value";

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Connect to the shared database named by a `postgres://` endpoint.
    pub async fn connect(endpoint: &str) -> Result<Self, DatastoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(endpoint)
            .await?;
        info!("postgres datastore connected");
        Ok(Self { pool })
    }
}

fn row_from_pg(row: &sqlx::postgres::PgRow) -> Result<KvRow, DatastoreError> {
    Ok(KvRow {
        id: row.try_get::<i64, _>("id")?,
        name: row.try_get::<String, _>("name")?,
        created: row.try_get::<bool, _>("created")?,
        deleted: row.try_get::<bool, _>("deleted")?,
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
impl SqlBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING id",
        )
        .bind(&row.name)
        .bind(row.created)
        .bind(row.deleted)
        .bind(row.create_revision)
        .bind(row.prev_revision)
        .bind(row.version)
        .bind(row.lease)
        .bind(&row.value)
        .bind(row.old_value.as_deref())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(InsertOutcome::Committed(row.try_get::<i64, _>("id")?)),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    async fn latest(&self, name: &str, max_id: i64) -> Result<Option<KvRow>, DatastoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM kv
             WHERE name = $1 AND ($2 = 0 OR id <= $2)
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(name)
        .bind(max_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_from_pg).transpose()
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
             WHERE a.name >= $1 AND ($2 = '' OR a.name < $2)
               AND a.id = (SELECT MAX(b.id) FROM kv AS b
                           WHERE b.name = a.name AND ($3 = 0 OR b.id <= $3))
               AND NOT a.deleted
             ORDER BY a.name ASC
             LIMIT $4"
        ))
        .bind(start)
        .bind(range_end)
        .bind(max_id)
        .bind(if limit > 0 { Some(limit) } else { None })
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_from_pg).collect()
    }

    async fn count_current(&self, start: &str, range_end: &str) -> Result<i64, DatastoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM kv AS a
             WHERE a.name >= $1 AND ($2 = '' OR a.name < $2)
               AND a.id = (SELECT MAX(b.id) FROM kv AS b WHERE b.name = a.name)
               AND NOT a.deleted",
        )
        .bind(start)
        .bind(range_end)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    async fn after(&self, revision: i64, limit: i64) -> Result<Vec<KvRow>, DatastoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM kv WHERE id > $1 ORDER BY id ASC LIMIT $2"
        ))
        .bind(revision)
        .bind(if limit > 0 { Some(limit) } else { None })
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_from_pg).collect()
    }

    async fn current_by_lease(&self, lease: i64) -> Result<Vec<KvRow>, DatastoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ROW_COLUMNS} FROM kv AS a
             WHERE a.lease = $1
               AND a.id = (SELECT MAX(b.id) FROM kv AS b WHERE b.name = a.name)
               AND NOT a.deleted
             ORDER BY a.name ASC"
        ))
        .bind(lease)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_from_pg).collect()
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
        sqlx::query(
            "UPDATE compaction SET compact_revision = $1 WHERE id = 1 AND compact_revision < $1",
        )
        .bind(revision)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune(&self, watermark: i64) -> Result<u64, DatastoreError> {
        let done = sqlx::query(
            "DELETE FROM kv
             WHERE id <= $1
               AND (deleted
                    OR id NOT IN (SELECT MAX(b.id) FROM kv AS b GROUP BY b.name))",
        )
        .bind(watermark)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn db_size(&self) -> Result<i64, DatastoreError> {
        let row = sqlx::query("SELECT pg_database_size(current_database()) AS size")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("size")?)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
