// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Embedded multi-server HA backend: a Raft-replicated SQLite state machine
//! hosted in-process by `hiqlite`. Consensus is delegated wholly to the
//! library; this adapter only contributes the row-log schema and dialect.
//!
//! Writes go through the Raft leader and are assigned their revision by the
//! state machine's AUTOINCREMENT, which is the apply order of the log.
//! Reads serve from the local replica; the watch poller observes rows as the
//! log applies locally, which keeps per-key revision order intact.

use std::path::Path;

use async_trait::async_trait;
use hiqlite::{params, Param};
use tracing::info;

use crate::domain::datastore::DatastoreError;
use crate::infrastructure::datastore::sql::{InsertOutcome, KvRow, NewKvRow, SqlBackend};

/// One member of the replication group.
#[derive(Debug, Clone)]
pub struct RaftPeer {
    pub id: u64,
    /// hiqlite client API address, `host:port`.
    pub api_addr: String,
    /// Raft replication address, `host:port`.
    pub raft_addr: String,
}

/// Settings for the embedded replication group, derived from the server
/// configuration and (on join) the peer list handed out during bootstrap.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub node_id: u64,
    pub peers: Vec<RaftPeer>,
    /// Shared secret protecting the raft and API planes; derived from the
    /// cluster token during bootstrap.
    pub secret: String,
}

impl RaftOptions {
    /// Parse a `raft://` endpoint:
    /// `raft://<self-id>@<id>=<api host:port>+<raft host:port>[,...]`.
    /// The member list must include the local node's own id.
    pub fn parse(endpoint: &str, secret: String) -> Result<Self, DatastoreError> {
        let malformed = |detail: &str| {
            DatastoreError::Unavailable(format!("malformed raft endpoint ({detail}): {endpoint}"))
        };
        let rest = endpoint
            .strip_prefix("raft://")
            .ok_or_else(|| malformed("missing scheme"))?;
        let (self_id, members) = rest.split_once('@').ok_or_else(|| malformed("missing @"))?;
        let node_id: u64 = self_id.parse().map_err(|_| malformed("bad node id"))?;
        let mut peers = Vec::new();
        for member in members.split(',') {
            let (id, addrs) = member.split_once('=').ok_or_else(|| malformed("missing ="))?;
            let (api_addr, raft_addr) = addrs.split_once('+').ok_or_else(|| malformed("missing +"))?;
            peers.push(RaftPeer {
                id: id.parse().map_err(|_| malformed("bad member id"))?,
                api_addr: api_addr.to_string(),
                raft_addr: raft_addr.to_string(),
            });
        }
        if !peers.iter().any(|p| p.id == node_id) {
            return Err(malformed("member list does not include the local node"));
        }
        Ok(Self {
            node_id,
            peers,
            secret,
        })
    }
}

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
        old_value BLOB NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS kv_name_prev_revision_uindex ON kv (name, prev_revision)",
    "CREATE INDEX IF NOT EXISTS kv_name_id_index ON kv (name, id)",
    "CREATE TABLE IF NOT EXISTS compaction (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        compact_revision INTEGER NOT NULL
    )",
    "INSERT OR IGNORE INTO compaction (id, compact_revision) VALUES (1, 0)",
];

const ROW_COLUMNS: &str =
    "id, name, created, deleted, create_revision, prev_revision, version, lease, value, old_value";

pub struct RaftBackend {
    client: hiqlite::Client,
}

impl RaftBackend {
    /// Start (or join) the in-process replication group and open the store.
    pub async fn start(data_dir: &Path, options: RaftOptions) -> Result<Self, DatastoreError> {
        let nodes = options
            .peers
            .iter()
            .map(|p| hiqlite::Node {
                id: p.id,
                addr_api: p.api_addr.clone(),
                addr_raft: p.raft_addr.clone(),
            })
            .collect::<Vec<_>>();

        let config = hiqlite::NodeConfig {
            node_id: options.node_id,
            nodes,
            data_dir: data_dir.join("server").join("db").display().to_string().into(),
            filename_db: "state.db".into(),
            log_statements: false,
            prepared_statement_cache_capacity: 1024,
            read_pool_size: 4,
            secret_raft: options.secret.clone(),
            secret_api: options.secret,
            ..Default::default()
        };

        let client = hiqlite::start_node(config)
            .await
            .map_err(|e| DatastoreError::Unavailable(e.to_string()))?;
        info!(node_id = options.node_id, "raft datastore member started");
        Ok(Self { client })
    }

    async fn execute(&self, sql: &'static str, params: Vec<Param>) -> Result<usize, DatastoreError> {
        self.client
            .execute(sql, params)
            .await
            .map_err(map_hiqlite_err)
    }

    async fn query(
        &self,
        sql: &'static str,
        params: Vec<Param>,
    ) -> Result<Vec<hiqlite::Row<'static>>, DatastoreError> {
        self.client
            .query_raw(sql, params)
            .await
            .map_err(map_hiqlite_err)
    }
}

fn map_hiqlite_err(err: hiqlite::Error) -> DatastoreError {
    let text = err.to_string();
    // Raft leadership churn surfaces as retriable unavailability.
    if text.contains("leader") || text.contains("quorum") {
        DatastoreError::Unavailable(text)
    } else {
        DatastoreError::Database(text)
    }
}

fn is_unique_violation(err: &hiqlite::Error) -> bool {
    err.to_string().contains("UNIQUE constraint failed")
}

fn row_from_raft(mut row: hiqlite::Row<'_>) -> KvRow {
    let created = row.get::<i64>("created") != 0;
    let old_value: Vec<u8> = row.get("old_value");
    KvRow {
        id: row.get("id"),
        name: row.get("name"),
        created,
        deleted: row.get::<i64>("deleted") != 0,
        create_revision: row.get("create_revision"),
        prev_revision: row.get("prev_revision"),
        version: row.get("version"),
        lease: row.get("lease"),
        value: row.get("value"),
        // The schema stores old_value NOT NULL; only non-create rows have a
        // predecessor, so an empty blob on a create row means "none".
        old_value: if created { None } else { Some(old_value) },
    }
}

#[async_trait]
impl SqlBackend for RaftBackend {
    fn name(&self) -> &'static str {
        "raft"
    }

    async fn migrate(&self) -> Result<(), DatastoreError> {
        for statement in SCHEMA {
            self.execute(statement, params!()).await?;
        }
        Ok(())
    }

    async fn insert(&self, row: &NewKvRow) -> Result<InsertOutcome, DatastoreError> {
        let result = self
            .client
            .execute_returning_one(
                "INSERT INTO kv (name, created, deleted, create_revision, prev_revision, version, lease, value, old_value)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 RETURNING id",
                params!(
                    row.name.clone(),
                    row.created as i64,
                    row.deleted as i64,
                    row.create_revision,
                    row.prev_revision,
                    row.version,
                    row.lease,
                    row.value.clone(),
                    row.old_value.clone().unwrap_or_default()
                ),
            )
            .await;

        match result {
            Ok(mut returned) => Ok(InsertOutcome::Committed(returned.get::<i64>("id"))),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(map_hiqlite_err(e)),
        }
    }

    async fn latest(&self, name: &str, max_id: i64) -> Result<Option<KvRow>, DatastoreError> {
        let mut rows = self
            .query(
                "SELECT id, name, created, deleted, create_revision, prev_revision, version, lease, value, old_value
                 FROM kv
                 WHERE name = $1 AND ($2 = 0 OR id <= $2)
                 ORDER BY id DESC LIMIT 1",
                params!(name.to_string(), max_id),
            )
            .await?;
        Ok(rows.pop().map(row_from_raft))
    }

    async fn list_current(
        &self,
        start: &str,
        range_end: &str,
        limit: i64,
        max_id: i64,
    ) -> Result<Vec<KvRow>, DatastoreError> {
        let rows = self
            .query(
                "SELECT id, name, created, deleted, create_revision, prev_revision, version, lease, value, old_value
                 FROM kv AS a
                 WHERE a.name >= $1 AND ($2 = '' OR a.name < $2)
                   AND a.id = (SELECT MAX(b.id) FROM kv AS b
                               WHERE b.name = a.name AND ($3 = 0 OR b.id <= $3))
                   AND a.deleted = 0
                 ORDER BY a.name ASC
                 LIMIT $4",
                params!(
                    start.to_string(),
                    range_end.to_string(),
                    max_id,
                    if limit > 0 { limit } else { -1 }
                ),
            )
            .await?;
        Ok(rows.into_iter().map(row_from_raft).collect())
    }

    async fn count_current(&self, start: &str, range_end: &str) -> Result<i64, DatastoreError> {
        let mut rows = self
            .query(
                "SELECT COUNT(*) AS n FROM kv AS a
                 WHERE a.name >= $1 AND ($2 = '' OR a.name < $2)
                   AND a.id = (SELECT MAX(b.id) FROM kv AS b WHERE b.name = a.name)
                   AND a.deleted = 0",
                params!(start.to_string(), range_end.to_string()),
            )
            .await?;
        Ok(rows.pop().map(|mut r| r.get::<i64>("n")).unwrap_or(0))
    }

    async fn after(&self, revision: i64, limit: i64) -> Result<Vec<KvRow>, DatastoreError> {
        let rows = self
            .query(
                "SELECT id, name, created, deleted, create_revision, prev_revision, version, lease, value, old_value
                 FROM kv WHERE id > $1 ORDER BY id ASC LIMIT $2",
                params!(revision, if limit > 0 { limit } else { -1 }),
            )
            .await?;
        Ok(rows.into_iter().map(row_from_raft).collect())
    }

    async fn current_by_lease(&self, lease: i64) -> Result<Vec<KvRow>, DatastoreError> {
        let rows = self
            .query(
                "SELECT id, name, created, deleted, create_revision, prev_revision, version, lease, value, old_value
                 FROM kv AS a
                 WHERE a.lease = $1
                   AND a.id = (SELECT MAX(b.id) FROM kv AS b WHERE b.name = a.name)
                   AND a.deleted = 0
                 ORDER BY a.name ASC",
                params!(lease),
            )
            .await?;
        Ok(rows.into_iter().map(row_from_raft).collect())
    }

    async fn current_id(&self) -> Result<i64, DatastoreError> {
        let mut rows = self
            .query("SELECT COALESCE(MAX(id), 0) AS id FROM kv", params!())
            .await?;
        Ok(rows.pop().map(|mut r| r.get::<i64>("id")).unwrap_or(0))
    }

    async fn compact_revision(&self) -> Result<i64, DatastoreError> {
        let mut rows = self
            .query(
                "SELECT compact_revision FROM compaction WHERE id = 1",
                params!(),
            )
            .await?;
        Ok(rows
            .pop()
            .map(|mut r| r.get::<i64>("compact_revision"))
            .unwrap_or(0))
    }

    async fn set_compact_revision(&self, revision: i64) -> Result<(), DatastoreError> {
        self.execute(
            "UPDATE compaction SET compact_revision = $1 WHERE id = 1 AND compact_revision < $1",
            params!(revision),
        )
        .await?;
        Ok(())
    }

    async fn prune(&self, watermark: i64) -> Result<u64, DatastoreError> {
        let pruned = self
            .execute(
                "DELETE FROM kv
                 WHERE id <= $1
                   AND (deleted != 0
                        OR id NOT IN (SELECT MAX(b.id) FROM kv AS b GROUP BY b.name))",
                params!(watermark),
            )
            .await?;
        Ok(pruned as u64)
    }

    async fn db_size(&self) -> Result<i64, DatastoreError> {
        let mut rows = self
            .query(
                "SELECT page_count * page_size AS size FROM pragma_page_count(), pragma_page_size()",
                params!(),
            )
            .await?;
        Ok(rows.pop().map(|mut r| r.get::<i64>("size")).unwrap_or(0))
    }

    async fn close(&self) {
        if let Err(e) = self.client.shutdown().await {
            tracing::warn!(error = %e, "raft member shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raft_endpoint() {
        let options = RaftOptions::parse(
            "raft://2@1=10.0.0.1:8101+10.0.0.1:8102,2=10.0.0.2:8101+10.0.0.2:8102",
            "secret".to_string(),
        )
        .unwrap();
        assert_eq!(options.node_id, 2);
        assert_eq!(options.peers.len(), 2);
        assert_eq!(options.peers[0].api_addr, "10.0.0.1:8101");
        assert_eq!(options.peers[1].raft_addr, "10.0.0.2:8102");
    }

    #[test]
    fn test_parse_rejects_foreign_member_list() {
        assert!(RaftOptions::parse(
            "raft://9@1=a:1+a:2",
            "secret".to_string()
        )
        .is_err());
        assert!(RaftOptions::parse("raft://garbage", "secret".to_string()).is_err());
    }
}
