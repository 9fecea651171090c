// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Datastore Port - Storage Driver Abstraction
//
// One interface over the pluggable datastore backends:
// - embedded SQLite (single server)
// - networked PostgreSQL (multiple servers sharing one database)
// - embedded Raft-replicated SQLite (multi-server HA)
//
// The KV bridge and the bootstrap coordinator only ever talk to this trait;
// revision assignment, compaction scheduling and the lease sweep live behind
// it, inside each driver.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::kv::{Event, KeyValue};

/// Errors surfaced by a storage driver.
///
/// A CAS mismatch is not an error; the affected operations report it through
/// their `ok`/`deleted` result field so callers can re-read and retry.
#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("revision {requested} has been compacted (watermark {watermark})")]
    Compacted { requested: i64, watermark: i64 },

    #[error("watch closed: subscriber fell behind the event stream")]
    Closed,

    #[error("lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("operation timed out")]
    Timeout,

    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("snapshots are not supported for an external datastore")]
    SnapshotUnsupported,
}

/// A granted lease. Keys carrying the lease ID are deleted together once the
/// lease expires or is revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: i64,
    pub ttl_seconds: i64,
}

/// Lease inspection result for TimeToLive.
#[derive(Debug, Clone)]
pub struct LeaseStatus {
    pub id: i64,
    pub granted_ttl: i64,
    pub remaining_ttl: i64,
    pub keys: Vec<String>,
}

/// One batch of events, grouped by the revision that produced them, or the
/// terminal error that ended the subscription.
pub type WatchBatch = Result<Vec<Event>, DatastoreError>;

/// Handle to a watch subscription.
///
/// The driver feeds each subscriber through its own bounded queue; a
/// subscriber that fails to drain the queue receives [`DatastoreError::Closed`]
/// and is dropped rather than blocking the driver.
pub struct Watcher {
    pub start_revision: i64,
    pub receiver: mpsc::Receiver<WatchBatch>,
}

impl Watcher {
    /// Receive the next event batch. `None` means the stream ended.
    pub async fn recv(&mut self) -> Option<WatchBatch> {
        self.receiver.recv().await
    }
}

/// Uniform interface over the datastore backends.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Current value of the key, or its latest version at or below
    /// `revision` when `revision > 0`. Returns the revision the read was
    /// served at alongside the record.
    async fn get(&self, key: &str, revision: i64) -> Result<(i64, Option<KeyValue>), DatastoreError>;

    /// Atomically create the key. Fails with [`DatastoreError::AlreadyExists`]
    /// if a live record exists.
    async fn create(&self, key: &str, value: &[u8], lease: i64) -> Result<i64, DatastoreError>;

    /// Compare-and-swap on `mod_revision`. A mismatch is reported as
    /// `ok = false` with the current record, without an error.
    async fn update(
        &self,
        key: &str,
        value: &[u8],
        mod_revision: i64,
        lease: i64,
    ) -> Result<(i64, Option<KeyValue>, bool), DatastoreError>;

    /// Compare-and-delete on `mod_revision` (zero deletes unconditionally).
    /// Returns the prior record and whether a delete happened.
    async fn delete(
        &self,
        key: &str,
        mod_revision: i64,
    ) -> Result<(i64, Option<KeyValue>, bool), DatastoreError>;

    /// Range scan over `prefix`, ascending by key. `start_key` resumes a
    /// paginated scan; `revision = 0` reads as of now.
    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
    ) -> Result<(i64, Vec<KeyValue>), DatastoreError>;

    /// Number of live keys under `prefix`.
    async fn count(&self, prefix: &str) -> Result<(i64, i64), DatastoreError>;

    /// Subscribe to events for `prefix` starting at `start_revision`.
    /// Backfills persisted events first, then streams live commits.
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<Watcher, DatastoreError>;

    /// Prune historic rows at and below `revision`; advances the compaction
    /// watermark. The driver also compacts on its own schedule.
    async fn compact(&self, revision: i64) -> Result<i64, DatastoreError>;

    /// Highest committed revision.
    async fn current_revision(&self) -> Result<i64, DatastoreError>;

    /// Backend database size in bytes, for status reporting.
    async fn db_size(&self) -> Result<i64, DatastoreError>;

    async fn lease_grant(&self, ttl_seconds: i64) -> Result<Lease, DatastoreError>;

    /// Revoke the lease and delete every key attached to it.
    async fn lease_revoke(&self, id: i64) -> Result<i64, DatastoreError>;

    /// Refresh the lease deadline; returns the granted TTL.
    async fn lease_renew(&self, id: i64) -> Result<Lease, DatastoreError>;

    async fn lease_time_to_live(&self, id: i64, keys: bool) -> Result<LeaseStatus, DatastoreError>;

    /// Stop background loops and release the backend.
    async fn close(&self);
}
