// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Generic SQL storage driver
//!
//! All three backends store the keyspace as an append-only row log:
//! every mutation inserts a new row whose auto-assigned id is the cluster
//! revision. The backend contributes dialect SQL through [`SqlBackend`];
//! revision bookkeeping, compare-and-swap, watch fan-out, compaction and the
//! lease sweep live here and behave identically across backends.
//!
//! Concurrent writers are serialized per key by a unique `(name,
//! prev_revision)` index: two mutations racing from the same base row
//! collide on insert, and the loser re-reads and re-checks its CAS
//! condition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::datastore::{
    Datastore, DatastoreError, Lease, LeaseStatus, WatchBatch, Watcher,
};
use crate::domain::kv::{prefix_range_end, Event, EventKind, KeyValue};

/// Internal keyspace for persisted lease grants. Grants live in the same row
/// log as user keys so they replicate and survive restarts, but the control
/// plane never ranges over this prefix.
const LEASE_PREFIX: &str = "/aegis/leases/";

/// Queue depth per watch subscriber before the driver disconnects it.
const WATCH_QUEUE_DEPTH: usize = 512;

/// How often the poller looks for rows committed by other writers.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Rows fetched per poll or backfill page.
const POLL_BATCH: i64 = 500;

/// Sweep interval for expired leases. Bounded above by one minute.
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

impl From<sqlx::Error> for DatastoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => DatastoreError::Timeout,
            sqlx::Error::Io(e) => DatastoreError::Unavailable(e.to_string()),
            other => DatastoreError::Database(other.to_string()),
        }
    }
}

/// A row as stored in the `kv` log table. `id` is the revision.
#[derive(Debug, Clone)]
pub struct KvRow {
    pub id: i64,
    pub name: String,
    pub created: bool,
    pub deleted: bool,
    /// Zero on create rows; the creating revision otherwise.
    pub create_revision: i64,
    pub prev_revision: i64,
    pub version: i64,
    pub lease: i64,
    pub value: Vec<u8>,
    pub old_value: Option<Vec<u8>>,
}

/// Row to insert; the backend assigns the id.
#[derive(Debug, Clone)]
pub struct NewKvRow {
    pub name: String,
    pub created: bool,
    pub deleted: bool,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub version: i64,
    pub lease: i64,
    pub value: Vec<u8>,
    pub old_value: Option<Vec<u8>>,
}

/// Outcome of an insert attempt.
#[derive(Debug)]
pub enum InsertOutcome {
    /// Row committed at this revision.
    Committed(i64),
    /// Another writer committed from the same base row first.
    Conflict,
}

/// Dialect surface each backend implements.
#[async_trait]
pub trait SqlBackend: Send + Sync + 'static {
    /// Human-readable backend name for logs and status.
    fn name(&self) -> &'static str;

    /// Create the schema if it does not exist.
    async fn migrate(&self) -> Result<(), DatastoreError>;

    /// Append a row. Must report [`InsertOutcome::Conflict`] when the
    /// `(name, prev_revision)` unique index rejects the write.
    async fn insert(&self, row: &NewKvRow) -> Result<InsertOutcome, DatastoreError>;

    /// Latest row for `name` with `id <= max_id` (`max_id = 0` is unbounded).
    async fn latest(&self, name: &str, max_id: i64) -> Result<Option<KvRow>, DatastoreError>;

    /// Current (not superseded, not deleted) rows in `[start, range_end)`,
    /// as of `max_id` (`0` = now), ascending by name, up to `limit`
    /// (`0` = unbounded). An empty `range_end` means no upper bound.
    async fn list_current(
        &self,
        start: &str,
        range_end: &str,
        limit: i64,
        max_id: i64,
    ) -> Result<Vec<KvRow>, DatastoreError>;

    /// Count of current rows in `[start, range_end)`.
    async fn count_current(&self, start: &str, range_end: &str) -> Result<i64, DatastoreError>;

    /// Rows with `id > revision`, ascending by id, up to `limit`.
    async fn after(&self, revision: i64, limit: i64) -> Result<Vec<KvRow>, DatastoreError>;

    /// Current rows carrying the given lease id.
    async fn current_by_lease(&self, lease: i64) -> Result<Vec<KvRow>, DatastoreError>;

    /// Highest assigned row id.
    async fn current_id(&self) -> Result<i64, DatastoreError>;

    /// Compaction watermark (zero when never compacted).
    async fn compact_revision(&self) -> Result<i64, DatastoreError>;

    async fn set_compact_revision(&self, revision: i64) -> Result<(), DatastoreError>;

    /// Delete superseded rows and tombstones with `id <= watermark`,
    /// keeping the newest live row of every key. Returns rows pruned.
    async fn prune(&self, watermark: i64) -> Result<u64, DatastoreError>;

    /// Backend database size in bytes.
    async fn db_size(&self) -> Result<i64, DatastoreError>;

    /// Release pools / stop embedded nodes.
    async fn close(&self);
}

impl KvRow {
    fn effective_create_revision(&self) -> i64 {
        if self.created {
            self.id
        } else {
            self.create_revision
        }
    }

    /// Project the row onto the wire-level record. Tombstones carry an empty
    /// value and a zero version, matching the event contract.
    pub fn to_key_value(&self) -> KeyValue {
        if self.deleted {
            KeyValue {
                key: self.name.clone(),
                value: Vec::new(),
                create_revision: 0,
                mod_revision: self.id,
                version: 0,
                lease: 0,
            }
        } else {
            KeyValue {
                key: self.name.clone(),
                value: self.value.clone(),
                create_revision: self.effective_create_revision(),
                mod_revision: self.id,
                version: self.version,
                lease: self.lease,
            }
        }
    }

    /// Reconstruct the change event this row represents.
    pub fn to_event(&self) -> Event {
        let kind = if self.deleted {
            EventKind::Delete
        } else if self.created {
            EventKind::Create
        } else {
            EventKind::Update
        };
        let prev_kv = self.old_value.as_ref().map(|old| KeyValue {
            key: self.name.clone(),
            value: old.clone(),
            create_revision: self.effective_create_revision(),
            mod_revision: self.prev_revision,
            version: if self.deleted { self.version } else { self.version - 1 },
            lease: 0,
        });
        Event {
            kind,
            kv: self.to_key_value(),
            prev_kv,
        }
    }
}

/// Persisted body of a lease grant row.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct LeaseGrant {
    id: i64,
    ttl_seconds: i64,
    granted_at_unix: i64,
}

fn lease_key(id: i64) -> String {
    format!("{}{}", LEASE_PREFIX, id)
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

struct Subscriber {
    start: String,
    range_end: String,
    /// Revision the subscription started from; zero means live-only.
    start_revision: i64,
    tx: mpsc::Sender<WatchBatch>,
    /// Set when the hub dropped this subscriber for falling behind; the
    /// forwarder turns it into the `Closed` sentinel.
    overflowed: Arc<AtomicBool>,
}

/// Fan-out point between the poller and watch subscribers.
///
/// Each subscriber owns a bounded queue; one that fills up is handed a
/// `Closed` error and dropped so it can never block the poller.
struct WatchHub {
    subscribers: Mutex<Vec<Subscriber>>,
    /// Highest revision already broadcast.
    last_broadcast: Mutex<i64>,
}

impl WatchHub {
    fn new(initial_revision: i64) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            last_broadcast: Mutex::new(initial_revision),
        }
    }

    /// Register a subscriber. Returns the revision up to which the caller
    /// must backfill; everything later arrives through the queue.
    fn subscribe(
        &self,
        start: String,
        range_end: String,
        start_revision: i64,
    ) -> (i64, mpsc::Receiver<WatchBatch>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(WATCH_QUEUE_DEPTH);
        let overflowed = Arc::new(AtomicBool::new(false));
        // Both locks are taken in this order here and in broadcast; a
        // subscriber added mid-broadcast sees either the whole batch or
        // none of it.
        let mut subs = self.subscribers.lock();
        let attach = *self.last_broadcast.lock();
        subs.push(Subscriber {
            start,
            range_end,
            start_revision,
            tx,
            overflowed: overflowed.clone(),
        });
        (attach, rx, overflowed)
    }

    /// Compaction irreversibly ends any subscription started at or below
    /// the watermark: its backfill guarantee can no longer be honored.
    fn cancel_compacted(&self, watermark: i64) {
        let mut subs = self.subscribers.lock();
        subs.retain(|sub| {
            if sub.start_revision == 0 || sub.start_revision > watermark {
                return true;
            }
            let _ = sub.tx.try_send(Err(DatastoreError::Compacted {
                requested: sub.start_revision,
                watermark,
            }));
            false
        });
    }

    fn broadcast(&self, events: &[Event]) {
        let mut subs = self.subscribers.lock();
        if let Some(last) = events.last() {
            *self.last_broadcast.lock() = last.revision();
        }
        subs.retain(|sub| {
            let filtered: Vec<Event> = events
                .iter()
                .filter(|e| key_in_range(&e.kv.key, &sub.start, &sub.range_end))
                .cloned()
                .collect();
            if filtered.is_empty() {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(Ok(filtered)) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("dropping watch subscriber: queue full");
                    sub.overflowed.store(true, Ordering::SeqCst);
                    false
                }
            }
        });
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

fn key_in_range(key: &str, start: &str, range_end: &str) -> bool {
    key >= start && (range_end.is_empty() || key < range_end)
}

/// Tunables shared by every backend.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub compact_interval: Duration,
    /// Historic revisions kept behind the current revision.
    pub compact_retention: i64,
    /// Cancelled when the backend stays unreachable past the retry window,
    /// so the process supervisor can restart us instead of serving a dead
    /// datastore.
    pub shutdown: Option<CancellationToken>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            compact_interval: Duration::from_secs(60),
            compact_retention: 1000,
            shutdown: None,
        }
    }
}

/// Transient-error retry: capped exponential backoff, then the error
/// surfaces as-is. Safe around inserts because an ambiguous duplicate lands
/// on the `(name, prev_revision)` index and reports a conflict.
async fn with_retry<T, F, Fut>(op: F) -> Result<T, DatastoreError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, DatastoreError>>,
{
    let mut delay = Duration::from_millis(100);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(DatastoreError::Unavailable(reason)) if attempt < 4 => {
                attempt += 1;
                debug!(reason = %reason, attempt, "transient datastore error; retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(2));
            }
            other => return other,
        }
    }
}

/// The generic driver; see the module docs.
pub struct SqlDriver<B: SqlBackend> {
    backend: Arc<B>,
    hub: Arc<WatchHub>,
    /// Wakes the poller immediately after a local commit.
    poke: Arc<Notify>,
    cancel: CancellationToken,
    options: DriverOptions,
}

impl<B: SqlBackend> SqlDriver<B> {
    /// Open the driver: migrate the schema and start the poller, compactor
    /// and lease sweeper.
    pub async fn open(backend: B, options: DriverOptions) -> Result<Arc<Self>, DatastoreError> {
        let backend = Arc::new(backend);
        backend.migrate().await?;
        let current = backend.current_id().await?;
        info!(backend = backend.name(), revision = current, "datastore open");

        let driver = Arc::new(Self {
            backend,
            hub: Arc::new(WatchHub::new(current)),
            poke: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            options,
        });

        driver.clone().spawn_poller(current);
        driver.clone().spawn_compactor();
        driver.clone().spawn_lease_sweeper();
        Ok(driver)
    }

    /// Direct backend access for snapshot tooling.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn spawn_poller(self: Arc<Self>, from: i64) {
        // Polls that keep failing past this streak mean the backend is gone,
        // not blinking; the process restarts rather than serving stale data.
        const FATAL_POLL_FAILURES: u32 = 150;
        tokio::spawn(async move {
            let mut last = from;
            let mut consecutive_failures: u32 = 0;
            // A revision gap usually means a writer whose insert is still
            // committing. Give it one extra tick before skipping past; a
            // transaction that stays invisible longer than that has rolled
            // back and its id will never appear.
            let mut pending_gap: Option<i64> = None;
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.poke.notified() => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                loop {
                    let rows = match self.backend.after(last, POLL_BATCH).await {
                        Ok(rows) => {
                            consecutive_failures = 0;
                            rows
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(error = %e, consecutive_failures, "watch poll failed");
                            if consecutive_failures >= FATAL_POLL_FAILURES {
                                error!("datastore unreachable past the retry window; requesting shutdown");
                                if let Some(shutdown) = &self.options.shutdown {
                                    shutdown.cancel();
                                }
                                self.cancel.cancel();
                                return;
                            }
                            break;
                        }
                    };
                    if rows.is_empty() {
                        pending_gap = None;
                        break;
                    }
                    let mut publish: Vec<Event> = Vec::with_capacity(rows.len());
                    let mut stop_at_gap = false;
                    for row in &rows {
                        if row.id > last + 1 {
                            match pending_gap {
                                Some(expected) if expected == last + 1 => {
                                    debug!(revision = last + 1, "revision gap expired, skipping");
                                    pending_gap = None;
                                }
                                _ => {
                                    pending_gap = Some(last + 1);
                                    stop_at_gap = true;
                                    break;
                                }
                            }
                        }
                        last = row.id;
                        if !row.name.starts_with(LEASE_PREFIX) {
                            publish.push(row.to_event());
                        }
                    }
                    if !publish.is_empty() {
                        metrics::counter!("aegis_edge_datastore_watch_events_total")
                            .increment(publish.len() as u64);
                        self.hub.broadcast(&publish);
                    }
                    if stop_at_gap || (rows.len() as i64) < POLL_BATCH {
                        break;
                    }
                }
            }
        });
    }

    fn spawn_compactor(self: Arc<Self>) {
        let interval = self.options.compact_interval;
        let retention = self.options.compact_retention;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let current = match self.backend.current_id().await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "compactor: current revision unavailable");
                        continue;
                    }
                };
                let target = current - retention;
                if target <= 0 {
                    continue;
                }
                if let Err(e) = self.compact_to(target).await {
                    warn!(error = %e, target, "scheduled compaction failed");
                }
            }
        });
    }

    fn spawn_lease_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(LEASE_SWEEP_INTERVAL) => {}
                }
                if let Err(e) = self.sweep_expired_leases().await {
                    warn!(error = %e, "lease sweep failed");
                }
            }
        });
    }

    async fn sweep_expired_leases(&self) -> Result<(), DatastoreError> {
        let (_, grants) = self.list(LEASE_PREFIX, "", 0, 0).await?;
        let now = now_unix();
        for kv in grants {
            let grant: LeaseGrant = match serde_json::from_slice(&kv.value) {
                Ok(g) => g,
                Err(e) => {
                    error!(key = %kv.key, error = %e, "dropping undecodable lease grant");
                    let _ = self.delete(&kv.key, 0).await?;
                    continue;
                }
            };
            if now >= grant.granted_at_unix + grant.ttl_seconds {
                debug!(lease = grant.id, "lease expired");
                self.revoke_lease_keys(grant.id).await?;
            }
        }
        Ok(())
    }

    /// Delete every key attached to the lease, then the grant itself.
    /// Each delete is its own revision so watchers observe per-key events.
    async fn revoke_lease_keys(&self, id: i64) -> Result<i64, DatastoreError> {
        let rows = self.backend.current_by_lease(id).await?;
        for row in rows {
            let _ = self.delete(&row.name, 0).await?;
        }
        let (rev, _, _) = self.delete(&lease_key(id), 0).await?;
        Ok(rev)
    }

    async fn compact_to(&self, target: i64) -> Result<i64, DatastoreError> {
        let watermark = self.backend.compact_revision().await?;
        if target <= watermark {
            return Ok(watermark);
        }
        self.backend.set_compact_revision(target).await?;
        self.hub.cancel_compacted(target);
        let pruned = self.backend.prune(target).await?;
        if pruned > 0 {
            info!(watermark = target, pruned, "compacted");
        }
        metrics::counter!("aegis_edge_datastore_compactions_total").increment(1);
        Ok(target)
    }

    /// Read-check-insert with conflict retry. The closure inspects the
    /// current row and either produces the next row or short-circuits with
    /// a terminal result.
    async fn mutate<F>(&self, key: &str, decide: F) -> Result<MutationResult, DatastoreError>
    where
        F: Fn(Option<&KvRow>) -> Decision,
    {
        loop {
            let current = with_retry(|| self.backend.latest(key, 0)).await?;
            let row = match decide(current.as_ref()) {
                Decision::Abort(result) => return Ok(result),
                Decision::Fail(err) => return Err(err),
                Decision::Insert(row) => row,
            };
            match with_retry(|| self.backend.insert(&row)).await? {
                InsertOutcome::Committed(revision) => {
                    self.poke.notify_one();
                    return Ok(MutationResult::Committed { revision, row });
                }
                InsertOutcome::Conflict => {
                    debug!(key, "write conflict, retrying");
                    continue;
                }
            }
        }
    }
}

enum Decision {
    Insert(NewKvRow),
    Abort(MutationResult),
    Fail(DatastoreError),
}

enum MutationResult {
    Committed { revision: i64, row: NewKvRow },
    /// CAS mismatch: the store is unchanged; carries the current record.
    Mismatch(Option<KvRow>),
}

#[async_trait]
impl<B: SqlBackend> Datastore for SqlDriver<B> {
    async fn get(&self, key: &str, revision: i64) -> Result<(i64, Option<KeyValue>), DatastoreError> {
        let current = self.backend.current_id().await?;
        if revision > 0 {
            let watermark = self.backend.compact_revision().await?;
            if revision < watermark {
                return Err(DatastoreError::Compacted {
                    requested: revision,
                    watermark,
                });
            }
        }
        let row = self.backend.latest(key, revision).await?;
        let kv = row.filter(|r| !r.deleted).map(|r| r.to_key_value());
        Ok((current, kv))
    }

    async fn create(&self, key: &str, value: &[u8], lease: i64) -> Result<i64, DatastoreError> {
        let key_owned = key.to_string();
        let value = value.to_vec();
        let outcome = self
            .mutate(key, move |current| match current {
                Some(row) if !row.deleted => {
                    Decision::Fail(DatastoreError::AlreadyExists(key_owned.clone()))
                }
                prior => Decision::Insert(NewKvRow {
                    name: key_owned.clone(),
                    created: true,
                    deleted: false,
                    create_revision: 0,
                    prev_revision: prior.map(|r| r.id).unwrap_or(0),
                    version: 1,
                    lease,
                    value: value.clone(),
                    old_value: None,
                }),
            })
            .await?;
        metrics::counter!("aegis_edge_datastore_mutations_total", "op" => "create").increment(1);
        match outcome {
            MutationResult::Committed { revision, .. } => Ok(revision),
            MutationResult::Mismatch(_) => unreachable!("create never reports a CAS mismatch"),
        }
    }

    async fn update(
        &self,
        key: &str,
        value: &[u8],
        mod_revision: i64,
        lease: i64,
    ) -> Result<(i64, Option<KeyValue>, bool), DatastoreError> {
        let key_owned = key.to_string();
        let value = value.to_vec();
        let outcome = self
            .mutate(key, move |current| match current {
                Some(row) if !row.deleted && row.id == mod_revision => {
                    Decision::Insert(NewKvRow {
                        name: key_owned.clone(),
                        created: false,
                        deleted: false,
                        create_revision: row.effective_create_revision(),
                        prev_revision: row.id,
                        version: row.version + 1,
                        lease,
                        value: value.clone(),
                        old_value: Some(row.value.clone()),
                    })
                }
                other => Decision::Abort(MutationResult::Mismatch(other.cloned())),
            })
            .await?;
        metrics::counter!("aegis_edge_datastore_mutations_total", "op" => "update").increment(1);
        match outcome {
            MutationResult::Committed { revision, row } => {
                let kv = KeyValue {
                    key: key.to_string(),
                    value: row.value,
                    create_revision: row.create_revision,
                    mod_revision: revision,
                    version: row.version,
                    lease: row.lease,
                };
                Ok((revision, Some(kv), true))
            }
            MutationResult::Mismatch(current) => {
                let revision = self.backend.current_id().await?;
                let kv = current.filter(|r| !r.deleted).map(|r| r.to_key_value());
                Ok((revision, kv, false))
            }
        }
    }

    async fn delete(
        &self,
        key: &str,
        mod_revision: i64,
    ) -> Result<(i64, Option<KeyValue>, bool), DatastoreError> {
        let key_owned = key.to_string();
        let outcome = self
            .mutate(key, move |current| match current {
                Some(row) if !row.deleted && (mod_revision == 0 || row.id == mod_revision) => {
                    Decision::Insert(NewKvRow {
                        name: key_owned.clone(),
                        created: false,
                        deleted: true,
                        create_revision: row.effective_create_revision(),
                        prev_revision: row.id,
                        version: row.version,
                        lease: 0,
                        value: Vec::new(),
                        old_value: Some(row.value.clone()),
                    })
                }
                other => Decision::Abort(MutationResult::Mismatch(other.cloned())),
            })
            .await?;
        metrics::counter!("aegis_edge_datastore_mutations_total", "op" => "delete").increment(1);
        match outcome {
            MutationResult::Committed { revision, row } => {
                let prior = KeyValue {
                    key: key.to_string(),
                    value: row.old_value.unwrap_or_default(),
                    create_revision: row.create_revision,
                    mod_revision: row.prev_revision,
                    version: row.version,
                    lease: 0,
                };
                Ok((revision, Some(prior), true))
            }
            MutationResult::Mismatch(current) => {
                let revision = self.backend.current_id().await?;
                let kv = current.filter(|r| !r.deleted).map(|r| r.to_key_value());
                Ok((revision, kv, false))
            }
        }
    }

    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
    ) -> Result<(i64, Vec<KeyValue>), DatastoreError> {
        let current = self.backend.current_id().await?;
        if revision > 0 {
            let watermark = self.backend.compact_revision().await?;
            if revision < watermark {
                return Err(DatastoreError::Compacted {
                    requested: revision,
                    watermark,
                });
            }
        }
        let range_end = prefix_range_end(prefix);
        let start = if start_key.is_empty() { prefix } else { start_key };
        let rows = self
            .backend
            .list_current(start, &range_end, limit, revision)
            .await?;
        let kvs = rows.into_iter().map(|r| r.to_key_value()).collect();
        let at = if revision > 0 { revision } else { current };
        Ok((at, kvs))
    }

    async fn count(&self, prefix: &str) -> Result<(i64, i64), DatastoreError> {
        let current = self.backend.current_id().await?;
        let range_end = prefix_range_end(prefix);
        let count = self.backend.count_current(prefix, &range_end).await?;
        Ok((current, count))
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<Watcher, DatastoreError> {
        let watermark = self.backend.compact_revision().await?;
        if start_revision > 0 && start_revision <= watermark {
            return Err(DatastoreError::Compacted {
                requested: start_revision,
                watermark,
            });
        }

        let range_end = prefix_range_end(prefix);
        let (attach_rev, mut live, overflowed) =
            self.hub
                .subscribe(prefix.to_string(), range_end.clone(), start_revision);
        metrics::gauge!("aegis_edge_datastore_watchers").set(self.hub.subscriber_count() as f64);

        let (tx, rx) = mpsc::channel(WATCH_QUEUE_DEPTH);
        let backend = self.backend.clone();
        let prefix = prefix.to_string();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            // Replay persisted events in (start_revision - 1, attach_rev],
            // then splice onto the live queue. The hub only broadcasts
            // revisions above attach_rev, so the two segments neither
            // overlap nor leave a hole.
            let mut replayed_to = 0;
            if start_revision > 0 {
                let mut from = start_revision - 1;
                while from < attach_rev {
                    let rows = match backend.after(from, POLL_BATCH).await {
                        Ok(rows) => rows,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    if rows.is_empty() {
                        break;
                    }
                    let mut batch = Vec::new();
                    for row in &rows {
                        if row.id > attach_rev {
                            break;
                        }
                        from = row.id;
                        replayed_to = row.id;
                        if key_in_range(&row.name, &prefix, &range_end)
                            && !row.name.starts_with(LEASE_PREFIX)
                        {
                            batch.push(row.to_event());
                        }
                    }
                    if !batch.is_empty() && tx.send(Ok(batch)).await.is_err() {
                        return;
                    }
                    if rows.last().map(|r| r.id >= attach_rev).unwrap_or(true) {
                        break;
                    }
                }
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    batch = live.recv() => {
                        let Some(batch) = batch else {
                            if overflowed.load(Ordering::SeqCst) {
                                let _ = tx.send(Err(DatastoreError::Closed)).await;
                            }
                            return;
                        };
                        let forward = match batch {
                            Ok(events) => {
                                let events: Vec<Event> = events
                                    .into_iter()
                                    .filter(|e| e.revision() > replayed_to)
                                    .collect();
                                if events.is_empty() {
                                    continue;
                                }
                                Ok(events)
                            }
                            err => err,
                        };
                        if tx.send(forward).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Watcher {
            start_revision,
            receiver: rx,
        })
    }

    async fn compact(&self, revision: i64) -> Result<i64, DatastoreError> {
        self.compact_to(revision).await
    }

    async fn current_revision(&self) -> Result<i64, DatastoreError> {
        self.backend.current_id().await
    }

    async fn db_size(&self) -> Result<i64, DatastoreError> {
        self.backend.db_size().await
    }

    async fn lease_grant(&self, ttl_seconds: i64) -> Result<Lease, DatastoreError> {
        let ttl_seconds = ttl_seconds.max(1);
        loop {
            let id = (rand::random::<u64>() >> 1) as i64;
            if id == 0 {
                continue;
            }
            let grant = LeaseGrant {
                id,
                ttl_seconds,
                granted_at_unix: now_unix(),
            };
            let body = serde_json::to_vec(&grant)
                .map_err(|e| DatastoreError::Database(e.to_string()))?;
            match self.create(&lease_key(id), &body, 0).await {
                Ok(_) => return Ok(Lease { id, ttl_seconds }),
                // Astronomically unlikely, but ids must be unique.
                Err(DatastoreError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn lease_revoke(&self, id: i64) -> Result<i64, DatastoreError> {
        let (_, grant) = self.get(&lease_key(id), 0).await?;
        if grant.is_none() {
            return Err(DatastoreError::LeaseNotFound(id));
        }
        self.revoke_lease_keys(id).await
    }

    async fn lease_renew(&self, id: i64) -> Result<Lease, DatastoreError> {
        loop {
            let (_, current) = self.get(&lease_key(id), 0).await?;
            let Some(kv) = current else {
                return Err(DatastoreError::LeaseNotFound(id));
            };
            let mut grant: LeaseGrant = serde_json::from_slice(&kv.value)
                .map_err(|e| DatastoreError::Database(e.to_string()))?;
            grant.granted_at_unix = now_unix();
            let body = serde_json::to_vec(&grant)
                .map_err(|e| DatastoreError::Database(e.to_string()))?;
            let (_, _, ok) = self
                .update(&lease_key(id), &body, kv.mod_revision, 0)
                .await?;
            if ok {
                return Ok(Lease {
                    id,
                    ttl_seconds: grant.ttl_seconds,
                });
            }
        }
    }

    async fn lease_time_to_live(&self, id: i64, keys: bool) -> Result<LeaseStatus, DatastoreError> {
        let (_, current) = self.get(&lease_key(id), 0).await?;
        let Some(kv) = current else {
            return Err(DatastoreError::LeaseNotFound(id));
        };
        let grant: LeaseGrant = serde_json::from_slice(&kv.value)
            .map_err(|e| DatastoreError::Database(e.to_string()))?;
        let remaining = (grant.granted_at_unix + grant.ttl_seconds - now_unix()).max(0);
        let keys = if keys {
            self.backend
                .current_by_lease(id)
                .await?
                .into_iter()
                .map(|r| r.name)
                .collect()
        } else {
            Vec::new()
        };
        Ok(LeaseStatus {
            id,
            granted_ttl: grant.ttl_seconds,
            remaining_ttl: remaining,
            keys,
        })
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.backend.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update_row() -> KvRow {
        KvRow {
            id: 7,
            name: "/registry/pods/a".to_string(),
            created: false,
            deleted: false,
            create_revision: 3,
            prev_revision: 5,
            version: 3,
            lease: 0,
            value: b"new".to_vec(),
            old_value: Some(b"old".to_vec()),
        }
    }

    #[test]
    fn test_row_projects_key_value() {
        let kv = update_row().to_key_value();
        assert_eq!(kv.mod_revision, 7);
        assert_eq!(kv.create_revision, 3);
        assert_eq!(kv.version, 3);
        assert_eq!(kv.value, b"new");
    }

    #[test]
    fn test_create_row_uses_own_id_as_create_revision() {
        let row = KvRow {
            created: true,
            create_revision: 0,
            id: 11,
            ..update_row()
        };
        assert_eq!(row.to_key_value().create_revision, 11);
    }

    #[test]
    fn test_tombstone_event_carries_prior_state() {
        let row = KvRow {
            deleted: true,
            value: Vec::new(),
            ..update_row()
        };
        let event = row.to_event();
        assert_eq!(event.kind, EventKind::Delete);
        assert!(event.kv.value.is_empty());
        assert_eq!(event.kv.version, 0);
        let prev = event.prev_kv.expect("delete must carry prev_kv");
        assert_eq!(prev.value, b"old");
        assert_eq!(prev.mod_revision, 5);
    }

    #[test]
    fn test_key_in_range() {
        assert!(key_in_range("/a/b", "/a/", "/a0"));
        assert!(!key_in_range("/b", "/a/", "/a0"));
        assert!(key_in_range("/anything", "", ""));
    }

    #[tokio::test]
    async fn test_hub_disconnects_slow_subscriber() {
        let hub = WatchHub::new(0);
        let (_, mut rx, overflowed) = hub.subscribe(String::new(), String::new(), 0);
        let event = Event {
            kind: EventKind::Create,
            kv: KeyValue {
                key: "/k".to_string(),
                mod_revision: 1,
                version: 1,
                value: b"v".to_vec(),
                ..Default::default()
            },
            prev_kv: None,
        };
        for _ in 0..WATCH_QUEUE_DEPTH + 1 {
            hub.broadcast(std::slice::from_ref(&event));
        }
        assert_eq!(hub.subscriber_count(), 0);
        assert!(overflowed.load(Ordering::SeqCst));
        // The queued batches stay readable; the stream then ends because
        // the hub dropped its sender.
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, WATCH_QUEUE_DEPTH);
    }
}
