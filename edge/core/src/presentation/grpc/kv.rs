// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! KV surface of the bridge.
//!
//! Range serves single-key gets and prefix scans with limits and revision
//! bounds. All writes must arrive as one of three transaction shapes:
//!
//! 1. create-if-absent: `If(mod(key) == 0) Then(Put)`;
//! 2. compare-and-swap/delete: `If(mod(key) == N) Then(Put | DeleteRange)
//!    Else(Range)`, the failure branch re-reading the current value;
//! 3. the compaction pseudo-transaction (`If(version(key) == V)`), which is
//!    answered `succeeded = false` so the client leaves compaction to the
//!    driver's own schedule.
//!
//! Everything else (bare Put/DeleteRange, sorts, keys-only, serializable
//! reads) is rejected so the upstream client stays on the deterministic
//! path the drivers implement.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::domain::datastore::Datastore;
use crate::presentation::grpc::{
    etcdserverpb as pb, response_header, status_from, to_proto_kv, KvBridgeOptions,
};

pub struct KvService {
    datastore: Arc<dyn Datastore>,
    options: KvBridgeOptions,
}

impl KvService {
    pub fn new(datastore: Arc<dyn Datastore>, options: KvBridgeOptions) -> Self {
        Self { datastore, options }
    }
}

fn key_string(raw: &[u8]) -> Result<String, Status> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| Status::invalid_argument("keys must be valid UTF-8 paths"))
}

/// Recover the scan prefix from a range end (the range end is the prefix
/// with its last byte incremented; pagination moves `key` forward while the
/// range end stays put).
fn prefix_from_range_end(range_end: &[u8]) -> Result<String, Status> {
    let mut bytes = range_end.to_vec();
    match bytes.last_mut() {
        Some(0) => {
            // `[0]` means "from key to the end of the keyspace".
            Ok(String::new())
        }
        Some(last) => {
            *last -= 1;
            key_string(&bytes)
        }
        None => Ok(String::new()),
    }
}

#[tonic::async_trait]
impl pb::kv_server::Kv for KvService {
    async fn range(
        &self,
        request: Request<pb::RangeRequest>,
    ) -> Result<Response<pb::RangeResponse>, Status> {
        let req = request.into_inner();
        if req.sort_order != 0 || req.sort_target != 0 {
            return Err(Status::unimplemented("sorted ranges are not supported"));
        }
        if req.keys_only {
            return Err(Status::unimplemented("keys-only ranges are not supported"));
        }
        if req.serializable {
            return Err(Status::unimplemented("serializable reads are not supported"));
        }

        let key = key_string(&req.key)?;

        if req.count_only {
            let prefix = if req.range_end.is_empty() {
                key.clone()
            } else {
                prefix_from_range_end(&req.range_end)?
            };
            let (revision, count) = self
                .datastore
                .count(&prefix)
                .await
                .map_err(status_from)?;
            return Ok(Response::new(pb::RangeResponse {
                header: Some(response_header(revision)),
                kvs: Vec::new(),
                more: false,
                count,
            }));
        }

        if req.range_end.is_empty() {
            // Single-key get.
            let (revision, kv) = self
                .datastore
                .get(&key, req.revision)
                .await
                .map_err(status_from)?;
            let kvs: Vec<_> = kv.into_iter().map(to_proto_kv).collect();
            let count = kvs.len() as i64;
            return Ok(Response::new(pb::RangeResponse {
                header: Some(response_header(revision)),
                kvs,
                more: false,
                count,
            }));
        }

        let prefix = prefix_from_range_end(&req.range_end)?;
        // Fetch one extra row to learn whether the range continues.
        let fetch = if req.limit > 0 { req.limit + 1 } else { 0 };
        let (revision, mut kvs) = self
            .datastore
            .list(&prefix, &key, fetch, req.revision)
            .await
            .map_err(status_from)?;

        if req.min_mod_revision > 0 {
            kvs.retain(|kv| kv.mod_revision >= req.min_mod_revision);
        }
        if req.max_mod_revision > 0 {
            kvs.retain(|kv| kv.mod_revision <= req.max_mod_revision);
        }
        if req.min_create_revision > 0 {
            kvs.retain(|kv| kv.create_revision >= req.min_create_revision);
        }
        if req.max_create_revision > 0 {
            kvs.retain(|kv| kv.create_revision <= req.max_create_revision);
        }

        let more = req.limit > 0 && kvs.len() as i64 > req.limit;
        if more {
            kvs.truncate(req.limit as usize);
        }
        let count = kvs.len() as i64 + if more { 1 } else { 0 };
        Ok(Response::new(pb::RangeResponse {
            header: Some(response_header(revision)),
            kvs: kvs.into_iter().map(to_proto_kv).collect(),
            more,
            count,
        }))
    }

    async fn put(
        &self,
        _request: Request<pb::PutRequest>,
    ) -> Result<Response<pb::PutResponse>, Status> {
        Err(Status::unimplemented(
            "bare put is not supported; writes must be transactional",
        ))
    }

    async fn delete_range(
        &self,
        _request: Request<pb::DeleteRangeRequest>,
    ) -> Result<Response<pb::DeleteRangeResponse>, Status> {
        Err(Status::unimplemented(
            "bare delete is not supported; writes must be transactional",
        ))
    }

    async fn txn(
        &self,
        request: Request<pb::TxnRequest>,
    ) -> Result<Response<pb::TxnResponse>, Status> {
        let req = request.into_inner();
        let shape = TxnShape::recognize(&req)?;
        match shape {
            TxnShape::Create { key, put } => self.txn_create(key, put, &req).await,
            TxnShape::Update { key, mod_revision, put } => {
                self.txn_update(key, mod_revision, put, &req).await
            }
            TxnShape::Delete { key, mod_revision, prev_kv } => {
                self.txn_delete(key, mod_revision, prev_kv, &req).await
            }
            TxnShape::CompactMarker { key, version } => self.txn_compact_marker(key, version).await,
        }
    }

    async fn compact(
        &self,
        request: Request<pb::CompactionRequest>,
    ) -> Result<Response<pb::CompactionResponse>, Status> {
        let req = request.into_inner();
        if self.options.compact_passthrough {
            let watermark = self
                .datastore
                .compact(req.revision)
                .await
                .map_err(status_from)?;
            debug!(watermark, "client-driven compaction applied");
            return Ok(Response::new(pb::CompactionResponse {
                header: Some(response_header(watermark)),
            }));
        }
        // The driver compacts on its own schedule; answer with the current
        // revision so the client considers the request satisfied.
        let revision = self
            .datastore
            .current_revision()
            .await
            .map_err(status_from)?;
        Ok(Response::new(pb::CompactionResponse {
            header: Some(response_header(revision)),
        }))
    }
}

/// The recognized transaction shapes.
enum TxnShape {
    Create {
        key: String,
        put: pb::PutRequest,
    },
    Update {
        key: String,
        mod_revision: i64,
        put: pb::PutRequest,
    },
    Delete {
        key: String,
        mod_revision: i64,
        prev_kv: bool,
    },
    CompactMarker {
        key: String,
        version: i64,
    },
}

impl TxnShape {
    fn recognize(req: &pb::TxnRequest) -> Result<Self, Status> {
        if req.compare.len() != 1 {
            return Err(Status::unimplemented("unsupported transaction shape"));
        }
        let compare = &req.compare[0];
        let key = key_string(&compare.key)?;
        if compare.result != pb::compare::CompareResult::Equal as i32 {
            return Err(Status::unimplemented("only equality compares are supported"));
        }

        // Compaction marker: a version compare on the marker key, answered
        // without touching the store.
        if compare.target == pb::compare::CompareTarget::Version as i32 {
            let version = match compare.target_union {
                Some(pb::compare::TargetUnion::Version(v)) => v,
                None => 0,
                _ => return Err(Status::unimplemented("unsupported compare target value")),
            };
            return Ok(TxnShape::CompactMarker { key, version });
        }

        if compare.target != pb::compare::CompareTarget::Mod as i32 {
            return Err(Status::unimplemented("only mod-revision compares are supported"));
        }
        let mod_revision = match compare.target_union {
            Some(pb::compare::TargetUnion::ModRevision(v)) => v,
            None => 0,
            _ => return Err(Status::unimplemented("unsupported compare target value")),
        };

        if req.success.len() != 1 || req.failure.len() > 1 {
            return Err(Status::unimplemented("unsupported transaction shape"));
        }
        if let Some(failure) = req.failure.first() {
            if !matches!(
                failure.request,
                Some(pb::request_op::Request::RequestRange(_))
            ) {
                return Err(Status::unimplemented(
                    "transaction failure branch must re-read the key",
                ));
            }
        }

        match &req.success[0].request {
            Some(pb::request_op::Request::RequestPut(put)) => {
                let put_key = key_string(&put.key)?;
                if put_key != key {
                    return Err(Status::unimplemented("compare and put must target one key"));
                }
                if put.ignore_value || put.ignore_lease {
                    return Err(Status::unimplemented("ignore-value puts are not supported"));
                }
                if mod_revision == 0 {
                    Ok(TxnShape::Create { key, put: put.clone() })
                } else {
                    Ok(TxnShape::Update {
                        key,
                        mod_revision,
                        put: put.clone(),
                    })
                }
            }
            Some(pb::request_op::Request::RequestDeleteRange(delete)) => {
                let delete_key = key_string(&delete.key)?;
                if delete_key != key || !delete.range_end.is_empty() {
                    return Err(Status::unimplemented(
                        "compare and delete must target one key",
                    ));
                }
                Ok(TxnShape::Delete {
                    key,
                    mod_revision,
                    prev_kv: delete.prev_kv,
                })
            }
            _ => Err(Status::unimplemented("unsupported transaction shape")),
        }
    }
}

impl KvService {
    /// Failure-branch response: re-read the current record.
    async fn failure_range(&self, key: &str, req: &pb::TxnRequest, revision: i64) -> Vec<pb::ResponseOp> {
        if req.failure.is_empty() {
            return Vec::new();
        }
        let (_, kv) = match self.datastore.get(key, 0).await {
            Ok(result) => result,
            Err(_) => (revision, None),
        };
        let kvs: Vec<_> = kv.into_iter().map(to_proto_kv).collect();
        let count = kvs.len() as i64;
        vec![pb::ResponseOp {
            response: Some(pb::response_op::Response::ResponseRange(pb::RangeResponse {
                header: Some(response_header(revision)),
                kvs,
                more: false,
                count,
            })),
        }]
    }

    async fn txn_create(
        &self,
        key: String,
        put: pb::PutRequest,
        req: &pb::TxnRequest,
    ) -> Result<Response<pb::TxnResponse>, Status> {
        match self.datastore.create(&key, &put.value, put.lease).await {
            Ok(revision) => Ok(Response::new(pb::TxnResponse {
                header: Some(response_header(revision)),
                succeeded: true,
                responses: vec![pb::ResponseOp {
                    response: Some(pb::response_op::Response::ResponsePut(pb::PutResponse {
                        header: Some(response_header(revision)),
                        prev_kv: None,
                    })),
                }],
            })),
            Err(crate::domain::datastore::DatastoreError::AlreadyExists(_)) => {
                let revision = self
                    .datastore
                    .current_revision()
                    .await
                    .map_err(status_from)?;
                let responses = self.failure_range(&key, req, revision).await;
                Ok(Response::new(pb::TxnResponse {
                    header: Some(response_header(revision)),
                    succeeded: false,
                    responses,
                }))
            }
            Err(e) => Err(status_from(e)),
        }
    }

    async fn txn_update(
        &self,
        key: String,
        mod_revision: i64,
        put: pb::PutRequest,
        req: &pb::TxnRequest,
    ) -> Result<Response<pb::TxnResponse>, Status> {
        let (revision, _kv, ok) = self
            .datastore
            .update(&key, &put.value, mod_revision, put.lease)
            .await
            .map_err(status_from)?;
        if ok {
            Ok(Response::new(pb::TxnResponse {
                header: Some(response_header(revision)),
                succeeded: true,
                responses: vec![pb::ResponseOp {
                    response: Some(pb::response_op::Response::ResponsePut(pb::PutResponse {
                        header: Some(response_header(revision)),
                        prev_kv: None,
                    })),
                }],
            }))
        } else {
            let responses = self.failure_range(&key, req, revision).await;
            Ok(Response::new(pb::TxnResponse {
                header: Some(response_header(revision)),
                succeeded: false,
                responses,
            }))
        }
    }

    async fn txn_delete(
        &self,
        key: String,
        mod_revision: i64,
        prev_kv: bool,
        req: &pb::TxnRequest,
    ) -> Result<Response<pb::TxnResponse>, Status> {
        let (revision, prior, deleted) = self
            .datastore
            .delete(&key, mod_revision)
            .await
            .map_err(status_from)?;
        if deleted {
            let prev_kvs = if prev_kv {
                prior.into_iter().map(to_proto_kv).collect()
            } else {
                Vec::new()
            };
            Ok(Response::new(pb::TxnResponse {
                header: Some(response_header(revision)),
                succeeded: true,
                responses: vec![pb::ResponseOp {
                    response: Some(pb::response_op::Response::ResponseDeleteRange(
                        pb::DeleteRangeResponse {
                            header: Some(response_header(revision)),
                            deleted: 1,
                            prev_kvs,
                        },
                    )),
                }],
            }))
        } else {
            let responses = self.failure_range(&key, req, revision).await;
            Ok(Response::new(pb::TxnResponse {
                header: Some(response_header(revision)),
                succeeded: false,
                responses,
            }))
        }
    }

    /// Answer the compaction pseudo-transaction: `succeeded = false` plus a
    /// marker record carrying the current revision, which makes the client
    /// adopt our timeline and skip issuing a real compaction.
    async fn txn_compact_marker(
        &self,
        key: String,
        version: i64,
    ) -> Result<Response<pb::TxnResponse>, Status> {
        let revision = self
            .datastore
            .current_revision()
            .await
            .map_err(status_from)?;
        let marker = crate::presentation::grpc::mvccpb::KeyValue {
            key: key.into_bytes(),
            create_revision: 0,
            mod_revision: revision,
            version: version + 1,
            value: revision.to_string().into_bytes(),
            lease: 0,
        };
        Ok(Response::new(pb::TxnResponse {
            header: Some(response_header(revision)),
            succeeded: false,
            responses: vec![pb::ResponseOp {
                response: Some(pb::response_op::Response::ResponseRange(pb::RangeResponse {
                    header: Some(response_header(revision)),
                    kvs: vec![marker],
                    more: false,
                    count: 1,
                })),
            }],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::kv::prefix_range_end;
    use crate::infrastructure::datastore::sqlite::SqliteBackend;
    use crate::infrastructure::datastore::{DriverOptions, SqlDriver};
    use pb::kv_server::Kv;

    async fn service(dir: &tempfile::TempDir) -> KvService {
        let backend = SqliteBackend::open(&dir.path().join("state.db")).await.unwrap();
        let datastore: Arc<dyn Datastore> =
            SqlDriver::open(backend, DriverOptions::default()).await.unwrap();
        KvService::new(
            datastore,
            KvBridgeOptions {
                compact_passthrough: false,
            },
        )
    }

    fn create_txn(key: &[u8], value: &[u8]) -> pb::TxnRequest {
        pb::TxnRequest {
            compare: vec![pb::Compare {
                result: pb::compare::CompareResult::Equal as i32,
                target: pb::compare::CompareTarget::Mod as i32,
                key: key.to_vec(),
                target_union: Some(pb::compare::TargetUnion::ModRevision(0)),
                range_end: Vec::new(),
            }],
            success: vec![pb::RequestOp {
                request: Some(pb::request_op::Request::RequestPut(pb::PutRequest {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    ..Default::default()
                })),
            }],
            failure: Vec::new(),
        }
    }

    fn update_txn(key: &[u8], value: &[u8], mod_revision: i64) -> pb::TxnRequest {
        pb::TxnRequest {
            compare: vec![pb::Compare {
                result: pb::compare::CompareResult::Equal as i32,
                target: pb::compare::CompareTarget::Mod as i32,
                key: key.to_vec(),
                target_union: Some(pb::compare::TargetUnion::ModRevision(mod_revision)),
                range_end: Vec::new(),
            }],
            success: vec![pb::RequestOp {
                request: Some(pb::request_op::Request::RequestPut(pb::PutRequest {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    ..Default::default()
                })),
            }],
            failure: vec![pb::RequestOp {
                request: Some(pb::request_op::Request::RequestRange(pb::RangeRequest {
                    key: key.to_vec(),
                    ..Default::default()
                })),
            }],
        }
    }

    fn single_get(key: &[u8]) -> pb::RangeRequest {
        pb::RangeRequest {
            key: key.to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_txn_then_range_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;

        let response = service
            .txn(Request::new(create_txn(b"/registry/pods/a", b"pod-a")))
            .await
            .unwrap()
            .into_inner();
        assert!(response.succeeded);
        let revision = response.header.unwrap().revision;

        let range = service
            .range(Request::new(single_get(b"/registry/pods/a")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(range.count, 1);
        assert_eq!(range.kvs[0].value, b"pod-a");
        assert_eq!(range.kvs[0].version, 1);
        assert_eq!(range.kvs[0].mod_revision, revision);
    }

    #[tokio::test]
    async fn test_create_txn_conflict_reports_not_succeeded() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;
        service
            .txn(Request::new(create_txn(b"/k", b"one")))
            .await
            .unwrap();
        let response = service
            .txn(Request::new(create_txn(b"/k", b"two")))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.succeeded);

        // Value unchanged.
        let range = service
            .range(Request::new(single_get(b"/k")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(range.kvs[0].value, b"one");
    }

    #[tokio::test]
    async fn test_cas_update_failure_branch_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;
        let created = service
            .txn(Request::new(create_txn(b"/k", b"one")))
            .await
            .unwrap()
            .into_inner();
        let rev = created.header.unwrap().revision;

        // Stale mod revision: not succeeded, failure branch carries current.
        let stale = service
            .txn(Request::new(update_txn(b"/k", b"two", rev + 99)))
            .await
            .unwrap()
            .into_inner();
        assert!(!stale.succeeded);
        let range = match &stale.responses[0].response {
            Some(pb::response_op::Response::ResponseRange(r)) => r,
            other => panic!("expected range response, got {:?}", other),
        };
        assert_eq!(range.kvs[0].value, b"one");
        assert_eq!(range.kvs[0].mod_revision, rev);

        // Correct mod revision succeeds.
        let fresh = service
            .txn(Request::new(update_txn(b"/k", b"two", rev)))
            .await
            .unwrap()
            .into_inner();
        assert!(fresh.succeeded);
    }

    #[tokio::test]
    async fn test_delete_txn_returns_prior_value() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;
        let created = service
            .txn(Request::new(create_txn(b"/k", b"v")))
            .await
            .unwrap()
            .into_inner();
        let rev = created.header.unwrap().revision;

        let delete = pb::TxnRequest {
            compare: vec![pb::Compare {
                result: pb::compare::CompareResult::Equal as i32,
                target: pb::compare::CompareTarget::Mod as i32,
                key: b"/k".to_vec(),
                target_union: Some(pb::compare::TargetUnion::ModRevision(rev)),
                range_end: Vec::new(),
            }],
            success: vec![pb::RequestOp {
                request: Some(pb::request_op::Request::RequestDeleteRange(
                    pb::DeleteRangeRequest {
                        key: b"/k".to_vec(),
                        range_end: Vec::new(),
                        prev_kv: true,
                    },
                )),
            }],
            failure: Vec::new(),
        };
        let response = service.txn(Request::new(delete)).await.unwrap().into_inner();
        assert!(response.succeeded);
        let deleted = match &response.responses[0].response {
            Some(pb::response_op::Response::ResponseDeleteRange(d)) => d,
            other => panic!("expected delete response, got {:?}", other),
        };
        assert_eq!(deleted.deleted, 1);
        assert_eq!(deleted.prev_kvs[0].value, b"v");

        let range = service
            .range(Request::new(single_get(b"/k")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(range.count, 0);
    }

    #[tokio::test]
    async fn test_prefix_scan_with_limit_and_pagination() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;
        for key in [&b"/r/a"[..], b"/r/b", b"/r/c"] {
            service.txn(Request::new(create_txn(key, b"v"))).await.unwrap();
        }

        let page = service
            .range(Request::new(pb::RangeRequest {
                key: b"/r/".to_vec(),
                range_end: prefix_range_end("/r/").into_bytes(),
                limit: 2,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(page.more);
        assert_eq!(page.kvs.len(), 2);
        assert_eq!(page.kvs[0].key, b"/r/a");

        // Continue from after the last returned key.
        let rest = service
            .range(Request::new(pb::RangeRequest {
                key: b"/r/b\0".to_vec(),
                range_end: prefix_range_end("/r/").into_bytes(),
                limit: 2,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!rest.more);
        assert_eq!(rest.kvs.len(), 1);
        assert_eq!(rest.kvs[0].key, b"/r/c");
    }

    #[tokio::test]
    async fn test_count_only_range() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;
        for key in [&b"/r/a"[..], b"/r/b"] {
            service.txn(Request::new(create_txn(key, b"v"))).await.unwrap();
        }
        let counted = service
            .range(Request::new(pb::RangeRequest {
                key: b"/r/".to_vec(),
                range_end: prefix_range_end("/r/").into_bytes(),
                count_only: true,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(counted.count, 2);
        assert!(counted.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_operations_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;

        let err = service
            .put(Request::new(pb::PutRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);

        let err = service
            .delete_range(Request::new(pb::DeleteRangeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);

        let err = service
            .range(Request::new(pb::RangeRequest {
                key: b"/k".to_vec(),
                serializable: true,
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);

        // A two-compare transaction is outside the recognized shapes.
        let err = service
            .txn(Request::new(pb::TxnRequest {
                compare: vec![pb::Compare::default(), pb::Compare::default()],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_compaction_pseudo_txn_is_deflected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;
        service.txn(Request::new(create_txn(b"/k", b"v"))).await.unwrap();

        let pseudo = pb::TxnRequest {
            compare: vec![pb::Compare {
                result: pb::compare::CompareResult::Equal as i32,
                target: pb::compare::CompareTarget::Version as i32,
                key: b"compact_rev_key".to_vec(),
                target_union: Some(pb::compare::TargetUnion::Version(3)),
                range_end: Vec::new(),
            }],
            success: vec![pb::RequestOp {
                request: Some(pb::request_op::Request::RequestPut(pb::PutRequest {
                    key: b"compact_rev_key".to_vec(),
                    value: b"9".to_vec(),
                    ..Default::default()
                })),
            }],
            failure: vec![pb::RequestOp {
                request: Some(pb::request_op::Request::RequestRange(pb::RangeRequest {
                    key: b"compact_rev_key".to_vec(),
                    ..Default::default()
                })),
            }],
        };
        let response = service.txn(Request::new(pseudo)).await.unwrap().into_inner();
        assert!(!response.succeeded);
        let range = match &response.responses[0].response {
            Some(pb::response_op::Response::ResponseRange(r)) => r,
            other => panic!("expected range response, got {:?}", other),
        };
        assert_eq!(range.kvs[0].version, 4);
        // The marker never landed in the store.
        let lookup = service
            .range(Request::new(single_get(b"compact_rev_key")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(lookup.count, 0);
    }

    #[tokio::test]
    async fn test_compact_rpc_is_noop_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir).await;
        let created = service
            .txn(Request::new(create_txn(b"/k", b"v")))
            .await
            .unwrap()
            .into_inner();
        let rev = created.header.unwrap().revision;

        let response = service
            .compact(Request::new(pb::CompactionRequest {
                revision: rev,
                physical: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.header.unwrap().revision, rev);

        // History is still readable: the driver did not compact.
        let range = service
            .range(Request::new(pb::RangeRequest {
                key: b"/k".to_vec(),
                revision: rev,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(range.count, 1);
    }
}
