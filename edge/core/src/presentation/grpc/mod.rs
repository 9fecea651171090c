// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # KV bridge
//!
//! Serves the etcd v3 gRPC surface the upstream control plane links against
//! and translates it onto the [`Datastore`] trait. The bridge holds no
//! durable state; it narrows the wire surface to the exact subset the
//! control plane issues (see [`kv`]) so every write arrives as a recognized
//! compare-and-mutate transaction and CAS is always enforced.
//!
//! The bridge binds to loopback only; the control plane runs in-process on
//! the same host, and the supervisor port is the cluster's outer surface.

pub mod kv;
pub mod lease;
pub mod maintenance;
pub mod watch;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use crate::domain::datastore::{Datastore, DatastoreError};

pub mod etcdserverpb {
    tonic_prost::include_proto!("etcdserverpb");
}

pub mod mvccpb {
    tonic_prost::include_proto!("mvccpb");
}

pub mod healthpb {
    tonic_prost::include_proto!("grpc.health.v1");
}

/// Map a driver error onto the status codes the upstream client expects.
pub(crate) fn status_from(err: DatastoreError) -> tonic::Status {
    match err {
        DatastoreError::AlreadyExists(key) => tonic::Status::already_exists(key),
        DatastoreError::Compacted { requested, watermark } => tonic::Status::failed_precondition(
            format!("revision {requested} compacted (watermark {watermark})"),
        ),
        DatastoreError::Timeout => tonic::Status::deadline_exceeded("datastore deadline exceeded"),
        DatastoreError::Unavailable(reason) => tonic::Status::unavailable(reason),
        DatastoreError::Closed => tonic::Status::unavailable("watch closed"),
        DatastoreError::LeaseNotFound(id) => tonic::Status::not_found(format!("lease {id}")),
        other => tonic::Status::internal(other.to_string()),
    }
}

pub(crate) fn response_header(revision: i64) -> etcdserverpb::ResponseHeader {
    etcdserverpb::ResponseHeader {
        cluster_id: 0,
        member_id: 0,
        revision,
        raft_term: 0,
    }
}

pub(crate) fn to_proto_kv(kv: crate::domain::kv::KeyValue) -> mvccpb::KeyValue {
    mvccpb::KeyValue {
        key: kv.key.into_bytes(),
        create_revision: kv.create_revision,
        mod_revision: kv.mod_revision,
        version: kv.version,
        value: kv.value,
        lease: kv.lease,
    }
}

#[derive(Debug, Clone)]
pub struct KvBridgeOptions {
    /// Resolve client-issued Compact requests against the driver instead of
    /// answering them as a no-op.
    pub compact_passthrough: bool,
}

/// Serve the bridge until cancelled. Health flips to SERVING immediately:
/// the datastore handle passed in is already open.
pub async fn serve(
    addr: std::net::SocketAddr,
    datastore: Arc<dyn Datastore>,
    options: KvBridgeOptions,
    cancel: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    use etcdserverpb::kv_server::KvServer;
    use etcdserverpb::lease_server::LeaseServer;
    use etcdserverpb::maintenance_server::MaintenanceServer;
    use etcdserverpb::watch_server::WatchServer;
    use healthpb::health_server::HealthServer;

    info!(listen = %addr, "kv bridge listening");
    Server::builder()
        .add_service(KvServer::new(kv::KvService::new(
            datastore.clone(),
            options.clone(),
        )))
        .add_service(WatchServer::new(watch::WatchService::new(datastore.clone())))
        .add_service(LeaseServer::new(lease::LeaseService::new(datastore.clone())))
        .add_service(MaintenanceServer::new(maintenance::MaintenanceService::new(
            datastore.clone(),
        )))
        .add_service(HealthServer::new(maintenance::HealthService::new(datastore)))
        .serve_with_shutdown(addr, cancel.cancelled())
        .await
}
