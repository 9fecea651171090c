// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Maintenance.Status (database size + current revision) and the standard
//! health service, which reports SERVING once the datastore handle exists.

use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::domain::datastore::Datastore;
use crate::presentation::grpc::{etcdserverpb as pb, healthpb, response_header, status_from};

pub struct MaintenanceService {
    datastore: Arc<dyn Datastore>,
}

impl MaintenanceService {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }
}

#[tonic::async_trait]
impl pb::maintenance_server::Maintenance for MaintenanceService {
    async fn status(
        &self,
        _request: Request<pb::StatusRequest>,
    ) -> Result<Response<pb::StatusResponse>, Status> {
        let db_size = self.datastore.db_size().await.map_err(status_from)?;
        let revision = self
            .datastore
            .current_revision()
            .await
            .map_err(status_from)?;
        Ok(Response::new(pb::StatusResponse {
            header: Some(response_header(revision)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            db_size,
            leader: 1,
            raft_index: revision as u64,
            raft_term: 0,
        }))
    }
}

pub struct HealthService {
    _datastore: Arc<dyn Datastore>,
}

impl HealthService {
    /// Holding the open datastore handle is the serving condition: the
    /// bridge is only assembled after the driver opened successfully.
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            _datastore: datastore,
        }
    }
}

#[tonic::async_trait]
impl healthpb::health_server::Health for HealthService {
    async fn check(
        &self,
        _request: Request<healthpb::HealthCheckRequest>,
    ) -> Result<Response<healthpb::HealthCheckResponse>, Status> {
        Ok(Response::new(healthpb::HealthCheckResponse {
            status: healthpb::health_check_response::ServingStatus::Serving as i32,
        }))
    }

    type WatchStream = ReceiverStream<Result<healthpb::HealthCheckResponse, Status>>;

    async fn watch(
        &self,
        _request: Request<healthpb::HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(healthpb::HealthCheckResponse {
                status: healthpb::health_check_response::ServingStatus::Serving as i32,
            }))
            .await;
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
