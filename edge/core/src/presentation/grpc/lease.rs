// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lease surface of the bridge: Grant / KeepAlive / Revoke / TimeToLive,
//! mapped one-to-one onto the driver's lease operations.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::domain::datastore::Datastore;
use crate::presentation::grpc::{etcdserverpb as pb, response_header, status_from};

pub struct LeaseService {
    datastore: Arc<dyn Datastore>,
}

impl LeaseService {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }
}

#[tonic::async_trait]
impl pb::lease_server::Lease for LeaseService {
    async fn lease_grant(
        &self,
        request: Request<pb::LeaseGrantRequest>,
    ) -> Result<Response<pb::LeaseGrantResponse>, Status> {
        let req = request.into_inner();
        let lease = self
            .datastore
            .lease_grant(req.ttl)
            .await
            .map_err(status_from)?;
        let revision = self
            .datastore
            .current_revision()
            .await
            .map_err(status_from)?;
        Ok(Response::new(pb::LeaseGrantResponse {
            header: Some(response_header(revision)),
            id: lease.id,
            ttl: lease.ttl_seconds,
            error: String::new(),
        }))
    }

    async fn lease_revoke(
        &self,
        request: Request<pb::LeaseRevokeRequest>,
    ) -> Result<Response<pb::LeaseRevokeResponse>, Status> {
        let req = request.into_inner();
        let revision = self
            .datastore
            .lease_revoke(req.id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(pb::LeaseRevokeResponse {
            header: Some(response_header(revision)),
        }))
    }

    type LeaseKeepAliveStream = ReceiverStream<Result<pb::LeaseKeepAliveResponse, Status>>;

    async fn lease_keep_alive(
        &self,
        request: Request<Streaming<pb::LeaseKeepAliveRequest>>,
    ) -> Result<Response<Self::LeaseKeepAliveStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let datastore = self.datastore.clone();
        tokio::spawn(async move {
            while let Ok(Some(req)) = inbound.message().await {
                let response = match datastore.lease_renew(req.id).await {
                    Ok(lease) => pb::LeaseKeepAliveResponse {
                        header: Some(response_header(0)),
                        id: lease.id,
                        ttl: lease.ttl_seconds,
                    },
                    // An expired lease keeps the stream alive but reports
                    // zero TTL, which tells the client to re-grant.
                    Err(_) => pb::LeaseKeepAliveResponse {
                        header: Some(response_header(0)),
                        id: req.id,
                        ttl: 0,
                    },
                };
                if tx.send(Ok(response)).await.is_err() {
                    return;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn lease_time_to_live(
        &self,
        request: Request<pb::LeaseTimeToLiveRequest>,
    ) -> Result<Response<pb::LeaseTimeToLiveResponse>, Status> {
        let req = request.into_inner();
        let status = self
            .datastore
            .lease_time_to_live(req.id, req.keys)
            .await
            .map_err(status_from)?;
        let revision = self
            .datastore
            .current_revision()
            .await
            .map_err(status_from)?;
        Ok(Response::new(pb::LeaseTimeToLiveResponse {
            header: Some(response_header(revision)),
            id: status.id,
            ttl: status.remaining_ttl,
            granted_ttl: status.granted_ttl,
            keys: status.keys.into_iter().map(String::into_bytes).collect(),
        }))
    }
}
