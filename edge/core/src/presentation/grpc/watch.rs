// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Watch surface of the bridge: prefix and single-key watches with event
//! type filters, backed by the driver's backfill-then-live subscriptions.
//!
//! One gRPC stream multiplexes any number of watches; each create spawns a
//! forwarder that translates driver batches into `WatchResponse`s until the
//! client cancels, the stream drops, or the driver ends the subscription
//! (compaction or backpressure).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::domain::datastore::{Datastore, DatastoreError};
use crate::domain::kv::{Event, EventKind};
use crate::presentation::grpc::{etcdserverpb as pb, mvccpb, response_header, to_proto_kv};

pub struct WatchService {
    datastore: Arc<dyn Datastore>,
}

impl WatchService {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }
}

struct ActiveWatch {
    cancel: CancellationToken,
}

fn to_proto_event(event: Event, want_prev: bool) -> mvccpb::Event {
    let kind = match event.kind {
        EventKind::Delete => mvccpb::event::EventType::Delete,
        EventKind::Create | EventKind::Update => mvccpb::event::EventType::Put,
    };
    mvccpb::Event {
        r#type: kind as i32,
        kv: Some(to_proto_kv(event.kv)),
        prev_kv: if want_prev {
            event.prev_kv.map(to_proto_kv)
        } else {
            None
        },
    }
}

fn passes_filters(event: &Event, filters: &[i32]) -> bool {
    for filter in filters {
        match pb::watch_create_request::FilterType::try_from(*filter) {
            Ok(pb::watch_create_request::FilterType::Noput)
                if !matches!(event.kind, EventKind::Delete) =>
            {
                return false;
            }
            Ok(pb::watch_create_request::FilterType::Nodelete)
                if matches!(event.kind, EventKind::Delete) =>
            {
                return false;
            }
            _ => {}
        }
    }
    true
}

#[tonic::async_trait]
impl pb::watch_server::Watch for WatchService {
    type WatchStream = ReceiverStream<Result<pb::WatchResponse, Status>>;

    async fn watch(
        &self,
        request: Request<Streaming<pb::WatchRequest>>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<pb::WatchResponse, Status>>(128);
        let datastore = self.datastore.clone();

        tokio::spawn(async move {
            let mut next_id: i64 = 1;
            let mut active: HashMap<i64, ActiveWatch> = HashMap::new();
            let stream_cancel = CancellationToken::new();

            while let Ok(Some(message)) = inbound.message().await {
                match message.request_union {
                    Some(pb::watch_request::RequestUnion::CreateRequest(create)) => {
                        let watch_id = if create.watch_id > 0 {
                            create.watch_id
                        } else {
                            let id = next_id;
                            next_id += 1;
                            id
                        };
                        handle_create(
                            &datastore,
                            &tx,
                            &mut active,
                            &stream_cancel,
                            watch_id,
                            create,
                        )
                        .await;
                    }
                    Some(pb::watch_request::RequestUnion::CancelRequest(cancel)) => {
                        if let Some(watch) = active.remove(&cancel.watch_id) {
                            watch.cancel.cancel();
                            let revision = datastore.current_revision().await.unwrap_or(0);
                            let _ = tx
                                .send(Ok(pb::WatchResponse {
                                    header: Some(response_header(revision)),
                                    watch_id: cancel.watch_id,
                                    canceled: true,
                                    ..Default::default()
                                }))
                                .await;
                        }
                    }
                    Some(pb::watch_request::RequestUnion::ProgressRequest(_)) => {
                        let revision = datastore.current_revision().await.unwrap_or(0);
                        // Progress notifications carry the broadcast id.
                        let _ = tx
                            .send(Ok(pb::WatchResponse {
                                header: Some(response_header(revision)),
                                watch_id: -1,
                                ..Default::default()
                            }))
                            .await;
                    }
                    None => {}
                }
            }
            // Client stream ended; tear down every forwarder.
            stream_cancel.cancel();
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

async fn handle_create(
    datastore: &Arc<dyn Datastore>,
    tx: &mpsc::Sender<Result<pb::WatchResponse, Status>>,
    active: &mut HashMap<i64, ActiveWatch>,
    stream_cancel: &CancellationToken,
    watch_id: i64,
    create: pb::WatchCreateRequest,
) {
    let Ok(key) = String::from_utf8(create.key.clone()) else {
        let _ = tx
            .send(Err(Status::invalid_argument("watch keys must be UTF-8")))
            .await;
        return;
    };
    // Exact watches have an empty range end; everything else is a prefix.
    let exact = create.range_end.is_empty().then(|| key.clone());

    let watcher = match datastore.watch(&key, create.start_revision).await {
        Ok(watcher) => watcher,
        Err(DatastoreError::Compacted { watermark, .. }) => {
            let _ = tx
                .send(Ok(pb::WatchResponse {
                    header: Some(response_header(watermark)),
                    watch_id,
                    created: true,
                    canceled: true,
                    compact_revision: watermark,
                    ..Default::default()
                }))
                .await;
            return;
        }
        Err(e) => {
            let _ = tx.send(Err(super::status_from(e))).await;
            return;
        }
    };

    let revision = datastore.current_revision().await.unwrap_or(0);
    if tx
        .send(Ok(pb::WatchResponse {
            header: Some(response_header(revision)),
            watch_id,
            created: true,
            ..Default::default()
        }))
        .await
        .is_err()
    {
        return;
    }

    let cancel = CancellationToken::new();
    active.insert(watch_id, ActiveWatch { cancel: cancel.clone() });
    debug!(watch_id, key = %key, start = create.start_revision, "watch created");

    let tx = tx.clone();
    let stream_cancel = stream_cancel.clone();
    let filters = create.filters.clone();
    let want_prev = create.prev_kv;
    let mut watcher = watcher;
    tokio::spawn(async move {
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = stream_cancel.cancelled() => return,
                batch = watcher.recv() => batch,
            };
            match batch {
                Some(Ok(events)) => {
                    let events: Vec<mvccpb::Event> = events
                        .into_iter()
                        .filter(|e| exact.as_deref().is_none_or(|k| e.kv.key == k))
                        .filter(|e| passes_filters(e, &filters))
                        .map(|e| to_proto_event(e, want_prev))
                        .collect();
                    if events.is_empty() {
                        continue;
                    }
                    let revision = events.last().and_then(|e| e.kv.as_ref()).map(|kv| kv.mod_revision).unwrap_or(0);
                    let response = pb::WatchResponse {
                        header: Some(response_header(revision)),
                        watch_id,
                        events,
                        ..Default::default()
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        return;
                    }
                }
                Some(Err(DatastoreError::Compacted { watermark, .. })) => {
                    let _ = tx
                        .send(Ok(pb::WatchResponse {
                            header: Some(response_header(watermark)),
                            watch_id,
                            canceled: true,
                            compact_revision: watermark,
                            ..Default::default()
                        }))
                        .await;
                    return;
                }
                Some(Err(e)) => {
                    let _ = tx
                        .send(Ok(pb::WatchResponse {
                            header: Some(response_header(0)),
                            watch_id,
                            canceled: true,
                            cancel_reason: e.to_string(),
                            ..Default::default()
                        }))
                        .await;
                    return;
                }
                None => {
                    let _ = tx
                        .send(Ok(pb::WatchResponse {
                            header: Some(response_header(0)),
                            watch_id,
                            canceled: true,
                            ..Default::default()
                        }))
                        .await;
                    return;
                }
            }
        }
    });
}
