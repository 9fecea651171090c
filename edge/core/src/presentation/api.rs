// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Supervisor HTTPS surface: node join, bootstrap exchange for joining
//! servers, the tunnel websocket upgrade, endpoint discovery, and the
//! administrative encryption/token commands.
//!
//! Two credential classes: the cluster token (join, bootstrap, admin) and
//! node bearer tokens issued by the registrar (tunnel upgrade, endpoint
//! discovery). Both ride in the `Authorization: Bearer` header.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use aegis_edge_tunnel::session::TunnelSocket;
use aegis_edge_tunnel::TunnelError;

use crate::application::supervisor::ServerContext;
use crate::domain::node::{JoinRequest, NodeRegistration, NodeRole, RegistrarError};
use crate::domain::secrets::{EncryptionCommand, SecretsError};

pub fn router(context: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/v1-edge/readyz", get(readyz))
        .route("/v1-edge/server-bootstrap", get(server_bootstrap))
        .route("/v1-edge/node/register", post(node_register))
        .route("/v1-edge/endpoints", get(endpoints))
        .route("/v1-edge/connect", get(connect))
        .route("/v1-edge/encrypt/status", get(encrypt_status))
        .route("/v1-edge/encrypt/{command}", post(encrypt_advance))
        .route("/v1-edge/token/rotate", post(token_rotate))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn require_cluster_token(
    context: &ServerContext,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, String)> {
    let presented = bearer(headers)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing bearer token".to_string()))?;
    if context.registrar.verify_cluster_token(presented) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "token rejected".to_string()))
    }
}

async fn ping() -> &'static str {
    "pong"
}

async fn readyz(State(context): State<Arc<ServerContext>>) -> Result<&'static str, StatusCode> {
    context
        .datastore
        .current_revision()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok("ok")
}

/// Shared PKI for a joining server, gated on the cluster token.
async fn server_bootstrap(
    State(context): State<Arc<ServerContext>>,
    headers: HeaderMap,
) -> Result<Response, (StatusCode, String)> {
    require_cluster_token(&context, &headers)?;
    let blob = context
        .secrets
        .bootstrap_blob()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(blob).into_response())
}

async fn node_register(
    State(context): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(request): Json<JoinRequest>,
) -> Result<Response, (StatusCode, String)> {
    let presented = bearer(&headers)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing bearer token".to_string()))?;
    match context.registrar.register(presented, request).await {
        Ok(response) => Ok(Json(response).into_response()),
        Err(e @ RegistrarError::InvalidToken) => Err((StatusCode::UNAUTHORIZED, e.to_string())),
        Err(e @ RegistrarError::NameConflict(_)) => Err((StatusCode::CONFLICT, e.to_string())),
        Err(e @ RegistrarError::InvalidName(_)) => Err((StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// Current server-role endpoints, for agents refreshing their set.
async fn endpoints(
    State(context): State<Arc<ServerContext>>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>, (StatusCode, String)> {
    authenticate_any(&context, &headers)?;
    let mut endpoints = context
        .registrar
        .server_endpoints()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !endpoints.contains(&context.advertised_address) {
        endpoints.push(context.advertised_address.clone());
    }
    Ok(Json(endpoints))
}

/// Either credential class is acceptable.
fn authenticate_any(
    context: &ServerContext,
    headers: &HeaderMap,
) -> Result<Option<String>, (StatusCode, String)> {
    let presented = bearer(headers)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing bearer token".to_string()))?;
    if context.registrar.verify_cluster_token(presented) {
        return Ok(None);
    }
    match context.registrar.verify_node_token(presented) {
        Ok(node) => Ok(Some(node)),
        Err(_) => Err((StatusCode::UNAUTHORIZED, "credential rejected".to_string())),
    }
}

/// Tunnel websocket upgrade. The client key is the node name inside the
/// bearer token; server-role nodes become peer links.
async fn connect(
    State(context): State<Arc<ServerContext>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, (StatusCode, String)> {
    let presented = bearer(&headers)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing bearer token".to_string()))?;
    let node = context
        .registrar
        .verify_node_token(presented)
        .map_err(|_| (StatusCode::UNAUTHORIZED, "node credential rejected".to_string()))?;

    let peer = match lookup_role(&context, &node).await {
        Some(NodeRole::Server) => true,
        Some(NodeRole::Agent) => false,
        None => {
            return Err((
                StatusCode::FORBIDDEN,
                format!("node {node} has no registration"),
            ))
        }
    };

    Ok(ws.on_upgrade(move |socket| async move {
        let tunnel = context.tunnel.clone();
        if let Err(e) = tunnel.serve(&node, peer, AxumWsSocket { socket }).await {
            warn!(node = %node, error = %e, "tunnel session ended with error");
        }
    }))
}

async fn lookup_role(context: &ServerContext, node: &str) -> Option<NodeRole> {
    let key = format!("/aegis/registrations/{node}");
    let (_, kv) = context.datastore.get(&key, 0).await.ok()?;
    let record: NodeRegistration = serde_json::from_slice(&kv?.value).ok()?;
    Some(record.role)
}

async fn encrypt_status(
    State(context): State<Arc<ServerContext>>,
    headers: HeaderMap,
) -> Result<Response, (StatusCode, String)> {
    require_cluster_token(&context, &headers)?;
    Ok(Json(context.encryption.status()).into_response())
}

async fn encrypt_advance(
    State(context): State<Arc<ServerContext>>,
    Path(command): Path<String>,
    headers: HeaderMap,
) -> Result<Response, (StatusCode, String)> {
    require_cluster_token(&context, &headers)?;
    let command = match command.as_str() {
        "prepare" => EncryptionCommand::Prepare,
        "rotate" => EncryptionCommand::Rotate,
        "reencrypt" => EncryptionCommand::Reencrypt,
        other => {
            return Err((
                StatusCode::NOT_FOUND,
                format!("unknown encryption command {other}"),
            ))
        }
    };
    match context.encryption.advance(command, &context.datastore).await {
        Ok(status) => Ok(Json(status).into_response()),
        Err(e @ SecretsError::StageMismatch { .. }) => Err((StatusCode::CONFLICT, e.to_string())),
        Err(e @ SecretsError::NotEnabled) => Err((StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenRotateRequest {
    pub new_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenRotateResponse {
    pub rotated: bool,
}

/// Rotate the cluster token; the old token stops working immediately.
async fn token_rotate(
    State(context): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(request): Json<TokenRotateRequest>,
) -> Result<Response, (StatusCode, String)> {
    require_cluster_token(&context, &headers)?;
    let rotated = context
        .coordinator
        .rotate_token(&context.secrets, &context.datastore, &request.new_token)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    *context.token.write() = rotated;
    Ok(Json(TokenRotateResponse { rotated: true }).into_response())
}

/// [`TunnelSocket`] over an accepted axum websocket.
struct AxumWsSocket {
    socket: WebSocket,
}

#[async_trait]
impl TunnelSocket for AxumWsSocket {
    async fn send(&mut self, frame: Bytes) -> Result<(), TunnelError> {
        self.socket
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TunnelError::Websocket(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Bytes, TunnelError>> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Binary(payload)) => return Some(Ok(payload)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(TunnelError::Websocket(e.to_string()))),
            }
        }
    }
}
