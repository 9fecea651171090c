// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Edge reverse tunnel
//!
//! The control plane must reach agents that live behind NAT, so agents dial
//! in: each agent keeps a persistent websocket to every control-plane
//! endpoint, and the server multiplexes its outbound TCP connections back
//! over those websockets.
//!
//! - [`message`] - the binary frame format carried over the websocket.
//! - [`session`] - one multiplexed websocket: connection table, read loop,
//!   virtual [`session::TunnelConn`] streams.
//! - [`server`] - the control-plane session table and `dial`.
//! - [`client`] - the agent-side connection loop with jittered backoff.
//! - [`lb`] - the loopback listener that spreads API traffic across healthy
//!   control-plane endpoints.

pub mod client;
pub mod lb;
pub mod message;
pub mod server;
pub mod session;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("malformed tunnel frame: {0}")]
    Frame(String),

    #[error("tunnel session closed")]
    Closed,

    #[error("connect rejected: {0}")]
    ConnectRejected(String),

    #[error("dial deadline exceeded")]
    DialTimeout,

    #[error("no tunnel route to client {0}")]
    NoRoute(String),

    #[error("websocket error: {0}")]
    Websocket(String),

    #[error("remote error on tunneled connection: {0}")]
    Remote(String),
}
