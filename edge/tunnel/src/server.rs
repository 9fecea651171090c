// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Control-plane side of the tunnel: the session table.
//!
//! Sessions are keyed `(client-key, session-key)`; the session key is a
//! random 63-bit value assigned on upgrade so one node reconnecting fast
//! never collides with its own dying session. Peer control-plane servers
//! connect to each other the same way agents do; each server advertises its
//! locally connected client keys over those peer links, and a dial for a
//! client without a local session is forwarded to whichever peer advertises
//! it. The table holds strong references to its own sessions only; routing
//! across peers goes through advertised keys, never through direct
//! session-to-session pointers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::session::{ConnParity, ConnectHandler, Session, TunnelConn, TunnelSocket};
use crate::TunnelError;

/// Session-table listener: `(client_key, added)`. Invoked synchronously
/// while the table lock is held; implementations must only enqueue.
pub type SessionListener = Box<dyn Fn(&str, bool) + Send + Sync>;

/// Marker prefix distinguishing peer control-plane links from agent links.
pub const PEER_KEY_PREFIX: &str = "peer:";

#[derive(Default)]
pub struct TunnelServer {
    sessions: Mutex<HashMap<String, Vec<Arc<Session>>>>,
    peers: Mutex<Vec<Arc<Session>>>,
    listeners: Mutex<Vec<SessionListener>>,
}

impl TunnelServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_listener(&self, listener: SessionListener) {
        // Taking the table lock keeps add/remove notifications ordered
        // relative to listener registration.
        let _table = self.sessions.lock();
        self.listeners.lock().push(listener);
    }

    pub fn has_session(&self, client_key: &str) -> bool {
        self.sessions
            .lock()
            .get(client_key)
            .is_some_and(|list| !list.is_empty())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().values().map(Vec::len).sum()
    }

    /// Run one accepted websocket as a tunnel session until it closes.
    /// `peer` marks a link from another control-plane server.
    pub async fn serve(
        self: &Arc<Self>,
        client_key: &str,
        peer: bool,
        socket: impl TunnelSocket,
    ) -> Result<(), TunnelError> {
        let session_key = (rand::random::<u64>() >> 1) as i64;
        let handler = if peer {
            Some(Arc::new(ForwardHandler {
                server: Arc::downgrade(self),
            }) as Arc<dyn ConnectHandler>)
        } else {
            None
        };
        let session = Session::new(client_key, session_key, ConnParity::Even, handler);
        info!(client = client_key, session = session_key, peer, "tunnel session open");

        self.add_session(client_key, peer, &session).await;
        metrics::gauge!("aegis_edge_tunnel_sessions").set(self.session_count() as f64);
        let result = session.run(socket).await;
        self.remove_session(client_key, peer, &session).await;
        metrics::gauge!("aegis_edge_tunnel_sessions").set(self.session_count() as f64);
        info!(client = client_key, session = session_key, "tunnel session closed");
        result
    }

    /// Run the ws-client side of an outbound peer link (this server dialed a
    /// fellow control-plane server).
    pub async fn serve_peer_outbound(
        self: &Arc<Self>,
        peer_key: &str,
        socket: impl TunnelSocket,
    ) -> Result<(), TunnelError> {
        let session = Session::new(
            peer_key,
            (rand::random::<u64>() >> 1) as i64,
            ConnParity::Odd,
            Some(Arc::new(ForwardHandler {
                server: Arc::downgrade(self),
            })),
        );
        self.add_session(peer_key, true, &session).await;
        let result = session.run(socket).await;
        self.remove_session(peer_key, true, &session).await;
        result
    }

    async fn add_session(&self, client_key: &str, peer: bool, session: &Arc<Session>) {
        if peer {
            let local_keys: Vec<String> = {
                let mut peers = self.peers.lock();
                peers.push(session.clone());
                self.sessions.lock().keys().cloned().collect()
            };
            // A new peer link learns every client already connected here.
            for key in local_keys {
                let _ = session.advertise(&key, true).await;
            }
            return;
        }

        {
            let mut table = self.sessions.lock();
            table
                .entry(client_key.to_string())
                .or_default()
                .push(session.clone());
            for listener in self.listeners.lock().iter() {
                listener(client_key, true);
            }
        }
        let peers: Vec<Arc<Session>> = self.peers.lock().clone();
        for peer_session in peers {
            let _ = peer_session.advertise(client_key, true).await;
        }
    }

    async fn remove_session(&self, client_key: &str, peer: bool, session: &Arc<Session>) {
        if peer {
            self.peers
                .lock()
                .retain(|s| s.session_key() != session.session_key());
            return;
        }

        let gone = {
            let mut table = self.sessions.lock();
            let mut gone = false;
            if let Some(list) = table.get_mut(client_key) {
                list.retain(|s| s.session_key() != session.session_key());
                if list.is_empty() {
                    table.remove(client_key);
                    gone = true;
                }
            }
            if gone {
                for listener in self.listeners.lock().iter() {
                    listener(client_key, false);
                }
            }
            gone
        };
        if gone {
            let peers: Vec<Arc<Session>> = self.peers.lock().clone();
            for peer_session in peers {
                let _ = peer_session.advertise(client_key, false).await;
            }
        }
    }

    /// Open a connection to `address` on the named client's side of the
    /// tunnel, routing through a peer server when the client is connected
    /// elsewhere.
    pub async fn dial(
        &self,
        client_key: &str,
        address: &str,
        deadline: Duration,
    ) -> Result<TunnelConn, TunnelError> {
        if let Some(session) = self.local_session(client_key) {
            return session.dial(address, deadline).await;
        }
        let forwarder = self
            .peers
            .lock()
            .iter()
            .find(|s| s.advertises(client_key))
            .cloned();
        if let Some(peer_session) = forwarder {
            debug!(client = client_key, via = peer_session.client_key(), "forwarding dial to peer");
            return peer_session
                .dial(&format!("forward:{client_key}|{address}"), deadline)
                .await;
        }
        Err(TunnelError::NoRoute(client_key.to_string()))
    }

    fn local_session(&self, client_key: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .get(client_key)
            .and_then(|list| list.last().cloned())
    }

    /// Resolve a dial strictly against local sessions; used when honoring a
    /// forwarded connect so routing cannot loop between peers.
    async fn dial_local(
        &self,
        client_key: &str,
        address: &str,
        deadline: Duration,
    ) -> Result<TunnelConn, TunnelError> {
        match self.local_session(client_key) {
            Some(session) => session.dial(address, deadline).await,
            None => Err(TunnelError::NoRoute(client_key.to_string())),
        }
    }

    /// Close every session (shutdown path).
    pub fn close_all(&self) {
        for list in self.sessions.lock().values() {
            for session in list {
                session.close();
            }
        }
        for session in self.peers.lock().iter() {
            session.close();
        }
    }
}

/// Honors `Connect` frames arriving over peer links by re-dialing the
/// target through the local session table and piping the two streams.
struct ForwardHandler {
    server: Weak<TunnelServer>,
}

#[async_trait]
impl ConnectHandler for ForwardHandler {
    async fn connect(
        &self,
        mut conn: TunnelConn,
        address: &str,
        deadline: Duration,
    ) -> Result<(), TunnelError> {
        let server = self
            .server
            .upgrade()
            .ok_or(TunnelError::Closed)?;
        let forwarded = address
            .strip_prefix("forward:")
            .ok_or_else(|| TunnelError::ConnectRejected(format!("unroutable address {address}")))?;
        let (client_key, target) = forwarded
            .split_once('|')
            .ok_or_else(|| TunnelError::ConnectRejected("malformed forward address".to_string()))?;

        let mut local = server.dial_local(client_key, target, deadline).await?;
        tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut conn, &mut local).await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::socket_pair;
    use crate::session::DEFAULT_DIAL_DEADLINE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    /// Stand-in for an agent: accepts connects and echoes bytes back.
    struct AgentEcho;

    #[async_trait]
    impl ConnectHandler for AgentEcho {
        async fn connect(
            &self,
            mut conn: TunnelConn,
            _address: &str,
            _deadline: Duration,
        ) -> Result<(), TunnelError> {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                while let Ok(n) = conn.read(&mut buf).await {
                    if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                let _ = conn.shutdown().await;
            });
            Ok(())
        }
    }

    /// Wire an "agent" session into a server, returning the agent session.
    fn attach_agent(server: &Arc<TunnelServer>, client_key: &str) -> Arc<Session> {
        let (server_sock, agent_sock) = socket_pair();
        let agent = Session::new(client_key, 99, ConnParity::Odd, Some(Arc::new(AgentEcho)));
        let agent_run = agent.clone();
        tokio::spawn(async move { agent_run.run(agent_sock).await });
        let server = server.clone();
        let client_key = client_key.to_string();
        tokio::spawn(async move { server.serve(&client_key, false, server_sock).await });
        agent
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_dial_reaches_local_agent() {
        let server = TunnelServer::new();
        let _agent = attach_agent(&server, "agent-01");
        wait_until(|| server.has_session("agent-01")).await;

        let mut conn = server
            .dial("agent-01", "tcp://127.0.0.1:10250", DEFAULT_DIAL_DEADLINE)
            .await
            .unwrap();
        conn.write_all(b"kubelet-probe").await.unwrap();
        let mut back = [0u8; 13];
        conn.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"kubelet-probe");
    }

    #[tokio::test]
    async fn test_dial_unknown_client_has_no_route() {
        let server = TunnelServer::new();
        let err = server
            .dial("ghost", "tcp://127.0.0.1:1", DEFAULT_DIAL_DEADLINE)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::NoRoute(_)));
    }

    #[tokio::test]
    async fn test_listeners_observe_add_then_remove() {
        let server = TunnelServer::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        server.add_listener(Box::new(move |key, added| {
            let _ = events_tx.send((key.to_string(), added));
        }));

        let agent = attach_agent(&server, "agent-02");
        let (key, added) = events_rx.recv().await.unwrap();
        assert_eq!((key.as_str(), added), ("agent-02", true));

        agent.close();
        let (key, added) = events_rx.recv().await.unwrap();
        assert_eq!((key.as_str(), added), ("agent-02", false));
    }

    #[tokio::test]
    async fn test_dial_forwards_through_peer_server() {
        let server_a = TunnelServer::new();
        let server_b = TunnelServer::new();

        // Agent lives on B.
        let _agent = attach_agent(&server_b, "agent-03");
        wait_until(|| server_b.has_session("agent-03")).await;

        // B dials A as a peer (B is the ws-client end).
        let (a_sock, b_sock) = socket_pair();
        {
            let server_a = server_a.clone();
            tokio::spawn(async move { server_a.serve("peer:b", true, a_sock).await });
        }
        {
            let server_b = server_b.clone();
            tokio::spawn(async move { server_b.serve_peer_outbound("peer:a", b_sock).await });
        }

        // A learns about agent-03 through B's advertisement, then dials it.
        wait_until(|| {
            server_a
                .peers
                .lock()
                .iter()
                .any(|s| s.advertises("agent-03"))
        })
        .await;

        let mut conn = server_a
            .dial("agent-03", "tcp://127.0.0.1:10250", DEFAULT_DIAL_DEADLINE)
            .await
            .unwrap();
        conn.write_all(b"cross-server").await.unwrap();
        let mut back = [0u8; 12];
        conn.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"cross-server");
    }
}
