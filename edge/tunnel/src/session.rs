// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! One multiplexed tunnel session over a websocket.
//!
//! A session owns the connection table for its link. Exactly one side of a
//! link initiates connections; initiated connection ids take the session's
//! parity (ws-client odd, ws-server even), so the two namespaces never
//! collide even on server-to-server peer links where both ends dial.
//!
//! Frames for one connection id are delivered in order; the per-connection
//! inbound queue is bounded, and a consumer that stops draining it takes the
//! whole session down rather than buffering without limit.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, warn};

use crate::message::{Frame, FrameKind};
use crate::TunnelError;

/// Inbound frames buffered per connection before the session is torn down.
const CONN_QUEUE_DEPTH: usize = 64;

/// Outbound frames buffered before writers feel backpressure.
const WRITE_QUEUE_DEPTH: usize = 256;

/// Data frames are chunked so one write cannot monopolize the link.
const MAX_DATA_CHUNK: usize = 64 * 1024;

/// Reason text used for a clean end-of-stream, as opposed to a failure.
const EOF_REASON: &str = "EOF";

/// Default dial deadline when a `Connect` carries none.
pub const DEFAULT_DIAL_DEADLINE: Duration = Duration::from_secs(15);

/// Which connection-id parity this end of the link allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnParity {
    /// The websocket-accepting side.
    Even,
    /// The websocket-initiating side.
    Odd,
}

/// Transport abstraction: one binary websocket message per frame. Lets the
/// server side ride on axum's upgrade type, the client side on
/// tokio-tungstenite, and tests on in-memory channels.
#[async_trait]
pub trait TunnelSocket: Send + 'static {
    async fn send(&mut self, frame: Bytes) -> Result<(), TunnelError>;
    async fn recv(&mut self) -> Option<Result<Bytes, TunnelError>>;
}

/// Accepts incoming `Connect` frames on sessions whose end is dialable.
#[async_trait]
pub trait ConnectHandler: Send + Sync + 'static {
    async fn connect(
        &self,
        conn: TunnelConn,
        address: &str,
        deadline: Duration,
    ) -> Result<(), TunnelError>;
}

/// Callback invoked (synchronously, under the session lock) when the peer
/// advertises or withdraws a reachable client key. Must only enqueue work.
pub type PeerAdvertisementFn = Box<dyn Fn(&str, bool) + Send + Sync>;

pub struct Session {
    client_key: String,
    session_key: i64,
    conns: Mutex<HashMap<i64, mpsc::Sender<Result<Bytes, TunnelError>>>>,
    remote_clients: Mutex<HashSet<String>>,
    writer: mpsc::Sender<Bytes>,
    writer_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    next_conn_id: AtomicI64,
    next_msg_id: AtomicI64,
    handler: Option<Arc<dyn ConnectHandler>>,
    on_advertisement: Mutex<Option<PeerAdvertisementFn>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        client_key: &str,
        session_key: i64,
        parity: ConnParity,
        handler: Option<Arc<dyn ConnectHandler>>,
    ) -> Arc<Self> {
        let (writer, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        Arc::new(Self {
            client_key: client_key.to_string(),
            session_key,
            conns: Mutex::new(HashMap::new()),
            remote_clients: Mutex::new(HashSet::new()),
            writer,
            writer_rx: Mutex::new(Some(writer_rx)),
            next_conn_id: AtomicI64::new(match parity {
                ConnParity::Even => 2,
                ConnParity::Odd => 1,
            }),
            next_msg_id: AtomicI64::new(1),
            handler,
            on_advertisement: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn session_key(&self) -> i64 {
        self.session_key
    }

    pub fn set_advertisement_callback(&self, callback: PeerAdvertisementFn) {
        *self.on_advertisement.lock() = Some(callback);
    }

    /// Client keys the peer advertised as reachable through this session.
    pub fn advertises(&self, client_key: &str) -> bool {
        self.remote_clients.lock().contains(client_key)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn msg_id(&self) -> i64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue an advertisement frame for the peer.
    pub async fn advertise(&self, client_key: &str, added: bool) -> Result<(), TunnelError> {
        let frame = if added {
            Frame::add_client(self.msg_id(), client_key)
        } else {
            Frame::remove_client(self.msg_id(), client_key)
        };
        self.writer
            .send(frame.encode())
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Open a tunneled connection to `address` on the remote side.
    pub async fn dial(
        self: &Arc<Self>,
        address: &str,
        deadline: Duration,
    ) -> Result<TunnelConn, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let conn_id = self.next_conn_id.fetch_add(2, Ordering::Relaxed);
        let rx = self.register_conn(conn_id);
        let frame = Frame::connect(
            self.msg_id(),
            conn_id,
            address,
            deadline.as_millis().min(u32::MAX as u128) as u32,
        );
        if self.writer.send(frame.encode()).await.is_err() {
            self.remove_conn(conn_id);
            return Err(TunnelError::Closed);
        }
        metrics::counter!("aegis_edge_tunnel_dials_total").increment(1);
        Ok(TunnelConn::new(self.clone(), conn_id, rx))
    }

    fn register_conn(&self, conn_id: i64) -> mpsc::Receiver<Result<Bytes, TunnelError>> {
        let (tx, rx) = mpsc::channel(CONN_QUEUE_DEPTH);
        self.conns.lock().insert(conn_id, tx);
        rx
    }

    fn remove_conn(&self, conn_id: i64) {
        self.conns.lock().remove(&conn_id);
    }

    /// Drive the session until the socket closes or the session is
    /// cancelled. Owns both directions of the websocket.
    pub async fn run(self: &Arc<Self>, mut socket: impl TunnelSocket) -> Result<(), TunnelError> {
        let mut writer_rx = self
            .writer_rx
            .lock()
            .take()
            .expect("session run started twice");
        let result = loop {
            // The socket cannot be split, so the select only *picks* the next
            // outbound frame; the actual send happens after the select, once
            // the recv future has released its borrow.
            let mut outgoing: Option<Bytes> = None;
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                outbound = writer_rx.recv() => {
                    match outbound {
                        Some(bytes) => outgoing = Some(bytes),
                        None => break Ok(()),
                    }
                }
                inbound = socket.recv() => {
                    match inbound {
                        Some(Ok(raw)) => {
                            match Frame::decode(raw) {
                                Ok(frame) => self.dispatch(frame).await,
                                Err(e) => {
                                    warn!(session = self.session_key, error = %e, "dropping malformed frame");
                                }
                            }
                        }
                        Some(Err(e)) => break Err(e),
                        None => break Ok(()),
                    }
                }
            }
            if let Some(bytes) = outgoing {
                if let Err(e) = socket.send(bytes).await {
                    break Err(e);
                }
            }
        };
        self.cancel.cancel();
        self.close_all_conns();
        result
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame.kind {
            FrameKind::Connect => self.handle_connect(frame).await,
            FrameKind::Data => {
                let sender = self.conns.lock().get(&frame.conn_id).cloned();
                match sender {
                    Some(tx) => {
                        if let Err(mpsc::error::TrySendError::Full(_)) =
                            tx.try_send(Ok(frame.data))
                        {
                            // Spec'd backpressure: a consumer that stops
                            // reading takes the whole session down instead
                            // of buffering without bound.
                            warn!(
                                session = self.session_key,
                                conn = frame.conn_id,
                                "tunneled connection not draining; closing session"
                            );
                            self.cancel.cancel();
                        }
                    }
                    None => {
                        let reply = Frame::error(self.msg_id(), frame.conn_id, "unknown connection");
                        let _ = self.writer.try_send(reply.encode());
                    }
                }
            }
            FrameKind::Error => {
                let sender = self.conns.lock().remove(&frame.conn_id);
                if let Some(tx) = sender {
                    if frame.text != EOF_REASON {
                        let _ = tx.try_send(Err(TunnelError::Remote(frame.text)));
                    }
                    // Dropping the sender ends the stream for the reader.
                }
            }
            FrameKind::AddClient | FrameKind::RemoveClient => {
                let added = frame.kind == FrameKind::AddClient;
                {
                    let mut remote = self.remote_clients.lock();
                    if added {
                        remote.insert(frame.text.clone());
                    } else {
                        remote.remove(&frame.text);
                    }
                }
                if let Some(callback) = &*self.on_advertisement.lock() {
                    callback(&frame.text, added);
                }
            }
        }
    }

    async fn handle_connect(self: &Arc<Self>, frame: Frame) {
        let Some(handler) = self.handler.clone() else {
            debug!(session = self.session_key, "connect refused: not a dialable end");
            let reply = Frame::error(self.msg_id(), frame.conn_id, "connect not allowed");
            let _ = self.writer.try_send(reply.encode());
            return;
        };
        let rx = self.register_conn(frame.conn_id);
        let conn = TunnelConn::new(self.clone(), frame.conn_id, rx);
        let deadline = if frame.deadline_ms == 0 {
            DEFAULT_DIAL_DEADLINE
        } else {
            Duration::from_millis(frame.deadline_ms as u64)
        };
        let session = self.clone();
        let address = frame.text;
        tokio::spawn(async move {
            if let Err(e) = handler.connect(conn, &address, deadline).await {
                debug!(address = %address, error = %e, "tunnel connect failed");
                let reply = Frame::error(session.msg_id(), frame.conn_id, &e.to_string());
                let _ = session.writer.try_send(reply.encode());
                session.remove_conn(frame.conn_id);
            }
        });
    }

    fn close_all_conns(&self) {
        let conns: Vec<_> = {
            let mut map = self.conns.lock();
            map.drain().collect()
        };
        for (_, tx) in conns {
            let _ = tx.try_send(Err(TunnelError::Closed));
        }
    }
}

/// A tunneled byte stream. Reads arrive in frame order for this connection
/// id; writes are chunked into `Data` frames. Dropping the stream (or
/// calling shutdown) sends the clean end-of-stream marker.
pub struct TunnelConn {
    session: Arc<Session>,
    conn_id: i64,
    rx: mpsc::Receiver<Result<Bytes, TunnelError>>,
    pending: Bytes,
    writer: PollSender<Bytes>,
    shutdown_sent: bool,
}

impl TunnelConn {
    fn new(
        session: Arc<Session>,
        conn_id: i64,
        rx: mpsc::Receiver<Result<Bytes, TunnelError>>,
    ) -> Self {
        let writer = PollSender::new(session.writer.clone());
        Self {
            session,
            conn_id,
            rx,
            pending: Bytes::new(),
            writer,
            shutdown_sent: false,
        }
    }

    pub fn conn_id(&self) -> i64 {
        self.conn_id
    }

    fn eof_frame(&self) -> Bytes {
        Frame::error(self.session.msg_id(), self.conn_id, EOF_REASON).encode()
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let take = self.pending.len().min(buf.remaining());
                let chunk = self.pending.split_to(take);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.pending = bytes;
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::other(e)));
                }
                // Sender dropped: clean end of stream.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.session.is_closed() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel session closed",
            )));
        }
        match self.writer.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "tunnel writer closed",
                )))
            }
            Poll::Pending => return Poll::Pending,
        }
        let take = data.len().min(MAX_DATA_CHUNK);
        let frame = Frame::data(
            self.session.msg_id(),
            self.conn_id,
            Bytes::copy_from_slice(&data[..take]),
        );
        match self.writer.send_item(frame.encode()) {
            Ok(()) => Poll::Ready(Ok(take)),
            Err(_) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel writer closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.shutdown_sent {
            return Poll::Ready(Ok(()));
        }
        match self.writer.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let frame = self.eof_frame();
                let _ = self.writer.send_item(frame);
                self.shutdown_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        self.session.remove_conn(self.conn_id);
        if !self.shutdown_sent && !self.session.is_closed() {
            let frame = self.eof_frame();
            let _ = self.session.writer.try_send(frame);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// In-memory socket pair: frames sent on one end arrive on the other.
    pub(crate) struct ChannelSocket {
        tx: mpsc::Sender<Bytes>,
        rx: mpsc::Receiver<Bytes>,
    }

    pub(crate) fn socket_pair() -> (ChannelSocket, ChannelSocket) {
        let (tx_a, rx_a) = mpsc::channel(1024);
        let (tx_b, rx_b) = mpsc::channel(1024);
        (
            ChannelSocket { tx: tx_a, rx: rx_b },
            ChannelSocket { tx: tx_b, rx: rx_a },
        )
    }

    #[async_trait]
    impl TunnelSocket for ChannelSocket {
        async fn send(&mut self, frame: Bytes) -> Result<(), TunnelError> {
            self.tx.send(frame).await.map_err(|_| TunnelError::Closed)
        }

        async fn recv(&mut self) -> Option<Result<Bytes, TunnelError>> {
            self.rx.recv().await.map(Ok)
        }
    }

    /// Echoes everything written to a dialed connection back to the dialer.
    struct EchoHandler;

    #[async_trait]
    impl ConnectHandler for EchoHandler {
        async fn connect(
            &self,
            mut conn: TunnelConn,
            _address: &str,
            _deadline: Duration,
        ) -> Result<(), TunnelError> {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = conn.shutdown().await;
            });
            Ok(())
        }
    }

    fn linked_sessions() -> (Arc<Session>, Arc<Session>) {
        let (sock_server, sock_client) = socket_pair();
        let server = Session::new("agent-01", 1, ConnParity::Even, None);
        let client = Session::new("control-plane", 1, ConnParity::Odd, Some(Arc::new(EchoHandler)));
        let server_run = server.clone();
        let client_run = client.clone();
        tokio::spawn(async move { server_run.run(sock_server).await });
        tokio::spawn(async move { client_run.run(sock_client).await });
        (server, client)
    }

    #[tokio::test]
    async fn test_dial_and_fifo_echo() {
        let (server, _client) = linked_sessions();
        let mut conn = server
            .dial("tcp://127.0.0.1:10250", Duration::from_secs(5))
            .await
            .unwrap();

        // Several writes on one conn id must come back in order.
        for chunk in [&b"alpha"[..], b"beta", b"gamma"] {
            conn.write_all(chunk).await.unwrap();
        }
        let mut echoed = vec![0u8; "alphabetagamma".len()];
        conn.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"alphabetagamma");
    }

    #[tokio::test]
    async fn test_concurrent_conns_do_not_cross() {
        let (server, _client) = linked_sessions();
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let session = server.clone();
            handles.push(tokio::spawn(async move {
                let mut conn = session
                    .dial("tcp://127.0.0.1:1", Duration::from_secs(5))
                    .await
                    .unwrap();
                let payload = format!("conn-{i}-payload").into_bytes();
                conn.write_all(&payload).await.unwrap();
                let mut back = vec![0u8; payload.len()];
                conn.read_exact(&mut back).await.unwrap();
                assert_eq!(back, payload);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_connect_refused_without_handler() {
        let (sock_a, sock_b) = socket_pair();
        // Neither side accepts connects.
        let a = Session::new("a", 1, ConnParity::Even, None);
        let b = Session::new("b", 1, ConnParity::Odd, None);
        let (a_run, b_run) = (a.clone(), b.clone());
        tokio::spawn(async move { a_run.run(sock_a).await });
        tokio::spawn(async move { b_run.run(sock_b).await });

        let mut conn = a.dial("tcp://nowhere:1", Duration::from_secs(1)).await.unwrap();
        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("connect not allowed"));
    }

    #[tokio::test]
    async fn test_session_close_errors_open_conns() {
        let (server, client) = linked_sessions();
        let mut conn = server
            .dial("tcp://127.0.0.1:1", Duration::from_secs(5))
            .await
            .unwrap();
        client.close();
        server.close();
        // The pending read ends with an error or clean EOF, not a hang.
        let mut buf = [0u8; 8];
        let _ = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .expect("read must resolve after session close");
    }

    #[tokio::test]
    async fn test_peer_advertisements_tracked_and_reported() {
        let (sock_a, sock_b) = socket_pair();
        let a = Session::new("peer", 1, ConnParity::Even, None);
        let b = Session::new("peer", 1, ConnParity::Odd, None);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        a.set_advertisement_callback(Box::new(move |key, added| {
            let _ = seen_tx.send((key.to_string(), added));
        }));
        let (a_run, b_run) = (a.clone(), b.clone());
        tokio::spawn(async move { a_run.run(sock_a).await });
        tokio::spawn(async move { b_run.run(sock_b).await });

        b.advertise("agent-07", true).await.unwrap();
        let (key, added) = seen_rx.recv().await.unwrap();
        assert_eq!(key, "agent-07");
        assert!(added);
        assert!(a.advertises("agent-07"));

        b.advertise("agent-07", false).await.unwrap();
        let (_, added) = seen_rx.recv().await.unwrap();
        assert!(!added);
        assert!(!a.advertises("agent-07"));
    }
}
