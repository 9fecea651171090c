// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent side of the tunnel: one persistent websocket per control-plane
//! endpoint, re-dialed with jittered backoff, carrying the node's bearer
//! credential on the upgrade request.
//!
//! Inbound `Connect` frames are only honored for targets the configured
//! authorizer accepts; an agent never proxies to arbitrary addresses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{ConnParity, ConnectHandler, Session, TunnelConn, TunnelSocket};
use crate::TunnelError;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(15);

/// Decides whether a server-initiated connect to `address` is allowed.
pub type ConnectAuthorizer = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Allows only loopback targets, the posture of a node agent that proxies
/// exclusively to daemons on its own host.
pub fn loopback_authorizer() -> ConnectAuthorizer {
    Arc::new(|address: &str| {
        let Some(rest) = address.strip_prefix("tcp://") else {
            return false;
        };
        let host = rest.rsplit_once(':').map(|(h, _)| h).unwrap_or(rest);
        matches!(host, "127.0.0.1" | "localhost" | "[::1]")
    })
}

#[derive(Clone)]
pub struct ClientOptions {
    /// Websocket URL of one control-plane endpoint, e.g.
    /// `wss://10.0.0.1:6443/v1-edge/connect`.
    pub url: String,
    /// Node bearer credential sent in the `Authorization` header.
    pub bearer_token: String,
    /// TLS configuration trusting the cluster's server CA.
    pub tls: Arc<rustls::ClientConfig>,
    pub authorizer: ConnectAuthorizer,
}

/// Keep one tunnel to `options.url` alive until cancelled.
pub async fn run_client(options: ClientOptions, cancel: CancellationToken) {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match connect_once(&options, &cancel).await {
            Ok(()) => {
                attempt = 0;
                debug!(url = %options.url, "tunnel closed cleanly; reconnecting");
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                warn!(url = %options.url, error = %e, attempt, "tunnel connection failed");
            }
        }
        let delay = backoff_delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Exponential backoff with 50-100% jitter so a fleet of agents does not
/// reconnect in lockstep after an endpoint restart.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(6));
    let capped = exp.min(BACKOFF_CAP);
    capped.mul_f64(0.5 + rand::random::<f64>() / 2.0)
}

/// Open one authenticated tunnel websocket. Also used by control-plane
/// servers to establish their side of a peer link.
pub async fn connect_socket(
    url: &str,
    bearer_token: &str,
    tls: Arc<rustls::ClientConfig>,
) -> Result<impl TunnelSocket, TunnelError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TunnelError::Websocket(e.to_string()))?;
    let auth = format!("Bearer {bearer_token}")
        .parse()
        .map_err(|_| TunnelError::Websocket("invalid bearer token header".to_string()))?;
    request.headers_mut().insert(http::header::AUTHORIZATION, auth);

    let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
        request,
        None,
        false,
        Some(Connector::Rustls(tls)),
    )
    .await
    .map_err(|e| TunnelError::Websocket(e.to_string()))?;
    info!(url = %url, "tunnel established");
    Ok(WsSocket { ws })
}

async fn connect_once(options: &ClientOptions, cancel: &CancellationToken) -> Result<(), TunnelError> {
    let socket = connect_socket(&options.url, &options.bearer_token, options.tls.clone()).await?;

    let session = Session::new(
        "control-plane",
        (rand::random::<u64>() >> 1) as i64,
        ConnParity::Odd,
        Some(Arc::new(LocalDialer {
            authorizer: options.authorizer.clone(),
        })),
    );
    let session_cancel = session.clone();
    let cancel = cancel.clone();
    let guard = tokio::spawn(async move {
        cancel.cancelled().await;
        session_cancel.close();
    });
    let result = session.run(socket).await;
    guard.abort();
    result
}

/// Honors server-initiated connects by dialing daemons on this host.
struct LocalDialer {
    authorizer: ConnectAuthorizer,
}

#[async_trait]
impl ConnectHandler for LocalDialer {
    async fn connect(
        &self,
        mut conn: TunnelConn,
        address: &str,
        deadline: Duration,
    ) -> Result<(), TunnelError> {
        if !(self.authorizer)(address) {
            return Err(TunnelError::ConnectRejected(address.to_string()));
        }
        let target = address
            .strip_prefix("tcp://")
            .ok_or_else(|| TunnelError::ConnectRejected(address.to_string()))?;
        let mut stream = tokio::time::timeout(deadline, TcpStream::connect(target))
            .await
            .map_err(|_| TunnelError::DialTimeout)?
            .map_err(|e| TunnelError::ConnectRejected(e.to_string()))?;
        tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut conn, &mut stream).await;
        });
        Ok(())
    }
}

/// [`TunnelSocket`] over a tungstenite stream.
struct WsSocket {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TunnelSocket for WsSocket {
    async fn send(&mut self, frame: Bytes) -> Result<(), TunnelError> {
        self.ws
            .send(Message::binary(frame.to_vec()))
            .await
            .map_err(|e| TunnelError::Websocket(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Bytes, TunnelError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Binary(payload)) => return Some(Ok(payload.into())),
                Ok(Message::Close(_)) => return None,
                // Pings are answered by the library on the next flush.
                Ok(_) => continue,
                Err(e) => return Some(Err(TunnelError::Websocket(e.to_string()))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_authorizer_scopes_targets() {
        let allow = loopback_authorizer();
        assert!(allow("tcp://127.0.0.1:10250"));
        assert!(allow("tcp://localhost:9100"));
        assert!(!allow("tcp://10.0.0.5:22"));
        assert!(!allow("udp://127.0.0.1:53"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let early = backoff_delay(0);
        assert!(early <= BACKOFF_BASE);
        for attempt in 0..20 {
            let delay = backoff_delay(attempt);
            assert!(delay <= BACKOFF_CAP, "attempt {attempt} exceeded cap: {delay:?}");
        }
        // Jitter keeps at least half the nominal delay.
        assert!(backoff_delay(10) >= BACKOFF_CAP.mul_f64(0.5));
    }
}
