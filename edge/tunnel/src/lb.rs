// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Loopback load balancer over the control-plane endpoints.
//!
//! The local kubelet shim and every other on-node component use one
//! `127.0.0.1:<port>` address as their API server; connections accepted
//! there are proxied to a healthy control-plane endpoint picked by
//! round-robin. An endpoint that fails a few dials in a row sits out a
//! jittered backoff window, and the endpoint set itself is refreshed
//! periodically from the list of server-role nodes, so the fleet can grow
//! or shrink without agent restarts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive dial failures before an endpoint sits out.
const FAILURE_THRESHOLD: u32 = 3;

const DOWN_BASE: Duration = Duration::from_secs(5);
const DOWN_CAP: Duration = Duration::from_secs(30);

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Endpoints tried per proxied connection before giving up.
const DIAL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
struct Endpoint {
    /// `host:port` of a control-plane server.
    address: String,
    consecutive_failures: u32,
    down_until: Option<Instant>,
}

impl Endpoint {
    fn healthy(&self, now: Instant) -> bool {
        match self.down_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

#[derive(Default)]
pub struct LoadBalancer {
    endpoints: Mutex<Vec<Endpoint>>,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(initial: Vec<String>) -> Arc<Self> {
        let lb = Arc::new(Self::default());
        lb.update(initial);
        lb
    }

    /// Replace the endpoint set, preserving health state for addresses that
    /// stay. An empty refresh is ignored; losing every endpoint at once is
    /// always a stale read of the node list, never a real fleet.
    pub fn update(&self, addresses: Vec<String>) {
        if addresses.is_empty() {
            return;
        }
        let mut endpoints = self.endpoints.lock();
        let mut next = Vec::with_capacity(addresses.len());
        for address in addresses {
            match endpoints.iter().find(|e| e.address == address) {
                Some(existing) => next.push(existing.clone()),
                None => {
                    debug!(endpoint = %address, "endpoint added");
                    next.push(Endpoint {
                        address,
                        consecutive_failures: 0,
                        down_until: None,
                    });
                }
            }
        }
        for dropped in endpoints.iter().filter(|e| !next.iter().any(|n| n.address == e.address)) {
            debug!(endpoint = %dropped.address, "endpoint removed");
        }
        *endpoints = next;
    }

    pub fn addresses(&self) -> Vec<String> {
        self.endpoints.lock().iter().map(|e| e.address.clone()).collect()
    }

    /// Round-robin over healthy endpoints; when everything is in backoff,
    /// the least-recently-benched endpoint gets a chance anyway.
    pub fn pick(&self) -> Option<String> {
        let now = Instant::now();
        let endpoints = self.endpoints.lock();
        if endpoints.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..endpoints.len() {
            let candidate = &endpoints[(start + offset) % endpoints.len()];
            if candidate.healthy(now) {
                return Some(candidate.address.clone());
            }
        }
        endpoints
            .iter()
            .min_by_key(|e| e.down_until)
            .map(|e| e.address.clone())
    }

    /// Record a dial outcome for health weighting.
    pub fn report(&self, address: &str, ok: bool) {
        let mut endpoints = self.endpoints.lock();
        let Some(endpoint) = endpoints.iter_mut().find(|e| e.address == address) else {
            return;
        };
        if ok {
            endpoint.consecutive_failures = 0;
            endpoint.down_until = None;
            return;
        }
        endpoint.consecutive_failures = endpoint.consecutive_failures.saturating_add(1);
        if endpoint.consecutive_failures >= FAILURE_THRESHOLD {
            let nominal = DOWN_BASE
                .saturating_mul(endpoint.consecutive_failures - FAILURE_THRESHOLD + 1)
                .min(DOWN_CAP);
            let backoff = nominal.mul_f64(0.5 + rand::random::<f64>() / 2.0);
            endpoint.down_until = Some(Instant::now() + backoff);
            warn!(
                endpoint = %endpoint.address,
                failures = endpoint.consecutive_failures,
                backoff_ms = backoff.as_millis() as u64,
                "endpoint benched after consecutive failures"
            );
        }
    }

    /// Dial some healthy endpoint, walking the rotation on failure.
    pub async fn dial(&self) -> Option<(String, TcpStream)> {
        for _ in 0..DIAL_ATTEMPTS {
            let address = self.pick()?;
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&address)).await {
                Ok(Ok(stream)) => {
                    self.report(&address, true);
                    return Some((address, stream));
                }
                Ok(Err(e)) => {
                    debug!(endpoint = %address, error = %e, "endpoint dial failed");
                    self.report(&address, false);
                }
                Err(_) => {
                    debug!(endpoint = %address, "endpoint dial timed out");
                    self.report(&address, false);
                }
            }
        }
        None
    }
}

/// Accept loop for the loopback listener; every accepted connection is
/// proxied byte-for-byte to a healthy control-plane endpoint.
pub async fn serve(
    lb: Arc<LoadBalancer>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    info!(listen = %local, "endpoint load balancer listening");
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (mut inbound, _) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "load balancer accept failed");
                continue;
            }
        };
        let lb = lb.clone();
        tokio::spawn(async move {
            match lb.dial().await {
                Some((endpoint, mut outbound)) => {
                    metrics::counter!("aegis_edge_lb_proxied_total").increment(1);
                    if let Err(e) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await
                    {
                        debug!(endpoint = %endpoint, error = %e, "proxied connection ended");
                    }
                }
                None => {
                    warn!("no healthy control-plane endpoint; dropping connection");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_round_robin_rotates() {
        let lb = LoadBalancer::new(vec!["a:1".to_string(), "b:1".to_string()]);
        let first = lb.pick().unwrap();
        let second = lb.pick().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_failed_endpoint_is_benched_then_retried() {
        let lb = LoadBalancer::new(vec!["a:1".to_string(), "b:1".to_string()]);
        for _ in 0..FAILURE_THRESHOLD {
            lb.report("a:1", false);
        }
        // Benched endpoint is skipped by the rotation.
        for _ in 0..4 {
            assert_eq!(lb.pick().unwrap(), "b:1");
        }
        // A success clears the bench immediately.
        lb.report("a:1", true);
        let picks: Vec<_> = (0..4).map(|_| lb.pick().unwrap()).collect();
        assert!(picks.contains(&"a:1".to_string()));
    }

    #[test]
    fn test_update_preserves_state_and_ignores_empty() {
        let lb = LoadBalancer::new(vec!["a:1".to_string()]);
        for _ in 0..FAILURE_THRESHOLD {
            lb.report("a:1", false);
        }
        lb.update(vec!["a:1".to_string(), "b:1".to_string()]);
        // a:1 is still benched after the refresh.
        assert_eq!(lb.pick().unwrap(), "b:1");

        lb.update(Vec::new());
        assert_eq!(lb.addresses().len(), 2);
    }

    #[tokio::test]
    async fn test_proxy_survives_endpoint_loss() {
        // Two backends; one goes away, traffic keeps flowing via the other.
        let backend_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = backend_a.local_addr().unwrap().to_string();
        let addr_b = backend_b.local_addr().unwrap().to_string();

        // Each backend answers with its own tag.
        for (listener, tag) in [(backend_a, b"A"), (backend_b, b"B")] {
            tokio::spawn(async move {
                loop {
                    let Ok((mut conn, _)) = listener.accept().await else {
                        return;
                    };
                    let tag = *tag;
                    tokio::spawn(async move {
                        let _ = conn.write_all(&tag).await;
                    });
                }
            });
        }

        let lb = LoadBalancer::new(vec![addr_a.clone(), addr_b]);
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(lb.clone(), front, cancel.clone()));

        // Kill backend A by benching it the way real dial failures would.
        for _ in 0..FAILURE_THRESHOLD {
            lb.report(&addr_a, false);
        }

        for _ in 0..4 {
            let mut conn = TcpStream::connect(front_addr).await.unwrap();
            let mut tag = [0u8; 1];
            conn.read_exact(&mut tag).await.unwrap();
            assert_eq!(&tag, b"B");
        }
        cancel.cancel();
    }
}
