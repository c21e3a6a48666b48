//! # Server Tunnel Acceptor
//!
//! Accepts inbound TLS channels and spawns one [`crate::session::run_session`]
//! task per channel. The connection cap (spec §4.5.1 / §9) is enforced after
//! the TLS handshake completes, not at the raw TCP accept — a fully
//! authenticated peer is the thing being rationed, not an anonymous socket.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::egress::BreakerRegistry;
use crate::session;

/// Tries to reserve one of `max_connections` admission slots, speculatively
/// incrementing `active` first and backing out on overflow. The caller
/// passes in the same `active` counter it later reports to telemetry, so the
/// two always agree on what "active" means.
fn try_admit(active: &AtomicUsize, max_connections: usize) -> bool {
    if active.fetch_add(1, Ordering::SeqCst) >= max_connections {
        active.fetch_sub(1, Ordering::SeqCst);
        false
    } else {
        true
    }
}

pub async fn run(
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
    max_connections: usize,
    breakers: Arc<BreakerRegistry>,
    http_client: reqwest::Client,
    active: Arc<AtomicUsize>,
    last_activity: Arc<AtomicU64>,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                info!("acceptor shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (tcp_stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        continue;
                    }
                };

                let tls_acceptor = tls_acceptor.clone();
                let breakers = breakers.clone();
                let http_client = http_client.clone();
                let session_cancellation = cancellation.child_token();
                let active = active.clone();
                let last_activity = last_activity.clone();

                tokio::spawn(async move {
                    let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(%peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };

                    if !try_admit(&active, max_connections) {
                        warn!(%peer, max_connections, "connection cap reached, closing channel");
                        return;
                    }
                    last_activity.store(tunnel_protocol::epoch_seconds_now(), Ordering::Relaxed);

                    info!(%peer, "accepted agent channel");
                    session::run_session(tls_stream, session_cancellation, breakers, http_client).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    last_activity.store(tunnel_protocol::epoch_seconds_now(), Ordering::Relaxed);
                    info!(%peer, "agent channel closed");
                });
            }
        }
    }
}
