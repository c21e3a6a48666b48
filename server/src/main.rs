//! # Tunnel Egress Server
//!
//! Accepts mutually-authenticated agent channels over TLS 1.3 and executes
//! HTTP, TCP (CONNECT), and WebSocket egress on their behalf.
//!
//! ## Modules
//!
//! - [`config`] — CLI/TOML/env configuration loading
//! - [`tls`] — mutual-TLS server config construction
//! - [`acceptor`] — the TLS accept loop and connection admission cap
//! - [`session`] — per-channel envelope demultiplexer
//! - [`egress`] — HTTP/TCP/WebSocket egress workers and the circuit breaker registry
//! - [`error`] — the server's error taxonomy
//!
//! A periodic task emits `ActiveConnections`/`LastActivityEpochSeconds`
//! samples through `tunnel_protocol::telemetry`, fed by the acceptor's own
//! admission counter.

mod acceptor;
mod config;
mod egress;
mod error;
mod session;
mod tls;

use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tunnel_protocol::secrets::{FileSecretSource, SecretSource};
use tunnel_protocol::{TelemetrySample, TracingTelemetrySink};

use crate::egress::BreakerRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("tunnel-server: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = config::Cli::parse();
    let cfg = cli.resolve()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tunnel_server={}", cfg.log_level).into()),
        )
        .json()
        .init();

    info!(addr = %cfg.listen_socket_addr(), max_connections = cfg.max_connections, "starting tunnel-server");

    let secrets = FileSecretSource {
        cert_file: cfg.cert_file.clone(),
        key_file: cfg.key_file.clone(),
        ca_file: cfg.ca_file.clone(),
    };
    let material = secrets
        .load()
        .map_err(|e| error::ServerError::Tls(e.to_string()))?;
    let server_tls_config = tls::build_server_config(&material)?;
    let tls_acceptor = TlsAcceptor::from(Arc::new(server_tls_config));

    let addr = cfg.listen_socket_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| error::ServerError::Bind { addr: addr.clone(), source })?;

    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .expect("building the shared HTTP egress client");

    let breakers = Arc::new(BreakerRegistry::new());
    let cancellation = CancellationToken::new();

    let active_connections = Arc::new(AtomicUsize::new(0));
    let last_activity = Arc::new(AtomicU64::new(tunnel_protocol::epoch_seconds_now()));

    let acceptor_cancellation = cancellation.clone();
    let acceptor_task = tokio::spawn(acceptor::run(
        listener,
        tls_acceptor,
        cfg.max_connections,
        breakers,
        http_client,
        active_connections.clone(),
        last_activity.clone(),
        acceptor_cancellation,
    ));

    let telemetry_cluster = cfg.listen_socket_addr();
    let telemetry_task = tokio::spawn(tunnel_protocol::run_periodic(
        TracingTelemetrySink,
        "tunnel-server".to_string(),
        telemetry_cluster,
        Duration::from_secs(30),
        move || TelemetrySample {
            active_connections: active_connections.load(std::sync::atomic::Ordering::Relaxed) as u64,
            last_activity_epoch_seconds: last_activity.load(std::sync::atomic::Ordering::Relaxed),
        },
    ));

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    cancellation.cancel();
    telemetry_task.abort();
    let _ = acceptor_task.await;

    Ok(())
}
