//! `tunnel-agent` — loopback HTTP/CONNECT/WebSocket forward proxy, tunneled
//! to a remote egress server over mutual TLS (spec §1/§2).
//!
//! A periodic task emits `ActiveConnections`/`LastActivityEpochSeconds`
//! samples through `tunnel_protocol::telemetry`, sourced from the tunnel
//! client's own stream registry and reader-pump activity clock.

mod channel;
mod config;
mod control_plane;
mod error;
mod listener;
mod registry;
mod tls;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tunnel_protocol::{FileSecretSource, SecretSource, TelemetrySample, TracingTelemetrySink, VaultSecretSource};

use channel::{TunnelClient, TunnelClientConfig};
use config::{AgentConfig, Cli};
use control_plane::HttpControlPlane;
use registry::StreamRegistry;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_CEILING: Duration = Duration::from_secs(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("tunnel-agent: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = cli.resolve()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tunnel_agent={}", cfg.log_level).into()),
        )
        .json()
        .init();

    let material = load_tls_material(&cfg)?;
    let tls_config = Arc::new(tls::build_client_config(&material)?);

    let shutdown = CancellationToken::new();
    let registry = Arc::new(StreamRegistry::new());
    let sweeper = registry.spawn_sweeper(SWEEP_INTERVAL, REQUEST_TIMEOUT, shutdown.child_token());

    let control_plane = HttpControlPlane::new(
        reqwest::Client::builder().build()?,
        cfg.wake_url.clone(),
        cfg.kill_url.clone(),
        cfg.control_plane_shared_key.clone(),
    );
    control_plane.wake().await;

    let client_config = TunnelClientConfig {
        server_addr: cfg.server_socket_addr(),
        server_name: cfg.server_ip.clone(),
        tls_config,
        request_timeout: REQUEST_TIMEOUT,
        reconnect_ceiling: RECONNECT_CEILING,
    };
    let (client, client_task) = TunnelClient::spawn(client_config, registry.clone(), shutdown.child_token());

    let telemetry_client = client.clone();
    let telemetry_cluster = cfg.server_socket_addr();
    let telemetry_task = tokio::spawn(tunnel_protocol::run_periodic(
        TracingTelemetrySink,
        "tunnel-agent".to_string(),
        telemetry_cluster,
        Duration::from_secs(30),
        move || TelemetrySample {
            active_connections: telemetry_client.active_stream_count() as u64,
            last_activity_epoch_seconds: telemetry_client.last_activity_epoch_seconds(),
        },
    ));

    let local_addr = format!("127.0.0.1:{}", cfg.local_proxy_port);
    let proxy_listener = TcpListener::bind(&local_addr).await.map_err(|source| error::AgentError::Bind {
        addr: local_addr.clone(),
        source,
    })?;
    info!(addr = %local_addr, server = %cfg.server_socket_addr(), "agent proxy listening");

    let listener_task = tokio::spawn(listener::run(proxy_listener, client, shutdown.child_token()));

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, draining");
    shutdown.cancel();
    telemetry_task.abort();

    let _ = listener_task.await;
    let _ = client_task.await;
    sweeper.abort();

    control_plane.kill().await;
    Ok(())
}

fn load_tls_material(cfg: &AgentConfig) -> anyhow::Result<tunnel_protocol::TlsMaterial> {
    let file_source = FileSecretSource {
        cert_file: cfg.cert_file.clone(),
        key_file: cfg.key_file.clone(),
        ca_file: cfg.ca_cert_file.clone(),
    };

    let material = match &cfg.secret_vault_name {
        Some(name) => {
            let vault = VaultSecretSource { secret_name: name.clone() };
            match vault.load() {
                Ok(material) => material,
                Err(e) => {
                    tracing::warn!(error = %e, "vault secret source unavailable, falling back to file source");
                    file_source.load().map_err(|e| error::AgentError::Tls(e.to_string()))?
                }
            }
        }
        None => file_source.load().map_err(|e| error::AgentError::Tls(e.to_string()))?,
    };
    Ok(material)
}
