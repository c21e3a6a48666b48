//! # Agent Configuration
//!
//! Same layering as the server: built-in defaults → TOML file (`--config`)
//! → `TUNNEL_`-prefixed environment variables → CLI flags.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required field 'server_ip' (set it in the config file, TUNNEL_SERVER_IP, or --server-ip)")]
    MissingServerIp,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub local_proxy_port: u16,
    pub cert_file: String,
    pub key_file: String,
    pub ca_cert_file: String,
    pub log_level: String,
    pub secret_vault_name: Option<String>,
    pub wake_url: Option<String>,
    pub kill_url: Option<String>,
    pub control_plane_shared_key: Option<String>,
}

impl AgentConfig {
    pub fn server_socket_addr(&self) -> String {
        format!("{}:{}", self.server_ip, self.server_port)
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawFileConfig {
    server_ip: Option<String>,
    server_port: Option<u16>,
    local_proxy_port: Option<u16>,
    cert_file: Option<String>,
    key_file: Option<String>,
    ca_cert_file: Option<String>,
    log_level: Option<String>,
    secret_vault_name: Option<String>,
    wake_url: Option<String>,
    kill_url: Option<String>,
    control_plane_shared_key: Option<String>,
}

/// `tunnel-agent` — a loopback HTTP/CONNECT/WebSocket forward proxy tunneled
/// to a remote egress server over mutual TLS.
#[derive(Debug, Parser)]
#[command(name = "tunnel-agent", version)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub server_ip: Option<String>,
    #[arg(long)]
    pub server_port: Option<u16>,
    #[arg(long)]
    pub local_proxy_port: Option<u16>,
    #[arg(long)]
    pub cert_file: Option<String>,
    #[arg(long)]
    pub key_file: Option<String>,
    #[arg(long)]
    pub ca_cert_file: Option<String>,
    #[arg(long)]
    pub log_level: Option<String>,
    #[arg(long)]
    pub secret_vault_name: Option<String>,
    #[arg(long)]
    pub wake_url: Option<String>,
    #[arg(long)]
    pub kill_url: Option<String>,
}

impl Cli {
    pub fn resolve(self) -> Result<AgentConfig, ConfigError> {
        let mut cfg = AgentConfig {
            server_ip: String::new(),
            server_port: 8443,
            local_proxy_port: 8080,
            cert_file: "agent.crt".to_string(),
            key_file: "agent.key".to_string(),
            ca_cert_file: "ca.crt".to_string(),
            log_level: "info".to_string(),
            secret_vault_name: None,
            wake_url: None,
            kill_url: None,
            control_plane_shared_key: None,
        };

        if let Some(path) = &self.config {
            apply_file(&mut cfg, path)?;
        }

        apply_env(&mut cfg);

        if let Some(v) = self.server_ip {
            cfg.server_ip = v;
        }
        if let Some(v) = self.server_port {
            cfg.server_port = v;
        }
        if let Some(v) = self.local_proxy_port {
            cfg.local_proxy_port = v;
        }
        if let Some(v) = self.cert_file {
            cfg.cert_file = v;
        }
        if let Some(v) = self.key_file {
            cfg.key_file = v;
        }
        if let Some(v) = self.ca_cert_file {
            cfg.ca_cert_file = v;
        }
        if let Some(v) = self.log_level {
            cfg.log_level = v;
        }
        if let Some(v) = self.secret_vault_name {
            cfg.secret_vault_name = Some(v);
        }
        if let Some(v) = self.wake_url {
            cfg.wake_url = Some(v);
        }
        if let Some(v) = self.kill_url {
            cfg.kill_url = Some(v);
        }

        if cfg.server_ip.is_empty() {
            return Err(ConfigError::MissingServerIp);
        }

        Ok(cfg)
    }
}

fn apply_file(cfg: &mut AgentConfig, path: &Path) -> Result<(), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let raw: RawFileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    if let Some(v) = raw.server_ip {
        cfg.server_ip = v;
    }
    if let Some(v) = raw.server_port {
        cfg.server_port = v;
    }
    if let Some(v) = raw.local_proxy_port {
        cfg.local_proxy_port = v;
    }
    if let Some(v) = raw.cert_file {
        cfg.cert_file = v;
    }
    if let Some(v) = raw.key_file {
        cfg.key_file = v;
    }
    if let Some(v) = raw.ca_cert_file {
        cfg.ca_cert_file = v;
    }
    if let Some(v) = raw.log_level {
        cfg.log_level = v;
    }
    if let Some(v) = raw.secret_vault_name {
        cfg.secret_vault_name = Some(v);
    }
    if let Some(v) = raw.wake_url {
        cfg.wake_url = Some(v);
    }
    if let Some(v) = raw.kill_url {
        cfg.kill_url = Some(v);
    }
    if let Some(v) = raw.control_plane_shared_key {
        cfg.control_plane_shared_key = Some(v);
    }
    Ok(())
}

fn apply_env(cfg: &mut AgentConfig) {
    if let Ok(v) = std::env::var("TUNNEL_SERVER_IP") {
        cfg.server_ip = v;
    }
    if let Ok(v) = std::env::var("TUNNEL_SERVER_PORT") {
        if let Ok(v) = v.parse() {
            cfg.server_port = v;
        }
    }
    if let Ok(v) = std::env::var("TUNNEL_LOCAL_PROXY_PORT") {
        if let Ok(v) = v.parse() {
            cfg.local_proxy_port = v;
        }
    }
    if let Ok(v) = std::env::var("TUNNEL_CERT_FILE") {
        cfg.cert_file = v;
    }
    if let Ok(v) = std::env::var("TUNNEL_KEY_FILE") {
        cfg.key_file = v;
    }
    if let Ok(v) = std::env::var("TUNNEL_CA_CERT_FILE") {
        cfg.ca_cert_file = v;
    }
    if let Ok(v) = std::env::var("TUNNEL_LOG_LEVEL") {
        cfg.log_level = v;
    }
    if let Ok(v) = std::env::var("TUNNEL_CONTROL_PLANE_SHARED_KEY") {
        cfg.control_plane_shared_key = Some(v);
    }
}
