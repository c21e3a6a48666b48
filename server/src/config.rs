//! # Server Configuration
//!
//! Layered precedence (lowest to highest): built-in defaults → TOML file
//! (`--config`) → `TUNNEL_`-prefixed environment variables → CLI flags.
//! The TOML layer follows the all-`Option` raw-struct pattern so a partial
//! file only overrides the keys it mentions.

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
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub max_connections: usize,
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8443,
            max_connections: 100,
            cert_file: "server.crt".to_string(),
            key_file: "server.key".to_string(),
            ca_file: "ca.crt".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn listen_socket_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawFileConfig {
    listen_addr: Option<String>,
    listen_port: Option<u16>,
    max_connections: Option<usize>,
    cert_file: Option<String>,
    key_file: Option<String>,
    ca_file: Option<String>,
    log_level: Option<String>,
}

/// `tunnel-server` — accepts mutually-authenticated agent channels and
/// executes HTTP/TCP/WebSocket egress on their behalf.
#[derive(Debug, Parser)]
#[command(name = "tunnel-server", version)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub listen_addr: Option<String>,
    #[arg(long)]
    pub listen_port: Option<u16>,
    #[arg(long)]
    pub max_connections: Option<usize>,
    #[arg(long)]
    pub cert_file: Option<String>,
    #[arg(long)]
    pub key_file: Option<String>,
    #[arg(long)]
    pub ca_file: Option<String>,
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Resolves the final config by merging defaults, an optional TOML
    /// file, `TUNNEL_`-prefixed env vars, and CLI flags, in that order.
    pub fn resolve(self) -> Result<ServerConfig, ConfigError> {
        let mut cfg = ServerConfig::default();

        if let Some(path) = &self.config {
            apply_file(&mut cfg, path)?;
        }

        apply_env(&mut cfg);

        if let Some(v) = self.listen_addr {
            cfg.listen_addr = v;
        }
        if let Some(v) = self.listen_port {
            cfg.listen_port = v;
        }
        if let Some(v) = self.max_connections {
            cfg.max_connections = v;
        }
        if let Some(v) = self.cert_file {
            cfg.cert_file = v;
        }
        if let Some(v) = self.key_file {
            cfg.key_file = v;
        }
        if let Some(v) = self.ca_file {
            cfg.ca_file = v;
        }
        if let Some(v) = self.log_level {
            cfg.log_level = v;
        }

        Ok(cfg)
    }
}

fn apply_file(cfg: &mut ServerConfig, path: &Path) -> Result<(), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let raw: RawFileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    if let Some(v) = raw.listen_addr {
        cfg.listen_addr = v;
    }
    if let Some(v) = raw.listen_port {
        cfg.listen_port = v;
    }
    if let Some(v) = raw.max_connections {
        cfg.max_connections = v;
    }
    if let Some(v) = raw.cert_file {
        cfg.cert_file = v;
    }
    if let Some(v) = raw.key_file {
        cfg.key_file = v;
    }
    if let Some(v) = raw.ca_file {
        cfg.ca_file = v;
    }
    if let Some(v) = raw.log_level {
        cfg.log_level = v;
    }
    Ok(())
}

fn apply_env(cfg: &mut ServerConfig) {
    if let Ok(v) = std::env::var("TUNNEL_LISTEN_ADDR") {
        cfg.listen_addr = v;
    }
    if let Ok(v) = std::env::var("TUNNEL_LISTEN_PORT") {
        if let Ok(v) = v.parse() {
            cfg.listen_port = v;
        }
    }
    if let Ok(v) = std::env::var("TUNNEL_MAX_CONNECTIONS") {
        if let Ok(v) = v.parse() {
            cfg.max_connections = v;
        }
    }
    if let Ok(v) = std::env::var("TUNNEL_CERT_FILE") {
        cfg.cert_file = v;
    }
    if let Ok(v) = std::env::var("TUNNEL_KEY_FILE") {
        cfg.key_file = v;
    }
    if let Ok(v) = std::env::var("TUNNEL_CA_FILE") {
        cfg.ca_file = v;
    }
    if let Ok(v) = std::env::var("TUNNEL_LOG_LEVEL") {
        cfg.log_level = v;
    }
}
