//! Error taxonomy for the agent binary (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("binding local proxy on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("loading TLS material: {0}")]
    Tls(String),
    #[error("config: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Surfaced by [`crate::channel::TunnelClient`] to a waiting caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("channel lost")]
    ChannelLost,
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Refused(String),
}
