//! Error taxonomy for the server binary (spec §7): startup errors bubble up
//! through `anyhow` in `main`; everything below is local to a channel or a
//! stream and never crosses that boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("binding {addr}: {source}")]
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
