//! # TLS Material Loading
//!
//! The agent and the server both need a `(cert, key, ca)` PEM triple to
//! build their half of the mutual-TLS handshake. `SecretSource` abstracts
//! where that triple comes from so both binaries can swap a file-based
//! default for a named-vault lookup without touching the TLS setup code.

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca_pem: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("reading '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("secret source '{0}' is not configured")]
    NotConfigured(String),
}

pub trait SecretSource: Send + Sync {
    fn load(&self) -> Result<TlsMaterial, SecretError>;
}

/// Loads `(cert, key, ca)` PEM files from disk. The default source for both
/// binaries; a named-vault source falls back to this when unavailable.
pub struct FileSecretSource {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
}

impl SecretSource for FileSecretSource {
    fn load(&self) -> Result<TlsMaterial, SecretError> {
        let read = |path: &str| {
            std::fs::read(path).map_err(|source| SecretError::Io {
                path: path.to_string(),
                source,
            })
        };
        Ok(TlsMaterial {
            cert_pem: read(&self.cert_file)?,
            key_pem: read(&self.key_file)?,
            ca_pem: read(&self.ca_file)?,
        })
    }
}

/// A named-vault secret source. No vendor SDK is wired in here; this exists
/// so the collaborator interface in the specification has a concrete type,
/// and returns [`SecretError::NotConfigured`] until a real backend is
/// plugged in behind the same trait.
pub struct VaultSecretSource {
    pub secret_name: String,
}

impl SecretSource for VaultSecretSource {
    fn load(&self) -> Result<TlsMaterial, SecretError> {
        Err(SecretError::NotConfigured(self.secret_name.clone()))
    }
}
