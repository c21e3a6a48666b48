//! Builds the agent's `rustls::ClientConfig`: a client certificate is
//! presented for mutual authentication, and the server's certificate must
//! chain to the configured private CA (spec §6: TLS 1.3, mutual auth,
//! private CA, SNI set to the server's hostname).

use rustls::RootCertStore;
use tunnel_protocol::secrets::TlsMaterial;

use crate::error::AgentError;

pub fn build_client_config(material: &TlsMaterial) -> Result<rustls::ClientConfig, AgentError> {
    let certs = rustls_pemfile::certs(&mut &material.cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AgentError::Tls(format!("parsing agent certificate: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &material.key_pem[..])
        .map_err(|e| AgentError::Tls(format!("parsing agent key: {e}")))?
        .ok_or_else(|| AgentError::Tls("no private key found in key file".to_string()))?;

    let mut ca_store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &material.ca_pem[..]) {
        let cert = cert.map_err(|e| AgentError::Tls(format!("parsing CA certificate: {e}")))?;
        ca_store
            .add(cert)
            .map_err(|e| AgentError::Tls(format!("adding CA certificate: {e}")))?;
    }

    let config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(ca_store)
        .with_client_auth_cert(certs, key)
        .map_err(|e| AgentError::Tls(format!("building client TLS config: {e}")))?;

    Ok(config)
}
