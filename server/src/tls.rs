//! Builds the server's `rustls::ServerConfig` with client-certificate
//! verification required (spec §4.5.1 / §6: TLS 1.3, mutual auth, private
//! CA). Unverified clients never complete the handshake.

use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::sync::Arc;
use tunnel_protocol::secrets::TlsMaterial;

use crate::error::ServerError;

pub fn build_server_config(material: &TlsMaterial) -> Result<rustls::ServerConfig, ServerError> {
    let certs = rustls_pemfile::certs(&mut &material.cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("parsing server certificate: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &material.key_pem[..])
        .map_err(|e| ServerError::Tls(format!("parsing server key: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key found in key file".to_string()))?;

    let mut ca_store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &material.ca_pem[..]) {
        let cert = cert.map_err(|e| ServerError::Tls(format!("parsing CA certificate: {e}")))?;
        ca_store
            .add(cert)
            .map_err(|e| ServerError::Tls(format!("adding CA certificate: {e}")))?;
    }

    let client_verifier = WebPkiClientVerifier::builder(Arc::new(ca_store))
        .build()
        .map_err(|e| ServerError::Tls(format!("building client verifier: {e}")))?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("building server TLS config: {e}")))?;

    Ok(config)
}
