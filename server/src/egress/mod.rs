//! Egress workers (spec §4.6): each executes one outbound call — HTTP, raw
//! TCP (CONNECT), or WebSocket — on behalf of a stream and pumps results
//! back onto the channel as envelopes.

pub mod http;
pub mod tcp;
pub mod ws;

use dashmap::DashMap;
use std::sync::Arc;
use tunnel_protocol::{BreakerConfig, CircuitBreaker};

/// Keys a [`CircuitBreaker`] per worker class and destination host (spec
/// §4.7: "guards every egress call, keyed per worker class, optionally per
/// destination host").
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<(&'static str, String), Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, class: &'static str, host: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry((class, host.to_string()))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(BreakerConfig::default())))
            .clone()
    }
}

/// Extracts the bare host (no port) from a `host:port` egress address, for
/// use as a breaker key. Falls back to the whole address if there's no port.
pub fn host_key(address: &str) -> &str {
    address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address)
}

/// Extracts the host from a URL string for use as a breaker key.
pub fn host_key_from_url(url: &str) -> String {
    url.split("://")
        .nth(1)
        .and_then(|rest| rest.split(['/', '?']).next())
        .and_then(|authority| authority.rsplit_once('@').map_or(Some(authority), |(_, h)| Some(h)))
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_strips_port() {
        assert_eq!(host_key("example.test:443"), "example.test");
        assert_eq!(host_key("example.test"), "example.test");
    }

    #[test]
    fn host_key_from_url_extracts_authority() {
        assert_eq!(host_key_from_url("http://example.test/path"), "example.test");
        assert_eq!(host_key_from_url("https://example.test:8443/x"), "example.test");
    }

    #[test]
    fn registry_returns_same_breaker_for_same_key() {
        let reg = BreakerRegistry::new();
        let a = reg.get("http", "example.test");
        let b = reg.get("http", "example.test");
        assert!(Arc::ptr_eq(&a, &b));
        let c = reg.get("tcp", "example.test");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
