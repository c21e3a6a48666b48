//! # Control-plane wake/kill collaborator (spec §6)
//!
//! A thin adapter, not part of the tunnel substrate: POSTs to two
//! configured URLs with a pre-shared key header, guarded by the same
//! [`RetryPolicy`]/[`CircuitBreaker`] primitives egress traffic uses. Wake
//! fires before the first connect attempt; kill fires after a clean
//! shutdown. Both calls are idempotent by construction (repeating a
//! wake/kill POST has no additional effect on the deployment's lifecycle).

use std::sync::Arc;
use std::time::Duration;

use tunnel_protocol::{BreakerConfig, CircuitBreaker, RetryPolicy, RetryPolicyConfig};

const SHARED_KEY_HEADER: &str = "x-tunnel-control-key";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpControlPlane {
    client: reqwest::Client,
    wake_url: Option<String>,
    kill_url: Option<String>,
    shared_key: Option<String>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy<fn(&str) -> bool>,
}

impl HttpControlPlane {
    pub fn new(
        client: reqwest::Client,
        wake_url: Option<String>,
        kill_url: Option<String>,
        shared_key: Option<String>,
    ) -> Self {
        Self {
            client,
            wake_url,
            kill_url,
            shared_key,
            breaker: Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            retry: RetryPolicy::new(RetryPolicyConfig::default(), |_| true),
        }
    }

    pub async fn wake(&self) {
        if let Some(url) = self.wake_url.clone() {
            self.post(&url, "wake").await;
        }
    }

    pub async fn kill(&self) {
        if let Some(url) = self.kill_url.clone() {
            self.post(&url, "kill").await;
        }
    }

    async fn post(&self, url: &str, label: &'static str) {
        let result = self
            .retry
            .run(
                || async {
                    let guard = self.breaker.try_acquire().map_err(|e| e.to_string())?;
                    let mut request = self.client.post(url).timeout(REQUEST_TIMEOUT);
                    if let Some(key) = &self.shared_key {
                        request = request.header(SHARED_KEY_HEADER, key);
                    }
                    match request.send().await {
                        Ok(response) if response.status().is_success() => {
                            guard.on_success();
                            Ok(())
                        }
                        Ok(response) => {
                            guard.on_failure();
                            Err(format!("status {}", response.status()))
                        }
                        Err(e) => {
                            guard.on_failure();
                            Err(e.to_string())
                        }
                    }
                },
                Box::pin(std::future::pending()),
            )
            .await;

        if let Err(error) = result {
            tracing::warn!(%label, %error, "control-plane call failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_urls_configured_means_no_op() {
        let plane = HttpControlPlane::new(reqwest::Client::new(), None, None, None);
        assert!(plane.wake_url.is_none());
        assert!(plane.kill_url.is_none());
    }
}
