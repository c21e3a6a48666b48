//! # Retry Policy
//!
//! Bounded exponential-backoff retry with predicate-based eligibility, used
//! by optional client-side callers such as the control-plane wake/kill
//! collaborator (spec §6, §4.8). Not used on the tunnel's hot path — the
//! channel itself reconnects via the agent's own backoff loop (§4.4.1).

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

pub struct RetryPolicy<P> {
    config: RetryPolicyConfig,
    is_retryable: P,
}

impl<P> RetryPolicy<P>
where
    P: Fn(&str) -> bool,
{
    pub fn new(config: RetryPolicyConfig, is_retryable: P) -> Self {
        Self {
            config,
            is_retryable,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled).min(self.config.max_delay)
    }

    /// Runs `op` up to `max_attempts` times. `op` returns `Err(String)` with
    /// a short error description; a description `is_retryable` rejects
    /// stops the retry loop immediately with that error.
    ///
    /// A cancellation signal (a future that resolves when the caller's
    /// deadline expires) always wins a race against a pending backoff
    /// delay or in-flight attempt — its error, not the last attempt's
    /// error, is returned.
    pub async fn run<F, Fut, T, C>(&self, mut op: F, mut cancelled: C) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, String>>,
        C: Future<Output = String> + Unpin,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                reason = &mut cancelled => return Err(reason),
                result = op() => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.config.max_attempts || !(self.is_retryable)(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    tokio::select! {
                        biased;
                        reason = &mut cancelled => return Err(reason),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_within_attempt_budget() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(
            RetryPolicyConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(1),
                multiplier: 2.0,
            },
            |_| true,
        );

        let result = policy
            .run(
                || async {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err("not yet".to_string())
                    } else {
                        Ok(42)
                    }
                },
                Box::pin(pending()),
            )
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_when_predicate_rejects() {
        let policy = RetryPolicy::new(RetryPolicyConfig::default(), |e: &str| e != "fatal");
        let result = policy
            .run(
                || async { Err::<(), _>("fatal".to_string()) },
                Box::pin(pending()),
            )
            .await;
        assert_eq!(result, Err("fatal".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_attempt_error() {
        let policy = RetryPolicy::new(RetryPolicyConfig::default(), |_| true);
        let cancel = async { "deadline exceeded".to_string() };
        let result = policy
            .run(|| async { Err::<(), _>("transient".to_string()) }, Box::pin(cancel))
            .await;
        assert_eq!(result, Err("deadline exceeded".to_string()));
    }
}
