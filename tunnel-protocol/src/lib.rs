//! # Tunnel Protocol
//!
//! Shared wire types and primitives for the tunnel agent and server:
//! - [`envelope`] — the tagged envelope union carried over the channel
//! - [`codec`] — streaming JSON framing on top of an async byte stream
//! - [`stream_id`] — high-entropy stream identifiers minted by the agent
//! - [`breaker`] — the three-state circuit breaker guarding egress calls
//! - [`retry`] — bounded exponential-backoff retry policy
//! - [`error`] — the error taxonomy shared across both processes
//! - [`telemetry`] — the telemetry sink adapter contract
//! - [`secrets`] — TLS material loading (`SecretSource`)
//!
//! Both `tunnel-agent` and `tunnel-server` are built from this workspace and
//! released together, so this crate is an internal boundary, not a
//! wire-compatibility contract with an external party.

pub mod breaker;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod retry;
pub mod secrets;
pub mod stream_id;
pub mod telemetry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use codec::EnvelopeCodec;
pub use envelope::{Envelope, WsFrameKind};
pub use error::{EgressErrorKind, ProtocolError};
pub use retry::{RetryPolicy, RetryPolicyConfig};
pub use secrets::{FileSecretSource, SecretError, SecretSource, TlsMaterial, VaultSecretSource};
pub use stream_id::StreamId;
pub use telemetry::{epoch_seconds_now, run_periodic, TelemetrySample, TelemetrySink, TracingTelemetrySink};

/// The protocol version advertised by the agent's `hello` envelope.
///
/// Backward-compatible changes to the envelope set must only add variants;
/// breaking changes bump this constant.
pub const PROTOCOL_VERSION: u32 = 1;

/// The exact error string a `CircuitOpen` rejection surfaces as, per the
/// testable properties in the specification.
pub const CIRCUIT_OPEN_MESSAGE: &str = "service temporarily unavailable (circuit open)";
