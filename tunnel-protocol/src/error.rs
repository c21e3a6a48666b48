//! # Error Taxonomy
//!
//! Mirrors the specification's error classes: protocol violations and
//! transport errors are fatal to the whole channel; egress, timeout, and
//! circuit-open errors are local to one stream.

use thiserror::Error;

/// Fatal to the channel: the channel is drained and every live stream fails
/// with [`crate::error::ChannelLost`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("duplicate stream id")]
    DuplicateStreamId,
    #[error("envelope received after stream close")]
    EnvelopeAfterClose,
    #[error("mid-stream envelope for a single-shot http stream")]
    UnexpectedMidStream,
    #[error("data/message envelope before ack")]
    DataBeforeAck,
}

/// Short, machine-stable egress failure kinds, used both as the `error`
/// field on the wire and in logs.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EgressErrorKind {
    #[error("dns")]
    Dns,
    #[error("connect_refused")]
    ConnectRefused,
    #[error("timeout")]
    Timeout,
    #[error("tls")]
    Tls,
    #[error("circuit_open")]
    CircuitOpen,
    #[error("io")]
    Io,
}

impl EgressErrorKind {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            EgressErrorKind::Dns => "dns",
            EgressErrorKind::ConnectRefused => "connect_refused",
            EgressErrorKind::Timeout => "timeout",
            EgressErrorKind::Tls => "tls",
            EgressErrorKind::CircuitOpen => "circuit_open",
            EgressErrorKind::Io => "io",
        }
    }
}

/// Signals that the channel carrying a stream was lost (read/write error,
/// protocol violation, or explicit shutdown) before the stream completed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("channel lost")]
pub struct ChannelLost;

/// Signals that a request's deadline elapsed before a response arrived.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("request timed out")]
pub struct RequestTimeout;
