//! # Wire Envelopes
//!
//! Defines every message exchanged over the mutual-TLS channel between one
//! agent and one server. Messages are adjacently-tagged JSON objects:
//! `{"type": "<tag>", "payload": {...}}`. Binary fields (`body`, `chunk`,
//! `data`) are base64 strings on the wire and `Vec<u8>` in Rust, via the
//! [`base64_bytes`] helper module.

use crate::stream_id::StreamId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// All possible envelopes carried over a tunnel channel.
///
/// `#[serde(tag = "type", content = "payload")]` gives each variant the
/// exact `{"type": ..., "payload": {...}}` shape the wire format requires,
/// with the tag rendered in snake_case (e.g. `Envelope::HttpRequest` becomes
/// `"http_request"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    /// First envelope an agent sends on a freshly connected channel.
    /// Informational only — the server logs it and never blocks on it.
    Hello { version: u32 },

    // ── HTTP (single-shot) ──────────────────────────────────────────
    HttpRequest {
        id: StreamId,
        method: String,
        url: String,
        headers: HashMap<String, Vec<String>>,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },
    HttpResponse {
        id: StreamId,
        status: u16,
        headers: HashMap<String, Vec<String>>,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ── TCP tunnel (CONNECT) ────────────────────────────────────────
    ConnectOpen {
        id: StreamId,
        address: String,
    },
    ConnectAck {
        id: StreamId,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ConnectData {
        id: StreamId,
        #[serde(with = "base64_bytes")]
        chunk: Vec<u8>,
    },
    ConnectClose {
        id: StreamId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ── WebSocket ─────────────────────────────────────────────────
    WsOpen {
        id: StreamId,
        url: String,
        headers: HashMap<String, Vec<String>>,
    },
    WsAck {
        id: StreamId,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WsMessage {
        id: StreamId,
        kind: WsFrameKind,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    WsClose {
        id: StreamId,
        code: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Envelope {
    /// The stream-id this envelope belongs to, if any (`Hello` has none).
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Envelope::Hello { .. } => None,
            Envelope::HttpRequest { id, .. }
            | Envelope::HttpResponse { id, .. }
            | Envelope::ConnectOpen { id, .. }
            | Envelope::ConnectAck { id, .. }
            | Envelope::ConnectData { id, .. }
            | Envelope::ConnectClose { id, .. }
            | Envelope::WsOpen { id, .. }
            | Envelope::WsAck { id, .. }
            | Envelope::WsMessage { id, .. }
            | Envelope::WsClose { id, .. } => Some(*id),
        }
    }

    /// True for envelopes that open a new stream (`*_open` / `http_request`).
    pub fn is_opening(&self) -> bool {
        matches!(
            self,
            Envelope::HttpRequest { .. } | Envelope::ConnectOpen { .. } | Envelope::WsOpen { .. }
        )
    }

    /// True for envelopes that terminate a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Envelope::HttpResponse { .. } | Envelope::ConnectClose { .. } | Envelope::WsClose { .. }
        )
    }
}

/// The kind of a WebSocket frame, preserved across the tunnel so the egress
/// side can replay it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsFrameKind {
    Text,
    Binary,
    Ping,
    Pong,
}

/// Base64-encodes binary payload fields so the envelope stream stays valid
/// UTF-8 JSON text end to end.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelopes() -> Vec<Envelope> {
        let id = StreamId::new();
        vec![
            Envelope::Hello { version: 1 },
            Envelope::HttpRequest {
                id,
                method: "GET".into(),
                url: "http://example.test/".into(),
                headers: HashMap::from([("accept".to_string(), vec!["*/*".to_string()])]),
                body: vec![],
            },
            Envelope::HttpResponse {
                id,
                status: 200,
                headers: HashMap::new(),
                body: b"hello".to_vec(),
                error: None,
            },
            Envelope::ConnectOpen {
                id,
                address: "echo.test:9".into(),
            },
            Envelope::ConnectData {
                id,
                chunk: vec![0u8; 4096],
            },
            Envelope::ConnectClose { id, error: None },
            Envelope::WsMessage {
                id,
                kind: WsFrameKind::Text,
                data: b"ping-0".to_vec(),
            },
            Envelope::WsClose {
                id,
                code: 1000,
                reason: Some("bye".into()),
            },
        ]
    }

    #[test]
    fn round_trips_every_variant() {
        for env in sample_envelopes() {
            let json = serde_json::to_string(&env).unwrap();
            let back: Envelope = serde_json::from_str(&json).unwrap();
            assert_eq!(env, back, "round-trip mismatch for {json}");
        }
    }

    #[test]
    fn wire_shape_is_adjacently_tagged() {
        let env = Envelope::ConnectClose {
            id: StreamId::new(),
            error: Some("boom".into()),
        };
        let value: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "connect_close");
        assert!(value["payload"]["id"].is_string());
        assert_eq!(value["payload"]["error"], "boom");
    }

    #[test]
    fn stream_id_accessor_matches_payload() {
        let id = StreamId::new();
        let env = Envelope::ConnectOpen {
            id,
            address: "a:1".into(),
        };
        assert_eq!(env.stream_id(), Some(id));
        assert_eq!(Envelope::Hello { version: 1 }.stream_id(), None);
    }
}
