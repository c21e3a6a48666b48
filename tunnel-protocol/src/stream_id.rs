//! # Stream Identifiers
//!
//! A stream-id is an opaque, high-entropy identifier minted by the agent
//! (the originator of every stream) and never reused within a channel's
//! lifetime. It is carried on the wire as a lowercase hex string.

use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 128 bits of entropy, hex-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId([u8; 16]);

impl StreamId {
    /// Mints a fresh, cryptographically random stream-id.
    ///
    /// Only the agent calls this — the server never mints stream-ids (see
    /// the specification's stream-id invariants).
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_hex(&self) -> String {
        self.to_string()
    }

    pub fn parse(hex: &str) -> Result<Self, ParseStreamIdError> {
        if hex.len() != 32 {
            return Err(ParseStreamIdError);
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).map_err(|_| ParseStreamIdError)?;
            bytes[i] = u8::from_str_radix(s, 16).map_err(|_| ParseStreamIdError)?;
        }
        Ok(Self(bytes))
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed stream id")]
pub struct ParseStreamIdError;

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Serialize for StreamId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HexVisitor;
        impl Visitor<'_> for HexVisitor {
            type Value = StreamId;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 32-character lowercase hex string")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<StreamId, E> {
                StreamId::parse(v).map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(HexVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let id = StreamId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: StreamId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn distinct_ids_are_minted() {
        let a = StreamId::new();
        let b = StreamId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(StreamId::parse("not-hex").is_err());
        assert!(StreamId::parse("abcd").is_err());
    }
}
