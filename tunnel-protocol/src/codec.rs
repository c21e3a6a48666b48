//! # Frame Codec
//!
//! Length-delimited in spirit only: the wire format is a sequence of
//! self-delimiting JSON objects with optional whitespace between them
//! (spec §4.1), not a byte-counted frame. [`EnvelopeCodec`] implements
//! `tokio_util::codec::{Decoder, Encoder}` so the channel can be wrapped in
//! a [`tokio_util::codec::Framed`] the way the rest of the ecosystem frames
//! a byte stream into a `Stream`/`Sink` of typed messages.

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum bytes of partially-received JSON to buffer before treating the
/// peer as violating the protocol. Guards against an unbounded buffer being
/// grown by a peer that never completes a value (e.g. a multi-gigabyte
/// `chunk` field).
const MAX_PENDING_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    _priv: (),
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
        if src.is_empty() {
            return Ok(None);
        }

        // Skip leading inter-value whitespace so a stream of whitespace
        // alone never looks like a truncated value.
        let leading_ws = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        if leading_ws > 0 {
            src.advance(leading_ws);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let mut stream = serde_json::Deserializer::from_slice(src).into_iter::<Envelope>();
        match stream.next() {
            Some(Ok(envelope)) => {
                let consumed = stream.byte_offset();
                src.advance(consumed);
                Ok(Some(envelope))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > MAX_PENDING_BYTES {
                    Err(ProtocolError::Malformed(format!(
                        "envelope exceeds {MAX_PENDING_BYTES} bytes without completing"
                    )))
                } else {
                    Ok(None)
                }
            }
            Some(Err(e)) => Err(ProtocolError::Malformed(e.to_string())),
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let bytes = encode(&item)?;
        dst.extend_from_slice(&bytes);
        // A trailing newline is not required by the self-delimiting JSON
        // format, but it keeps a raw `tcpdump`/log tail human-readable.
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

/// Pure encode: serializes one envelope to its JSON wire representation.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(envelope).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_id::StreamId;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    fn sample() -> Envelope {
        Envelope::ConnectOpen {
            id: StreamId::new(),
            address: "example.test:443".into(),
        }
    }

    #[test]
    fn decode_needs_more_data_on_partial_input() {
        let mut codec = EnvelopeCodec::new();
        let full = encode(&sample()).unwrap();
        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn decode_round_trips_one_value() {
        let mut codec = EnvelopeCodec::new();
        let env = sample();
        let mut buf = BytesMut::from(&encode(&env)[..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_handles_back_to_back_values_with_whitespace() {
        let mut codec = EnvelopeCodec::new();
        let a = sample();
        let b = sample();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&a));
        buf.extend_from_slice(b"   \n");
        buf.extend_from_slice(&encode(&b));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, a);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, b);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_malformed_json() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\": \"not_a_real_tag\"}"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn framed_duplex_round_trips_large_binary_chunk() {
        let (client, server) = tokio::io::duplex(128 * 1024);
        let mut client = Framed::new(client, EnvelopeCodec::new());
        let mut server = Framed::new(server, EnvelopeCodec::new());

        let env = Envelope::ConnectData {
            id: StreamId::new(),
            chunk: vec![0xAB; 32 * 1024],
        };
        client.send(env.clone()).await.unwrap();
        let received = server.next().await.unwrap().unwrap();
        assert_eq!(received, env);
    }
}
