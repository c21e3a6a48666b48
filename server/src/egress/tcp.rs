//! TCP egress worker (spec §4.6.2): dials the CONNECT target and runs two
//! half-duplex pumps until either side closes, then tears down the other.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tunnel_protocol::{EgressErrorKind, Envelope, StreamId};

use super::{host_key, BreakerRegistry};
use crate::session::{write_envelope, ChannelWriter};
use tokio::io::AsyncWrite;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER: usize = 32 * 1024;

pub async fn handle<S>(
    id: StreamId,
    address: String,
    writer: ChannelWriter<S>,
    mut inbound: mpsc::Receiver<Envelope>,
    breakers: std::sync::Arc<BreakerRegistry>,
    cancellation: CancellationToken,
) where
    S: AsyncWrite + Unpin + Send + 'static,
{
    let breaker = breakers.get("tcp", host_key(&address));
    let guard = match breaker.try_acquire() {
        Ok(guard) => guard,
        Err(message) => {
            write_envelope(
                &writer,
                Envelope::ConnectClose {
                    id,
                    error: Some(message.to_string()),
                },
            )
            .await;
            return;
        }
    };

    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => {
            guard.on_success();
            stream
        }
        Ok(Err(e)) => {
            guard.on_failure();
            write_envelope(&writer, Envelope::ConnectClose { id, error: Some(classify_io(&e)) }).await;
            return;
        }
        Err(_) => {
            guard.on_failure();
            write_envelope(
                &writer,
                Envelope::ConnectClose {
                    id,
                    error: Some(EgressErrorKind::Timeout.as_wire_str().to_string()),
                },
            )
            .await;
            return;
        }
    };

    write_envelope(&writer, Envelope::ConnectAck { id, ok: true, error: None }).await;

    let (mut read_half, mut write_half) = stream.into_split();

    let outbound_handle = tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            match envelope {
                Envelope::ConnectData { chunk, .. } => {
                    if write_half.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                Envelope::ConnectClose { .. } => break,
                _ => {}
            }
        }
        let _ = write_half.shutdown().await;
    });

    let writer_for_inbound = writer.clone();
    let inbound_handle = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    write_envelope(&writer_for_inbound, Envelope::ConnectClose { id, error: None }).await;
                    break;
                }
                Ok(n) => {
                    write_envelope(
                        &writer_for_inbound,
                        Envelope::ConnectData { id, chunk: buf[..n].to_vec() },
                    )
                    .await;
                }
                Err(e) => {
                    write_envelope(
                        &writer_for_inbound,
                        Envelope::ConnectClose { id, error: Some(classify_io(&e)) },
                    )
                    .await;
                    break;
                }
            }
        }
    });

    let mut outbound_handle = outbound_handle;
    let mut inbound_handle = inbound_handle;
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => {
            outbound_handle.abort();
            inbound_handle.abort();
        }
        _ = &mut outbound_handle => {
            inbound_handle.abort();
        }
        _ = &mut inbound_handle => {
            outbound_handle.abort();
        }
    }
    debug!(%id, "tcp egress worker done");
}

fn classify_io(error: &std::io::Error) -> String {
    use std::io::ErrorKind::*;
    let kind = match error.kind() {
        ConnectionRefused => EgressErrorKind::ConnectRefused,
        TimedOut => EgressErrorKind::Timeout,
        _ => EgressErrorKind::Io,
    };
    kind.as_wire_str().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChannelWriter;
    use futures::StreamExt;
    use std::sync::Arc as StdArc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as TokioMutex;
    use tokio_util::codec::Framed;
    use tunnel_protocol::EnvelopeCodec;

    fn writer_pair() -> (ChannelWriter<tokio::io::DuplexStream>, Framed<tokio::io::DuplexStream, EnvelopeCodec>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let sink = Framed::new(a, EnvelopeCodec::new()).split().0;
        (StdArc::new(TokioMutex::new(sink)), Framed::new(b, EnvelopeCodec::new()))
    }

    #[tokio::test]
    async fn connects_echoes_and_closes_on_peer_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
            // Dropping the socket here drives the worker's inbound pump to EOF.
        });

        let (writer, mut reader) = writer_pair();
        let (tx, rx) = mpsc::channel(8);
        let id = StreamId::new();
        let breakers = StdArc::new(BreakerRegistry::new());

        let worker = tokio::spawn(handle(id, address, writer, rx, breakers, CancellationToken::new()));

        let ack = reader.next().await.unwrap().unwrap();
        assert!(matches!(ack, Envelope::ConnectAck { ok: true, .. }));

        tx.send(Envelope::ConnectData { id, chunk: b"ping".to_vec() }).await.unwrap();

        let echoed = reader.next().await.unwrap().unwrap();
        match echoed {
            Envelope::ConnectData { chunk, .. } => assert_eq!(chunk, b"ping"),
            other => panic!("expected echoed ConnectData, got {other:?}"),
        }

        let closed = reader.next().await.unwrap().unwrap();
        assert!(matches!(closed, Envelope::ConnectClose { .. }));

        drop(tx);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_dialing() {
        let (writer, mut reader) = writer_pair();
        let (_tx, rx) = mpsc::channel(8);
        let id = StreamId::new();
        let breakers = StdArc::new(BreakerRegistry::new());
        let breaker = breakers.get("tcp", "example.invalid");
        for _ in 0..5 {
            breaker.try_acquire().unwrap().on_failure();
        }

        handle(id, "example.invalid:9".to_string(), writer, rx, breakers, CancellationToken::new()).await;

        let response = reader.next().await.unwrap().unwrap();
        match response {
            Envelope::ConnectClose { error, .. } => {
                assert_eq!(error.as_deref(), Some(tunnel_protocol::CIRCUIT_OPEN_MESSAGE));
            }
            other => panic!("expected ConnectClose, got {other:?}"),
        }
    }
}
