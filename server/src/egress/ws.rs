//! WebSocket egress worker (spec §4.6.3): frame-preserving relay between the
//! tunnel and an outbound WebSocket connection.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tunnel_protocol::{EgressErrorKind, Envelope, StreamId, WsFrameKind};

use super::{host_key_from_url, BreakerRegistry};
use crate::session::{write_envelope, ChannelWriter};
use tokio::io::AsyncWrite;

pub async fn handle<S>(
    id: StreamId,
    open: Envelope,
    writer: ChannelWriter<S>,
    mut inbound: mpsc::Receiver<Envelope>,
    breakers: std::sync::Arc<BreakerRegistry>,
    cancellation: CancellationToken,
) where
    S: AsyncWrite + Unpin + Send + 'static,
{
    let Envelope::WsOpen { url, headers, .. } = open else {
        return;
    };

    let breaker = breakers.get("ws", &host_key_from_url(&url));
    let guard = match breaker.try_acquire() {
        Ok(guard) => guard,
        Err(message) => {
            write_envelope(&writer, Envelope::WsAck { id, ok: false, error: Some(message.to_string()) }).await;
            return;
        }
    };

    let mut request = match url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            guard.on_failure();
            write_envelope(&writer, Envelope::WsAck { id, ok: false, error: Some(e.to_string()) }).await;
            return;
        }
    };
    for (name, values) in &headers {
        if let Ok(header_name) = HeaderName::try_from(name.as_str()) {
            for value in values {
                if let Ok(header_value) = HeaderValue::from_str(value) {
                    request.headers_mut().append(header_name.clone(), header_value);
                }
            }
        }
    }

    let socket = match tokio_tungstenite::connect_async(request).await {
        Ok((socket, _response)) => {
            guard.on_success();
            socket
        }
        Err(e) => {
            guard.on_failure();
            write_envelope(&writer, Envelope::WsAck { id, ok: false, error: Some(classify_ws_error(&e)) }).await;
            return;
        }
    };

    write_envelope(&writer, Envelope::WsAck { id, ok: true, error: None }).await;

    let (mut ws_sink, mut ws_stream) = socket.split();

    let outbound_handle = tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            match envelope {
                Envelope::WsMessage { kind, data, .. } => {
                    let message = match kind {
                        WsFrameKind::Text => Message::Text(String::from_utf8_lossy(&data).into_owned().into()),
                        WsFrameKind::Binary => Message::Binary(data.into()),
                        WsFrameKind::Ping => Message::Ping(data.into()),
                        WsFrameKind::Pong => Message::Pong(data.into()),
                    };
                    if ws_sink.send(message).await.is_err() {
                        break;
                    }
                }
                Envelope::WsClose { code, reason, .. } => {
                    let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: code.into(),
                        reason: reason.unwrap_or_default().into(),
                    };
                    let _ = ws_sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                _ => {}
            }
        }
        let _ = ws_sink.close().await;
    });

    let writer_for_inbound = writer.clone();
    let inbound_handle = tokio::spawn(async move {
        while let Some(message) = ws_stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    write_envelope(
                        &writer_for_inbound,
                        Envelope::WsMessage { id, kind: WsFrameKind::Text, data: text.as_bytes().to_vec() },
                    )
                    .await;
                }
                Ok(Message::Binary(data)) => {
                    write_envelope(
                        &writer_for_inbound,
                        Envelope::WsMessage { id, kind: WsFrameKind::Binary, data: data.to_vec() },
                    )
                    .await;
                }
                Ok(Message::Ping(data)) => {
                    write_envelope(
                        &writer_for_inbound,
                        Envelope::WsMessage { id, kind: WsFrameKind::Ping, data: data.to_vec() },
                    )
                    .await;
                }
                Ok(Message::Pong(data)) => {
                    write_envelope(
                        &writer_for_inbound,
                        Envelope::WsMessage { id, kind: WsFrameKind::Pong, data: data.to_vec() },
                    )
                    .await;
                }
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), Some(f.reason.to_string())))
                        .unwrap_or((1000, None));
                    write_envelope(&writer_for_inbound, Envelope::WsClose { id, code, reason }).await;
                    break;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    write_envelope(
                        &writer_for_inbound,
                        Envelope::WsClose { id, code: 1006, reason: Some(e.to_string()) },
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
    debug!(%id, "ws egress worker done");
}

fn classify_ws_error(error: &tokio_tungstenite::tungstenite::Error) -> String {
    use tokio_tungstenite::tungstenite::Error as E;
    let kind = match error {
        E::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => EgressErrorKind::ConnectRefused,
        E::Io(_) => EgressErrorKind::Io,
        E::Tls(_) => EgressErrorKind::Tls,
        _ => EgressErrorKind::Io,
    };
    kind.as_wire_str().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChannelWriter;
    use std::collections::HashMap;
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
    async fn opens_echoes_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            let _ = ws.close(None).await;
        });

        let (writer, mut reader) = writer_pair();
        let (tx, rx) = mpsc::channel(8);
        let id = StreamId::new();
        let breakers = StdArc::new(BreakerRegistry::new());
        let open = Envelope::WsOpen {
            id,
            url: format!("ws://{addr}/"),
            headers: HashMap::new(),
        };

        let worker = tokio::spawn(handle(id, open, writer, rx, breakers, CancellationToken::new()));

        let ack = reader.next().await.unwrap().unwrap();
        assert!(matches!(ack, Envelope::WsAck { ok: true, .. }));

        tx.send(Envelope::WsMessage { id, kind: WsFrameKind::Text, data: b"hi".to_vec() })
            .await
            .unwrap();

        let echoed = reader.next().await.unwrap().unwrap();
        match echoed {
            Envelope::WsMessage { kind: WsFrameKind::Text, data, .. } => assert_eq!(data, b"hi"),
            other => panic!("expected echoed WsMessage, got {other:?}"),
        }

        let closed = reader.next().await.unwrap().unwrap();
        assert!(matches!(closed, Envelope::WsClose { .. }));

        drop(tx);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_dialing() {
        let (writer, mut reader) = writer_pair();
        let (_tx, rx) = mpsc::channel(8);
        let id = StreamId::new();
        let breakers = StdArc::new(BreakerRegistry::new());
        let breaker = breakers.get("ws", "example.invalid");
        for _ in 0..5 {
            breaker.try_acquire().unwrap().on_failure();
        }

        let open = Envelope::WsOpen {
            id,
            url: "ws://example.invalid/".to_string(),
            headers: HashMap::new(),
        };
        handle(id, open, writer, rx, breakers, CancellationToken::new()).await;

        let response = reader.next().await.unwrap().unwrap();
        match response {
            Envelope::WsAck { ok: false, error, .. } => {
                assert_eq!(error.as_deref(), Some(tunnel_protocol::CIRCUIT_OPEN_MESSAGE));
            }
            other => panic!("expected WsAck, got {other:?}"),
        }
    }
}
