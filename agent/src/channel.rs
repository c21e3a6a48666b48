//! # Agent Tunnel Client
//!
//! Owns the single mutual-TLS channel to the server: the reconnect loop,
//! the reader pump, the serialized writer, and the public contract the
//! proxy listener drives (spec §4.4). The reconnect loop generalizes the
//! teacher's `agent::run_agent_loop` fixed-delay WebSocket reconnect into
//! the state machine of spec §4.4.1 (immediate first retry, then capped
//! exponential backoff) over a `tokio_rustls` channel instead of a
//! WebSocket. Not the `tunnel_protocol::RetryPolicy` path — that primitive
//! is for bounded-attempt client calls, not an unbounded reconnect loop.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnel_protocol::{Envelope, EnvelopeCodec, ProtocolError, StreamId, WsFrameKind, PROTOCOL_VERSION};

use crate::error::RequestError;
use crate::registry::StreamRegistry;

type TunnelStream = tokio_rustls::client::TlsStream<TcpStream>;
type TunnelWriter = Arc<Mutex<SplitSink<Framed<TunnelStream, EnvelopeCodec>, Envelope>>>;

const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct TunnelClientConfig {
    pub server_addr: String,
    pub server_name: String,
    pub tls_config: Arc<rustls::ClientConfig>,
    pub request_timeout: Duration,
    pub reconnect_ceiling: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

#[derive(Clone)]
struct Session {
    writer: TunnelWriter,
    token: CancellationToken,
}

struct Inner {
    config: TunnelClientConfig,
    registry: Arc<StreamRegistry>,
    state: StdMutex<ConnectionState>,
    session: StdMutex<Option<Session>>,
    reconnected: Notify,
    shutdown: CancellationToken,
    last_activity: std::sync::atomic::AtomicU64,
}

pub struct TunnelClient {
    inner: Arc<Inner>,
}

pub struct HttpRequestSpec {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

pub struct HttpResponseResult {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

#[derive(Clone, Copy)]
enum StreamKind {
    Connect,
    Ws,
}

/// The writable half of an established CONNECT/WebSocket stream. Cheaply
/// `Clone`-able so a pump task can hold it independently of the receiver
/// half (see [`TunnelStreamHandle::split`]).
#[derive(Clone)]
pub struct TunnelStreamSender {
    id: StreamId,
    writer: TunnelWriter,
    session_token: CancellationToken,
    kind: StreamKind,
}

impl TunnelStreamSender {
    pub async fn send_data(&self, chunk: Vec<u8>) -> bool {
        let envelope = match self.kind {
            StreamKind::Connect => Envelope::ConnectData { id: self.id, chunk },
            StreamKind::Ws => Envelope::WsMessage {
                id: self.id,
                kind: WsFrameKind::Binary,
                data: chunk,
            },
        };
        self.send_envelope(envelope).await
    }

    pub async fn send_ws_frame(&self, kind: WsFrameKind, data: Vec<u8>) -> bool {
        self.send_envelope(Envelope::WsMessage { id: self.id, kind, data }).await
    }

    pub async fn close(&self, error: Option<String>) {
        let envelope = match self.kind {
            StreamKind::Connect => Envelope::ConnectClose { id: self.id, error },
            StreamKind::Ws => Envelope::WsClose {
                id: self.id,
                code: 1000,
                reason: error,
            },
        };
        let _ = self.send_envelope(envelope).await;
    }

    async fn send_envelope(&self, envelope: Envelope) -> bool {
        if self.session_token.is_cancelled() {
            return false;
        }
        write_envelope(&self.writer, envelope).await
    }
}

/// A live byte-duplex stream (CONNECT or WebSocket) established over the
/// tunnel. The listener copies bytes between the local client socket and
/// this handle in both directions.
pub struct TunnelStreamHandle {
    sender: TunnelStreamSender,
    inbound: mpsc::Receiver<Envelope>,
}

impl TunnelStreamHandle {
    pub async fn send_data(&self, chunk: Vec<u8>) -> bool {
        self.sender.send_data(chunk).await
    }

    pub async fn send_ws_frame(&self, kind: WsFrameKind, data: Vec<u8>) -> bool {
        self.sender.send_ws_frame(kind, data).await
    }

    pub async fn close(&self, error: Option<String>) {
        self.sender.close(error).await
    }

    /// Yields the next inbound data/close envelope, or `None` once the
    /// stream has been fully torn down.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Splits into an independently owned sender and receiver so a pump
    /// can read from the tunnel on one task and write to it on another.
    pub fn split(self) -> (TunnelStreamSender, mpsc::Receiver<Envelope>) {
        (self.sender, self.inbound)
    }
}

async fn write_envelope(writer: &TunnelWriter, envelope: Envelope) -> bool {
    let mut sink = writer.lock().await;
    sink.send(envelope).await.is_ok()
}

impl TunnelClient {
    /// Builds the client and spawns its background reconnect/reader task.
    /// `shutdown` stops the reconnect loop and drains every live stream.
    pub fn spawn(
        config: TunnelClientConfig,
        registry: Arc<StreamRegistry>,
        shutdown: CancellationToken,
    ) -> (Arc<TunnelClient>, tokio::task::JoinHandle<()>) {
        let inner = Arc::new(Inner {
            config,
            registry,
            state: StdMutex::new(ConnectionState::Disconnected),
            session: StdMutex::new(None),
            reconnected: Notify::new(),
            shutdown,
            last_activity: std::sync::atomic::AtomicU64::new(tunnel_protocol::epoch_seconds_now()),
        });
        let client = Arc::new(TunnelClient { inner: inner.clone() });
        let handle = tokio::spawn(run(inner));
        (client, handle)
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.lock().unwrap() == ConnectionState::Connected
    }

    /// Number of streams the registry is currently tracking — the agent's
    /// notion of "active connections" for telemetry.
    pub fn active_stream_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn last_activity_epoch_seconds(&self) -> u64 {
        self.inner.last_activity.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Resolves once a reconnect (or the first connect) completes.
    pub async fn reconnect_events(&self) {
        self.inner.reconnected.notified().await;
    }

    pub async fn send_request(&self, req: HttpRequestSpec) -> Result<HttpResponseResult, RequestError> {
        let Some(session) = current_session(&self.inner) else {
            return Err(RequestError::ChannelLost);
        };

        let (id, rx) = loop {
            let candidate = StreamId::new();
            let (tx, rx) = oneshot::channel();
            match self.inner.registry.register_http(candidate, tx) {
                Ok(()) => break (candidate, rx),
                Err(_) => continue,
            }
        };

        let envelope = Envelope::HttpRequest {
            id,
            method: req.method,
            url: req.url,
            headers: req.headers,
            body: req.body,
        };
        if !write_envelope(&session.writer, envelope).await {
            self.inner.registry.take_http(id);
            return Err(RequestError::ChannelLost);
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(Envelope::HttpResponse { status, headers, body, error })) => match error {
                Some(error) => Err(RequestError::Refused(error)),
                None => Ok(HttpResponseResult { status, headers, body }),
            },
            Ok(Ok(_)) | Ok(Err(_)) => Err(RequestError::ChannelLost),
            Err(_) => {
                self.inner.registry.take_http(id);
                Err(RequestError::Timeout)
            }
        }
    }

    pub async fn open_connect(&self, address: String) -> Result<TunnelStreamHandle, RequestError> {
        self.open_stream(StreamKind::Connect, move |id| Envelope::ConnectOpen { id, address })
            .await
    }

    pub async fn open_websocket(
        &self,
        url: String,
        headers: HashMap<String, Vec<String>>,
    ) -> Result<TunnelStreamHandle, RequestError> {
        self.open_stream(StreamKind::Ws, move |id| Envelope::WsOpen { id, url, headers })
            .await
    }

    async fn open_stream(
        &self,
        kind: StreamKind,
        build_open: impl FnOnce(StreamId) -> Envelope,
    ) -> Result<TunnelStreamHandle, RequestError> {
        let Some(session) = current_session(&self.inner) else {
            return Err(RequestError::ChannelLost);
        };

        let (id, ack_rx, data_rx) = loop {
            let candidate = StreamId::new();
            let (ack_tx, ack_rx) = oneshot::channel();
            let (data_tx, data_rx) = mpsc::channel(MAILBOX_CAPACITY);
            match self.inner.registry.register_stream(candidate, ack_tx, data_tx) {
                Ok(()) => break (candidate, ack_rx, data_rx),
                Err(_) => continue,
            }
        };

        if !write_envelope(&session.writer, build_open(id)).await {
            self.inner.registry.take(id);
            return Err(RequestError::ChannelLost);
        }

        match tokio::time::timeout(self.inner.config.request_timeout, ack_rx).await {
            Ok(Ok(Envelope::ConnectAck { ok: true, .. })) | Ok(Ok(Envelope::WsAck { ok: true, .. })) => {
                Ok(TunnelStreamHandle {
                    sender: TunnelStreamSender {
                        id,
                        writer: session.writer,
                        session_token: session.token,
                        kind,
                    },
                    inbound: data_rx,
                })
            }
            Ok(Ok(Envelope::ConnectAck { error, .. }))
            | Ok(Ok(Envelope::WsAck { error, .. }))
            | Ok(Ok(Envelope::ConnectClose { error, .. })) => {
                self.inner.registry.take(id);
                Err(RequestError::Refused(error.unwrap_or_else(|| "refused".to_string())))
            }
            Ok(Ok(Envelope::WsClose { reason, .. })) => {
                self.inner.registry.take(id);
                Err(RequestError::Refused(reason.unwrap_or_else(|| "closed before ack".to_string())))
            }
            Ok(Ok(_)) | Ok(Err(_)) => {
                self.inner.registry.take(id);
                Err(RequestError::ChannelLost)
            }
            Err(_) => {
                self.inner.registry.take(id);
                Err(RequestError::Timeout)
            }
        }
    }
}

fn current_session(inner: &Inner) -> Option<Session> {
    inner.session.lock().unwrap().clone()
}

async fn run(inner: Arc<Inner>) {
    let mut backoff: Option<Duration> = None;
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        if let Some(delay) = backoff {
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        *inner.state.lock().unwrap() = ConnectionState::Connecting;
        let stream = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            result = connect_once(&inner.config) => result,
        };

        let tunnel = match stream {
            Ok(tunnel) => tunnel,
            Err(err) => {
                warn!(error = %err, "tunnel connect failed, backing off");
                backoff = Some(next_delay(backoff, inner.config.reconnect_ceiling));
                continue;
            }
        };

        info!(server = %inner.config.server_addr, "tunnel channel established");

        let framed = Framed::new(tunnel, EnvelopeCodec::new());
        let (mut sink, mut source) = framed.split();
        if sink.send(Envelope::Hello { version: PROTOCOL_VERSION }).await.is_err() {
            warn!("failed writing hello envelope, retrying connect");
            backoff = Some(next_delay(backoff, inner.config.reconnect_ceiling));
            continue;
        }
        backoff = None;

        let writer: TunnelWriter = Arc::new(Mutex::new(sink));
        let session_token = CancellationToken::new();
        *inner.session.lock().unwrap() = Some(Session {
            writer: writer.clone(),
            token: session_token.clone(),
        });
        *inner.state.lock().unwrap() = ConnectionState::Connected;
        inner.reconnected.notify_waiters();

        loop {
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => { session_token.cancel(); break; }
                _ = session_token.cancelled() => break,
                next = source.next() => {
                    match next {
                        Some(Ok(envelope)) => {
                            inner
                                .last_activity
                                .store(tunnel_protocol::epoch_seconds_now(), std::sync::atomic::Ordering::Relaxed);
                            if let Err(e) = dispatch(&inner.registry, envelope).await {
                                warn!(error = %e, "protocol violation, draining channel");
                                session_token.cancel();
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "tunnel decode error, draining");
                            session_token.cancel();
                            break;
                        }
                        None => {
                            warn!("tunnel channel closed by server, draining");
                            session_token.cancel();
                            break;
                        }
                    }
                }
            }
        }

        *inner.state.lock().unwrap() = ConnectionState::Draining;
        *inner.session.lock().unwrap() = None;
        let drained = inner.registry.drain();
        debug!(drained, "registry drained after channel loss");
        *inner.state.lock().unwrap() = ConnectionState::Disconnected;

        if inner.shutdown.is_cancelled() {
            break;
        }
        backoff = Some(next_delay(None, inner.config.reconnect_ceiling));
    }
}

async fn connect_once(config: &TunnelClientConfig) -> Result<TunnelStream, String> {
    let addr = config
        .server_addr
        .to_socket_addrs()
        .map_err(|e| format!("resolving {}: {e}", config.server_addr))?
        .next()
        .ok_or_else(|| format!("no addresses for {}", config.server_addr))?;

    let tcp = TcpStream::connect(addr).await.map_err(|e| format!("tcp connect: {e}"))?;
    tcp.set_nodelay(true).ok();

    let server_name =
        ServerName::try_from(config.server_name.clone()).map_err(|e| format!("invalid server name: {e}"))?;
    let connector = TlsConnector::from(config.tls_config.clone());
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| format!("tls handshake: {e}"))?;
    Ok(tls)
}

fn next_delay(previous: Option<Duration>, ceiling: Duration) -> Duration {
    match previous {
        None => Duration::ZERO,
        Some(d) if d.is_zero() => Duration::from_millis(200),
        Some(d) => (d * 2).min(ceiling),
    }
}

async fn dispatch(registry: &StreamRegistry, envelope: Envelope) -> Result<(), ProtocolError> {
    let Some(id) = envelope.stream_id() else {
        return Ok(());
    };
    match &envelope {
        Envelope::HttpResponse { .. } => {
            let tx = registry.take_http_checked(id)?;
            let _ = tx.send(envelope);
            Ok(())
        }
        Envelope::ConnectAck { .. } | Envelope::WsAck { .. } => {
            let tx = registry.take_ack_checked(id)?;
            let _ = tx.send(envelope);
            Ok(())
        }
        Envelope::ConnectData { .. } | Envelope::WsMessage { .. } => {
            let tx = registry.data_sender_checked(id)?;
            let _ = tx.send(envelope).await;
            Ok(())
        }
        Envelope::ConnectClose { .. } | Envelope::WsClose { .. } => {
            // Closing is tolerant of either phase: a close can arrive while
            // the ack is still pending (the open attempt was refused) or
            // once the stream is fully established (ack already consumed).
            // Only a close for an id with no entry at all is a violation.
            if let Some(ack_tx) = registry.take_ack(id) {
                let _ = ack_tx.send(envelope);
                registry.take(id);
                Ok(())
            } else if let Some(data_tx) = registry.data_sender(id) {
                let _ = data_tx.send(envelope).await;
                registry.take(id);
                Ok(())
            } else {
                Err(ProtocolError::EnvelopeAfterClose)
            }
        }
        Envelope::Hello { .. }
        | Envelope::HttpRequest { .. }
        | Envelope::ConnectOpen { .. }
        | Envelope::WsOpen { .. } => {
            debug!(%id, "ignoring agent-only envelope received from server");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: Duration = Duration::from_secs(30);

    #[test]
    fn next_delay_is_immediate_then_doubles_and_caps() {
        let first = next_delay(None, CEILING);
        assert_eq!(first, Duration::ZERO);

        let second = next_delay(Some(first), CEILING);
        assert_eq!(second, Duration::from_millis(200));

        let third = next_delay(Some(second), CEILING);
        assert_eq!(third, Duration::from_millis(400));

        let mut delay = third;
        for _ in 0..20 {
            delay = next_delay(Some(delay), CEILING);
        }
        assert_eq!(delay, CEILING, "backoff must never exceed the configured ceiling");
    }

    #[tokio::test]
    async fn dispatch_http_response_reaches_registered_waiter() {
        let registry = StreamRegistry::new();
        let id = StreamId::new();
        let (tx, rx) = oneshot::channel();
        registry.register_http(id, tx).unwrap();

        let envelope = Envelope::HttpResponse {
            id,
            status: 200,
            headers: HashMap::new(),
            body: vec![],
            error: None,
        };
        dispatch(&registry, envelope).await.unwrap();

        let delivered = rx.await.unwrap();
        assert!(matches!(delivered, Envelope::HttpResponse { status: 200, .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dispatch_rejects_http_response_for_unregistered_id() {
        let registry = StreamRegistry::new();
        let envelope = Envelope::HttpResponse {
            id: StreamId::new(),
            status: 200,
            headers: HashMap::new(),
            body: vec![],
            error: None,
        };
        let err = dispatch(&registry, envelope).await.unwrap_err();
        assert!(matches!(err, ProtocolError::EnvelopeAfterClose));
    }

    #[tokio::test]
    async fn dispatch_rejects_data_before_ack() {
        let registry = StreamRegistry::new();
        let id = StreamId::new();
        let (ack_tx, _ack_rx) = oneshot::channel();
        let (data_tx, _data_rx) = mpsc::channel(8);
        registry.register_stream(id, ack_tx, data_tx).unwrap();

        let err = dispatch(&registry, Envelope::ConnectData { id, chunk: vec![1] })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DataBeforeAck));
    }

    #[tokio::test]
    async fn dispatch_ack_then_data_then_close_drains_registry() {
        let registry = StreamRegistry::new();
        let id = StreamId::new();
        let (ack_tx, ack_rx) = oneshot::channel();
        let (data_tx, mut data_rx) = mpsc::channel(8);
        registry.register_stream(id, ack_tx, data_tx).unwrap();

        dispatch(&registry, Envelope::ConnectAck { id, ok: true, error: None }).await.unwrap();
        assert!(matches!(ack_rx.await.unwrap(), Envelope::ConnectAck { ok: true, .. }));

        dispatch(&registry, Envelope::ConnectData { id, chunk: vec![9] }).await.unwrap();
        assert!(matches!(data_rx.recv().await.unwrap(), Envelope::ConnectData { .. }));

        dispatch(&registry, Envelope::ConnectClose { id, error: None }).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dispatch_rejects_close_for_unknown_stream() {
        let registry = StreamRegistry::new();
        let err = dispatch(&registry, Envelope::ConnectClose { id: StreamId::new(), error: None })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::EnvelopeAfterClose));
    }

    /// One self-signed cert per side, each trusted directly as its peer's
    /// sole root — enough for a real mutual-TLS handshake without a CA.
    fn self_signed_identity() -> (
        rustls::pki_types::CertificateDer<'static>,
        rustls::pki_types::PrivateKeyDer<'static>,
    ) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(rustls::pki_types::PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));
        (certified.cert.der().clone(), key)
    }

    async fn poll_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(timeout, async {
            loop {
                if cond() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition did not become true in time");
    }

    #[tokio::test]
    async fn reconnects_after_the_server_drops_the_channel() {
        let (server_cert, server_key) = self_signed_identity();
        let (client_cert, client_key) = self_signed_identity();

        let mut client_roots = rustls::RootCertStore::empty();
        client_roots.add(client_cert.clone()).unwrap();
        let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(client_roots))
            .build()
            .unwrap();
        let server_config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(vec![server_cert.clone()], server_key)
            .unwrap();

        let mut server_roots = rustls::RootCertStore::empty();
        server_roots.add(server_cert).unwrap();
        let client_config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_root_certificates(server_roots)
            .with_client_auth_cert(vec![client_cert], client_key)
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let fake_server = tokio::spawn(async move {
            // First channel: accept the handshake, read the hello, then drop
            // it immediately to force the agent into its reconnect path.
            let (tcp1, _) = listener.accept().await.unwrap();
            let tls1 = tls_acceptor.accept(tcp1).await.unwrap();
            let mut framed1 = Framed::new(tls1, EnvelopeCodec::new());
            let _ = framed1.next().await;
            drop(framed1);

            // Second channel: accept and hold it open for the rest of the test.
            let (tcp2, _) = listener.accept().await.unwrap();
            let tls2 = tls_acceptor.accept(tcp2).await.unwrap();
            let mut framed2 = Framed::new(tls2, EnvelopeCodec::new());
            let _ = framed2.next().await;
            std::future::pending::<()>().await
        });

        let client_config = TunnelClientConfig {
            server_addr: addr.to_string(),
            server_name: "localhost".to_string(),
            tls_config: Arc::new(client_config),
            request_timeout: Duration::from_secs(5),
            reconnect_ceiling: Duration::from_millis(200),
        };
        let registry = Arc::new(StreamRegistry::new());
        let shutdown = CancellationToken::new();
        let (client, client_task) = TunnelClient::spawn(client_config, registry, shutdown.child_token());

        poll_until(Duration::from_secs(5), || client.is_connected()).await;
        poll_until(Duration::from_secs(5), || !client.is_connected()).await;
        poll_until(Duration::from_secs(5), || client.is_connected()).await;

        shutdown.cancel();
        fake_server.abort();
        let _ = client_task.await;
    }
}
