//! # Server Session Handler
//!
//! One [`run_session`] task per accepted channel (spec §4.5.2): decodes
//! envelopes, spawns an egress worker for each `*_open`/`http_request`, and
//! routes mid-stream/closing envelopes to the worker's inbound mailbox. The
//! reader never awaits a worker directly — only the bounded mailbox send,
//! which is the intended backpressure point (spec §5).

use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnel_protocol::{Envelope, EnvelopeCodec, ProtocolError, StreamId, PROTOCOL_VERSION};

use crate::egress::{self, BreakerRegistry};

/// Bound on a worker's inbound mailbox (mid-stream envelopes awaiting
/// pickup). When full, the reader pump's mailbox `send` awaits, which
/// throttles the whole channel uniformly (spec §5).
const MAILBOX_CAPACITY: usize = 256;

pub type ChannelWriter<S> = Arc<Mutex<SplitSink<Framed<S, EnvelopeCodec>, Envelope>>>;

/// What a stream-id in the worker table is currently backing: a live
/// CONNECT/WS mailbox, or a single-shot HTTP request still in flight. HTTP
/// ids are tracked too, not just CONNECT/WS, so a mid-stream envelope aimed
/// at one is recognized as the wrong-kind violation rather than silently
/// dropped.
enum WorkerEntry {
    Http,
    Stream(mpsc::Sender<Envelope>),
}

type WorkerTable = Arc<DashMap<StreamId, WorkerEntry>>;

pub async fn write_envelope<S>(writer: &ChannelWriter<S>, envelope: Envelope) -> bool
where
    S: AsyncWrite + Unpin + Send,
{
    let mut sink = writer.lock().await;
    sink.send(envelope).await.is_ok()
}

/// Runs one agent channel's session to completion: returns when the channel
/// is lost (read error, decode error, or clean EOF) or `cancellation` fires.
pub async fn run_session<S>(
    transport: S,
    cancellation: CancellationToken,
    breakers: Arc<BreakerRegistry>,
    http_client: reqwest::Client,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(transport, EnvelopeCodec::new());
    let (sink, mut source) = framed.split();
    let writer: ChannelWriter<S> = Arc::new(Mutex::new(sink));
    let workers: WorkerTable = Arc::new(DashMap::new());

    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                debug!("session cancelled");
                break;
            }
            next = source.next() => {
                match next {
                    Some(Ok(envelope)) => {
                        if let Err(e) = dispatch(
                            envelope,
                            &writer,
                            &workers,
                            &breakers,
                            &http_client,
                            &cancellation,
                        )
                        .await
                        {
                            warn!(error = %e, "protocol violation, closing session");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "channel protocol error, closing session");
                        break;
                    }
                    None => {
                        debug!("channel closed by peer");
                        break;
                    }
                }
            }
        }
    }

    // Channel lost: every worker's mailbox sender is dropped here, which
    // unblocks each worker's `recv` with `None` so it can exit and emit its
    // own terminal envelope attempt (best-effort, the writer may be gone).
    workers.clear();
}

async fn dispatch<S>(
    envelope: Envelope,
    writer: &ChannelWriter<S>,
    workers: &WorkerTable,
    breakers: &Arc<BreakerRegistry>,
    http_client: &reqwest::Client,
    cancellation: &CancellationToken,
) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    match envelope {
        Envelope::Hello { version } => {
            info!(version, server_version = PROTOCOL_VERSION, "agent hello");
            Ok(())
        }

        Envelope::HttpRequest { id, .. } => {
            if workers.contains_key(&id) {
                return Err(ProtocolError::DuplicateStreamId);
            }
            workers.insert(id, WorkerEntry::Http);
            let writer = writer.clone();
            let breakers = breakers.clone();
            let http_client = http_client.clone();
            let workers = workers.clone();
            tokio::spawn(async move {
                egress::http::handle(envelope, writer, breakers, http_client).await;
                workers.remove(&id);
            });
            Ok(())
        }

        Envelope::ConnectOpen { id, ref address } => {
            if workers.contains_key(&id) {
                return Err(ProtocolError::DuplicateStreamId);
            }
            let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
            workers.insert(id, WorkerEntry::Stream(tx));
            let address = address.clone();
            let writer = writer.clone();
            let breakers = breakers.clone();
            let workers = workers.clone();
            let child = cancellation.child_token();
            tokio::spawn(async move {
                egress::tcp::handle(id, address, writer, rx, breakers, child).await;
                workers.remove(&id);
            });
            Ok(())
        }

        Envelope::WsOpen { id, .. } => {
            if workers.contains_key(&id) {
                return Err(ProtocolError::DuplicateStreamId);
            }
            let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
            workers.insert(id, WorkerEntry::Stream(tx));
            let writer = writer.clone();
            let breakers = breakers.clone();
            let workers = workers.clone();
            let child = cancellation.child_token();
            tokio::spawn(async move {
                egress::ws::handle(id, envelope, writer, rx, breakers, child).await;
                workers.remove(&id);
            });
            Ok(())
        }

        Envelope::ConnectData { id, .. } | Envelope::ConnectClose { id, .. } => {
            route_to_worker(workers, id, envelope).await
        }
        Envelope::WsMessage { id, .. } | Envelope::WsClose { id, .. } => {
            route_to_worker(workers, id, envelope).await
        }

        // These only ever flow server -> agent; receiving one from an agent
        // is a protocol violation we tolerate by logging and ignoring,
        // rather than tearing down the whole channel over a stray message.
        Envelope::HttpResponse { id, .. }
        | Envelope::ConnectAck { id, .. }
        | Envelope::WsAck { id, .. } => {
            warn!(%id, "ignoring server-direction envelope received from agent");
            Ok(())
        }
    }
}

async fn route_to_worker(workers: &WorkerTable, id: StreamId, envelope: Envelope) -> Result<(), ProtocolError> {
    let sender = match workers.get(&id) {
        None => return Err(ProtocolError::EnvelopeAfterClose),
        Some(entry) => match entry.value() {
            WorkerEntry::Http => return Err(ProtocolError::UnexpectedMidStream),
            WorkerEntry::Stream(tx) => tx.clone(),
        },
    };
    // Backpressure point: if the worker's mailbox is full this await
    // suspends the reader, slowing the whole channel.
    if sender.send(envelope).await.is_err() {
        debug!(%id, "worker mailbox closed, dropping envelope");
    }
    Ok(())
}
