//! # Agent-side Stream Registry
//!
//! Maps a minted [`StreamId`] to whatever the caller is waiting on (spec
//! §4.2 / §3 "Registry entry"): a one-shot slot for HTTP, or a pending-ack
//! slot plus a live data mailbox for CONNECT/WebSocket streams.
//!
//! The map itself is guarded by a plain [`std::sync::Mutex`] — the critical
//! section is always a handful of hashmap operations, never a suspension
//! point, so a blocking mutex is the right tool (spec §5: "no task holds
//! the registry lock across an await").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use tunnel_protocol::{Envelope, ProtocolError, StreamId};

enum EntryKind {
    /// Awaiting exactly one `http_response`.
    Http(oneshot::Sender<Envelope>),
    /// Awaiting a `connect_ack`/`ws_ack`, then a live mailbox for
    /// `connect_data`/`connect_close` or `ws_message`/`ws_close`.
    Stream {
        ack: Option<oneshot::Sender<Envelope>>,
        data: mpsc::Sender<Envelope>,
    },
}

struct Entry {
    created: Instant,
    kind: EntryKind,
}

#[derive(Default)]
pub struct StreamRegistry {
    entries: Mutex<HashMap<StreamId, Entry>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_http(&self, id: StreamId, slot: oneshot::Sender<Envelope>) -> Result<(), ProtocolError> {
        self.insert(id, EntryKind::Http(slot))
    }

    pub fn register_stream(
        &self,
        id: StreamId,
        ack: oneshot::Sender<Envelope>,
        data: mpsc::Sender<Envelope>,
    ) -> Result<(), ProtocolError> {
        self.insert(id, EntryKind::Stream { ack: Some(ack), data })
    }

    fn insert(&self, id: StreamId, kind: EntryKind) -> Result<(), ProtocolError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&id) {
            return Err(ProtocolError::DuplicateStreamId);
        }
        entries.insert(id, Entry { created: Instant::now(), kind });
        Ok(())
    }

    /// Removes and returns the full entry — used for `http_response` and
    /// `connect_close`/`ws_close`, both of which terminate the stream.
    pub fn take(&self, id: StreamId) -> Option<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.remove(&id)?;
        match entry.kind {
            EntryKind::Http(tx) => {
                // Caller uses `take_http` for the happy path; reaching here
                // means a non-response terminal event hit an HTTP stream,
                // which the dropped sender reports as ChannelLost.
                drop(tx);
            }
            EntryKind::Stream { ack, .. } => drop(ack),
        }
        Some(())
    }

    pub fn take_http(&self, id: StreamId) -> Option<oneshot::Sender<Envelope>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(&id)?.kind {
            EntryKind::Http(tx) => Some(tx),
            EntryKind::Stream { .. } => None,
        }
    }

    /// Fulfils a stream's pending ack without removing the entry — the data
    /// mailbox stays registered for subsequent data/close envelopes.
    pub fn take_ack(&self, id: StreamId) -> Option<oneshot::Sender<Envelope>> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&id)?;
        match &mut entry.kind {
            EntryKind::Stream { ack, .. } => ack.take(),
            EntryKind::Http(_) => None,
        }
    }

    /// Clones the data mailbox for a live stream without removing it.
    pub fn data_sender(&self, id: StreamId) -> Option<mpsc::Sender<Envelope>> {
        let entries = self.entries.lock().unwrap();
        match &entries.get(&id)?.kind {
            EntryKind::Stream { data, .. } => Some(data.clone()),
            EntryKind::Http(_) => None,
        }
    }

    /// `take_http` for the reader pump: distinguishes "no such stream" from
    /// "that id belongs to a CONNECT/WS stream", each a distinct protocol
    /// violation rather than a silently dropped envelope.
    pub fn take_http_checked(&self, id: StreamId) -> Result<oneshot::Sender<Envelope>, ProtocolError> {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get(&id) else {
            return Err(ProtocolError::EnvelopeAfterClose);
        };
        if !matches!(entry.kind, EntryKind::Http(_)) {
            return Err(ProtocolError::UnexpectedMidStream);
        }
        match entries.remove(&id).map(|e| e.kind) {
            Some(EntryKind::Http(tx)) => Ok(tx),
            _ => Err(ProtocolError::EnvelopeAfterClose),
        }
    }

    /// `take_ack` for the reader pump: an ack for an id with no entry, or
    /// whose ack was already delivered, is a protocol violation; an ack
    /// aimed at a single-shot HTTP entry is the wrong-kind violation.
    pub fn take_ack_checked(&self, id: StreamId) -> Result<oneshot::Sender<Envelope>, ProtocolError> {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&id) else {
            return Err(ProtocolError::EnvelopeAfterClose);
        };
        match &mut entry.kind {
            EntryKind::Http(_) => Err(ProtocolError::UnexpectedMidStream),
            EntryKind::Stream { ack, .. } => ack.take().ok_or(ProtocolError::EnvelopeAfterClose),
        }
    }

    /// `data_sender` for the reader pump: data/message for an id with no
    /// entry (already closed, or never opened) or for a single-shot HTTP
    /// entry is a protocol violation; data that beats its own ack off the
    /// wire is also a violation (the agent never returns a handle to its
    /// caller until the ack arrives, so legitimate data is always post-ack).
    pub fn data_sender_checked(&self, id: StreamId) -> Result<mpsc::Sender<Envelope>, ProtocolError> {
        let entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get(&id) else {
            return Err(ProtocolError::EnvelopeAfterClose);
        };
        match &entry.kind {
            EntryKind::Http(_) => Err(ProtocolError::UnexpectedMidStream),
            EntryKind::Stream { ack: Some(_), .. } => Err(ProtocolError::DataBeforeAck),
            EntryKind::Stream { ack: None, data } => Ok(data.clone()),
        }
    }

    /// Removes every entry, dropping their senders so every waiting caller
    /// observes channel loss (dropped oneshot => RecvError; dropped mpsc
    /// sender => the receiver eventually sees `None`).
    pub fn drain(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts entries that are still awaiting their first response/ack
    /// past `timeout`. Established byte-streams (ack already delivered)
    /// are never swept here — only the registry's tracked creation time,
    /// not stream activity, is a signal this code has.
    pub fn sweep_once(&self, timeout: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let stale: Vec<StreamId> = entries
            .iter()
            .filter(|(_, entry)| {
                now.duration_since(entry.created) > timeout
                    && matches!(
                        &entry.kind,
                        EntryKind::Http(_) | EntryKind::Stream { ack: Some(_), .. }
                    )
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            entries.remove(id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "swept stale registry entries");
        }
        stale.len()
    }

    /// Owns the periodic sweep per spec (§4.2/§9): a background task that
    /// runs until `cancellation` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep_once(timeout);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_protocol::StreamId;

    #[test]
    fn register_rejects_duplicate_id() {
        let reg = StreamRegistry::new();
        let id = StreamId::new();
        let (tx, _rx) = oneshot::channel();
        reg.register_http(id, tx).unwrap();
        let (tx2, _rx2) = oneshot::channel();
        assert!(matches!(reg.register_http(id, tx2), Err(ProtocolError::DuplicateStreamId)));
    }

    #[test]
    fn take_http_removes_entry() {
        let reg = StreamRegistry::new();
        let id = StreamId::new();
        let (tx, _rx) = oneshot::channel();
        reg.register_http(id, tx).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.take_http(id).is_some());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn ack_then_data_sender_both_work_without_double_remove() {
        let reg = StreamRegistry::new();
        let id = StreamId::new();
        let (ack_tx, _ack_rx) = oneshot::channel();
        let (data_tx, _data_rx) = mpsc::channel(8);
        reg.register_stream(id, ack_tx, data_tx).unwrap();

        assert!(reg.take_ack(id).is_some());
        assert!(reg.take_ack(id).is_none(), "ack can only be taken once");
        assert!(reg.data_sender(id).is_some(), "data sender survives ack consumption");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn data_sender_checked_rejects_data_before_ack() {
        let reg = StreamRegistry::new();
        let id = StreamId::new();
        let (ack_tx, _ack_rx) = oneshot::channel();
        let (data_tx, _data_rx) = mpsc::channel(8);
        reg.register_stream(id, ack_tx, data_tx).unwrap();

        assert!(matches!(reg.data_sender_checked(id), Err(ProtocolError::DataBeforeAck)));
        reg.take_ack(id);
        assert!(reg.data_sender_checked(id).is_ok());
    }

    #[test]
    fn checked_lookups_reject_wrong_kind_and_unknown_ids() {
        let reg = StreamRegistry::new();
        let http_id = StreamId::new();
        let (tx, _rx) = oneshot::channel();
        reg.register_http(http_id, tx).unwrap();

        assert!(matches!(reg.data_sender_checked(http_id), Err(ProtocolError::UnexpectedMidStream)));
        assert!(matches!(reg.take_ack_checked(http_id), Err(ProtocolError::UnexpectedMidStream)));

        let unknown_id = StreamId::new();
        assert!(matches!(reg.take_http_checked(unknown_id), Err(ProtocolError::EnvelopeAfterClose)));
        assert!(matches!(reg.take_ack_checked(unknown_id), Err(ProtocolError::EnvelopeAfterClose)));
        assert!(matches!(reg.data_sender_checked(unknown_id), Err(ProtocolError::EnvelopeAfterClose)));
    }

    #[test]
    fn drain_empties_registry() {
        let reg = StreamRegistry::new();
        let (tx, _rx) = oneshot::channel();
        reg.register_http(StreamId::new(), tx).unwrap();
        assert_eq!(reg.drain(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn sweep_evicts_only_unacked_entries_past_timeout() {
        let reg = StreamRegistry::new();
        let unacked = StreamId::new();
        let (ack_tx, _ack_rx) = oneshot::channel();
        let (data_tx, _data_rx) = mpsc::channel(8);
        reg.register_stream(unacked, ack_tx, data_tx).unwrap();

        let acked = StreamId::new();
        let (ack_tx2, _ack_rx2) = oneshot::channel();
        let (data_tx2, _data_rx2) = mpsc::channel(8);
        reg.register_stream(acked, ack_tx2, data_tx2).unwrap();
        reg.take_ack(acked);

        std::thread::sleep(Duration::from_millis(10));
        let evicted = reg.sweep_once(Duration::from_millis(5));
        assert_eq!(evicted, 1);
        assert!(reg.data_sender(unacked).is_none());
        assert!(reg.data_sender(acked).is_some());
    }
}
