//! Shared fixtures for coordinator tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tutti_protocol::{codec, DocumentDescriptor, Message, PeerId};
use tutti_session::{
    channel, Command, ConnectionOutcome, Input, MemoryStore, Payload, SessionConfig,
    SessionCoordinator, SessionEvent, SessionHandle, SessionInbox, TransferId, Transport,
    TransportError, TransportEvent,
};
use tutti_store::{hash_bytes, ContentStore};

/// A transport request, as seen by the test.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    StartAdvertising { name: String, service_id: String },
    StopAdvertising,
    StartDiscovery,
    StopDiscovery,
    Connect(PeerId),
    Disconnect(PeerId),
    Send { peer: PeerId, message: Message },
    SendFile { peer: PeerId, path: PathBuf },
    CancelTransfer(TransferId),
    StopAllEndpoints,
}

#[derive(Default)]
struct Recorded {
    calls: Vec<Call>,
    failing: HashSet<PeerId>,
    fail_advertising: bool,
    next_transfer: u64,
}

/// Transport that records every request and never produces events by itself.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingTransport {
    fn record(&self, call: Call) {
        self.inner.lock().unwrap().calls.push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.inner.lock().unwrap().calls)
    }

    /// Messages successfully handed to the transport, in order.
    pub fn sent(&self) -> Vec<(PeerId, Message)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send { peer, message } => Some((peer, message)),
                _ => None,
            })
            .collect()
    }

    pub fn take_sent(&self) -> Vec<(PeerId, Message)> {
        self.take_calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Send { peer, message } => Some((peer, message)),
                _ => None,
            })
            .collect()
    }

    pub fn fail_sends_to(&self, peer: &PeerId) {
        self.inner.lock().unwrap().failing.insert(peer.clone());
    }

    pub fn fail_advertising(&self) {
        self.inner.lock().unwrap().fail_advertising = true;
    }
}

impl Transport for RecordingTransport {
    fn start_advertising(&mut self, name: &str, service_id: &str) -> Result<(), TransportError> {
        if self.inner.lock().unwrap().fail_advertising {
            return Err(TransportError::Unavailable("radio off".to_string()));
        }
        self.record(Call::StartAdvertising {
            name: name.to_string(),
            service_id: service_id.to_string(),
        });
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.record(Call::StopAdvertising);
    }

    fn start_discovery(&mut self, _service_id: &str) -> Result<(), TransportError> {
        self.record(Call::StartDiscovery);
        Ok(())
    }

    fn stop_discovery(&mut self) {
        self.record(Call::StopDiscovery);
    }

    fn connect(&mut self, _local_name: &str, peer: &PeerId) -> Result<(), TransportError> {
        self.record(Call::Connect(peer.clone()));
        Ok(())
    }

    fn disconnect(&mut self, peer: &PeerId) {
        self.record(Call::Disconnect(peer.clone()));
    }

    fn send_bytes(&mut self, peer: &PeerId, payload: Bytes) -> Result<(), TransportError> {
        if self.inner.lock().unwrap().failing.contains(peer) {
            return Err(TransportError::NotConnected(peer.clone()));
        }
        let message = codec::decode(&payload).expect("coordinator sent an undecodable message");
        self.record(Call::Send {
            peer: peer.clone(),
            message,
        });
        Ok(())
    }

    fn send_file(&mut self, peer: &PeerId, path: &Path) -> Result<TransferId, TransportError> {
        let transfer = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_transfer += 1;
            TransferId(inner.next_transfer)
        };
        self.record(Call::SendFile {
            peer: peer.clone(),
            path: path.to_path_buf(),
        });
        Ok(transfer)
    }

    fn cancel_transfer(&mut self, transfer: TransferId) {
        self.record(Call::CancelTransfer(transfer));
    }

    fn stop_all_endpoints(&mut self) {
        self.record(Call::StopAllEndpoints);
    }
}

pub fn peer(id: &str) -> PeerId {
    PeerId::new(id)
}

/// A coordinator driven input by input, without a running actor loop.
pub struct Harness {
    pub coordinator: SessionCoordinator<RecordingTransport, MemoryStore>,
    pub events: UnboundedReceiver<SessionEvent>,
    pub transport: RecordingTransport,
    pub prefs: MemoryStore,
    pub store: ContentStore,
    pub inbox: SessionInbox,
    pub handle: SessionHandle,
    pub dir: Arc<TempDir>,
}

impl Harness {
    pub async fn new(name: &str) -> Self {
        let dir = Arc::new(tempfile::tempdir().unwrap());
        Self::build(name, dir, MemoryStore::new()).await
    }

    /// Another device sharing this one's cache directory and preferences.
    pub async fn sharing(&self, name: &str) -> Self {
        Self::build(name, Arc::clone(&self.dir), self.prefs.clone()).await
    }

    async fn build(name: &str, dir: Arc<TempDir>, prefs: MemoryStore) -> Self {
        let config = SessionConfig::default()
            .with_device_name(name)
            .with_cache_dir(dir.path().join("cache"));
        let store = config.open_store().await.unwrap();
        let transport = RecordingTransport::default();
        let (handle, inbox) = channel();
        let (coordinator, events) = SessionCoordinator::new(
            config,
            transport.clone(),
            store.clone(),
            prefs.clone(),
            &inbox,
        );
        Self {
            coordinator,
            events,
            transport,
            prefs,
            store,
            inbox,
            handle,
            dir,
        }
    }

    pub async fn command(&mut self, command: Command) -> bool {
        self.coordinator.process(Input::Command(command)).await
    }

    pub async fn event(&mut self, event: TransportEvent) {
        self.coordinator.process(Input::Transport(event)).await;
    }

    pub async fn message(&mut self, from: &PeerId, message: &Message) {
        let bytes = codec::encode(message).unwrap();
        self.event(TransportEvent::PayloadReceived {
            peer: from.clone(),
            payload: Payload::Bytes(Bytes::from(bytes)),
        })
        .await;
    }

    pub async fn connected(&mut self, from: &PeerId, name: &str) {
        self.event(TransportEvent::ConnectionResult {
            peer: from.clone(),
            name: name.to_string(),
            outcome: ConnectionOutcome::Connected,
        })
        .await;
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Write a document outside the cache, as a user would pick it.
    pub fn write_document(&self, name: &str, contents: &[u8]) -> PathBuf {
        let docs = self.dir.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        let path = docs.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Load a document and start advertising.
    pub async fn lead(&mut self, contents: &[u8], page_count: Option<u32>) -> DocumentDescriptor {
        let path = self.write_document("score.pdf", contents);
        self.command(Command::LoadDocument { path, page_count }).await;
        self.command(Command::StartLeading).await;
        descriptor("score.pdf", contents)
    }

    /// Discover and connect to `leader`.
    pub async fn follow(&mut self, leader: &PeerId) {
        self.command(Command::StartDiscovery).await;
        self.event(TransportEvent::PeerFound {
            peer: leader.clone(),
            name: "Leader".to_string(),
        })
        .await;
        self.connected(leader, "Leader").await;
    }
}

pub fn descriptor(name: &str, contents: &[u8]) -> DocumentDescriptor {
    DocumentDescriptor::new(name, contents.len() as u64, hash_bytes(contents))
}

pub fn statuses(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Status(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

pub fn pages(events: &[SessionEvent]) -> Vec<(u32, usize, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::PageChanged {
                book_page,
                slot,
                local_page,
            } => Some((*book_page, *slot, *local_page)),
            _ => None,
        })
        .collect()
}
