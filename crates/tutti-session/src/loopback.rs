//! In-process transport.
//!
//! A [`LoopbackHub`] stands in for the shared radio medium: every
//! [`LoopbackTransport`] created from it can discover, connect to and send to
//! the others. Files are handed over by path and complete immediately.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, trace};
use tutti_protocol::PeerId;

use crate::transport::{
    ConnectionOutcome, Payload, TransferId, TransferStatus, Transport, TransportError,
    TransportEvent, TransportEventSink,
};

struct Endpoint {
    name: String,
    sink: TransportEventSink,
    advertising: Option<String>,
    discovering: Option<String>,
    links: HashSet<u64>,
}

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<u64, Endpoint>,
    next_endpoint: u64,
    next_transfer: u64,
}

impl HubInner {
    fn deliver(&self, id: u64, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get(&id) {
            if !endpoint.sink.deliver(event) {
                trace!(endpoint = id, "Loopback event dropped, session closed");
            }
        }
    }

    fn unlink(&mut self, a: u64, b: u64) -> bool {
        let removed = self
            .endpoints
            .get_mut(&a)
            .map(|e| e.links.remove(&b))
            .unwrap_or(false);
        if let Some(e) = self.endpoints.get_mut(&b) {
            e.links.remove(&a);
        }
        removed
    }

    fn linked(&self, a: u64, b: u64) -> bool {
        self.endpoints
            .get(&a)
            .map(|e| e.links.contains(&b))
            .unwrap_or(false)
    }

    /// Tear down everything `id` has open, telling the other side.
    fn drop_endpoint_state(&mut self, id: u64) {
        let links: Vec<u64> = self
            .endpoints
            .get(&id)
            .map(|e| e.links.iter().copied().collect())
            .unwrap_or_default();
        for other in links {
            self.unlink(id, other);
            self.deliver(other, TransportEvent::Disconnected { peer: peer_id(id) });
        }
        self.stop_advertising(id);
        if let Some(e) = self.endpoints.get_mut(&id) {
            e.discovering = None;
        }
    }

    fn stop_advertising(&mut self, id: u64) {
        let Some(service) = self.endpoints.get_mut(&id).and_then(|e| e.advertising.take()) else {
            return;
        };
        let watchers: Vec<u64> = self
            .endpoints
            .iter()
            .filter(|(other, e)| **other != id && e.discovering.as_deref() == Some(service.as_str()))
            .map(|(other, _)| *other)
            .collect();
        for other in watchers {
            self.deliver(other, TransportEvent::PeerLost { peer: peer_id(id) });
        }
    }
}

fn peer_id(id: u64) -> PeerId {
    PeerId::new(format!("ep-{}", id))
}

fn endpoint_id(peer: &PeerId) -> Option<u64> {
    peer.as_str().strip_prefix("ep-")?.parse().ok()
}

/// Shared medium connecting loopback transports.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint delivering its events to `sink`.
    pub fn endpoint(&self, sink: TransportEventSink) -> LoopbackTransport {
        let mut inner = self.lock();
        let id = inner.next_endpoint;
        inner.next_endpoint += 1;
        inner.endpoints.insert(
            id,
            Endpoint {
                name: String::new(),
                sink,
                advertising: None,
                discovering: None,
                links: HashSet::new(),
            },
        );
        debug!(endpoint = id, "Loopback endpoint registered");
        LoopbackTransport {
            hub: self.clone(),
            id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One device's view of a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: LoopbackHub,
    id: u64,
}

impl LoopbackTransport {
    /// The id other endpoints know this one by.
    pub fn peer_id(&self) -> PeerId {
        peer_id(self.id)
    }

    fn target(&self, inner: &HubInner, peer: &PeerId) -> Result<u64, TransportError> {
        endpoint_id(peer)
            .filter(|id| inner.endpoints.contains_key(id))
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))
    }

    fn connected_target(&self, inner: &HubInner, peer: &PeerId) -> Result<u64, TransportError> {
        let target = self.target(inner, peer)?;
        if inner.linked(self.id, target) {
            Ok(target)
        } else {
            Err(TransportError::NotConnected(peer.clone()))
        }
    }
}

impl Transport for LoopbackTransport {
    fn start_advertising(&mut self, name: &str, service_id: &str) -> Result<(), TransportError> {
        let mut inner = self.hub.lock();
        let id = self.id;
        if let Some(e) = inner.endpoints.get_mut(&id) {
            e.name = name.to_string();
            e.advertising = Some(service_id.to_string());
        }
        inner.deliver(id, TransportEvent::AdvertisingStarted);

        let watchers: Vec<u64> = inner
            .endpoints
            .iter()
            .filter(|(other, e)| **other != id && e.discovering.as_deref() == Some(service_id))
            .map(|(other, _)| *other)
            .collect();
        for other in watchers {
            inner.deliver(
                other,
                TransportEvent::PeerFound {
                    peer: peer_id(id),
                    name: name.to_string(),
                },
            );
        }
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.hub.lock().stop_advertising(self.id);
    }

    fn start_discovery(&mut self, service_id: &str) -> Result<(), TransportError> {
        let mut inner = self.hub.lock();
        let id = self.id;
        if let Some(e) = inner.endpoints.get_mut(&id) {
            e.discovering = Some(service_id.to_string());
        }
        inner.deliver(id, TransportEvent::DiscoveryStarted);

        let found: Vec<(u64, String)> = inner
            .endpoints
            .iter()
            .filter(|(other, e)| **other != id && e.advertising.as_deref() == Some(service_id))
            .map(|(other, e)| (*other, e.name.clone()))
            .collect();
        for (other, name) in found {
            inner.deliver(
                id,
                TransportEvent::PeerFound {
                    peer: peer_id(other),
                    name,
                },
            );
        }
        Ok(())
    }

    fn stop_discovery(&mut self) {
        if let Some(e) = self.hub.lock().endpoints.get_mut(&self.id) {
            e.discovering = None;
        }
    }

    fn connect(&mut self, local_name: &str, peer: &PeerId) -> Result<(), TransportError> {
        let mut inner = self.hub.lock();
        let target = self.target(&inner, peer)?;
        let id = self.id;

        let (accepting, target_name) = match inner.endpoints.get(&target) {
            Some(e) => (e.advertising.is_some(), e.name.clone()),
            None => return Err(TransportError::UnknownPeer(peer.clone())),
        };
        if !accepting {
            inner.deliver(
                id,
                TransportEvent::ConnectionResult {
                    peer: peer.clone(),
                    name: target_name,
                    outcome: ConnectionOutcome::Rejected,
                },
            );
            return Ok(());
        }

        if let Some(e) = inner.endpoints.get_mut(&id) {
            e.name = local_name.to_string();
            e.links.insert(target);
        }
        if let Some(e) = inner.endpoints.get_mut(&target) {
            e.links.insert(id);
        }
        debug!(from = id, to = target, "Loopback connection established");

        inner.deliver(
            id,
            TransportEvent::ConnectionResult {
                peer: peer.clone(),
                name: target_name,
                outcome: ConnectionOutcome::Connected,
            },
        );
        inner.deliver(
            target,
            TransportEvent::ConnectionResult {
                peer: peer_id(id),
                name: local_name.to_string(),
                outcome: ConnectionOutcome::Connected,
            },
        );
        Ok(())
    }

    fn disconnect(&mut self, peer: &PeerId) {
        let mut inner = self.hub.lock();
        let Some(target) = endpoint_id(peer) else {
            return;
        };
        if inner.unlink(self.id, target) {
            inner.deliver(target, TransportEvent::Disconnected { peer: peer_id(self.id) });
        }
    }

    fn send_bytes(&mut self, peer: &PeerId, payload: Bytes) -> Result<(), TransportError> {
        let inner = self.hub.lock();
        let target = self.connected_target(&inner, peer)?;
        inner.deliver(
            target,
            TransportEvent::PayloadReceived {
                peer: peer_id(self.id),
                payload: Payload::Bytes(payload),
            },
        );
        Ok(())
    }

    fn send_file(&mut self, peer: &PeerId, path: &Path) -> Result<TransferId, TransportError> {
        let mut inner = self.hub.lock();
        let target = self.connected_target(&inner, peer)?;
        let size = std::fs::metadata(path)?.len();

        let transfer = TransferId(inner.next_transfer);
        inner.next_transfer += 1;
        let me = peer_id(self.id);

        inner.deliver(
            target,
            TransportEvent::PayloadReceived {
                peer: me.clone(),
                payload: Payload::File {
                    transfer,
                    path: path.to_path_buf(),
                },
            },
        );
        for (bytes_done, status) in [(0, TransferStatus::InProgress), (size, TransferStatus::Success)] {
            for (endpoint, other) in [(self.id, peer.clone()), (target, me.clone())] {
                inner.deliver(
                    endpoint,
                    TransportEvent::TransferUpdate {
                        peer: other,
                        transfer,
                        bytes_done,
                        bytes_total: size,
                        status,
                    },
                );
            }
        }
        Ok(transfer)
    }

    fn cancel_transfer(&mut self, transfer: TransferId) {
        trace!(%transfer, "Loopback transfers complete synchronously, nothing to cancel");
    }

    fn stop_all_endpoints(&mut self) {
        self.hub.lock().drop_endpoint_state(self.id);
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let mut inner = self.hub.lock();
        inner.drop_endpoint_state(self.id);
        inner.endpoints.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{channel, Input, SessionInbox};

    fn endpoint(hub: &LoopbackHub) -> (crate::SessionHandle, SessionInbox, LoopbackTransport) {
        let (handle, inbox) = channel();
        let transport = hub.endpoint(inbox.transport_sink());
        (handle, inbox, transport)
    }

    fn drain(inbox: &mut SessionInbox) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Some(input) = inbox.try_recv() {
            if let Input::Transport(event) = input {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn discovery_finds_existing_advertiser() {
        let hub = LoopbackHub::new();
        let (_h1, mut leader_inbox, mut leader) = endpoint(&hub);
        let (_h2, mut follower_inbox, mut follower) = endpoint(&hub);

        leader.start_advertising("Violin I", "svc").unwrap();
        follower.start_discovery("svc").unwrap();

        assert!(matches!(
            drain(&mut leader_inbox).as_slice(),
            [TransportEvent::AdvertisingStarted]
        ));
        let events = drain(&mut follower_inbox);
        assert!(matches!(events[0], TransportEvent::DiscoveryStarted));
        match &events[1] {
            TransportEvent::PeerFound { peer, name } => {
                assert_eq!(*peer, leader.peer_id());
                assert_eq!(name, "Violin I");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn other_service_is_invisible() {
        let hub = LoopbackHub::new();
        let (_h1, _leader_inbox, mut leader) = endpoint(&hub);
        let (_h2, mut follower_inbox, mut follower) = endpoint(&hub);

        leader.start_advertising("Violin I", "rehearsal-a").unwrap();
        follower.start_discovery("rehearsal-b").unwrap();

        assert!(matches!(
            drain(&mut follower_inbox).as_slice(),
            [TransportEvent::DiscoveryStarted]
        ));
    }

    #[tokio::test]
    async fn connect_send_and_disconnect() {
        let hub = LoopbackHub::new();
        let (_h1, mut leader_inbox, mut leader) = endpoint(&hub);
        let (_h2, mut follower_inbox, mut follower) = endpoint(&hub);

        leader.start_advertising("Violin I", "svc").unwrap();
        follower.connect("Viola", &leader.peer_id()).unwrap();
        drain(&mut follower_inbox);
        let joined = drain(&mut leader_inbox);
        assert!(joined.iter().any(|e| matches!(
            e,
            TransportEvent::ConnectionResult { name, outcome: ConnectionOutcome::Connected, .. }
                if name == "Viola"
        )));

        leader
            .send_bytes(&follower.peer_id(), Bytes::from_static(b"hello"))
            .unwrap();
        match drain(&mut follower_inbox).pop() {
            Some(TransportEvent::PayloadReceived {
                payload: Payload::Bytes(bytes),
                ..
            }) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("unexpected {:?}", other),
        }

        follower.disconnect(&leader.peer_id());
        assert!(matches!(
            drain(&mut leader_inbox).as_slice(),
            [TransportEvent::Disconnected { .. }]
        ));
        assert!(matches!(
            leader.send_bytes(&follower.peer_id(), Bytes::new()),
            Err(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn connect_to_non_advertiser_is_rejected() {
        let hub = LoopbackHub::new();
        let (_h1, _a_inbox, a) = endpoint(&hub);
        let (_h2, mut b_inbox, mut b) = endpoint(&hub);

        b.connect("B", &a.peer_id()).unwrap();

        assert!(matches!(
            drain(&mut b_inbox).as_slice(),
            [TransportEvent::ConnectionResult { outcome: ConnectionOutcome::Rejected, .. }]
        ));
        assert!(matches!(
            b.connect("B", &PeerId::new("ep-99")),
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn dropping_an_endpoint_disconnects_its_peers() {
        let hub = LoopbackHub::new();
        let (_h1, mut leader_inbox, mut leader) = endpoint(&hub);
        let (_h2, _follower_inbox, mut follower) = endpoint(&hub);

        leader.start_advertising("Violin I", "svc").unwrap();
        follower.connect("Viola", &leader.peer_id()).unwrap();
        drain(&mut leader_inbox);

        drop(follower);

        assert!(matches!(
            drain(&mut leader_inbox).as_slice(),
            [TransportEvent::Disconnected { .. }]
        ));
    }

    #[tokio::test]
    async fn file_transfer_reports_to_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("score.pdf");
        std::fs::write(&path, b"%PDF-1.7 tiny").unwrap();

        let hub = LoopbackHub::new();
        let (_h1, mut leader_inbox, mut leader) = endpoint(&hub);
        let (_h2, mut follower_inbox, mut follower) = endpoint(&hub);
        leader.start_advertising("Violin I", "svc").unwrap();
        follower.connect("Viola", &leader.peer_id()).unwrap();
        drain(&mut leader_inbox);
        drain(&mut follower_inbox);

        let transfer = leader.send_file(&follower.peer_id(), &path).unwrap();

        let received = drain(&mut follower_inbox);
        assert!(matches!(
            &received[0],
            TransportEvent::PayloadReceived { payload: Payload::File { transfer: t, .. }, .. }
                if *t == transfer
        ));
        assert!(matches!(
            received.last(),
            Some(TransportEvent::TransferUpdate { status: TransferStatus::Success, bytes_done: 13, .. })
        ));
        assert!(matches!(
            drain(&mut leader_inbox).last(),
            Some(TransportEvent::TransferUpdate { status: TransferStatus::Success, .. })
        ));
    }
}
