//! Transport seam.
//!
//! The coordinator never talks to radios or sockets directly. It issues
//! non-blocking requests through [`Transport`], and everything the transport
//! observes comes back as a [`TransportEvent`] pushed into the coordinator's
//! inbox through a [`TransportEventSink`].

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::WeakUnboundedSender;
use tutti_protocol::PeerId;

use crate::coordinator::Input;

/// Transport-assigned id of one file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Synchronous failure of a transport request.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to {0}")]
    NotConnected(PeerId),

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Requests the coordinator can make of a peer-to-peer transport.
///
/// Every method returns as soon as the request is issued. Outcomes (a
/// connection being accepted, a transfer completing) arrive later as events.
pub trait Transport: Send + 'static {
    fn start_advertising(&mut self, name: &str, service_id: &str) -> Result<(), TransportError>;

    fn stop_advertising(&mut self);

    fn start_discovery(&mut self, service_id: &str) -> Result<(), TransportError>;

    fn stop_discovery(&mut self);

    /// Ask `peer` for a connection, introducing ourselves as `local_name`.
    fn connect(&mut self, local_name: &str, peer: &PeerId) -> Result<(), TransportError>;

    fn disconnect(&mut self, peer: &PeerId);

    fn send_bytes(&mut self, peer: &PeerId, payload: Bytes) -> Result<(), TransportError>;

    /// Start sending a file. Progress is reported via [`TransportEvent::TransferUpdate`].
    fn send_file(&mut self, peer: &PeerId, path: &Path) -> Result<TransferId, TransportError>;

    fn cancel_transfer(&mut self, transfer: TransferId);

    /// Drop every connection, advertisement and discovery at once.
    fn stop_all_endpoints(&mut self);
}

/// Outcome of a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Connected,
    Rejected,
    Error(String),
}

/// State of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Success,
    Failure,
    Canceled,
}

/// Byte stream handed over by the transport. Readable once the transfer succeeds.
pub struct IncomingStream(Box<dyn AsyncRead + Send + Unpin>);

impl IncomingStream {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self(Box::new(reader))
    }

    pub fn into_inner(self) -> Box<dyn AsyncRead + Send + Unpin> {
        self.0
    }
}

impl fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IncomingStream")
    }
}

/// Data received from a peer.
#[derive(Debug)]
pub enum Payload {
    /// A complete message.
    Bytes(Bytes),
    /// A file the transport wrote to disk.
    File { transfer: TransferId, path: PathBuf },
    /// A file delivered as a stream.
    Stream { transfer: TransferId, stream: IncomingStream },
}

/// Everything a transport reports back.
#[derive(Debug)]
pub enum TransportEvent {
    AdvertisingStarted,
    AdvertisingFailed { reason: String },
    DiscoveryStarted,
    DiscoveryFailed { reason: String },
    PeerFound { peer: PeerId, name: String },
    PeerLost { peer: PeerId },
    ConnectionResult {
        peer: PeerId,
        name: String,
        outcome: ConnectionOutcome,
    },
    Disconnected { peer: PeerId },
    PayloadReceived { peer: PeerId, payload: Payload },
    TransferUpdate {
        peer: PeerId,
        transfer: TransferId,
        bytes_done: u64,
        bytes_total: u64,
        status: TransferStatus,
    },
}

/// Where a transport delivers its events.
///
/// Holds only a weak reference to the coordinator inbox, so a transport
/// outliving every [`SessionHandle`](crate::SessionHandle) doesn't keep the
/// coordinator alive.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    inbox: WeakUnboundedSender<Input>,
}

impl TransportEventSink {
    pub(crate) fn new(inbox: WeakUnboundedSender<Input>) -> Self {
        Self { inbox }
    }

    /// Push an event to the coordinator. Returns false once the session is gone.
    pub fn deliver(&self, event: TransportEvent) -> bool {
        match self.inbox.upgrade() {
            Some(tx) => tx.send(Input::Transport(event)).is_ok(),
            None => false,
        }
    }
}
