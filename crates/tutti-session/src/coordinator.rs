//! Session coordinator.
//!
//! A single actor owns all session state: role, roster, active document, book
//! page and in-flight transfers. Commands from the UI, transport events and the
//! discovery timer all arrive through one inbox and are handled strictly one at
//! a time by [`SessionCoordinator::process`].
//!
//! # Roles
//!
//! - **Leader** (`Advertising`, `Leading`): owns the document and the book page.
//!   Newcomers receive `FileInfo`, then every follower receives its own view of
//!   the arrangement, then the current page.
//! - **Follower** (`Following`): mirrors the leader. A page is only shown once
//!   the announced document is available locally *and* the leader has sent a page.
//!
//! A follower that loses its leader reports it and goes straight back to
//! discovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use tutti_protocol::{
    arrangement, codec, BookPage, Device, Direction, DocumentDescriptor, Message, PeerId, Roster,
};
use tutti_store::{ContentHash, ContentStore};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{Role, SessionEvent, SessionSnapshot, SessionState};
use crate::preferences::{KeyValueStore, Preferences};
use crate::transport::{
    ConnectionOutcome, IncomingStream, Payload, TransferId, TransferStatus, Transport,
    TransportEvent, TransportEventSink,
};

/// Requests accepted by the coordinator.
#[derive(Debug)]
pub enum Command {
    /// Import a file and make it the active document.
    LoadDocument {
        path: PathBuf,
        page_count: Option<u32>,
    },
    /// Reopen the last document from the cache.
    ResumeLastDocument { page_count: Option<u32> },
    /// Page count reported by the renderer, used to bound `Next`.
    SetPageCount(u32),
    StartLeading,
    StopLeading,
    StartDiscovery,
    StopDiscovery,
    LeaveSession,
    /// Ask the leader for the announced document again after a failed transfer.
    RequestFile,
    TurnPage(Direction),
    /// Show `page` on this device.
    GoToPage(u32),
    EvictCache,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum Input {
    Command(Command),
    Transport(TransportEvent),
    DiscoveryTimeout { generation: u64 },
}

/// Create the coordinator inbox and a handle that feeds it.
pub fn channel() -> (SessionHandle, SessionInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let weak = tx.downgrade();
    (SessionHandle { tx }, SessionInbox { rx, tx: weak })
}

/// Receiving end of the coordinator inbox.
#[derive(Debug)]
pub struct SessionInbox {
    rx: UnboundedReceiver<Input>,
    tx: WeakUnboundedSender<Input>,
}

impl SessionInbox {
    /// Sink to hand to the transport.
    pub fn transport_sink(&self) -> TransportEventSink {
        TransportEventSink::new(self.tx.clone())
    }

    pub async fn recv(&mut self) -> Option<Input> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Input> {
        self.rx.try_recv().ok()
    }
}

/// Cloneable handle for driving a running coordinator.
///
/// The coordinator shuts down once every handle is dropped.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: UnboundedSender<Input>,
}

impl SessionHandle {
    pub fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(Input::Command(command))
            .map_err(|_| Error::SessionClosed)
    }

    pub fn load_document(&self, path: impl Into<PathBuf>, page_count: Option<u32>) -> Result<()> {
        self.send(Command::LoadDocument {
            path: path.into(),
            page_count,
        })
    }

    pub fn resume_last_document(&self, page_count: Option<u32>) -> Result<()> {
        self.send(Command::ResumeLastDocument { page_count })
    }

    pub fn set_page_count(&self, page_count: u32) -> Result<()> {
        self.send(Command::SetPageCount(page_count))
    }

    pub fn start_leading(&self) -> Result<()> {
        self.send(Command::StartLeading)
    }

    pub fn stop_leading(&self) -> Result<()> {
        self.send(Command::StopLeading)
    }

    pub fn start_discovery(&self) -> Result<()> {
        self.send(Command::StartDiscovery)
    }

    pub fn stop_discovery(&self) -> Result<()> {
        self.send(Command::StopDiscovery)
    }

    pub fn leave_session(&self) -> Result<()> {
        self.send(Command::LeaveSession)
    }

    pub fn request_file(&self) -> Result<()> {
        self.send(Command::RequestFile)
    }

    pub fn turn_page(&self, direction: Direction) -> Result<()> {
        self.send(Command::TurnPage(direction))
    }

    pub fn go_to_page(&self, page: u32) -> Result<()> {
        self.send(Command::GoToPage(page))
    }

    pub fn evict_cache(&self) -> Result<()> {
        self.send(Command::EvictCache)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

struct ActiveDocument {
    descriptor: DocumentDescriptor,
    /// Local copy, once available.
    path: Option<PathBuf>,
}

enum IncomingSource {
    File(PathBuf),
    Stream(IncomingStream),
}

struct IncomingTransfer {
    peer: PeerId,
    expected: ContentHash,
    source: IncomingSource,
}

struct DiscoveryTimer {
    generation: u64,
    task: JoinHandle<()>,
}

/// The session state machine.
pub struct SessionCoordinator<T, K> {
    config: SessionConfig,
    transport: T,
    store: ContentStore,
    preferences: Preferences<K>,
    events: UnboundedSender<SessionEvent>,
    inbox: WeakUnboundedSender<Input>,

    state: SessionState,
    /// Leader side, in join order. Slot = index + 1.
    followers: Vec<Device>,
    /// Follower side, as last received from the leader.
    roster: Roster,
    document: Option<ActiveDocument>,
    page_count: Option<u32>,
    book_page: BookPage,
    /// Follower has received a page from its current leader.
    page_received: bool,
    leader: Option<PeerId>,
    connecting: Option<PeerId>,
    outgoing: HashMap<TransferId, PeerId>,
    incoming: HashMap<TransferId, IncomingTransfer>,
    discovery_timer: Option<DiscoveryTimer>,
    discovery_generation: u64,
}

impl<T: Transport, K: KeyValueStore> SessionCoordinator<T, K> {
    /// Create a coordinator reading from `inbox`. Returns it with its event stream.
    pub fn new(
        config: SessionConfig,
        transport: T,
        store: ContentStore,
        preferences: K,
        inbox: &SessionInbox,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        debug!(
            device = %config.device_name,
            service = %config.service_id,
            cache = %store.root().display(),
            "Created session coordinator"
        );
        let coordinator = Self {
            config,
            transport,
            store,
            preferences: Preferences::new(preferences),
            events,
            inbox: inbox.tx.clone(),
            state: SessionState::Idle,
            followers: Vec::new(),
            roster: Roster::new(),
            document: None,
            page_count: None,
            book_page: 0,
            page_received: false,
            leader: None,
            connecting: None,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            discovery_timer: None,
            discovery_generation: 0,
        };
        (coordinator, events_rx)
    }

    /// Run until shut down or until every [`SessionHandle`] is dropped.
    pub async fn run(mut self, mut inbox: SessionInbox) {
        match self.store.evict_expired().await {
            Ok(report) => debug!(
                removed = report.removed,
                retained = report.retained,
                "Startup cache sweep"
            ),
            Err(e) => warn!(error = %e, "Startup cache sweep failed"),
        }

        while let Some(input) = inbox.recv().await {
            if !self.process(input).await {
                return;
            }
        }
        debug!("All session handles dropped");
        self.shutdown();
    }

    /// Handle one input. Returns false after shutdown.
    pub async fn process(&mut self, input: Input) -> bool {
        match input {
            Input::Command(Command::Shutdown) => {
                self.shutdown();
                return false;
            }
            Input::Command(command) => self.handle_command(command).await,
            Input::Transport(event) => self.handle_transport(event).await,
            Input::DiscoveryTimeout { generation } => self.on_discovery_timeout(generation),
        }
        true
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn preferences(&self) -> &Preferences<K> {
        &self.preferences
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            roster: self.current_roster(),
            document: self.document.as_ref().map(|d| d.descriptor.clone()),
            document_ready: self.document_ready(),
            book_page: self.book_page,
            slot: self.local_slot(),
            page_count: self.page_count,
            leader: self.leader.clone(),
            pending_transfers: self.outgoing.len() + self.incoming.len(),
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::LoadDocument { path, page_count } => {
                self.load_document(&path, page_count).await
            }
            Command::ResumeLastDocument { page_count } => {
                self.resume_last_document(page_count).await
            }
            Command::SetPageCount(count) => {
                debug!(count, "Page count set");
                self.page_count = Some(count);
            }
            Command::StartLeading => self.start_leading(),
            Command::StopLeading => self.stop_leading(),
            Command::StartDiscovery => self.start_discovery(),
            Command::StopDiscovery => self.stop_discovery(),
            Command::LeaveSession => self.leave_session(),
            Command::RequestFile => self.request_file().await,
            Command::TurnPage(direction) => self.turn_page(direction),
            Command::GoToPage(page) => self.go_to_page(page),
            Command::EvictCache => self.evict_cache().await,
            Command::Snapshot(reply) => {
                if reply.send(self.snapshot()).is_err() {
                    trace!("Snapshot requester went away");
                }
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    async fn load_document(&mut self, path: &Path, page_count: Option<u32>) {
        if self.state == SessionState::Following {
            self.status("Cannot open a document while following a leader.");
            return;
        }

        let stored = match self.store.put_file(path).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to import document");
                self.status(format!("Failed to open document: {}", e));
                return;
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| stored.hash.to_hex());
        let descriptor = DocumentDescriptor::new(name, stored.size, stored.hash);
        self.open_document(descriptor, stored.path, page_count);
    }

    async fn resume_last_document(&mut self, page_count: Option<u32>) {
        if self.state == SessionState::Following {
            self.status("Cannot open a document while following a leader.");
            return;
        }
        let Some(hash) = self.preferences.last_opened() else {
            self.status("No previously opened document.");
            return;
        };

        match self.store.get(&hash).await {
            Ok(Some(stored)) => {
                let name = self
                    .preferences
                    .last_opened_name()
                    .unwrap_or_else(|| hash.to_hex());
                let descriptor = DocumentDescriptor::new(name, stored.size, hash);
                self.open_document(descriptor, stored.path, page_count);
            }
            Ok(None) => {
                info!(hash = %hash.short(), "Last opened document is gone from the cache");
                self.preferences.clear_last_page(&hash);
                self.preferences.clear_last_opened();
                self.status("Last opened document is no longer cached.");
            }
            Err(e) => {
                warn!(hash = %hash.short(), error = %e, "Cache lookup failed");
                self.status(format!("Failed to reopen document: {}", e));
            }
        }
    }

    /// Make a locally available document active, resuming its last page.
    fn open_document(&mut self, descriptor: DocumentDescriptor, path: PathBuf, page_count: Option<u32>) {
        self.cancel_outgoing();

        let last_viewed_page = self.preferences.last_page(&descriptor.content_hash);
        let mut book_page = last_viewed_page
            .map(|page| arrangement::book_page_for(page, 0))
            .unwrap_or(0);
        if let Some(count) = page_count {
            book_page = book_page.min(count.saturating_sub(1));
        }

        info!(
            name = %descriptor.name,
            hash = %descriptor.content_hash.short(),
            size = descriptor.size_bytes,
            book_page,
            "Document opened"
        );
        self.preferences.set_last_opened(&descriptor);
        self.emit(SessionEvent::DocumentReady {
            document: descriptor.clone(),
            path: path.clone(),
            last_viewed_page,
        });

        self.document = Some(ActiveDocument {
            descriptor: descriptor.clone(),
            path: Some(path),
        });
        self.page_count = page_count;
        self.book_page = book_page;
        self.show_page(0);

        if self.state.role() == Role::Leader {
            for peer in self.follower_ids() {
                self.send(&peer, &Message::FileInfo(descriptor.clone()));
            }
            self.broadcast(&Message::PageChanged { book_page });
        }
    }

    fn start_leading(&mut self) {
        match self.state {
            SessionState::Advertising | SessionState::Leading => {
                debug!("Already leading");
                return;
            }
            SessionState::Following => {
                self.status("Leave the current session before leading one.");
                self.emit(SessionEvent::AdvertisingFailed);
                return;
            }
            SessionState::Discovering => self.end_discovery(),
            SessionState::Idle => {}
        }

        if !self.document_ready() {
            self.status("No document loaded. Cannot start leading session.");
            self.set_state(SessionState::Idle);
            self.emit(SessionEvent::AdvertisingFailed);
            return;
        }

        match self
            .transport
            .start_advertising(&self.config.device_name, &self.config.service_id)
        {
            Ok(()) => self.set_state(SessionState::Advertising),
            Err(e) => {
                warn!(error = %e, "Failed to start advertising");
                self.set_state(SessionState::Idle);
                self.status(format!("Failed to start advertising: {}", e));
                self.emit(SessionEvent::AdvertisingFailed);
            }
        }
    }

    fn stop_leading(&mut self) {
        if self.state.role() != Role::Leader {
            debug!(state = %self.state, "Not leading, nothing to stop");
            return;
        }
        self.transport.stop_advertising();
        for peer in self.follower_ids() {
            self.transport.disconnect(&peer);
        }
        self.cancel_outgoing();
        self.followers.clear();
        self.set_state(SessionState::Idle);
        self.status("Stopped leading session.");
        self.emit(SessionEvent::LeadingStopped);
    }

    fn start_discovery(&mut self) {
        match self.state {
            SessionState::Advertising | SessionState::Leading => {
                self.status("Stop leading before searching for a leader.");
            }
            SessionState::Following => {
                self.status("Already following a leader.");
            }
            SessionState::Idle | SessionState::Discovering => self.begin_discovery(),
        }
    }

    fn stop_discovery(&mut self) {
        if self.state != SessionState::Discovering {
            debug!(state = %self.state, "Not discovering, nothing to stop");
            return;
        }
        self.end_discovery();
        self.set_state(SessionState::Idle);
        self.status("Stopped searching for a leader.");
    }

    fn leave_session(&mut self) {
        if self.state != SessionState::Following {
            debug!(state = %self.state, "Not following, nothing to leave");
            return;
        }
        if let Some(leader) = self.leader.clone() {
            self.transport.disconnect(&leader);
        }
        self.reset_follower();
        self.set_state(SessionState::Idle);
        self.status("Left session.");
    }

    async fn request_file(&mut self) {
        let Some(leader) = self.leader.clone().filter(|_| self.state == SessionState::Following)
        else {
            debug!(state = %self.state, "Not following, no file to request");
            return;
        };
        let Some(hash) = self.document.as_ref().map(|d| d.descriptor.content_hash) else {
            self.status("No document announced yet.");
            return;
        };
        if self.document_ready() {
            debug!(hash = %hash.short(), "Document already available");
            return;
        }
        if !self.incoming.is_empty() {
            debug!(pending = self.incoming.len(), "File already on its way");
            return;
        }
        info!(%leader, hash = %hash.short(), "Requesting document again");
        self.fetch_document(leader, hash).await;
    }

    fn turn_page(&mut self, direction: Direction) {
        match self.state.role() {
            Role::Leader => self.apply_turn(direction, self.followers.len() + 1),
            Role::Follower => {
                if let Some(leader) = self.leader.clone() {
                    debug!(%direction, "Asking leader to turn");
                    self.send(&leader, &Message::TurnRequest { direction });
                }
            }
            Role::None if self.document_ready() => self.apply_turn(direction, 1),
            Role::None => debug!("No document to turn"),
        }
    }

    fn go_to_page(&mut self, page: u32) {
        if self.state.role() == Role::Follower {
            self.status("Only the leader can change pages.");
            return;
        }
        if !self.document_ready() {
            debug!("No document to page through");
            return;
        }
        if let Some(count) = self.page_count {
            let roster_size = match self.state.role() {
                Role::Leader => self.followers.len() + 1,
                _ => 1,
            };
            let last_shown = u64::from(page) + u64::from(arrangement::stride(roster_size)) - 1;
            if last_shown >= u64::from(count) {
                self.status(format!("Page {} is past the end of the document.", page + 1));
                return;
            }
        }
        self.move_to(arrangement::book_page_for(page, 0));
    }

    async fn evict_cache(&mut self) {
        match self.store.evict_expired().await {
            Ok(report) => {
                info!(
                    removed = report.removed,
                    retained = report.retained,
                    failed = report.failed,
                    "Cache sweep"
                );
                self.status(format!("Removed {} expired file(s) from the cache.", report.removed));
            }
            Err(e) => {
                warn!(error = %e, "Cache sweep failed");
                self.status(format!("Cache cleanup failed: {}", e));
            }
        }
    }

    /// Any state to `Idle`. Cancels transfers instead of waiting on them.
    fn shutdown(&mut self) {
        info!(state = %self.state, "Shutting down session");
        self.status("Shutting down sync.");
        self.cancel_discovery_timer();
        self.cancel_outgoing();
        for (transfer, _) in self.incoming.drain() {
            self.transport.cancel_transfer(transfer);
        }
        self.transport.stop_all_endpoints();

        self.followers.clear();
        self.roster = Roster::new();
        self.document = None;
        self.page_count = None;
        self.book_page = 0;
        self.page_received = false;
        self.leader = None;
        self.connecting = None;
        self.set_state(SessionState::Idle);
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    fn begin_discovery(&mut self) {
        if let Some(peer) = self.connecting.take() {
            self.transport.disconnect(&peer);
        }
        match self.transport.start_discovery(&self.config.service_id) {
            Ok(()) => {
                self.set_state(SessionState::Discovering);
                self.arm_discovery_timer();
                self.status("Searching for a leader...");
            }
            Err(e) => {
                warn!(error = %e, "Failed to start discovery");
                self.cancel_discovery_timer();
                self.set_state(SessionState::Idle);
                self.status(format!("Failed to start discovery: {}", e));
                self.emit(SessionEvent::NoLeaderFound);
            }
        }
    }

    /// Stop searching and drop any half-open connection. Leaves the state alone.
    fn end_discovery(&mut self) {
        self.transport.stop_discovery();
        self.cancel_discovery_timer();
        if let Some(peer) = self.connecting.take() {
            self.transport.disconnect(&peer);
        }
    }

    fn arm_discovery_timer(&mut self) {
        self.cancel_discovery_timer();
        self.discovery_generation += 1;
        let generation = self.discovery_generation;
        let timeout = self.config.discovery_timeout;
        let inbox = self.inbox.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(Input::DiscoveryTimeout { generation });
            }
        });
        trace!(generation, ?timeout, "Discovery timer armed");
        self.discovery_timer = Some(DiscoveryTimer { generation, task });
    }

    fn cancel_discovery_timer(&mut self) {
        if let Some(timer) = self.discovery_timer.take() {
            trace!(generation = timer.generation, "Discovery timer cancelled");
            timer.task.abort();
        }
    }

    fn on_discovery_timeout(&mut self, generation: u64) {
        let current = self.discovery_timer.as_ref().map(|t| t.generation);
        if current != Some(generation) || self.state != SessionState::Discovering {
            debug!(generation, ?current, "Ignoring stale discovery timeout");
            return;
        }
        self.discovery_timer = None;
        info!("No leader found before timeout");
        self.end_discovery();
        self.set_state(SessionState::Idle);
        self.status("No leader found.");
        self.emit(SessionEvent::NoLeaderFound);
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::AdvertisingStarted => {
                if self.state.role() == Role::Leader {
                    self.status("Advertising started. Waiting for followers.");
                    self.emit(SessionEvent::AdvertisingStarted);
                }
            }
            TransportEvent::AdvertisingFailed { reason } => {
                warn!(%reason, "Advertising failed");
                if self.state == SessionState::Advertising {
                    self.set_state(SessionState::Idle);
                }
                self.status(format!("Advertising failed: {}", reason));
                self.emit(SessionEvent::AdvertisingFailed);
            }
            TransportEvent::DiscoveryStarted => debug!("Discovery started"),
            TransportEvent::DiscoveryFailed { reason } => {
                warn!(%reason, "Discovery failed");
                if self.state == SessionState::Discovering {
                    self.end_discovery();
                    self.set_state(SessionState::Idle);
                    self.status(format!("Discovery failed: {}", reason));
                    self.emit(SessionEvent::NoLeaderFound);
                }
            }
            TransportEvent::PeerFound { peer, name } => self.on_peer_found(peer, name),
            TransportEvent::PeerLost { peer } => trace!(%peer, "Peer lost"),
            TransportEvent::ConnectionResult {
                peer,
                name,
                outcome,
            } => self.on_connection_result(peer, name, outcome),
            TransportEvent::Disconnected { peer } => self.on_disconnected(peer),
            TransportEvent::PayloadReceived { peer, payload } => {
                self.on_payload(peer, payload).await
            }
            TransportEvent::TransferUpdate {
                peer,
                transfer,
                bytes_done,
                bytes_total,
                status,
            } => {
                self.on_transfer_update(peer, transfer, bytes_done, bytes_total, status)
                    .await
            }
        }
    }

    fn on_peer_found(&mut self, peer: PeerId, name: String) {
        if self.state != SessionState::Discovering {
            trace!(%peer, state = %self.state, "Ignoring peer found outside discovery");
            return;
        }
        if self.connecting.is_some() {
            debug!(%peer, "Already connecting, ignoring another leader");
            return;
        }

        info!(%peer, %name, "Found leader");
        self.transport.stop_discovery();
        match self.transport.connect(&self.config.device_name, &peer) {
            Ok(()) => {
                self.connecting = Some(peer);
                self.status(format!("Found {}. Connecting...", name));
            }
            Err(e) => {
                warn!(%peer, error = %e, "Connection request failed");
                self.cancel_discovery_timer();
                self.set_state(SessionState::Idle);
                self.status(format!("Failed to connect to {}: {}", name, e));
                self.emit(SessionEvent::NoLeaderFound);
            }
        }
    }

    fn on_connection_result(&mut self, peer: PeerId, name: String, outcome: ConnectionOutcome) {
        let pending = self.connecting.as_ref() == Some(&peer);
        match (self.state, outcome) {
            (SessionState::Advertising | SessionState::Leading, ConnectionOutcome::Connected) => {
                self.add_follower(peer, name)
            }
            (SessionState::Discovering, ConnectionOutcome::Connected) if pending => {
                self.join_leader(peer, name)
            }
            (state, ConnectionOutcome::Connected) => {
                warn!(%peer, %state, "Unexpected connection, dropping it");
                self.transport.disconnect(&peer);
            }
            (SessionState::Advertising | SessionState::Leading, outcome) => {
                debug!(%peer, ?outcome, "Follower connection failed");
                self.status(format!("Connection with {} failed.", name));
                if self.remove_follower(&peer).is_some() {
                    self.after_follower_left();
                }
            }
            (SessionState::Discovering, outcome) if pending => {
                warn!(%peer, ?outcome, "Could not connect to leader");
                self.connecting = None;
                self.cancel_discovery_timer();
                self.set_state(SessionState::Idle);
                self.status(format!("Could not connect to {}.", name));
                self.emit(SessionEvent::NoLeaderFound);
            }
            (state, outcome) => {
                debug!(%peer, %state, ?outcome, "Ignoring connection result");
            }
        }
    }

    fn add_follower(&mut self, peer: PeerId, name: String) {
        if self.followers.iter().any(|d| d.peer_id == peer) {
            debug!(%peer, "Follower already connected");
            return;
        }
        let device = Device::follower(peer.clone(), name.clone());
        self.followers.push(device.clone());
        info!(%peer, %name, followers = self.followers.len(), "Follower joined");

        self.set_state(SessionState::Leading);
        self.status(format!("{} joined.", name));
        self.emit(SessionEvent::FollowerJoined(device));

        if let Some(descriptor) = self.document.as_ref().map(|d| d.descriptor.clone()) {
            self.send(&peer, &Message::FileInfo(descriptor));
        }
        self.broadcast_arrangement();
        self.broadcast(&Message::PageChanged {
            book_page: self.book_page,
        });
        self.emit(SessionEvent::RosterChanged(self.current_roster()));
    }

    fn join_leader(&mut self, peer: PeerId, name: String) {
        info!(%peer, %name, "Connected to leader");
        self.cancel_discovery_timer();
        self.connecting = None;
        self.reset_follower();
        self.leader = Some(peer.clone());
        self.set_state(SessionState::Following);
        self.status(format!("Connected to {}.", name));
        self.emit(SessionEvent::LeaderFound(peer));
    }

    fn on_disconnected(&mut self, peer: PeerId) {
        if self.state.role() == Role::Leader {
            if let Some(device) = self.remove_follower(&peer) {
                info!(%peer, name = %device.display_name, "Follower left");
                self.status(format!("{} left.", device.display_name));
                self.after_follower_left();
            }
            return;
        }

        if self.state == SessionState::Following && self.leader.as_ref() == Some(&peer) {
            warn!(%peer, "Lost connection to leader");
            self.reset_follower();
            self.status("Leader disconnected. Searching for new leader...");
            self.emit(SessionEvent::DisconnectedFromLeader);
            self.begin_discovery();
            return;
        }

        if self.state == SessionState::Discovering && self.connecting.as_ref() == Some(&peer) {
            debug!(%peer, "Leader went away while connecting");
            self.connecting = None;
            self.cancel_discovery_timer();
            self.set_state(SessionState::Idle);
            self.emit(SessionEvent::NoLeaderFound);
            return;
        }

        trace!(%peer, "Ignoring disconnect from unknown peer");
    }

    fn remove_follower(&mut self, peer: &PeerId) -> Option<Device> {
        let index = self.followers.iter().position(|d| d.peer_id == *peer)?;
        let device = self.followers.remove(index);

        let stale: Vec<TransferId> = self
            .outgoing
            .iter()
            .filter(|(_, p)| *p == peer)
            .map(|(t, _)| *t)
            .collect();
        for transfer in stale {
            self.outgoing.remove(&transfer);
            self.transport.cancel_transfer(transfer);
        }
        Some(device)
    }

    fn after_follower_left(&mut self) {
        if self.followers.is_empty() && self.state == SessionState::Leading {
            self.set_state(SessionState::Advertising);
        }
        self.broadcast_arrangement();
        self.emit(SessionEvent::RosterChanged(self.current_roster()));
    }

    async fn on_payload(&mut self, peer: PeerId, payload: Payload) {
        match payload {
            Payload::Bytes(bytes) => match codec::decode(&bytes) {
                Ok(message) => self.handle_message(peer, message).await,
                Err(e) => warn!(%peer, len = bytes.len(), error = %e, "Dropping undecodable message"),
            },
            Payload::File { transfer, path } => {
                self.register_incoming(peer, transfer, IncomingSource::File(path))
            }
            Payload::Stream { transfer, stream } => {
                self.register_incoming(peer, transfer, IncomingSource::Stream(stream))
            }
        }
    }

    fn register_incoming(&mut self, peer: PeerId, transfer: TransferId, source: IncomingSource) {
        if !self.from_leader(&peer) {
            warn!(%peer, %transfer, "Unsolicited file, cancelling");
            self.transport.cancel_transfer(transfer);
            return;
        }
        let expected = match &self.document {
            Some(doc) if doc.path.is_none() => doc.descriptor.content_hash,
            _ => {
                warn!(%peer, %transfer, "File arrived with no document waiting for it");
                self.transport.cancel_transfer(transfer);
                return;
            }
        };
        debug!(%peer, %transfer, hash = %expected.short(), "Incoming file registered");
        self.incoming.insert(
            transfer,
            IncomingTransfer {
                peer,
                expected,
                source,
            },
        );
    }

    async fn on_transfer_update(
        &mut self,
        peer: PeerId,
        transfer: TransferId,
        bytes_done: u64,
        bytes_total: u64,
        status: TransferStatus,
    ) {
        if let Some(recipient) = self.outgoing.get(&transfer).cloned() {
            let name = self.follower_name(&recipient);
            match status {
                TransferStatus::InProgress => {
                    if bytes_total > 0 {
                        let percent =
                            (u128::from(bytes_done) * 100 / u128::from(bytes_total)).min(100);
                        self.status(format!("Sending to {}... {}%", name, percent));
                    }
                }
                TransferStatus::Success => {
                    self.outgoing.remove(&transfer);
                    info!(peer = %recipient, %transfer, bytes = bytes_total, "File sent");
                    self.status(format!("File sent to {}.", name));
                }
                TransferStatus::Failure | TransferStatus::Canceled => {
                    self.outgoing.remove(&transfer);
                    warn!(peer = %recipient, %transfer, ?status, "File send did not complete");
                    self.status(format!("Failed to send file to {}.", name));
                }
            }
            return;
        }

        if !self.incoming.contains_key(&transfer) {
            trace!(%peer, %transfer, ?status, "Update for unknown transfer");
            return;
        }
        match status {
            TransferStatus::InProgress => {
                trace!(%peer, %transfer, bytes_done, bytes_total, "Receiving file")
            }
            TransferStatus::Success => {
                if let Some(incoming) = self.incoming.remove(&transfer) {
                    self.finish_incoming(transfer, incoming).await;
                }
            }
            TransferStatus::Failure | TransferStatus::Canceled => {
                self.incoming.remove(&transfer);
                warn!(%peer, %transfer, ?status, "File receive did not complete");
                self.status("File transfer failed.");
            }
        }
    }

    async fn finish_incoming(&mut self, transfer: TransferId, incoming: IncomingTransfer) {
        let IncomingTransfer {
            peer,
            expected,
            source,
        } = incoming;
        let result = match source {
            IncomingSource::File(path) => self.store.put_file_verified(&path, &expected).await,
            IncomingSource::Stream(stream) => {
                self.store.put_verified(stream.into_inner(), &expected).await
            }
        };

        match result {
            Ok(stored) => {
                let active = self.document.as_ref().map(|d| d.descriptor.content_hash);
                if !self.from_leader(&peer) || active != Some(stored.hash) {
                    debug!(%transfer, hash = %stored.hash.short(), "Received file is no longer active");
                    return;
                }
                if self.document_ready() {
                    debug!(%transfer, hash = %stored.hash.short(), "Duplicate copy of a ready document");
                    return;
                }
                info!(%transfer, hash = %stored.hash.short(), size = stored.size, "File received");
                self.status("File received successfully.");
                self.mark_document_ready(stored.path);
            }
            Err(tutti_store::Error::HashMismatch { expected, actual }) => {
                warn!(
                    %transfer,
                    expected = %expected.short(),
                    actual = %actual.short(),
                    "Received file does not match announced hash"
                );
                self.status("Received file failed verification.");
            }
            Err(e) => {
                warn!(%transfer, error = %e, "Failed to store received file");
                self.status(format!("Failed to save received file: {}", e));
            }
        }
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    async fn handle_message(&mut self, peer: PeerId, message: Message) {
        trace!(%peer, kind = message.kind(), "Message received");
        match message {
            Message::FileInfo(descriptor) => self.on_file_info(peer, descriptor).await,
            Message::FileRequest => self.on_file_request(peer),
            Message::PageChanged { book_page } => self.on_page_changed(peer, book_page),
            Message::ArrangementUpdate { devices } => self.on_arrangement(peer, devices),
            Message::TurnRequest { direction } => self.on_turn_request(peer, direction),
        }
    }

    async fn on_file_info(&mut self, peer: PeerId, descriptor: DocumentDescriptor) {
        if !self.from_leader(&peer) {
            debug!(%peer, "Ignoring FileInfo from a non-leader");
            return;
        }
        let hash = descriptor.content_hash;
        if self.document.as_ref().map(|d| &d.descriptor) == Some(&descriptor) {
            if self.document_ready() || !self.incoming.is_empty() {
                debug!(name = %descriptor.name, "Document already active");
                return;
            }
            debug!(name = %descriptor.name, "Document re-announced, fetching again");
        } else {
            info!(
                name = %descriptor.name,
                hash = %hash.short(),
                size = descriptor.size_bytes,
                "Leader announced document"
            );
            for (transfer, _) in self.incoming.drain() {
                self.transport.cancel_transfer(transfer);
            }
            self.document = Some(ActiveDocument {
                descriptor,
                path: None,
            });
            self.page_received = false;
        }
        self.fetch_document(peer, hash).await;
    }

    /// Use the cached copy of `hash` or ask `leader` to send it.
    async fn fetch_document(&mut self, leader: PeerId, hash: ContentHash) {
        match self.store.get(&hash).await {
            Ok(Some(stored)) => {
                self.status("File found in cache.");
                self.mark_document_ready(stored.path);
            }
            Ok(None) => {
                self.status("File not in cache. Requesting...");
                self.send(&leader, &Message::FileRequest);
            }
            Err(e) => {
                warn!(hash = %hash.short(), error = %e, "Cache lookup failed, requesting file");
                self.status("File not in cache. Requesting...");
                self.send(&leader, &Message::FileRequest);
            }
        }
    }

    fn on_file_request(&mut self, peer: PeerId) {
        if !self.is_follower(&peer) {
            debug!(%peer, "Ignoring FileRequest from a non-follower");
            return;
        }
        let Some(path) = self.document.as_ref().and_then(|d| d.path.clone()) else {
            warn!(%peer, "FileRequest with no document loaded");
            return;
        };
        let name = self.follower_name(&peer);
        match self.transport.send_file(&peer, &path) {
            Ok(transfer) => {
                info!(%peer, %transfer, "Sending document");
                self.outgoing.insert(transfer, peer);
                self.status(format!("Sending file to {}...", name));
            }
            Err(e) => {
                warn!(%peer, error = %e, "Failed to start file send");
                self.status(format!("Failed to send file to {}: {}", name, e));
            }
        }
    }

    fn on_page_changed(&mut self, peer: PeerId, book_page: BookPage) {
        if self.state.role() == Role::Leader {
            debug!(%peer, "Leader ignores PageChanged");
            return;
        }
        if !self.from_leader(&peer) {
            debug!(%peer, "Ignoring PageChanged from a non-leader");
            return;
        }
        self.book_page = book_page;
        self.page_received = true;
        if self.document_ready() {
            self.show_follower_page();
        } else {
            debug!(book_page, "Page pending until the document is ready");
        }
    }

    fn on_arrangement(&mut self, peer: PeerId, devices: Roster) {
        if !self.from_leader(&peer) {
            debug!(%peer, "Ignoring ArrangementUpdate from a non-leader");
            return;
        }
        if let Err(e) = devices.validate() {
            warn!(%peer, error = %e, "Dropping invalid arrangement");
            return;
        }
        if devices.leader().is_none() {
            warn!(%peer, "Dropping arrangement without a leader");
            return;
        }
        if devices.self_slot().is_none() {
            warn!(%peer, "Dropping arrangement that does not include this device");
            return;
        }

        debug!(devices = devices.len(), slot = ?devices.self_slot(), "Arrangement updated");
        self.roster = devices;
        self.emit(SessionEvent::RosterChanged(self.roster.clone()));
        if self.document_ready() && self.page_received {
            self.show_follower_page();
        }
    }

    fn on_turn_request(&mut self, peer: PeerId, direction: Direction) {
        if !self.is_follower(&peer) {
            debug!(%peer, "Ignoring TurnRequest from a non-follower");
            return;
        }
        debug!(%peer, %direction, "Follower requested turn");
        self.apply_turn(direction, self.followers.len() + 1);
    }

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    fn apply_turn(&mut self, direction: Direction, roster_size: usize) {
        match arrangement::try_advance(self.book_page, direction, roster_size, self.page_count) {
            Some(page) if page == self.book_page => trace!(page, "Turn had no effect"),
            Some(page) => self.move_to(page),
            None => {
                debug!(book_page = self.book_page, roster_size, page_count = ?self.page_count, "Turn rejected");
                self.status("Already at the end of the document.");
            }
        }
    }

    /// Set the book page on a leader or local viewer.
    fn move_to(&mut self, book_page: BookPage) {
        self.book_page = book_page;
        self.show_page(0);
        if self.state.role() == Role::Leader {
            self.broadcast(&Message::PageChanged { book_page });
        }
    }

    fn show_follower_page(&mut self) {
        let slot = self.roster.self_slot().unwrap_or(0);
        self.show_page(slot);
    }

    fn show_page(&mut self, slot: usize) {
        let local_page = arrangement::local_page(self.book_page, slot);
        if let Some(doc) = self.document.as_ref().filter(|d| d.path.is_some()) {
            self.preferences
                .set_last_page(&doc.descriptor.content_hash, local_page);
        }
        self.emit(SessionEvent::PageChanged {
            book_page: self.book_page,
            slot,
            local_page,
        });
    }

    fn mark_document_ready(&mut self, path: PathBuf) {
        let Some(doc) = self.document.as_mut() else {
            return;
        };
        doc.path = Some(path.clone());
        let descriptor = doc.descriptor.clone();

        let last_viewed_page = self.preferences.last_page(&descriptor.content_hash);
        self.preferences.set_last_opened(&descriptor);
        self.emit(SessionEvent::DocumentReady {
            document: descriptor,
            path,
            last_viewed_page,
        });
        if self.page_received {
            self.show_follower_page();
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn send(&mut self, peer: &PeerId, message: &Message) -> bool {
        match codec::encode(message) {
            Ok(bytes) => self.send_encoded(peer, message.kind(), Bytes::from(bytes)),
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Failed to encode message");
                false
            }
        }
    }

    fn send_encoded(&mut self, peer: &PeerId, kind: &str, bytes: Bytes) -> bool {
        match self.transport.send_bytes(peer, bytes) {
            Ok(()) => {
                trace!(%peer, kind, "Message sent");
                true
            }
            Err(e) => {
                warn!(%peer, kind, error = %e, "Send failed");
                false
            }
        }
    }

    /// Send to every follower. A failed send doesn't stop the rest.
    fn broadcast(&mut self, message: &Message) {
        let bytes = match codec::encode(message) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Failed to encode message");
                return;
            }
        };
        for peer in self.follower_ids() {
            self.send_encoded(&peer, message.kind(), bytes.clone());
        }
    }

    /// Each follower gets the roster with its own entry marked as self.
    fn broadcast_arrangement(&mut self) {
        let roster = self.current_roster();
        for peer in self.follower_ids() {
            let devices = roster.viewed_by(&peer);
            self.send(&peer, &Message::ArrangementUpdate { devices });
        }
    }

    fn cancel_outgoing(&mut self) {
        for (transfer, peer) in self.outgoing.drain() {
            debug!(%peer, %transfer, "Cancelling outgoing transfer");
            self.transport.cancel_transfer(transfer);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn reset_follower(&mut self) {
        self.leader = None;
        self.roster = Roster::new();
        self.document = None;
        self.page_count = None;
        self.book_page = 0;
        self.page_received = false;
        for (transfer, _) in self.incoming.drain() {
            self.transport.cancel_transfer(transfer);
        }
    }

    fn current_roster(&self) -> Roster {
        match self.state.role() {
            Role::Leader => Roster::for_leader(&self.config.device_name, &self.followers),
            Role::Follower => self.roster.clone(),
            Role::None => Roster::new(),
        }
    }

    fn local_slot(&self) -> Option<usize> {
        match self.state.role() {
            Role::Leader => Some(0),
            Role::Follower => self.roster.self_slot(),
            Role::None => self.document_ready().then_some(0),
        }
    }

    fn document_ready(&self) -> bool {
        self.document.as_ref().map_or(false, |d| d.path.is_some())
    }

    fn from_leader(&self, peer: &PeerId) -> bool {
        self.state == SessionState::Following && self.leader.as_ref() == Some(peer)
    }

    fn is_follower(&self, peer: &PeerId) -> bool {
        self.state.role() == Role::Leader && self.followers.iter().any(|d| d.peer_id == *peer)
    }

    fn follower_ids(&self) -> Vec<PeerId> {
        self.followers.iter().map(|d| d.peer_id.clone()).collect()
    }

    fn follower_name(&self, peer: &PeerId) -> String {
        self.followers
            .iter()
            .find(|d| d.peer_id == *peer)
            .map(|d| d.display_name.clone())
            .unwrap_or_else(|| peer.to_string())
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Session state changed");
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!(status = %message);
        self.emit(SessionEvent::Status(message));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("No listener for session events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_reports_closed_session() {
        let (handle, inbox) = channel();
        drop(inbox);

        assert!(matches!(handle.start_leading(), Err(Error::SessionClosed)));
        assert!(matches!(handle.snapshot().await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn sink_stops_delivering_after_handles_drop() {
        let (handle, mut inbox) = channel();
        let sink = inbox.transport_sink();

        assert!(sink.deliver(TransportEvent::DiscoveryStarted));
        assert!(matches!(
            inbox.try_recv(),
            Some(Input::Transport(TransportEvent::DiscoveryStarted))
        ));

        drop(handle);
        assert!(!sink.deliver(TransportEvent::DiscoveryStarted));
        assert!(inbox.recv().await.is_none());
    }
}
