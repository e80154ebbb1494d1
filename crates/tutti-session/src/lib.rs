//! Tutti Session - leader/follower coordination for shared score reading
//!
//! A small group of co-located devices shows consecutive pages of one document
//! and turns them together. One device leads: it owns the document and the shared
//! book page. The others follow: they fetch the document (or find it in their
//! cache), learn their slot from the leader's arrangement, and ask the leader to
//! turn.
//!
//! - [`SessionCoordinator`]: single-writer actor that owns all session state
//! - [`Transport`]: the peer-to-peer seam; [`LoopbackHub`] is an in-process one
//! - [`Preferences`]: last opened document and last page per document
//! - [`SessionEvent`]: everything reported to the UI layer
//!
//! # Example
//!
//! ```no_run
//! use tutti_session::{channel, LoopbackHub, MemoryStore, SessionConfig, SessionCoordinator};
//!
//! # async fn demo() -> tutti_session::Result<()> {
//! let config = SessionConfig::from_env();
//! let store = config.open_store().await?;
//! let hub = LoopbackHub::new();
//!
//! let (handle, inbox) = channel();
//! let transport = hub.endpoint(inbox.transport_sink());
//! let (coordinator, mut events) =
//!     SessionCoordinator::new(config, transport, store, MemoryStore::new(), &inbox);
//! tokio::spawn(coordinator.run(inbox));
//!
//! handle.load_document("score.pdf", Some(40))?;
//! handle.start_leading()?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod loopback;
pub mod preferences;
pub mod transport;

pub use config::SessionConfig;
pub use coordinator::{channel, Command, Input, SessionCoordinator, SessionHandle, SessionInbox};
pub use error::{Error, Result};
pub use events::{Role, SessionEvent, SessionSnapshot, SessionState};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use preferences::{JsonFileStore, KeyValueStore, MemoryStore, Preferences};
pub use transport::{
    ConnectionOutcome, IncomingStream, Payload, TransferId, TransferStatus, Transport,
    TransportError, TransportEvent, TransportEventSink,
};
