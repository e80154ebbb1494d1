//! Error types for tutti-session.

use thiserror::Error;

use crate::transport::TransportError;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the session coordinator and its handle.
#[derive(Debug, Error)]
pub enum Error {
    /// Content store failure.
    #[error("store error: {0}")]
    Store(#[from] tutti_store::Error),

    /// Message encoding or roster validation failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] tutti_protocol::Error),

    /// Transport request failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The coordinator has shut down.
    #[error("session closed")]
    SessionClosed,
}
