//! Error types for tutti-protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding, decoding or validating messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Bytes did not form a known, well-formed message.
    #[error("undecodable message: {0}")]
    Decode(#[source] serde_json::Error),

    /// A message could not be serialized.
    #[error("unencodable message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A roster broke one of its invariants.
    #[error("invalid roster: {0}")]
    InvalidRoster(String),
}
