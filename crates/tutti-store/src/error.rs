//! Error types for tutti-store.

use thiserror::Error;

use crate::hash::ContentHash;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the content store.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error while reading, writing or renaming cache files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Copied content does not match the hash it was announced under.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// A string could not be parsed as a content hash.
    #[error("invalid content hash: {0}")]
    InvalidHash(String),
}
