//! Tutti Store - content-addressed document cache
//!
//! Followers in a Tutti session identify documents by content hash, so a file
//! received once never needs to be transferred again. This crate owns that cache:
//!
//! - **Hashing**: a 128-bit digest streamed over any `AsyncRead`, independent of
//!   read size and without seeking. The digest is BLAKE3 truncated to 16 bytes; it
//!   has the width of an MD5 hex string but never equals the MD5 of the same file,
//!   so hashes from MD5-based peers or caches are not interchangeable with these
//! - **Put**: copy-then-rename into a file named by its hash, with dedup and
//!   optional verification against an announced hash
//! - **Get**: lookups refresh the entry's last-access time
//! - **Evict**: best-effort sweep of entries not read within the retention window
//!
//! # Example
//!
//! ```no_run
//! use tutti_store::ContentStore;
//!
//! # async fn demo() -> tutti_store::Result<()> {
//! let store = ContentStore::open("./tutti-cache").await?;
//! let stored = store.put_file("score.pdf").await?;
//! assert!(store.get(&stored.hash).await?.is_some());
//! store.evict_expired().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod hash;
pub mod store;

pub use error::{Error, Result};
pub use hash::{hash_bytes, hash_reader, ContentHash, ContentHasher, DEFAULT_CHUNK_SIZE, HASH_LEN};
pub use store::{ContentStore, EvictionReport, StoredFile, DEFAULT_RETENTION};
