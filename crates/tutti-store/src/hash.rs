//! Content hashing.
//!
//! Documents are identified by a 128-bit digest of their bytes, rendered as 32
//! lowercase hex characters. The digest is BLAKE3's extended output truncated to
//! 16 bytes, so the identity stays the same width as the hashes carried in the wire
//! protocol while the underlying function remains collision resistant.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

/// Digest width in bytes.
pub const HASH_LEN: usize = 16;

/// Default read size when streaming content through the hasher.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// A 128-bit content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Create a hash from raw bytes.
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Convert to a 32 character lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 32 character hex string.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        if s.len() != HASH_LEN * 2 {
            return Err(Error::InvalidHash(s.to_string()));
        }
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidHash(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    fn from_hasher(hasher: &blake3::Hasher) -> Self {
        let mut bytes = [0u8; HASH_LEN];
        hasher.finalize_xof().fill(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher that callers feed while copying content elsewhere.
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(&self) -> ContentHash {
        ContentHash::from_hasher(&self.inner)
    }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Hash a byte stream, reading it in `chunk_size` pieces.
///
/// The result depends only on the bytes and their order, never on the chunk size.
/// The reader does not need to be seekable.
pub async fn hash_reader<R>(mut reader: R, chunk_size: usize) -> std::io::Result<ContentHash>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_deterministic() {
        assert_eq!(hash_bytes(b"score"), hash_bytes(b"score"));
        assert_ne!(hash_bytes(b"score"), hash_bytes(b"scores"));
    }

    #[test]
    fn hash_is_order_sensitive() {
        assert_ne!(hash_bytes(b"ab"), hash_bytes(b"ba"));
    }

    #[test]
    fn hex_is_32_chars_and_parses_back() {
        let hash = hash_bytes(b"");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(ContentHash::from_hex(&hex).unwrap(), hash);
        assert_eq!(hex.parse::<ContentHash>().unwrap(), hash);
    }

    #[test]
    fn digest_is_truncated_blake3_not_md5() {
        let empty = hash_bytes(b"").to_hex();
        assert_eq!(empty, "af1349b9f5f9a1a6a0404dea36dcc949");
        assert_ne!(empty, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn leading_zero_bytes_are_padded() {
        let hash = ContentHash::from_bytes([0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14]);
        assert_eq!(hash.to_hex(), "00000102030405060708090a0b0c0d0e");
        assert_eq!(hash.short(), "00000102");
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(ContentHash::from_hex("abc").is_err());
        assert!(ContentHash::from_hex(&"z".repeat(32)).is_err());
        assert!(ContentHash::from_hex(&"a".repeat(64)).is_err());
    }

    #[test]
    fn serde_uses_hex_string() {
        let hash = hash_bytes(b"page one");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(serde_json::from_str::<ContentHash>("\"not-a-hash\"").is_err());
    }

    #[tokio::test]
    async fn reader_hash_independent_of_chunk_size() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let expected = hash_bytes(&data);

        for chunk in [1, 7, 512, DEFAULT_CHUNK_SIZE, 100_000] {
            let got = hash_reader(&data[..], chunk).await.unwrap();
            assert_eq!(got, expected, "chunk size {}", chunk);
        }
    }

    #[test]
    fn incremental_hasher_tracks_length() {
        let mut hasher = ContentHasher::new();
        assert!(hasher.is_empty());
        hasher.update(b"abc");
        hasher.update(b"def");
        assert_eq!(hasher.len(), 6);
        assert_eq!(hasher.finalize(), hash_bytes(b"abcdef"));
    }
}
