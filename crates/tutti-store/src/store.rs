//! Content-addressed document cache on the local filesystem.
//!
//! Layout: one file per content hash directly under the cache root, named by the
//! 32 character hex hash. Incoming content is always written to a temporary file
//! in the same directory first and only renamed into its hash name once the copy
//! (and, when requested, verification) has succeeded.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::hash::{ContentHash, ContentHasher, DEFAULT_CHUNK_SIZE};

/// How long an entry survives without being read.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const TEMP_PREFIX: &str = ".incoming-";
const TEMP_SUFFIX: &str = ".tmp";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A file held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Content hash, also the file name.
    pub hash: ContentHash,
    /// Absolute location inside the cache directory.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// Outcome of an eviction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: usize,
    pub retained: usize,
    pub failed: usize,
}

/// Content-addressed cache of document files.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
    chunk_size: usize,
    retention: Duration,
}

impl ContentStore {
    /// Open or create a store rooted at `root`.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened content store");
        Ok(Self {
            root,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retention: DEFAULT_RETENTION,
        })
    }

    /// Set the read size used when streaming content.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Set the retention window used by [`evict_expired`](Self::evict_expired).
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Location an entry with this hash has (or would have).
    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.to_hex())
    }

    /// Hash a stream without storing it.
    pub async fn hash<R: AsyncRead + Unpin>(&self, reader: R) -> Result<ContentHash> {
        Ok(crate::hash::hash_reader(reader, self.chunk_size).await?)
    }

    /// Copy a stream into the store under its content hash.
    ///
    /// Storing content that is already present leaves the existing file in place
    /// and discards the new copy.
    pub async fn put<R: AsyncRead + Unpin>(&self, reader: R) -> Result<StoredFile> {
        self.ingest(reader, None).await
    }

    /// Like [`put`](Self::put), but the content must hash to `expected`.
    ///
    /// On mismatch the copy is discarded and nothing is stored.
    pub async fn put_verified<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        expected: &ContentHash,
    ) -> Result<StoredFile> {
        self.ingest(reader, Some(expected)).await
    }

    /// Import a file from disk.
    pub async fn put_file<P: AsRef<Path>>(&self, path: P) -> Result<StoredFile> {
        let file = File::open(path.as_ref()).await?;
        self.ingest(file, None).await
    }

    /// Import a file from disk, verifying it against an announced hash.
    pub async fn put_file_verified<P: AsRef<Path>>(
        &self,
        path: P,
        expected: &ContentHash,
    ) -> Result<StoredFile> {
        let file = File::open(path.as_ref()).await?;
        self.ingest(file, Some(expected)).await
    }

    /// Look up an entry, refreshing its last-access time on a hit.
    ///
    /// Returns `Ok(None)` when the entry does not exist, including when its file
    /// was removed behind the store's back.
    pub async fn get(&self, hash: &ContentHash) -> Result<Option<StoredFile>> {
        let path = self.path_for(hash);
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = touch(&path).await {
            if e.kind() == std::io::ErrorKind::NotFound {
                return Ok(None);
            }
            warn!(hash = %hash.short(), error = %e, "Failed to refresh cache entry access time");
        }

        trace!(hash = %hash.short(), "Cache hit");
        Ok(Some(StoredFile {
            hash: *hash,
            path,
            size: metadata.len(),
        }))
    }

    /// Check for an entry without touching it.
    pub async fn contains(&self, hash: &ContentHash) -> bool {
        fs::metadata(self.path_for(hash))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Delete every file whose last access is older than `max_age`.
    ///
    /// Individual deletion failures are logged and counted; they never stop the
    /// sweep.
    pub async fn evict(&self, max_age: Duration) -> Result<EvictionReport> {
        let now = SystemTime::now();
        let mut report = EvictionReport::default();
        let mut entries = fs::read_dir(&self.root).await?;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Cache directory listing interrupted");
                    report.failed += 1;
                    break;
                }
            };
            let path = entry.path();

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat cache entry");
                    report.failed += 1;
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= max_age {
                report.retained += 1;
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Deleted old cached file");
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete old cached file");
                    report.failed += 1;
                }
            }
        }

        info!(
            removed = report.removed,
            retained = report.retained,
            failed = report.failed,
            "Cache eviction sweep finished"
        );
        Ok(report)
    }

    /// Evict using the configured retention window.
    pub async fn evict_expired(&self) -> Result<EvictionReport> {
        self.evict(self.retention).await
    }

    fn temp_path(&self) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            "{}{}-{}{}",
            TEMP_PREFIX,
            std::process::id(),
            seq,
            TEMP_SUFFIX
        ))
    }

    async fn ingest<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        expected: Option<&ContentHash>,
    ) -> Result<StoredFile> {
        let temp = self.temp_path();

        let (hash, size) = match self.copy_hashing(reader, &temp).await {
            Ok(done) => done,
            Err(e) => {
                discard(&temp).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected {
            if hash != *expected {
                discard(&temp).await;
                warn!(
                    expected = %expected.short(),
                    actual = %hash.short(),
                    "Discarding content that does not match its announced hash"
                );
                return Err(Error::HashMismatch {
                    expected: *expected,
                    actual: hash,
                });
            }
        }

        let path = self.path_for(&hash);
        if fs::metadata(&path).await.is_ok() {
            discard(&temp).await;
            if let Err(e) = touch(&path).await {
                warn!(hash = %hash.short(), error = %e, "Failed to refresh cache entry access time");
            }
            debug!(hash = %hash.short(), size, "Content already cached");
        } else {
            if let Err(e) = fs::rename(&temp, &path).await {
                discard(&temp).await;
                return Err(e.into());
            }
            debug!(hash = %hash.short(), size, "Cached new content");
        }

        Ok(StoredFile { hash, path, size })
    }

    async fn copy_hashing<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
        temp: &Path,
    ) -> Result<(ContentHash, u64)> {
        let mut out = File::create(temp).await?;
        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
        }
        out.flush().await?;
        out.sync_all().await?;

        Ok((hasher.finalize(), hasher.len()))
    }
}

async fn discard(temp: &Path) {
    if let Err(e) = fs::remove_file(temp).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %temp.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

async fn touch(path: &Path) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().append(true).open(&path)?;
        file.set_modified(SystemTime::now())
    })
    .await
    .map_err(std::io::Error::other)?
}
