//! Persisted per-device preferences: last opened document and last page per document.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};
use tutti_protocol::DocumentDescriptor;
use tutti_store::ContentHash;

const LAST_OPENED: &str = "last_opened";
const LAST_OPENED_NAME: &str = "last_opened_name";
const LAST_PAGE_PREFIX: &str = "last_page:";

/// String key-value storage backing [`Preferences`].
pub trait KeyValueStore: Send + 'static {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String);
    fn remove(&mut self, key: &str);
}

/// In-memory store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
    }
}

/// Store persisted as a single JSON object.
///
/// Writes go to a temp file that is renamed over the original. Inside a tokio
/// runtime they run on the blocking pool, one at a time, and a burst of changes
/// collapses into a single write of the latest values. Write failures are logged;
/// the in-memory value stays current.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
    writer: Arc<Mutex<PendingWrite>>,
}

#[derive(Debug, Default)]
struct PendingWrite {
    latest: Option<BTreeMap<String, String>>,
    running: bool,
}

impl JsonFileStore {
    /// Load `path`, starting empty when it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Discarding unreadable preferences");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read preferences");
                BTreeMap::new()
            }
        };
        Self {
            path,
            values,
            writer: Arc::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            save(&self.path, &self.values);
            return;
        };

        let mut pending = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        pending.latest = Some(self.values.clone());
        if pending.running {
            return;
        }
        pending.running = true;
        let path = self.path.clone();
        let writer = Arc::clone(&self.writer);
        runtime.spawn_blocking(move || drain_writes(&path, &writer));
    }
}

fn drain_writes(path: &Path, writer: &Mutex<PendingWrite>) {
    loop {
        let values = {
            let mut pending = writer.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.latest.take() {
                Some(values) => values,
                None => {
                    pending.running = false;
                    return;
                }
            }
        };
        save(path, &values);
    }
}

fn save(path: &Path, values: &BTreeMap<String, String>) {
    if let Err(e) = write_file(path, values) {
        warn!(path = %path.display(), error = %e, "Failed to save preferences");
    }
}

fn write_file(path: &Path, values: &BTreeMap<String, String>) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(values)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        if self.values.get(key) == Some(&value) {
            return;
        }
        self.values.insert(key.to_string(), value);
        self.persist();
    }

    fn remove(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.persist();
        }
    }
}

/// Typed view over a [`KeyValueStore`].
#[derive(Debug)]
pub struct Preferences<K> {
    store: K,
}

impl<K: KeyValueStore> Preferences<K> {
    pub fn new(store: K) -> Self {
        Self { store }
    }

    /// Hash of the document opened most recently.
    pub fn last_opened(&self) -> Option<ContentHash> {
        let raw = self.store.get(LAST_OPENED)?;
        match raw.parse() {
            Ok(hash) => Some(hash),
            Err(e) => {
                debug!(value = %raw, error = %e, "Ignoring malformed last opened hash");
                None
            }
        }
    }

    pub fn last_opened_name(&self) -> Option<String> {
        self.store.get(LAST_OPENED_NAME)
    }

    pub fn set_last_opened(&mut self, document: &DocumentDescriptor) {
        self.store.set(LAST_OPENED, document.content_hash.to_hex());
        self.store.set(LAST_OPENED_NAME, document.name.clone());
    }

    pub fn clear_last_opened(&mut self) {
        self.store.remove(LAST_OPENED);
        self.store.remove(LAST_OPENED_NAME);
    }

    /// Last page shown on this device for a document.
    pub fn last_page(&self, hash: &ContentHash) -> Option<u32> {
        self.store.get(&page_key(hash))?.parse().ok()
    }

    pub fn set_last_page(&mut self, hash: &ContentHash, page: u32) {
        self.store.set(&page_key(hash), page.to_string());
    }

    pub fn clear_last_page(&mut self, hash: &ContentHash) {
        self.store.remove(&page_key(hash));
    }

    pub fn store(&self) -> &K {
        &self.store
    }
}

fn page_key(hash: &ContentHash) -> String {
    format!("{}{}", LAST_PAGE_PREFIX, hash)
}
