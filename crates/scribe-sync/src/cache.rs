//! Persistent, versioned, TTL-bounded cache for remote listings and content.
//!
//! Two layers: a process-local in-memory map consulted first, and a durable
//! `CacheStore` that survives restarts. Every durable entry is wrapped in a
//! `CacheEntry` envelope carrying the schema version and storage timestamp;
//! an entry failing either check is treated as absent and purged on touch.
//! Corrupt durable entries are likewise deleted silently - the cache never
//! surfaces errors to callers, it only degrades to a miss.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::now_ms;

/// Bumping this invalidates every previously persisted entry at once.
pub const SCHEMA_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Raw durable key-value layer beneath the cache. Implementations do not
/// interpret the bytes; the `Cache` owns the codec.
pub trait CacheStore: Send + Sync {
    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;
    fn remove(&self, key: &str) -> StoreResult<()>;
    fn keys(&self) -> StoreResult<Vec<String>>;
    fn clear(&self) -> StoreResult<()>;
}

/// Durable cache entry envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    schema_version: u32,
    /// Milliseconds since the Unix epoch.
    stored_at: u64,
    payload: serde_json::Value,
}

impl CacheEntry {
    fn is_valid(&self, ttl: Duration, now: u64) -> bool {
        self.schema_version == SCHEMA_VERSION
            && now.saturating_sub(self.stored_at) < ttl.as_millis() as u64
    }
}

/// Cache key for a folder listing.
pub fn listing_key(remote_folder_id: &str) -> String {
    format!("listing:{remote_folder_id}")
}

/// Cache key for a document's content.
pub fn content_key(remote_file_id: &str) -> String {
    format!("content:{remote_file_id}")
}

/// Typed two-layer cache view over a shared durable store.
///
/// Several typed views (listings, contents) share one `CacheStore`; their key
/// prefixes keep them disjoint. `cleanup` and `clear` operate on the whole
/// shared store since entries are type-agnostic at that level.
pub struct Cache<V> {
    store: Arc<dyn CacheStore>,
    memory: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entry_bytes: usize,
    max_total_bytes: u64,
    _payload: PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> Cache<V> {
    pub fn new(
        store: Arc<dyn CacheStore>,
        ttl: Duration,
        max_entry_bytes: usize,
        max_total_bytes: u64,
    ) -> Self {
        Self {
            store,
            memory: Mutex::new(HashMap::new()),
            ttl,
            max_entry_bytes,
            max_total_bytes,
            _payload: PhantomData,
        }
    }

    /// Look up a key. Memory first, then the durable layer; a durable hit is
    /// promoted into memory. Expired, version-mismatched or undecodable
    /// entries are removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = now_ms();

        {
            let mut memory = self.memory.lock().unwrap();
            if let Some(entry) = memory.get(key) {
                if entry.is_valid(self.ttl, now) {
                    if let Ok(value) = serde_json::from_value(entry.payload.clone()) {
                        return Some(value);
                    }
                }
                memory.remove(key);
                let _ = self.store.remove(key);
                return None;
            }
        }

        let bytes = match self.store.read(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                debug!("cache read failed for {key}: {e}");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                // Corrupt durable entry: delete, report absent.
                warn!("dropping corrupt cache entry {key}: {e}");
                let _ = self.store.remove(key);
                return None;
            }
        };

        if !entry.is_valid(self.ttl, now) {
            let _ = self.store.remove(key);
            return None;
        }

        match serde_json::from_value(entry.payload.clone()) {
            Ok(value) => {
                self.memory.lock().unwrap().insert(key.to_string(), entry);
                Some(value)
            }
            Err(e) => {
                warn!("dropping cache entry {key} with unreadable payload: {e}");
                let _ = self.store.remove(key);
                None
            }
        }
    }

    /// Store a value in both layers. Oversized entries skip the durable write
    /// (soft degradation: the memory layer still serves them this session).
    pub fn set(&self, key: &str, value: &V) {
        let payload = match serde_json::to_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("cache payload for {key} not serializable: {e}");
                return;
            }
        };
        let entry = CacheEntry {
            schema_version: SCHEMA_VERSION,
            stored_at: now_ms(),
            payload,
        };

        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cache entry for {key} not serializable: {e}");
                return;
            }
        };

        self.memory
            .lock()
            .unwrap()
            .insert(key.to_string(), entry);

        if bytes.len() > self.max_entry_bytes {
            debug!(
                "skipping durable write for {key}: {} bytes exceeds entry cap",
                bytes.len()
            );
            return;
        }
        if let Err(e) = self.store.write(key, &bytes) {
            debug!("durable cache write failed for {key}: {e}");
        }
    }

    /// Remove a single key from both layers.
    pub fn invalidate(&self, key: &str) {
        self.memory.lock().unwrap().remove(key);
        let _ = self.store.remove(key);
    }

    /// Remove every entry whose key starts with `prefix` from both layers.
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.memory
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(prefix));
        if let Ok(keys) = self.store.keys() {
            for key in keys.iter().filter(|k| k.starts_with(prefix)) {
                let _ = self.store.remove(key);
            }
        }
    }

    /// Drop everything from both layers (whole shared store).
    pub fn clear(&self) {
        self.memory.lock().unwrap().clear();
        if let Err(e) = self.store.clear() {
            warn!("failed to clear durable cache: {e}");
        }
    }

    /// Periodic maintenance over the whole shared store: drop expired and
    /// corrupt entries; if the durable footprint still exceeds the total cap,
    /// evict the oldest 30% of remaining entries by storage time.
    pub fn cleanup(&self) {
        let now = now_ms();
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                debug!("cache cleanup could not list keys: {e}");
                return;
            }
        };

        let mut live: Vec<(String, u64, u64)> = Vec::new();
        for key in keys {
            let bytes = match self.store.read(&key) {
                Ok(Some(bytes)) => bytes,
                _ => continue,
            };
            match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) if entry.is_valid(self.ttl, now) => {
                    live.push((key, entry.stored_at, bytes.len() as u64));
                }
                _ => {
                    let _ = self.store.remove(&key);
                    self.memory.lock().unwrap().remove(&key);
                }
            }
        }

        let total: u64 = live.iter().map(|(_, _, size)| size).sum();
        if total <= self.max_total_bytes {
            return;
        }

        live.sort_by_key(|(_, stored_at, _)| *stored_at);
        let evict = (live.len() * 3).div_ceil(10);
        debug!(
            "cache over budget ({total} bytes); evicting {evict} oldest entries"
        );
        for (key, _, _) in live.into_iter().take(evict) {
            let _ = self.store.remove(&key);
            self.memory.lock().unwrap().remove(&key);
        }
    }
}

/// In-memory durable layer for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }

    fn clear(&self) -> StoreResult<()> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}

pub use file_store::FileStore;

mod file_store {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Durable layer backed by one file per entry under a cache directory.
    ///
    /// Keys are escaped into filenames (keys contain `:`); the escaping is
    /// reversible so `keys()` can reconstruct them.
    pub struct FileStore {
        dir: PathBuf,
    }

    impl FileStore {
        pub fn new(dir: &Path) -> StoreResult<Self> {
            fs::create_dir_all(dir).map_err(|e| StoreError::Io(e.to_string()))?;
            Ok(Self {
                dir: dir.to_path_buf(),
            })
        }

        fn encode_key(key: &str) -> String {
            let mut out = String::with_capacity(key.len());
            for b in key.bytes() {
                match b {
                    b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => {
                        out.push(b as char)
                    }
                    _ => out.push_str(&format!("%{b:02X}")),
                }
            }
            out
        }

        fn decode_key(name: &str) -> Option<String> {
            let bytes = name.as_bytes();
            let mut out = Vec::with_capacity(bytes.len());
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'%' {
                    let hex = name.get(i + 1..i + 3)?;
                    out.push(u8::from_str_radix(hex, 16).ok()?);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            String::from_utf8(out).ok()
        }

        fn path_for(&self, key: &str) -> PathBuf {
            self.dir.join(Self::encode_key(key))
        }
    }

    impl CacheStore for FileStore {
        fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
            match fs::read(self.path_for(key)) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(StoreError::Io(e.to_string())),
            }
        }

        fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
            fs::write(self.path_for(key), bytes).map_err(|e| StoreError::Io(e.to_string()))
        }

        fn remove(&self, key: &str) -> StoreResult<()> {
            match fs::remove_file(self.path_for(key)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::Io(e.to_string())),
            }
        }

        fn keys(&self) -> StoreResult<Vec<String>> {
            let mut keys = Vec::new();
            let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::Io(e.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
                if let Some(key) = entry
                    .file_name()
                    .to_str()
                    .and_then(Self::decode_key)
                {
                    keys.push(key);
                }
            }
            Ok(keys)
        }

        fn clear(&self) -> StoreResult<()> {
            for key in self.keys()? {
                self.remove(&key)?;
            }
            Ok(())
        }
    }
}
