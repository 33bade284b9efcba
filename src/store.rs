//! In-memory key-value store with per-key expiry
//!
//! Every operation runs under one exclusive lock per store, so operations on
//! the same store are linearizable. Expired entries are treated as absent by
//! every read path. Key-addressed reads (`get`, `exists`, `expire`) also remove
//! the expired entry they find; aggregate reads (`len`, `snapshot`, `dump`)
//! only filter. Bulk removal of expired entries is left to the background
//! sweep.

use crate::config::StoreConfig;
use crate::error::{MiniKvError, Result};
use crate::snapshot;
use crate::sweeper::ExpirySweeper;
use crate::value::Value;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Upper bound applied to TTLs so deadline arithmetic cannot overflow (100 years)
const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

pub(crate) type EntryMap = HashMap<String, Entry>;

/// A stored value plus its optional deadline
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Entry {
    pub value: Value,
    pub expires_at: Option<Instant>,
}

impl Entry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    pub fn with_ttl(value: Value, ttl_secs: i64, now: Instant) -> Self {
        Self {
            value,
            expires_at: Some(deadline_after(now, ttl_secs)),
        }
    }

    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.map(|deadline| now >= deadline).unwrap_or(false)
    }
}

/// Deadline `ttl_secs` seconds after `now`. Non-positive TTLs give a deadline
/// that has already passed.
pub(crate) fn deadline_after(now: Instant, ttl_secs: i64) -> Instant {
    let ttl = Duration::from_secs(ttl_secs.unsigned_abs().min(MAX_TTL_SECS));
    if ttl_secs > 0 {
        now + ttl
    } else {
        now.checked_sub(ttl).unwrap_or(now)
    }
}

/// Remove every expired entry, returning how many were removed
pub(crate) fn purge_expired(entries: &mut EntryMap, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired_at(now));
    before - entries.len()
}

/// Remove `key` if its deadline has passed. Returns whether a live entry
/// remains under `key`.
fn evict_if_expired(entries: &mut EntryMap, key: &str, now: Instant) -> bool {
    let expired = match entries.get(key) {
        Some(entry) => entry.is_expired_at(now),
        None => return false,
    };
    if expired {
        entries.remove(key);
        debug!(key, "Evicted expired key");
    }
    !expired
}

/// Trait defining the interface for key-value storage operations
pub trait Store: Send + Sync {
    /// Set a key-value pair with no expiry, clearing any previous deadline
    async fn set(&self, key: String, value: Value);

    /// Set a key-value pair that expires `ttl_secs` seconds from now
    async fn set_with_ttl(&self, key: String, value: Value, ttl_secs: i64);

    /// Get a value by key
    async fn get(&self, key: &str) -> Option<Value>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> bool;

    /// Delete a key-value pair
    async fn delete(&self, key: &str) -> bool;

    /// Replace the deadline of an existing key, leaving its value untouched
    async fn expire(&self, key: &str, ttl_secs: i64) -> bool;

    /// Get the number of live items
    async fn len(&self) -> usize;

    /// Get all live key-value pairs, sorted by key
    async fn snapshot(&self) -> Vec<(String, Value)>;

    /// Clear all data
    async fn clear(&self);
}

/// Thread-safe in-memory store with lazy and background expiry
pub struct ExpiringStore {
    entries: Arc<Mutex<EntryMap>>,
    sweeper: Mutex<Option<ExpirySweeper>>,
}

impl ExpiringStore {
    /// Create a store with the default one-second background sweep
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime, which is needed to spawn
    /// the sweep task.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create a store with custom configuration
    ///
    /// # Panics
    ///
    /// Panics if the configuration enables the sweep and no Tokio runtime is
    /// running.
    pub fn with_config(config: StoreConfig) -> Self {
        let entries = Arc::new(Mutex::new(EntryMap::new()));
        let sweeper = config
            .sweep_interval
            .map(|interval| ExpirySweeper::start(Arc::clone(&entries), interval));

        Self {
            entries,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Create a store without a background sweep; expired entries are only
    /// removed when observed or by `purge_expired`
    pub fn without_sweeper() -> Self {
        Self::with_config(StoreConfig::default().without_sweep())
    }

    /// Run one sweep pass now, returning the number of entries removed
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, Instant::now())
    }

    /// Stop the background sweep and wait for it to finish
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
    }

    /// Serialize all live entries to the snapshot format
    pub async fn dump(&self) -> Result<Vec<u8>> {
        let entries = self.entries.lock().await;
        snapshot::encode(&entries, Instant::now())
    }

    /// Replace the store's contents with a decoded snapshot
    ///
    /// Returns the number of records restored. On a decode error the store is
    /// left untouched.
    pub async fn restore(&self, bytes: &[u8]) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let restored = snapshot::decode(bytes, Instant::now())?;
        let count = restored.len();
        *entries = restored;
        Ok(count)
    }

    /// Write a snapshot to `path`
    ///
    /// The snapshot goes to a temporary file first and is renamed over `path`,
    /// so a failed write leaves any previous snapshot intact.
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let entries = self.entries.lock().await;
        let bytes = snapshot::encode(&entries, Instant::now())?;

        let temp_path = temp_path_for(path);
        let temp_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(temp_file);
        writer.write_all(&bytes)?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, path)?;
        info!(path = %path.display(), bytes = bytes.len(), "Saved snapshot");
        Ok(())
    }

    /// Replace the store's contents with the snapshot stored at `path`
    pub async fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let mut entries = self.entries.lock().await;

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MiniKvError::SnapshotNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        let restored = snapshot::decode(&bytes, Instant::now())?;
        let count = restored.len();
        *entries = restored;
        info!(path = %path.display(), entries = count, "Loaded snapshot");
        Ok(count)
    }
}

impl Default for ExpiringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for ExpiringStore {
    async fn set(&self, key: String, value: Value) {
        let mut entries = self.entries.lock().await;
        entries.insert(key, Entry::new(value));
    }

    async fn set_with_ttl(&self, key: String, value: Value, ttl_secs: i64) {
        let mut entries = self.entries.lock().await;
        entries.insert(key, Entry::with_ttl(value, ttl_secs, Instant::now()));
    }

    async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        if !evict_if_expired(&mut entries, key, Instant::now()) {
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    async fn exists(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        evict_if_expired(&mut entries, key, Instant::now())
    }

    async fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        entries.remove(key).is_some()
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> bool {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if !evict_if_expired(&mut entries, key, now) {
            return false;
        }
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(deadline_after(now, ttl_secs));
        }
        true
    }

    async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        entries.values().filter(|entry| !entry.is_expired_at(now)).count()
    }

    async fn snapshot(&self) -> Vec<(String, Value)> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        let mut live: Vec<(String, Value)> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }

    async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
