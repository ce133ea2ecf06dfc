//! Durable store: origin-wide key/value storage with change notifications.
//!
//! DESIGN
//! ======
//! The store plays the part of browser `localStorage`: synchronous string
//! reads and writes, shared by every tab of one origin, last writer wins.
//! Every mutation is published as a `StorageEvent` on a tokio broadcast
//! channel, which is the delivery primitive the cross-tab synchronizer
//! listens on. Unlike the browser, the writer also sees its own events;
//! receivers filter by tab ID instead.
//!
//! Two backends ship here: `MemoryStore` (clones share one map, so clones
//! behave like sibling tabs) and `FileStore` (one file per key, survives
//! process restarts).

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::broadcast;

use crate::error::StoreError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// TRAIT
// =============================================================================

/// A key change observed on the store. `new_value` is `None` on removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
}

/// Shared durable key/value storage.
pub trait DurableStore: Send + Sync {
    /// Read the value under `key`, if any.
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete `key`. Removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), StoreError>;

    /// Receive every subsequent mutation of the store.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// In-process store. Clones share state and change notifications.
#[derive(Clone)]
pub struct MemoryStore {
    items: Arc<Mutex<HashMap<String, String>>>,
    events: broadcast::Sender<StorageEvent>,
    /// Byte budget over all keys and values. `None` is unlimited.
    quota: Option<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { items: Arc::new(Mutex::new(HashMap::new())), events, quota: None }
    }

    /// A store that rejects writes once keys plus values exceed `bytes`.
    #[must_use]
    pub fn with_quota(bytes: usize) -> Self {
        Self { quota: Some(bytes), ..Self::new() }
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn publish(&self, key: &str, new_value: Option<&str>) {
        // No receivers is fine; nobody is listening yet.
        let _ = self
            .events
            .send(StorageEvent { key: key.to_owned(), new_value: new_value.map(str::to_owned) });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut items = self.lock();
            if let Some(quota) = self.quota {
                let used: usize = items
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                let needed = key.len() + value.len();
                if used + needed > quota {
                    return Err(StoreError::QuotaExceeded {
                        key: key.to_owned(),
                        needed,
                        available: quota.saturating_sub(used),
                    });
                }
            }
            items.insert(key.to_owned(), value.to_owned());
        }
        self.publish(key, Some(value));
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        let removed = self.lock().remove(key).is_some();
        if removed {
            self.publish(key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// Directory-backed store: one file per key.
///
/// Change events reach subscribers in this process only.
#[derive(Clone)]
pub struct FileStore {
    dir: PathBuf,
    events: broadcast::Sender<StorageEvent>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", dir.display())))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self { dir, events })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.item", encode_key(key)))
    }

    fn publish(&self, key: &str, new_value: Option<&str>) {
        let _ = self
            .events
            .send(StorageEvent { key: key.to_owned(), new_value: new_value.map(str::to_owned) });
    }
}

impl DurableStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io { key: key.to_owned(), message: e.to_string() }),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        // Unique per writer so handles in other processes never share it.
        let suffix: u64 = rand::rng().random();
        let tmp = path.with_extension(format!("{}-{suffix:016x}.tmp", std::process::id()));
        let io_err = |e: std::io::Error| StoreError::Io { key: key.to_owned(), message: e.to_string() };

        // Write-then-rename so readers never observe a torn value.
        std::fs::write(&tmp, value).map_err(io_err)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        self.publish(key, Some(value));
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => {
                self.publish(key, None);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io { key: key.to_owned(), message: e.to_string() }),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_-]` so any key maps to a
/// single safe file name.
fn encode_key(key: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
