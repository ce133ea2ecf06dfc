//! Cross-tab synchronizer: propagates form updates between tabs sharing
//! one durable store.
//!
//! ARCHITECTURE
//! ============
//! Each tab owns one `CrossTabSync`. Publishing writes a `CrossTabMessage`
//! under the form's sync key; a listener task receives the store's change
//! events, decodes records under the sync prefix and fans accepted messages
//! out to the callbacks subscribed for that form.
//!
//! DESIGN
//! ======
//! - Ordering uses a per-form version counter, not wall clocks. An update
//!   at or below the last version this tab recorded is stale and dropped.
//! - A tab never reacts to its own records (`tabId` filter).
//! - Conflicts are transported, not resolved. Forms may install a resolver
//!   and apply it when a conflict event arrives.
//! - The instance is constructed explicitly and disposed explicitly, so
//!   tests can run several isolated "tabs" in one process.
//!
//! ERROR HANDLING
//! ==============
//! Malformed records and failing store writes are logged and dropped.
//! A panicking subscriber is caught and logged; other subscribers still run.

use std::collections::HashMap;
use std::fmt::Write;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::Rng;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::StorageKeys;
use crate::message::{ConflictData, CrossTabMessage, MessageBody};
use crate::snapshot::{self, FormData, FormSnapshot};
use crate::store::{DurableStore, StorageEvent};

// =============================================================================
// TYPES
// =============================================================================

/// Normalized notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Another tab published full form state.
    Update(FormSnapshot),
    /// Another tab changed one field; `snapshot.data` is its form state.
    FieldUpdate { snapshot: FormSnapshot, field_path: String },
    /// The form was submitted or discarded elsewhere.
    Clear { form_id: String },
    /// Latest durable state, in answer to a restore request.
    Restore { form_id: String, data: FormData },
    /// Divergent edits, both sides verbatim.
    Conflict { form_id: String, local_data: FormData, remote_data: FormData },
}

impl SyncEvent {
    #[must_use]
    pub fn form_id(&self) -> &str {
        match self {
            Self::Update(snapshot) | Self::FieldUpdate { snapshot, .. } => &snapshot.form_id,
            Self::Clear { form_id } | Self::Restore { form_id, .. } | Self::Conflict { form_id, .. } => form_id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::FieldUpdate { .. } => "field-update",
            Self::Clear { .. } => "clear",
            Self::Restore { .. } => "restore",
            Self::Conflict { .. } => "conflict",
        }
    }
}

pub type SyncCallback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// `(local, remote) -> merged`.
pub type ConflictResolver = Arc<dyn Fn(&FormData, &FormData) -> FormData + Send + Sync>;

// =============================================================================
// SYNCHRONIZER
// =============================================================================

/// One tab's view of the shared broadcast channel. Clones share state.
#[derive(Clone)]
pub struct CrossTabSync {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    tab_id: String,
    store: Arc<dyn DurableStore>,
    keys: StorageKeys,
    /// Gates outgoing updates and conflicts only.
    active: AtomicBool,
    state: Mutex<SyncState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct SyncState {
    /// Last version recorded per form, sent or accepted.
    versions: HashMap<String, u64>,
    subscribers: HashMap<String, Vec<(u64, SyncCallback)>>,
    resolvers: HashMap<String, ConflictResolver>,
    next_subscriber_id: u64,
}

impl CrossTabSync {
    /// Create a synchronizer and start listening for other tabs.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(store: Arc<dyn DurableStore>, keys: StorageKeys) -> Self {
        let sync = Self::detached(store, keys);
        sync.spawn_listener();
        sync
    }

    /// Create a synchronizer that publishes but does not listen. Incoming
    /// records are fed through [`CrossTabSync::handle_storage_event`].
    pub fn detached(store: Arc<dyn DurableStore>, keys: StorageKeys) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                tab_id: generate_tab_id(),
                store,
                keys,
                active: AtomicBool::new(true),
                state: Mutex::new(SyncState::default()),
                listener: Mutex::new(None),
            }),
        }
    }

    fn spawn_listener(&self) {
        // Subscribe before spawning so no event slips between the two.
        let mut rx = self.inner.store.subscribe();
        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        let tab_id = self.inner.tab_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        inner.handle_storage_event(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%tab_id, skipped, "cross-tab listener lagged; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(%tab_id, "cross-tab listener stopped");
        });

        let mut listener = lock(&self.inner.listener);
        if let Some(previous) = listener.replace(handle) {
            previous.abort();
        }
    }

    #[must_use]
    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Call `callback` for every accepted message about `form_id`.
    ///
    /// The returned guard unsubscribes when dropped.
    pub fn subscribe<F>(&self, form_id: &str, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut state = self.inner.lock_state();
        state.next_subscriber_id += 1;
        let id = state.next_subscriber_id;
        state
            .subscribers
            .entry(form_id.to_owned())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription { sync: Arc::downgrade(&self.inner), form_id: form_id.to_owned(), id }
    }

    /// Number of live callbacks for `form_id`.
    #[must_use]
    pub fn subscriber_count(&self, form_id: &str) -> usize {
        self.inner
            .lock_state()
            .subscribers
            .get(form_id)
            .map_or(0, Vec::len)
    }

    // =========================================================================
    // PUBLISHING
    // =========================================================================

    /// Publish new state for `form_id` at the next version.
    ///
    /// Pass `field_path` for a single-field change. Returns the version
    /// used, or `None` while synchronization is disabled.
    pub fn broadcast_update(&self, form_id: &str, data: &FormData, field_path: Option<&str>) -> Option<u64> {
        if !self.is_active() {
            return None;
        }
        let version = {
            let mut state = self.inner.lock_state();
            let version = state.versions.entry(form_id.to_owned()).or_insert(0);
            *version += 1;
            *version
        };
        let message = CrossTabMessage::update(
            form_id,
            self.inner.tab_id.as_str(),
            version,
            data.clone(),
            field_path.map(str::to_owned),
        );
        self.inner.post(&message);
        Some(version)
    }

    /// Tell other tabs the form is gone and delete its durable snapshot.
    pub fn broadcast_clear(&self, form_id: &str) {
        let message = CrossTabMessage::clear(form_id, self.inner.tab_id.as_str());
        self.inner.post(&message);
        if let Err(e) = snapshot::remove_snapshot(self.inner.store.as_ref(), &self.inner.keys, form_id) {
            warn!(form_id, error = %e, "failed to remove durable snapshot on clear");
        }
        self.inner.lock_state().versions.remove(form_id);
    }

    /// Publish both sides of a conflict. No-op while disabled.
    pub fn broadcast_conflict(&self, form_id: &str, local_data: &FormData, remote_data: &FormData) {
        if !self.is_active() {
            return;
        }
        let message = CrossTabMessage::conflict(
            form_id,
            self.inner.tab_id.as_str(),
            local_data.clone(),
            remote_data.clone(),
        );
        self.inner.post(&message);
    }

    /// Ask other tabs to replay the durable state of `form_id`.
    pub fn broadcast_restore_request(&self, form_id: &str) {
        let message = CrossTabMessage::restore_request(form_id, self.inner.tab_id.as_str());
        self.inner.post(&message);
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Durable snapshot data for `form_id`, read directly from the store.
    #[must_use]
    pub fn get_latest_data(&self, form_id: &str) -> Option<FormData> {
        snapshot::read_snapshot(self.inner.store.as_ref(), &self.inner.keys, form_id).map(|s| s.data)
    }

    /// Last version this tab sent or accepted for `form_id`.
    #[must_use]
    pub fn last_version(&self, form_id: &str) -> Option<u64> {
        self.inner.lock_state().versions.get(form_id).copied()
    }

    // =========================================================================
    // CONFLICT RESOLUTION
    // =========================================================================

    pub fn set_conflict_resolver<F>(&self, form_id: &str, resolver: F)
    where
        F: Fn(&FormData, &FormData) -> FormData + Send + Sync + 'static,
    {
        self.inner
            .lock_state()
            .resolvers
            .insert(form_id.to_owned(), Arc::new(resolver));
    }

    #[must_use]
    pub fn get_conflict_resolver(&self, form_id: &str) -> Option<ConflictResolver> {
        self.inner.lock_state().resolvers.get(form_id).cloned()
    }

    /// Merge with the installed resolver. `None` if none is installed.
    #[must_use]
    pub fn resolve_conflict(&self, form_id: &str, local: &FormData, remote: &FormData) -> Option<FormData> {
        let resolver = self.get_conflict_resolver(form_id)?;
        Some(resolver(local, remote))
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    pub fn enable(&self) {
        self.inner.active.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Stop listening and forget all per-form state of this tab.
    pub fn dispose(&self) {
        if let Some(handle) = lock(&self.inner.listener).take() {
            handle.abort();
        }
        let mut state = self.inner.lock_state();
        state.versions.clear();
        state.subscribers.clear();
        state.resolvers.clear();
    }

    /// Apply one store change as if it came from the listener task.
    pub fn handle_storage_event(&self, event: &StorageEvent) {
        self.inner.handle_storage_event(event);
    }
}

// =============================================================================
// RECEIVE PATH
// =============================================================================

impl SyncInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        lock(&self.state)
    }

    fn post(&self, message: &CrossTabMessage) {
        let key = self.keys.sync_key(&message.form_id);
        let result = message
            .encode()
            .map_err(|e| e.to_string())
            .and_then(|raw| self.store.set_item(&key, &raw).map_err(|e| e.to_string()));
        if let Err(error) = result {
            warn!(
                form_id = %message.form_id,
                kind = message.kind().as_str(),
                %error,
                "cross-tab broadcast failed"
            );
        }
    }

    fn handle_storage_event(&self, event: &StorageEvent) {
        let Some(form_id) = self.keys.form_id_from_sync_key(&event.key) else {
            return;
        };
        // Removal of the channel record carries no message.
        let Some(raw) = event.new_value.as_deref() else {
            return;
        };
        let message = match CrossTabMessage::decode(&event.key, form_id, raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(key = %event.key, error = %e, "dropping malformed cross-tab message");
                return;
            }
        };
        if message.tab_id == self.tab_id {
            return;
        }
        self.accept(message);
    }

    fn accept(&self, message: CrossTabMessage) {
        let CrossTabMessage { form_id, timestamp, tab_id, body } = message;
        let event = match body {
            MessageBody::Update { version, field_path, data } => {
                let accepted_version = {
                    let mut state = self.lock_state();
                    let last = state.versions.get(&form_id).copied();
                    if let (Some(incoming), Some(last)) = (version, last) {
                        if incoming <= last {
                            debug!(%form_id, from = %tab_id, incoming, last, "discarding stale update");
                            return;
                        }
                    }
                    if let Some(incoming) = version {
                        state.versions.insert(form_id.clone(), incoming);
                    }
                    version.or(last).unwrap_or(0)
                };
                let snapshot = FormSnapshot { form_id, data, timestamp_ms: timestamp, version: accepted_version };
                match field_path {
                    Some(field_path) => SyncEvent::FieldUpdate { snapshot, field_path },
                    None => SyncEvent::Update(snapshot),
                }
            }
            MessageBody::Clear => {
                self.lock_state().versions.remove(&form_id);
                SyncEvent::Clear { form_id }
            }
            MessageBody::RestoreRequest => {
                let Some(stored) = snapshot::read_snapshot(self.store.as_ref(), &self.keys, &form_id) else {
                    debug!(%form_id, from = %tab_id, "restore requested but no durable snapshot");
                    return;
                };
                SyncEvent::Restore { form_id, data: stored.data }
            }
            MessageBody::Conflict { data: ConflictData { local_data, remote_data } } => {
                SyncEvent::Conflict { form_id, local_data, remote_data }
            }
        };
        self.dispatch(&event);
    }

    fn dispatch(&self, event: &SyncEvent) {
        let callbacks: Vec<SyncCallback> = {
            let state = self.lock_state();
            let Some(subscribers) = state.subscribers.get(event.form_id()) else {
                return;
            };
            subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(form_id = event.form_id(), kind = event.kind(), "cross-tab subscriber panicked");
            }
        }
    }

    fn remove_subscriber(&self, form_id: &str, id: u64) {
        let mut state = self.lock_state();
        let Some(subscribers) = state.subscribers.get_mut(form_id) else {
            return;
        };
        subscribers.retain(|(existing, _)| *existing != id);
        if subscribers.is_empty() {
            state.subscribers.remove(form_id);
        }
    }
}

impl Drop for SyncInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Registration returned by [`CrossTabSync::subscribe`].
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    sync: Weak<SyncInner>,
    form_id: String,
    id: u64,
}

impl Subscription {
    /// Stop receiving events. Same as dropping the guard.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.sync.upgrade() {
            inner.remove_subscriber(&self.form_id, self.id);
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn generate_tab_id() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    let mut id = String::with_capacity(4 + bytes.len() * 2);
    id.push_str("tab-");
    for b in bytes {
        let _ = write!(id, "{b:02x}");
    }
    id
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
