//! Auto-save engine: keeps a durable snapshot of live form data
//! eventually consistent with what the user typed.
//!
//! DESIGN
//! ======
//! The consuming form feeds every change into `AutoSave::update`. Changes
//! restart a debounce timer; when it fires, one save cycle runs against the
//! latest data: validation gate, caller persistence (`SaveHandler`), local
//! snapshot, optional cross-tab broadcast. A failed cycle retries with
//! linear backoff until `max_retries` attempts are spent. Data adopted
//! from another tab goes through `AutoSave::apply_remote` instead, which
//! moves the baseline without starting a cycle.
//!
//! Saves for one engine are strictly sequential (`save_gate`). A timer that
//! fires while a save is in flight waits for it rather than interrupting
//! it, and cancelling a timer never cancels a save that already started.
//!
//! ERROR HANDLING
//! ==============
//! Only the caller's `SaveHandler` is authoritative. Local snapshot writes
//! are best-effort: a failure (e.g. quota) is logged and the cycle still
//! counts as saved. Nothing in here panics or throws across the callback
//! boundary; outcomes flow through `AutoSaveStatus` and `on_error`.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{AutoSaveConfig, StorageKeys};
use crate::error::SaveError;
use crate::snapshot::{self, FormData};
use crate::status::{AutoSaveStatus, StatusRegistry};
use crate::store::DurableStore;
use crate::sync::CrossTabSync;

// =============================================================================
// CALLER HOOKS
// =============================================================================

/// Authoritative persistence for form data (typically a remote endpoint).
///
/// Resolve on success, reject with a `SaveError` on failure.
#[async_trait]
pub trait SaveHandler: Send + Sync {
    async fn save(&self, data: &FormData) -> Result<(), SaveError>;
}

pub type ErrorCallback = Arc<dyn Fn(&SaveError) + Send + Sync>;
pub type RestoreCallback = Arc<dyn Fn(&FormData) + Send + Sync>;
pub type SaveValidator = Arc<dyn Fn(&FormData) -> bool + Send + Sync>;

/// Construction options for [`AutoSave::start`].
#[derive(Clone)]
pub struct AutoSaveOptions {
    enabled: bool,
    config: AutoSaveConfig,
    keys: StorageKeys,
    on_save: Option<Arc<dyn SaveHandler>>,
    on_error: Option<ErrorCallback>,
    on_restore: Option<RestoreCallback>,
    validate_before_save: Option<SaveValidator>,
    sync: Option<CrossTabSync>,
    registry: Option<StatusRegistry>,
}

impl Default for AutoSaveOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            config: AutoSaveConfig::default(),
            keys: StorageKeys::default(),
            on_save: None,
            on_error: None,
            on_restore: None,
            validate_before_save: None,
            sync: None,
            registry: None,
        }
    }
}

impl AutoSaveOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: AutoSaveConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.config.debounce = debounce;
        self
    }

    #[must_use]
    pub fn with_keys(mut self, keys: StorageKeys) -> Self {
        self.keys = keys;
        self
    }

    /// Persistence to await before the local snapshot is written.
    /// Without one, only the durable store is used.
    #[must_use]
    pub fn with_on_save(mut self, handler: Arc<dyn SaveHandler>) -> Self {
        self.on_save = Some(handler);
        self
    }

    /// Called on every failed attempt, including ones that will retry.
    #[must_use]
    pub fn with_on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SaveError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called at most once, at start, with a snapshot found in the store.
    #[must_use]
    pub fn with_on_restore<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FormData) + Send + Sync + 'static,
    {
        self.on_restore = Some(Arc::new(callback));
        self
    }

    /// Gate that skips a save cycle when it returns `false`.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&FormData) -> bool + Send + Sync + 'static,
    {
        self.validate_before_save = Some(Arc::new(validator));
        self
    }

    /// Broadcast every successful save through `sync`.
    #[must_use]
    pub fn with_sync(mut self, sync: CrossTabSync) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Mirror status into `registry` for global aggregation.
    #[must_use]
    pub fn with_registry(mut self, registry: StatusRegistry) -> Self {
        self.registry = Some(registry);
        self
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Handle to one form's auto-save engine. Clones share the engine.
///
/// The engine spawns timers, so it must be driven from a tokio runtime.
/// Dropping the last handle disposes it.
#[derive(Clone)]
pub struct AutoSave {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    form_id: String,
    store: Arc<dyn DurableStore>,
    options: AutoSaveOptions,
    state: Mutex<EngineState>,
    /// Held for the whole of a save cycle.
    save_gate: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<AutoSaveStatus>,
    registry_id: Option<Uuid>,
}

struct EngineState {
    /// Latest live form data.
    data: FormData,
    enabled: bool,
    /// Set once the start-up restore ran. Until then, incoming data is the
    /// baseline rather than an edit.
    restored: bool,
    /// Bumped whenever the live data is replaced. A save attempt belongs
    /// to the cycle whose generation it captured.
    generation: u64,
    /// Failed attempts in the current save cycle.
    retry_count: u32,
    /// Debounce or retry timer. At most one is armed.
    pending: Option<JoinHandle<()>>,
}

impl AutoSave {
    /// Create the engine for `form_id` and run the restore phase.
    ///
    /// `initial` is the form's first-render data; it is never saved on its
    /// own. If a durable snapshot exists it becomes the baseline instead and
    /// `on_restore` receives it.
    pub fn start(
        form_id: impl Into<String>,
        initial: FormData,
        store: Arc<dyn DurableStore>,
        options: AutoSaveOptions,
    ) -> Self {
        let form_id = form_id.into();
        let registry_id = options
            .registry
            .as_ref()
            .map(|registry| registry.register(form_id.clone()));
        let (status_tx, _) = watch::channel(AutoSaveStatus::default());
        let enabled = options.enabled;

        let inner = Arc::new(EngineInner {
            form_id,
            store,
            options,
            state: Mutex::new(EngineState {
                data: initial,
                enabled,
                restored: false,
                generation: 0,
                retry_count: 0,
                pending: None,
            }),
            save_gate: tokio::sync::Mutex::new(()),
            status_tx,
            registry_id,
        });
        inner.restore();
        Self { inner }
    }

    #[must_use]
    pub fn form_id(&self) -> &str {
        &self.inner.form_id
    }

    /// Current live data.
    #[must_use]
    pub fn data(&self) -> FormData {
        self.inner.lock_state().data.clone()
    }

    /// Feed the form's current data. Any difference from the previous data
    /// marks the form dirty and restarts the debounce timer.
    pub fn update(&self, data: FormData) {
        {
            let mut state = self.inner.lock_state();
            if !state.restored {
                state.data = data;
                return;
            }
            if state.data == data {
                return;
            }
            state.data = data;
            if !state.enabled {
                return;
            }
            // A live change starts a fresh cycle.
            state.generation += 1;
            state.retry_count = 0;
        }
        self.inner.update_status(|s| {
            s.has_unsaved = true;
            s.has_errors = false;
        });
        self.inner.schedule(self.inner.options.config.debounce);
    }

    /// Adopt data received from another tab as the saved baseline.
    ///
    /// Unlike [`AutoSave::update`] this is not an edit: nothing is saved or
    /// broadcast, and a pending local save is dropped.
    pub fn apply_remote(&self, data: FormData) {
        let pending = {
            let mut state = self.inner.lock_state();
            state.data = data;
            state.generation += 1;
            state.retry_count = 0;
            state.pending.take()
        };
        if let Some(pending) = pending {
            pending.abort();
        }
        self.inner.update_status(|s| {
            s.has_unsaved = false;
            s.has_errors = false;
            s.error = None;
        });
        debug!(form_id = %self.inner.form_id, "adopted remote data");
    }

    /// Save the current data now, skipping the debounce.
    ///
    /// # Errors
    ///
    /// Returns the `SaveHandler`'s error (or a timeout) for this attempt.
    /// Automatic retries still follow a failure.
    pub async fn force_save(&self) -> Result<(), SaveError> {
        self.inner.cancel_pending();
        self.inner.run_save().await
    }

    /// Remove the durable snapshot and cancel any pending timer. Live data
    /// is untouched.
    pub fn clear_saved(&self) {
        self.inner.cancel_pending();
        if let Err(e) = snapshot::remove_snapshot(self.inner.store.as_ref(), &self.inner.options.keys, &self.inner.form_id) {
            warn!(form_id = %self.inner.form_id, error = %e, "failed to remove durable snapshot");
        }
    }

    #[must_use]
    pub fn status(&self) -> AutoSaveStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Receiver that observes every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<AutoSaveStatus> {
        self.inner.status_tx.subscribe()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.lock_state().enabled
    }

    /// Turning the engine off cancels any pending timer; turning it back on
    /// waits for the next change.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.lock_state().enabled = enabled;
        if !enabled {
            self.inner.cancel_pending();
        }
    }

    /// Stop all timers and leave the status registry. Further updates are
    /// ignored.
    pub fn dispose(&self) {
        self.set_enabled(false);
        self.inner.deregister();
    }
}

impl EngineInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn update_status(&self, apply: impl FnOnce(&mut AutoSaveStatus)) {
        self.status_tx.send_modify(apply);
        if let (Some(registry), Some(id)) = (&self.options.registry, self.registry_id) {
            registry.update(id, &self.status_tx.borrow());
        }
    }

    fn deregister(&self) {
        if let (Some(registry), Some(id)) = (&self.options.registry, self.registry_id) {
            registry.deregister(id);
        }
    }

    fn restore(&self) {
        let stored = {
            let mut state = self.lock_state();
            if state.restored {
                return;
            }
            state.restored = true;
            if !state.enabled {
                return;
            }
            let Some(stored) = snapshot::read_snapshot(self.store.as_ref(), &self.options.keys, &self.form_id) else {
                return;
            };
            // The restored data is the new baseline, so re-populating the
            // form with it is not an edit.
            state.data = stored.data.clone();
            stored
        };

        self.update_status(|s| s.last_saved = Some(stored.timestamp));
        debug!(form_id = %self.form_id, fields = stored.data.len(), "restored durable snapshot");
        if let Some(on_restore) = &self.options.on_restore {
            on_restore(&stored.data);
        }
    }

    // =========================================================================
    // TIMERS
    // =========================================================================

    /// Arm the timer to start a save cycle after `delay`, replacing any
    /// armed timer.
    fn schedule(self: &Arc<Self>, delay: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Detached so aborting the timer cannot abort the save.
            tokio::spawn(async move {
                let _ = inner.run_save().await;
            });
        });

        let previous = self.lock_state().pending.replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel_pending(&self) {
        let pending = self.lock_state().pending.take();
        if let Some(pending) = pending {
            pending.abort();
        }
    }

    // =========================================================================
    // SAVE CYCLE
    // =========================================================================

    async fn run_save(self: &Arc<Self>) -> Result<(), SaveError> {
        let _gate = self.save_gate.lock().await;

        let (data, generation, enabled) = {
            let state = self.lock_state();
            (state.data.clone(), state.generation, state.enabled)
        };
        if !enabled {
            return Ok(());
        }
        if let Some(validate) = &self.options.validate_before_save {
            if !validate(&data) {
                debug!(form_id = %self.form_id, "save skipped by validator");
                return Ok(());
            }
        }

        self.update_status(|s| {
            s.is_saving = true;
            s.error = None;
        });

        let outcome = match &self.options.on_save {
            Some(handler) => self.call_handler(handler.as_ref(), &data).await,
            None => Ok(()),
        };

        match outcome {
            Ok(()) => {
                self.finish_success(&data, generation);
                Ok(())
            }
            Err(e) => {
                self.finish_failure(&e, generation);
                Err(e)
            }
        }
    }

    async fn call_handler(&self, handler: &dyn SaveHandler, data: &FormData) -> Result<(), SaveError> {
        match self.options.config.save_timeout {
            Some(limit) => tokio::time::timeout(limit, handler.save(data))
                .await
                .unwrap_or(Err(SaveError::TimedOut(limit))),
            None => handler.save(data).await,
        }
    }

    fn finish_success(&self, data: &FormData, generation: u64) {
        if let Err(e) = snapshot::write_snapshot(self.store.as_ref(), &self.options.keys, &self.form_id, data) {
            warn!(form_id = %self.form_id, error = %e, "local snapshot write failed; save still counts");
        }

        // EDGE: an edit that landed mid-save keeps the form dirty.
        let still_dirty = {
            let mut state = self.lock_state();
            if state.generation == generation {
                state.retry_count = 0;
            }
            state.data != *data
        };
        let now = OffsetDateTime::now_utc();
        self.update_status(|s| {
            s.is_saving = false;
            s.has_unsaved = still_dirty;
            s.has_errors = false;
            s.last_saved = Some(now);
            s.error = None;
        });

        if let Some(sync) = &self.options.sync {
            sync.broadcast_update(&self.form_id, data, None);
        }
        debug!(form_id = %self.form_id, still_dirty, "form saved");
    }

    fn finish_failure(self: &Arc<Self>, e: &SaveError, generation: u64) {
        let attempt = {
            let mut state = self.lock_state();
            if state.generation == generation {
                state.retry_count += 1;
                Some(state.retry_count)
            } else {
                None
            }
        };

        // EDGE: the data changed mid-attempt. The newer cycle owns the retry
        // budget and its own timer, so this failure is only reported.
        let Some(attempt) = attempt else {
            warn!(form_id = %self.form_id, error = %e, "superseded save attempt failed");
            self.update_status(|s| {
                s.is_saving = false;
                s.error = Some(e.to_string());
            });
            if let Some(on_error) = &self.options.on_error {
                on_error(e);
            }
            return;
        };
        let max = self.options.config.max_retries;
        let exhausted = attempt >= max;

        warn!(form_id = %self.form_id, attempt, max, error = %e, "save attempt failed");
        self.update_status(|s| {
            s.is_saving = false;
            s.error = Some(e.to_string());
            if exhausted {
                s.has_errors = true;
            }
        });
        if let Some(on_error) = &self.options.on_error {
            on_error(e);
        }

        if exhausted {
            error!(form_id = %self.form_id, attempts = attempt, error = %e, "save retries exhausted");
        } else {
            self.schedule(self.options.config.backoff_for(attempt));
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let pending = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pending
            .take();
        if let Some(pending) = pending {
            pending.abort();
        }
        self.deregister();
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
