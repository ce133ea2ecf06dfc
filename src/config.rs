//! Configuration: engine tuning knobs and storage key layout.
//!
//! DESIGN
//! ======
//! Defaults mirror the browser behavior the forms were tuned against
//! (300ms debounce, three attempts, linear 1s backoff). Deployments can
//! override the knobs through environment variables; a missing or
//! unparsable value silently falls back to the default.

use std::time::Duration;

pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// `0` disables the save timeout.
pub const DEFAULT_SAVE_TIMEOUT_MS: u64 = 0;

pub const DEFAULT_SNAPSHOT_PREFIX: &str = "form-auto-save-";
pub const DEFAULT_SYNC_PREFIX: &str = "form-sync-";

// =============================================================================
// AUTO-SAVE CONFIG
// =============================================================================

/// Timing policy for one auto-save engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSaveConfig {
    /// Quiet period after the last change before a save starts.
    pub debounce: Duration,
    /// Attempts allowed per save cycle before giving up.
    pub max_retries: u32,
    /// Retry `n` waits `retry_backoff * n`.
    pub retry_backoff: Duration,
    /// Upper bound on one caller persistence call. `None` waits forever.
    pub save_timeout: Option<Duration>,
}

impl AutoSaveConfig {
    /// Build config from environment variables.
    ///
    /// - `AUTOSAVE_DEBOUNCE_MS`: default 300
    /// - `AUTOSAVE_MAX_RETRIES`: default 3
    /// - `AUTOSAVE_RETRY_BACKOFF_MS`: default 1000
    /// - `AUTOSAVE_SAVE_TIMEOUT_MS`: default 0 (no timeout)
    #[must_use]
    pub fn from_env() -> Self {
        let timeout_ms = env_parse("AUTOSAVE_SAVE_TIMEOUT_MS", DEFAULT_SAVE_TIMEOUT_MS);
        Self {
            debounce: Duration::from_millis(env_parse("AUTOSAVE_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)),
            max_retries: env_parse("AUTOSAVE_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            retry_backoff: Duration::from_millis(env_parse("AUTOSAVE_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS)),
            save_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        }
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    #[must_use]
    pub fn with_save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout = Some(timeout);
        self
    }

    /// Delay before retry number `retry_count` (1-based).
    #[must_use]
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        self.retry_backoff.saturating_mul(retry_count)
    }
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            save_timeout: None,
        }
    }
}

// =============================================================================
// STORAGE KEYS
// =============================================================================

/// Key layout shared by the engine and the synchronizer.
///
/// Snapshots and broadcast messages live under different prefixes so a
/// change listener can tell them apart by key alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub snapshot_prefix: String,
    pub sync_prefix: String,
}

impl StorageKeys {
    #[must_use]
    pub fn new(snapshot_prefix: impl Into<String>, sync_prefix: impl Into<String>) -> Self {
        Self { snapshot_prefix: snapshot_prefix.into(), sync_prefix: sync_prefix.into() }
    }

    /// Key of the durable snapshot for `form_id`.
    #[must_use]
    pub fn snapshot_key(&self, form_id: &str) -> String {
        format!("{}{form_id}", self.snapshot_prefix)
    }

    /// Key of the broadcast channel record for `form_id`.
    #[must_use]
    pub fn sync_key(&self, form_id: &str) -> String {
        format!("{}{form_id}", self.sync_prefix)
    }

    /// Recover the form ID from a broadcast key. `None` for foreign keys.
    #[must_use]
    pub fn form_id_from_sync_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.sync_prefix.as_str())
            .filter(|form_id| !form_id.is_empty())
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_PREFIX, DEFAULT_SYNC_PREFIX)
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
