//! Auto-save status: per-form flags, their presentation, and the
//! process-wide aggregate.
//!
//! DESIGN
//! ======
//! Each engine owns its `AutoSaveStatus` and mirrors every change into a
//! shared `StatusRegistry` entry. The registry is read-only from the
//! outside: it answers "is anything unsaved, saving, or failing?" for a
//! global badge and never influences persistence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// PER-FORM STATUS
// =============================================================================

/// Observable save state of one form.
///
/// `has_unsaved` and `is_saving` may both be set: an edit landed while a
/// save was in flight, so another cycle is still due.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSaveStatus {
    pub is_saving: bool,
    pub has_unsaved: bool,
    /// Set once a save cycle exhausts its retries; cleared by the next
    /// success or edit.
    pub has_errors: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_saved: Option<OffsetDateTime>,
    pub error: Option<String>,
}

/// What a status badge should show, most urgent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indicator {
    Saving,
    Failed { message: String },
    Unsaved,
    Saved { at: OffsetDateTime },
    Idle,
}

impl AutoSaveStatus {
    #[must_use]
    pub fn indicator(&self) -> Indicator {
        if self.is_saving {
            return Indicator::Saving;
        }
        if self.has_errors {
            let message = self.error.clone().unwrap_or_else(|| "unknown error".to_owned());
            return Indicator::Failed { message };
        }
        if self.has_unsaved {
            return Indicator::Unsaved;
        }
        match self.last_saved {
            Some(at) => Indicator::Saved { at },
            None => Indicator::Idle,
        }
    }

    /// User-facing label, with save time relative to `now`.
    #[must_use]
    pub fn describe(&self, now: OffsetDateTime) -> String {
        match self.indicator() {
            Indicator::Saving => "Saving...".to_owned(),
            Indicator::Failed { message } => format!("Save failed: {message}"),
            Indicator::Unsaved => "Unsaved changes".to_owned(),
            Indicator::Saved { at } => format!("Saved {}", relative_time(now - at)),
            Indicator::Idle => "No changes".to_owned(),
        }
    }
}

fn relative_time(elapsed: time::Duration) -> String {
    let secs = elapsed.whole_seconds().max(0);
    let plural = |n: i64, unit: &str| {
        if n == 1 { format!("1 {unit} ago") } else { format!("{n} {unit}s ago") }
    };
    match secs {
        0..10 => "just now".to_owned(),
        10..60 => plural(secs, "second"),
        60..3600 => plural(secs / 60, "minute"),
        3600..86_400 => plural(secs / 3600, "hour"),
        _ => plural(secs / 86_400, "day"),
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Summary over every registered form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStatus {
    pub has_unsaved: bool,
    pub is_saving: bool,
    pub has_errors: bool,
    /// Number of live engines.
    pub count: usize,
}

struct RegisteredForm {
    form_id: String,
    status: AutoSaveStatus,
}

/// Shared registry of live engine statuses. Clones share entries.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    entries: Arc<Mutex<HashMap<Uuid, RegisteredForm>>>,
}

impl StatusRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RegisteredForm>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add an engine for `form_id`; returns its entry ID.
    pub fn register(&self, form_id: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock()
            .insert(id, RegisteredForm { form_id: form_id.into(), status: AutoSaveStatus::default() });
        id
    }

    /// Replace the status of entry `id`. Unknown IDs are ignored.
    pub fn update(&self, id: Uuid, status: &AutoSaveStatus) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.status = status.clone();
        }
    }

    pub fn deregister(&self, id: Uuid) {
        self.lock().remove(&id);
    }

    #[must_use]
    pub fn aggregate(&self) -> GlobalStatus {
        let entries = self.lock();
        entries.values().fold(
            GlobalStatus { count: entries.len(), ..GlobalStatus::default() },
            |acc, entry| GlobalStatus {
                has_unsaved: acc.has_unsaved || entry.status.has_unsaved,
                is_saving: acc.is_saving || entry.status.is_saving,
                has_errors: acc.has_errors || entry.status.has_errors,
                count: acc.count,
            },
        )
    }

    /// Status of every registered form, sorted by form ID.
    #[must_use]
    pub fn forms(&self) -> Vec<(String, AutoSaveStatus)> {
        let mut forms: Vec<_> = self
            .lock()
            .values()
            .map(|entry| (entry.form_id.clone(), entry.status.clone()))
            .collect();
        forms.sort_by(|a, b| a.0.cmp(&b.0));
        forms
    }
}

#[cfg(test)]
#[path = "status_test.rs"]
mod tests;
