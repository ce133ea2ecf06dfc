//! Form snapshots and their durable records.
//!
//! SYSTEM CONTEXT
//! ==============
//! The engine writes one record per form under `StorageKeys::snapshot_key`;
//! the synchronizer reads the same record to answer restore requests. These
//! helpers centralize the JSON glue so neither side repeats it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::config::StorageKeys;
use crate::error::StoreError;
use crate::store::DurableStore;

/// Field name to field value, in form order. Opaque to the engine.
pub type FormData = serde_json::Map<String, serde_json::Value>;

/// The durable record for one form: `{ "data": {...}, "timestamp": "<RFC 3339>" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub data: FormData,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Full form state as seen by one tab at one point in time.
///
/// Superseded, never mutated, by the next snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FormSnapshot {
    pub form_id: String,
    pub data: FormData,
    /// Milliseconds since Unix epoch, as stamped by the sending tab.
    pub timestamp_ms: i64,
    /// Per-form optimistic concurrency token.
    pub version: u64,
}

// =============================================================================
// JSON HELPERS
// =============================================================================

/// Load a JSON value from `store` under `key`.
///
/// Read failures and undecodable values are logged and reported as absent.
pub fn load_json<T: DeserializeOwned>(store: &dyn DurableStore, key: &str) -> Option<T> {
    let raw = match store.get_item(key) {
        Ok(raw) => raw?,
        Err(e) => {
            warn!(key, error = %e, "durable read failed");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "discarding undecodable durable record");
            None
        }
    }
}

/// Save a JSON value to `store` under `key`.
///
/// # Errors
///
/// Returns the store's error, or `StoreError::Encode` if `value` does not
/// serialize.
pub fn save_json<T: Serialize>(store: &dyn DurableStore, key: &str, value: &T) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)
        .map_err(|e| StoreError::Encode { key: key.to_owned(), message: e.to_string() })?;
    store.set_item(key, &raw)
}

// =============================================================================
// SNAPSHOT RECORDS
// =============================================================================

/// Read the durable snapshot for `form_id`.
pub fn read_snapshot(store: &dyn DurableStore, keys: &StorageKeys, form_id: &str) -> Option<StoredSnapshot> {
    load_json(store, &keys.snapshot_key(form_id))
}

/// Persist `data` as the durable snapshot for `form_id`, stamped now.
///
/// # Errors
///
/// Propagates the store's error (typically a quota failure).
pub fn write_snapshot(
    store: &dyn DurableStore,
    keys: &StorageKeys,
    form_id: &str,
    data: &FormData,
) -> Result<StoredSnapshot, StoreError> {
    let snapshot = StoredSnapshot { data: data.clone(), timestamp: OffsetDateTime::now_utc() };
    save_json(store, &keys.snapshot_key(form_id), &snapshot)?;
    Ok(snapshot)
}

/// Delete the durable snapshot for `form_id`. Missing snapshots are fine.
///
/// # Errors
///
/// Propagates the store's error.
pub fn remove_snapshot(store: &dyn DurableStore, keys: &StorageKeys, form_id: &str) -> Result<(), StoreError> {
    store.remove_item(&keys.snapshot_key(form_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn contact(name: &str) -> FormData {
        let serde_json::Value::Object(map) = json!({"name": name, "email": ""}) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn write_then_read_snapshot() {
        let store = MemoryStore::new();
        let keys = StorageKeys::default();

        let written = write_snapshot(&store, &keys, "contact-form", &contact("John Doe")).unwrap();
        let read = read_snapshot(&store, &keys, "contact-form").unwrap();

        assert_eq!(read.data, written.data);
        assert!((read.timestamp - written.timestamp).abs() < time::Duration::milliseconds(1));
        assert_eq!(read.data.get("name"), Some(&json!("John Doe")));
    }

    #[test]
    fn record_uses_iso_timestamp_and_data_fields() {
        let store = MemoryStore::new();
        let keys = StorageKeys::default();
        write_snapshot(&store, &keys, "contact-form", &contact("John Doe")).unwrap();

        let raw = store.get_item("form-auto-save-contact-form").unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["data"], json!({"name": "John Doe", "email": ""}));
        let ts = value["timestamp"].as_str().unwrap();
        assert!(OffsetDateTime::parse(ts, &time::format_description::well_known::Rfc3339).is_ok());
    }

    #[test]
    fn field_order_is_preserved() {
        let store = MemoryStore::new();
        let keys = StorageKeys::default();
        let serde_json::Value::Object(data) = json!({"zeta": 1, "alpha": 2, "mid": 3}) else {
            unreachable!()
        };
        write_snapshot(&store, &keys, "f", &data).unwrap();

        let read = read_snapshot(&store, &keys, "f").unwrap();
        let order: Vec<&str> = read.data.keys().map(String::as_str).collect();
        assert_eq!(order, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn garbage_record_reads_as_absent() {
        let store = MemoryStore::new();
        let keys = StorageKeys::default();
        store.set_item(&keys.snapshot_key("f"), "{not json").unwrap();
        assert!(read_snapshot(&store, &keys, "f").is_none());
    }

    #[test]
    fn remove_snapshot_twice_is_fine() {
        let store = MemoryStore::new();
        let keys = StorageKeys::default();
        write_snapshot(&store, &keys, "f", &contact("x")).unwrap();
        remove_snapshot(&store, &keys, "f").unwrap();
        remove_snapshot(&store, &keys, "f").unwrap();
        assert!(read_snapshot(&store, &keys, "f").is_none());
    }

    #[test]
    fn quota_failure_is_returned() {
        let store = MemoryStore::with_quota(8);
        let keys = StorageKeys::default();
        let err = write_snapshot(&store, &keys, "f", &contact("too long")).unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
    }
}
