//! Debounced form auto-save with cross-tab synchronization.
//!
//! Three cooperating parts, one instance of the first per form:
//!
//! - [`AutoSave`] watches live form data, persists it after a quiet period
//!   through a caller [`SaveHandler`] and a durable local snapshot, retries
//!   failures with linear backoff, and restores the snapshot on start.
//! - [`CrossTabSync`] propagates saved data between tabs sharing one
//!   [`DurableStore`], discarding stale or duplicate versions.
//! - [`StatusRegistry`] folds every engine's [`AutoSaveStatus`] into one
//!   [`GlobalStatus`] for an app-wide badge.
//!
//! Everything is driven from a tokio runtime. Logging goes through
//! `tracing`; install a subscriber to see it.

pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod sync;

pub use config::{AutoSaveConfig, StorageKeys};
pub use engine::{AutoSave, AutoSaveOptions, SaveHandler};
pub use error::{MessageError, SaveError, StoreError};
pub use message::{CrossTabMessage, MessageBody, MessageKind};
pub use snapshot::{FormData, FormSnapshot, StoredSnapshot};
pub use status::{AutoSaveStatus, GlobalStatus, Indicator, StatusRegistry};
pub use store::{DurableStore, FileStore, MemoryStore, StorageEvent};
pub use sync::{CrossTabSync, Subscription, SyncEvent};
