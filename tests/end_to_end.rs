//! End-to-end scenarios: engines, synchronizers, and stores wired together
//! the way a multi-tab form app uses them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use form_autosave::{
    AutoSave, AutoSaveOptions, CrossTabSync, DurableStore, FileStore, FormData, GlobalStatus, MemoryStore,
    SaveError, SaveHandler, StatusRegistry, StorageEvent, StorageKeys, StoreError, Subscription, SyncEvent,
};
use serde_json::json;
use tokio::time::sleep;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn form(value: serde_json::Value) -> FormData {
    let serde_json::Value::Object(map) = value else {
        panic!("test data must be an object");
    };
    map
}

/// Remote endpoint stand-in: fails the first `failures` calls.
struct FlakyEndpoint {
    received: Mutex<Vec<FormData>>,
    failures_left: Mutex<u32>,
}

impl FlakyEndpoint {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self { received: Mutex::new(Vec::new()), failures_left: Mutex::new(failures) })
    }

    fn received(&self) -> Vec<FormData> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl SaveHandler for FlakyEndpoint {
    async fn save(&self, data: &FormData) -> Result<(), SaveError> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(SaveError::failed("503 service unavailable"));
        }
        self.received.lock().unwrap().push(data.clone());
        Ok(())
    }
}

fn options_for(endpoint: &Arc<FlakyEndpoint>) -> AutoSaveOptions {
    let handler: Arc<dyn SaveHandler> = endpoint.clone();
    AutoSaveOptions::new().with_on_save(handler)
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test(start_paused = true)]
async fn contact_form_survives_reload_until_cleared() {
    init_logging();
    let store = MemoryStore::new();
    let endpoint = FlakyEndpoint::new(0);

    let engine = AutoSave::start("contact", form(json!({"name": "", "email": ""})), Arc::new(store.clone()), options_for(&endpoint));
    engine.update(form(json!({"name": "Ada", "email": ""})));
    sleep(Duration::from_millis(100)).await;
    engine.update(form(json!({"name": "Ada", "email": "ada@example.com"})));
    sleep(Duration::from_secs(1)).await;

    assert_eq!(endpoint.received(), [form(json!({"name": "Ada", "email": "ada@example.com"}))]);
    assert!(!engine.status().has_unsaved);
    drop(engine);

    // Reload: a fresh engine over the same store restores the draft.
    let restored = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&restored);
    let engine = AutoSave::start(
        "contact",
        form(json!({"name": "", "email": ""})),
        Arc::new(store.clone()),
        options_for(&endpoint).with_on_restore(move |data| sink.lock().unwrap().push(data.clone())),
    );
    assert_eq!(*restored.lock().unwrap(), [form(json!({"name": "Ada", "email": "ada@example.com"}))]);

    // Submitted: drop the draft so the next visit starts empty.
    engine.clear_saved();
    drop(engine);

    let restores = Arc::new(Mutex::new(0_u32));
    let counter = Arc::clone(&restores);
    let _engine = AutoSave::start(
        "contact",
        form(json!({"name": "", "email": ""})),
        Arc::new(store.clone()),
        options_for(&endpoint).with_on_restore(move |_| *counter.lock().unwrap() += 1),
    );
    assert_eq!(*restores.lock().unwrap(), 0);
}

fn record_updates(sync: &CrossTabSync, form_id: &str) -> (Subscription, Arc<Mutex<Vec<(u64, FormData)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = sync.subscribe(form_id, move |event| {
        if let SyncEvent::Update(snapshot) = event {
            sink.lock().unwrap().push((snapshot.version, snapshot.data.clone()));
        }
    });
    (sub, seen)
}

#[tokio::test(start_paused = true)]
async fn edits_alternate_between_two_tabs() {
    init_logging();
    let store = MemoryStore::new();
    let tab_a = CrossTabSync::start(Arc::new(store.clone()), StorageKeys::default());
    let tab_b = CrossTabSync::start(Arc::new(store.clone()), StorageKeys::default());
    let (_sub_a, seen_by_a) = record_updates(&tab_a, "profile");
    let (_sub_b, seen_by_b) = record_updates(&tab_b, "profile");

    let endpoint = FlakyEndpoint::new(0);
    let start = |sync: &CrossTabSync| {
        AutoSave::start(
            "profile",
            form(json!({"name": ""})),
            Arc::new(store.clone()),
            options_for(&endpoint).with_sync(sync.clone()),
        )
    };
    let engine_a = start(&tab_a);
    let engine_b = start(&tab_b);

    engine_a.update(form(json!({"name": "Alice"})));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(*seen_by_b.lock().unwrap(), [(1, form(json!({"name": "Alice"})))]);

    // Tab B adopts the remote data; the form then echoes it back.
    let latest = tab_b.get_latest_data("profile").unwrap();
    engine_b.apply_remote(latest.clone());
    engine_b.update(latest);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(endpoint.received(), [form(json!({"name": "Alice"}))]);
    assert!(seen_by_a.lock().unwrap().is_empty());

    engine_b.update(form(json!({"name": "Alice B"})));
    sleep(Duration::from_secs(1)).await;

    assert_eq!(*seen_by_a.lock().unwrap(), [(2, form(json!({"name": "Alice B"})))]);
    assert_eq!(
        endpoint.received(),
        [form(json!({"name": "Alice"})), form(json!({"name": "Alice B"}))]
    );
    assert_eq!(tab_a.last_version("profile"), Some(2));
    assert_eq!(tab_b.last_version("profile"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn restore_request_is_answered_from_the_shared_snapshot() {
    init_logging();
    let store = MemoryStore::new();
    let tab_a = CrossTabSync::start(Arc::new(store.clone()), StorageKeys::default());
    let tab_b = CrossTabSync::start(Arc::new(store.clone()), StorageKeys::default());

    let endpoint = FlakyEndpoint::new(0);
    let engine = AutoSave::start("notes", form(json!({})), Arc::new(store.clone()), options_for(&endpoint));
    engine.update(form(json!({"body": "draft"})));
    engine.force_save().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = tab_a.subscribe("notes", move |event| sink.lock().unwrap().push(event.clone()));

    tab_b.broadcast_restore_request("notes");
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        *seen.lock().unwrap(),
        [SyncEvent::Restore { form_id: "notes".into(), data: form(json!({"body": "draft"})) }]
    );
}

#[tokio::test(start_paused = true)]
async fn flaky_endpoint_recovers_and_snapshot_survives_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let endpoint = FlakyEndpoint::new(2);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);

    let store: Arc<dyn DurableStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let engine = AutoSave::start(
        "quote",
        form(json!({"qty": 0})),
        store,
        options_for(&endpoint).with_on_error(move |e| sink.lock().unwrap().push(e.to_string())),
    );
    engine.update(form(json!({"qty": 12})));
    sleep(Duration::from_secs(10)).await;

    assert_eq!(*errors.lock().unwrap(), ["503 service unavailable", "503 service unavailable"]);
    assert_eq!(endpoint.received(), [form(json!({"qty": 12}))]);
    let status = engine.status();
    assert!(!status.has_errors);
    assert!(status.last_saved.is_some());
    drop(engine);

    // A new process opens the same directory.
    let reopened: Arc<dyn DurableStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let engine = AutoSave::start("quote", form(json!({"qty": 0})), reopened, AutoSaveOptions::new());
    assert_eq!(engine.data(), form(json!({"qty": 12})));
}

#[tokio::test(start_paused = true)]
async fn registry_reports_any_unsaved_form() {
    init_logging();
    let store = MemoryStore::new();
    let registry = StatusRegistry::new();
    let endpoint = FlakyEndpoint::new(0);

    let contact = AutoSave::start(
        "contact",
        form(json!({"name": ""})),
        Arc::new(store.clone()),
        options_for(&endpoint).with_registry(registry.clone()),
    );
    let _quote = AutoSave::start(
        "quote",
        form(json!({"qty": 0})),
        Arc::new(store.clone()),
        options_for(&endpoint).with_registry(registry.clone()),
    );

    contact.update(form(json!({"name": "Ada"})));
    assert_eq!(
        registry.aggregate(),
        GlobalStatus { has_unsaved: true, is_saving: false, has_errors: false, count: 2 }
    );

    sleep(Duration::from_secs(1)).await;
    assert_eq!(registry.aggregate(), GlobalStatus { count: 2, ..GlobalStatus::default() });
}

/// Durable store whose first `failures` writes fail with a quota error.
struct FlakyStore {
    inner: MemoryStore,
    failures_left: Mutex<u32>,
}

impl DurableStore for FlakyStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(StoreError::QuotaExceeded { key: key.to_owned(), needed: value.len(), available: 0 });
        }
        drop(left);
        self.inner.set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove_item(key)
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StorageEvent> {
        self.inner.subscribe()
    }
}

#[tokio::test(start_paused = true)]
async fn local_write_failures_never_surface_as_errors() {
    init_logging();
    let memory = MemoryStore::new();
    let store = Arc::new(FlakyStore { inner: memory.clone(), failures_left: Mutex::new(2) });
    let endpoint = FlakyEndpoint::new(0);
    let engine = AutoSave::start("contact-form", form(json!({"name": "", "email": ""})), store, options_for(&endpoint));
    let mut status = engine.watch_status();

    for name in ["J", "John", "John Doe"] {
        engine.update(form(json!({"name": name, "email": ""})));
        sleep(Duration::from_secs(1)).await;
        assert!(!status.borrow_and_update().has_errors);
    }

    assert_eq!(endpoint.received().len(), 3);
    assert!(engine.status().last_saved.is_some());
    let raw = memory.get_item("form-auto-save-contact-form").unwrap().unwrap();
    let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["data"], json!({"name": "John Doe", "email": ""}));
    assert!(record["timestamp"].is_string());
}
