use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use usbwarden::core::{DeviceIdentity, DeviceRecord, DeviceSnapshot, TrustLevel};
use usbwarden::error::StoreError;
use usbwarden::store::persist::MAX_BACKUPS;
use usbwarden::store::{ImportMode, StoreEvent, WhitelistStore};

fn record(serial: &str) -> DeviceRecord {
    let snapshot = DeviceSnapshot {
        device_node: PathBuf::from("/dev/sdb1"),
        serial: serial.to_string(),
        vendor: "Kingston".to_string(),
        model: "DataTraveler".to_string(),
        label: "BACKUP".to_string(),
        size_bytes: 8 * 1024 * 1024 * 1024,
        ..Default::default()
    };
    DeviceRecord::new(&snapshot, TrustLevel::Trusted)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<StoreEvent>) -> Vec<StoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn test_save_then_reopen_reproduces_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("devices.json");

    let store = WhitelistStore::open(&path);
    let mut a = record("A1");
    a.hash = "0f".repeat(32);
    a.notes = "office stick".into();
    a.auto_mount = true;
    store.add_device(a).unwrap();
    store.add_device(record("B2")).unwrap();
    store.save().unwrap();
    assert!(!store.is_dirty());

    let mut before = store.all_devices();
    before.sort_by(|x, y| x.unique_id.cmp(&y.unique_id));

    let reopened = WhitelistStore::open(&path);
    let mut after = reopened.all_devices();
    after.sort_by(|x, y| x.unique_id.cmp(&y.unique_id));
    assert_eq!(before, after);

    assert_eq!(reopened.reload().unwrap(), 2);
    assert_eq!(reopened.device_count(), 2);

    let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["version"], "1.0");
    assert_eq!(raw["device_count"], 2);
    assert!(raw["last_modified"].is_string());

    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

#[test]
fn test_six_backups_leave_five() {
    let dir = tempdir().unwrap();
    let store = WhitelistStore::open(dir.path().join("devices.json"));
    store.add_device(record("A1")).unwrap();

    let mut created = Vec::new();
    for _ in 0..6 {
        created.push(store.create_backup(None).unwrap());
        std::thread::sleep(Duration::from_millis(2));
    }

    let remaining = store.list_backups();
    assert_eq!(remaining.len(), MAX_BACKUPS);
    assert!(!created[0].exists(), "oldest backup should be rotated out");
    assert_eq!(remaining, created[1..].to_vec());
}

#[test]
fn test_interrupted_write_leaves_previous_file_intact() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("devices.json");

    let store = WhitelistStore::open(&path);
    store.add_device(record("A1")).unwrap();
    store.save().unwrap();
    let saved = std::fs::read(&path).unwrap();

    // A crash between writing the staging file and the rename.
    let staging = dir.path().join(".devices.json.0192.staging");
    std::fs::write(&staging, br#"{"version":"1.0","devices":[{"unique_id":"tru"#).unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), saved);
    let reopened = WhitelistStore::open(&path);
    assert_eq!(reopened.device_count(), 1);
    assert!(!staging.exists(), "stale staging file should be cleaned up");
}

#[test]
fn test_unparseable_file_starts_empty_with_error_event() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("devices.json");
    std::fs::write(&path, b"{ definitely not json").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let store = WhitelistStore::open_with_events(&path, tx);

    assert_eq!(store.device_count(), 0);
    let events = drain(&mut rx);
    assert!(matches!(events[0], StoreEvent::Error(_)));
    assert_eq!(events[1], StoreEvent::Loaded { count: 0 });
}

#[test]
fn test_reload_failure_keeps_memory_table() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("devices.json");
    let store = WhitelistStore::open(&path);
    store.add_device(record("A1")).unwrap();
    store.save().unwrap();

    std::fs::write(&path, b"[broken").unwrap();
    assert!(matches!(store.reload(), Err(StoreError::ParseFailed { .. })));
    assert_eq!(store.device_count(), 1);
}

#[test]
fn test_write_failure_keeps_dirty_flag() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let store = WhitelistStore::open_with_events(blocker.join("devices.json"), tx);
    store.add_device(record("A1")).unwrap();
    drain(&mut rx);

    assert!(matches!(store.save(), Err(StoreError::WriteFailed { .. })));
    assert!(store.is_dirty());
    assert!(drain(&mut rx).iter().any(|e| matches!(e, StoreEvent::Error(_))));
}

#[test]
fn test_restore_takes_safety_backup() {
    let dir = tempdir().unwrap();
    let store = WhitelistStore::open(dir.path().join("devices.json"));
    store.add_device(record("A1")).unwrap();
    let backup = store.create_backup(None).unwrap();
    std::thread::sleep(Duration::from_millis(2));

    store.add_device(record("B2")).unwrap();
    store.save().unwrap();

    assert_eq!(store.restore_from_backup(&backup).unwrap(), 1);
    assert!(store.has_device(&record("A1").unique_id));
    assert!(!store.has_device(&record("B2").unique_id));
    assert_eq!(store.list_backups().len(), 2);

    // The restored table was persisted.
    assert_eq!(WhitelistStore::open(store.path()).device_count(), 1);
}

#[test]
fn test_restore_missing_backup_fails_without_changes() {
    let dir = tempdir().unwrap();
    let store = WhitelistStore::open(dir.path().join("devices.json"));
    store.add_device(record("A1")).unwrap();

    let missing = dir.path().join("nope.json");
    assert!(matches!(
        store.restore_from_backup(&missing),
        Err(StoreError::BackupFailed { .. })
    ));
    assert_eq!(store.device_count(), 1);
}

#[test]
fn test_export_then_import_merge_and_replace() {
    let dir = tempdir().unwrap();
    let source = WhitelistStore::open(dir.path().join("source.json"));
    let mut shared = record("A1");
    shared.notes = "from export".into();
    source.add_device(shared).unwrap();
    source.add_device(record("B2")).unwrap();

    let export = dir.path().join("export.json");
    assert_eq!(source.export_to_file(&export, true).unwrap(), 2);
    let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&export).unwrap()).unwrap();
    assert!(raw["exported"].is_string());

    let target = WhitelistStore::open(dir.path().join("target.json"));
    target.add_device(record("A1")).unwrap();
    target.add_device(record("C3")).unwrap();

    assert_eq!(target.import_from_file(&export, ImportMode::Merge).unwrap(), 1);
    assert_eq!(target.device_count(), 3);
    assert_eq!(target.get_device(&record("A1").unique_id).unwrap().notes, "");

    assert_eq!(target.import_from_file(&export, ImportMode::Replace).unwrap(), 2);
    assert_eq!(target.device_count(), 2);
    assert!(!target.has_device(&record("C3").unique_id));
    assert_eq!(
        target.get_device(&record("A1").unique_id).unwrap().notes,
        "from export"
    );
}

#[test]
fn test_lenient_timestamps_load_as_absent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("devices.json");
    std::fs::write(
        &path,
        r#"{
  "version": "1.0",
  "devices": [
    {
      "unique_id": "S1_Kingston_DT",
      "hash": "ab",
      "first_seen": "yesterday-ish",
      "last_seen": "",
      "trust_level": 1
    }
  ]
}"#,
    )
    .unwrap();

    let store = WhitelistStore::open(&path);
    let record = store.all_devices().pop().unwrap();
    assert_eq!(record.first_seen, None);
    assert_eq!(record.last_seen, None);
    assert_eq!(record.hash_algorithm, "SHA256");
    assert_eq!(store.validate_integrity().len(), 1);
}

#[tokio::test]
async fn test_autosave_persists_mutations() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("devices.json");
    let store = Arc::new(WhitelistStore::open(&path));
    store.set_auto_save(true);
    let shutdown = CancellationToken::new();
    let task = store.spawn_autosave(shutdown.clone());

    store.add_device(record("A1")).unwrap();

    let persisted = tokio::time::timeout(Duration::from_secs(5), async {
        while store.is_dirty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(persisted.is_ok(), "auto-save never ran");
    assert_eq!(WhitelistStore::open(&path).device_count(), 1);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_compact_announces_removals_and_autosaves() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("devices.json");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let store = Arc::new(WhitelistStore::open_with_events(&path, tx));
    let mut blank = record("B1");
    blank.unique_id = DeviceIdentity::from("");
    store.upsert_device(blank);
    store.add_device(record("A1")).unwrap();
    store.save().unwrap();
    drain(&mut rx);

    store.set_auto_save(true);
    let shutdown = CancellationToken::new();
    let task = store.spawn_autosave(shutdown.clone());

    assert_eq!(store.compact(), 1);
    assert_eq!(
        drain(&mut rx),
        vec![StoreEvent::DeviceRemoved(DeviceIdentity::from(""))]
    );

    let persisted = tokio::time::timeout(Duration::from_secs(5), async {
        while store.is_dirty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(persisted.is_ok(), "compaction was never saved");
    assert_eq!(WhitelistStore::open(&path).device_count(), 1);

    shutdown.cancel();
    task.await.unwrap();
}
