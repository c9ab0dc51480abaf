use super::*;
use std::collections::HashSet;
use tempfile::TempDir;

fn store() -> (TempDir, WatchStore) {
    let dir = TempDir::new().unwrap();
    let store = WatchStore::new(dir.path().join("db")).unwrap();
    (dir, store)
}

fn event(n: i64) -> WatchEvent {
    WatchEvent {
        kind: EventKind::Create,
        target: PathBuf::from(format!("/tmp/x/file-{}", n)),
        time: 1_700_000_000 + n,
    }
}

fn record(id: &str) -> WatchRecord {
    WatchRecord::new(
        id.to_string(),
        PathBuf::from("/tmp/x"),
        1_700_000_000,
        1_700_000_060,
    )
}

// ============================================================================
// Records
// ============================================================================

#[test]
fn test_record_round_trip() {
    let (_dir, store) = store();
    store.create(&record("abc123")).unwrap();

    let loaded = store.read("abc123").unwrap().unwrap();
    assert_eq!(loaded.path, PathBuf::from("/tmp/x"));
    assert_eq!(loaded.started_at, 1_700_000_000);
    assert_eq!(loaded.expires_at, 1_700_000_060);
    assert!(!loaded.expired);
    assert!(loaded.events.is_empty());
}

#[test]
fn test_record_json_shape() {
    let mut rec = record("abc123");
    rec.events.push(event(1));
    let value = serde_json::to_value(&rec).unwrap();

    assert_eq!(value["watchId"], "abc123");
    assert_eq!(value["startedAt"], 1_700_000_000);
    assert_eq!(value["expiresAt"], 1_700_000_060);
    assert_eq!(value["expired"], false);
    assert!(value.get("expiredAt").is_none());
    assert_eq!(value["events"][0]["kind"], "create");
    assert_eq!(value["events"][0]["target"], "/tmp/x/file-1");
}

#[test]
fn test_create_refuses_existing_id() {
    let (_dir, store) = store();
    store.create(&record("dup")).unwrap();
    assert!(store.create(&record("dup")).is_err());
}

#[test]
fn test_read_missing_is_none() {
    let (_dir, store) = store();
    assert!(store.read("nothing").unwrap().is_none());
}

#[test]
fn test_read_corrupt_record_is_error() {
    let (_dir, store) = store();
    std::fs::write(store.base_dir().join("bad.json"), "{not json").unwrap();
    assert!(matches!(store.read("bad"), Err(AgentError::Storage(_))));
}

#[cfg(unix)]
#[test]
fn test_permissions_are_private() {
    use std::os::unix::fs::PermissionsExt;

    let (_dir, store) = store();
    store.create(&record("secret")).unwrap();

    let dir_mode = std::fs::metadata(store.base_dir()).unwrap().permissions().mode();
    assert_eq!(dir_mode & 0o777, 0o700);

    let file_mode = std::fs::metadata(store.base_dir().join("secret.json"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(file_mode & 0o777, 0o600);
}

// ============================================================================
// Events and expiry
// ============================================================================

#[test]
fn test_append_event_preserves_order() {
    let (_dir, store) = store();
    store.create(&record("w")).unwrap();
    for n in 0..3 {
        assert!(store.append_event("w", event(n)).unwrap());
    }

    let loaded = store.read("w").unwrap().unwrap();
    assert_eq!(loaded.events, vec![event(0), event(1), event(2)]);
}

#[test]
fn test_append_event_drops_oldest_past_cap() {
    let dir = TempDir::new().unwrap();
    let store = WatchStore::new(dir.path()).unwrap().with_event_cap(3);
    store.create(&record("w")).unwrap();
    for n in 0..5 {
        store.append_event("w", event(n)).unwrap();
    }

    let loaded = store.read("w").unwrap().unwrap();
    assert_eq!(loaded.events, vec![event(2), event(3), event(4)]);
}

#[test]
fn test_append_events_batch_keeps_order_and_cap() {
    let dir = TempDir::new().unwrap();
    let store = WatchStore::new(dir.path()).unwrap().with_event_cap(3);
    store.create(&record("w")).unwrap();
    assert!(store.append_events("w", vec![event(0), event(1)]).unwrap());
    assert!(store.append_events("w", vec![event(2), event(3)]).unwrap());
    assert!(!store.append_events("ghost", vec![event(4)]).unwrap());

    let loaded = store.read("w").unwrap().unwrap();
    assert_eq!(loaded.events, vec![event(1), event(2), event(3)]);
}

#[test]
fn test_default_event_cap() {
    let (_dir, store) = store();
    assert_eq!(store.event_cap(), DEFAULT_EVENT_CAP);
}

#[test]
fn test_missing_record_updates_are_noops() {
    let (_dir, store) = store();
    assert!(!store.append_event("ghost", event(0)).unwrap());
    assert!(!store.mark_expired("ghost", 5).unwrap());
    assert!(store.list_ids().unwrap().is_empty());
}

#[test]
fn test_mark_expired_sets_flag_and_time() {
    let (_dir, store) = store();
    store.create(&record("w")).unwrap();
    store.append_event("w", event(0)).unwrap();
    assert!(store.mark_expired("w", 1_700_000_061).unwrap());

    let loaded = store.read("w").unwrap().unwrap();
    assert!(loaded.expired);
    assert_eq!(loaded.expired_at, Some(1_700_000_061));
    assert_eq!(loaded.events.len(), 1);
}

// ============================================================================
// Listing and deletion
// ============================================================================

#[test]
fn test_list_ids_ignores_foreign_files() {
    let (_dir, store) = store();
    store.create(&record("one")).unwrap();
    store.create(&record("two")).unwrap();
    std::fs::write(store.base_dir().join("notes.txt"), "x").unwrap();

    let ids: HashSet<String> = store.list_ids().unwrap().into_iter().collect();
    assert_eq!(ids, HashSet::from(["one".to_string(), "two".to_string()]));
}

#[test]
fn test_delete() {
    let (_dir, store) = store();
    store.create(&record("gone")).unwrap();
    assert!(store.delete("gone").unwrap());
    assert!(!store.delete("gone").unwrap());
    assert!(store.read("gone").unwrap().is_none());
}

#[test]
fn test_push_capped() {
    let mut items = vec![1, 2];
    push_capped(&mut items, 3, 2);
    assert_eq!(items, vec![2, 3]);
    push_capped(&mut items, 4, 10);
    assert_eq!(items, vec![2, 3, 4]);
}
