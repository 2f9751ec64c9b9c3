use std::sync::Arc;

use relay_storage::{
    open_store, open_with_fallback, JsonlStore, MessageStore, SqliteStore, StorageDriver,
    StorageOptions,
};

#[tokio::test]
async fn test_sqlite_is_used_when_available() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&StorageOptions {
        driver: StorageDriver::Sqlite,
        path: dir.path().to_path_buf(),
    })
    .await;

    let report = store.health_check().await;
    assert_eq!(report.driver, "sqlite");
    assert!(report.persistent);
    assert!(report.error.is_none());
    assert!(dir.path().join("relay.db").exists());
}

#[tokio::test]
async fn test_failed_sqlite_init_degrades_to_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    // A plain file where the database directory should be.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let primary: Arc<dyn MessageStore> = Arc::new(SqliteStore::new(blocker.join("relay.db")));
    let secondary: Arc<dyn MessageStore> = Arc::new(JsonlStore::new(dir.path().join("jsonl")));
    let store = open_with_fallback(vec![primary, secondary]).await;

    let report = store.health_check().await;
    assert!(report.persistent);
    assert_eq!(report.driver, "jsonl");
    let error = report.error.expect("degradation must be reported");
    assert!(error.contains("sqlite"), "error should name the failed driver: {error}");
    assert!(error.contains("[storage]"), "error should carry remediation: {error}");
}

#[tokio::test]
async fn test_database_path_is_directory_degrades_to_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("relay.db")).unwrap();

    let store = open_store(&StorageOptions {
        driver: StorageDriver::Sqlite,
        path: dir.path().to_path_buf(),
    })
    .await;

    let report = store.health_check().await;
    assert!(report.persistent);
    assert_eq!(report.driver, "jsonl");
}

#[tokio::test]
async fn test_everything_failing_falls_back_to_memory() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();

    let store = open_store(&StorageOptions {
        driver: StorageDriver::Sqlite,
        path: blocker,
    })
    .await;

    let report = store.health_check().await;
    assert!(!report.persistent);
    assert_eq!(report.driver, "memory");
    let error = report.error.unwrap();
    assert!(error.contains("jsonl"));
    assert!(error.contains("memory"));

    // Still fully usable.
    let msg = relay_storage::StoredMessage {
        id: "m1".into(),
        ts: 1,
        from: "a".into(),
        to: "b".into(),
        topic: None,
        kind: "message".into(),
        body: "still works".into(),
        data: None,
        thread: None,
        delivery_seq: None,
        delivery_session_id: None,
        session_id: None,
        status: relay_storage::MessageStatus::Unread,
        is_urgent: false,
        is_broadcast: false,
    };
    store.save_message(&msg).await.unwrap();
    assert!(store.get_message_by_id("m1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_memory_driver_is_not_degraded() {
    let store = open_store(&StorageOptions {
        driver: StorageDriver::Memory,
        path: "unused".into(),
    })
    .await;
    let report = store.health_check().await;
    assert_eq!(report.driver, "memory");
    assert!(report.error.is_none());
}
