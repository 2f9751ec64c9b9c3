use relay_coordination::{BeadsTask, JsonlTaskLog, TaskLog, TaskStatus};

#[test]
fn test_future_lease_never_ready_until_expiry() {
    let mut task = BeadsTask::new("t1", "Port the parser", 1, 0);
    task.status = TaskStatus::InProgress;
    task.assignee = Some("W1".into());
    task.lease_expires = Some(10_000);

    for now in [0, 5_000, 9_999] {
        assert!(!task.is_ready(now), "leased task must not be ready at {now}");
    }
    assert!(task.is_ready(10_000));
    assert!(task.is_ready(50_000));
}

#[test]
fn test_open_task_with_stale_assignee_is_ready() {
    let mut task = BeadsTask::new("t1", "Port the parser", 1, 0);
    task.assignee = Some("W1".into());
    task.lease_expires = Some(100);
    assert!(!task.is_ready(99));
    assert!(task.is_ready(100));
}

#[tokio::test]
async fn test_missing_log_reads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let log = JsonlTaskLog::new(dir.path().join("nope.jsonl"));
    assert!(log.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_log_is_one_record_per_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");
    std::fs::write(
        &path,
        concat!(
            r#"{"id":"a","title":"A","status":"open","priority":2,"created_at":1,"updated_at":1}"#,
            "\n",
            "garbage line\n",
            r#"{"id":"b","title":"B","status":"in_progress","priority":1,"assignee":"W1","lease_expires":500,"created_at":1,"updated_at":2}"#,
            "\n"
        ),
    )
    .unwrap();

    let log = JsonlTaskLog::new(&path);
    let tasks = log.load().await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1].status, TaskStatus::InProgress);
    assert_eq!(tasks[1].lease_expires, Some(500));

    log.update(
        "a",
        Box::new(|t: &mut BeadsTask| {
            t.priority = 0;
            Ok(())
        }),
    )
    .await
    .unwrap();

    // Rewritten whole: the malformed line is gone.
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 2);
    assert!(!contents.contains("garbage"));
}
