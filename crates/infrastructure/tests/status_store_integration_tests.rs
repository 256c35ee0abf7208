use std::sync::Arc;

use chrono::Utc;
use hca_domain::{
    BlobLocation, BlobObject, Run, RunStatus, StatusStore, StatusTracker, Task, TaskFinalization,
    TaskKey, TaskStatus,
};
use hca_infrastructure::{InMemoryStatusStore, SqliteStatusStore};

fn sample_run(run_id: &str) -> Run {
    Run::new(
        run_id,
        "tester",
        Utc::now(),
        BlobLocation::new("images", "plate"),
        BlobObject::new("pipelines", "p.cppipe"),
        BlobLocation::new("records", "results"),
    )
    .unwrap()
}

async fn sqlite_store(dir: &tempfile::TempDir) -> Arc<dyn StatusStore> {
    let config = hca_config::StatusStoreConfig {
        r#type: hca_config::StatusStoreType::Sqlite,
        url: format!("sqlite://{}?mode=rwc", dir.path().join("s.db").display()),
        max_connections: 4,
    };
    Arc::new(SqliteStatusStore::connect(&config).await.unwrap())
}

async fn concurrent_finalizations_agree(store: Arc<dyn StatusStore>) {
    let tracker = StatusTracker::new(store);
    let run = sample_run("run-race");
    tracker.register_run(&run).await.unwrap();
    let task = Task::scheduled(&run, "C - 3").unwrap();
    tracker.register_task(&task).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..6 {
        let tracker = tracker.clone();
        let key = task.key();
        let outcome = if i % 2 == 0 {
            TaskStatus::Finished
        } else {
            TaskStatus::Failed
        };
        handles.push(tokio::spawn(async move {
            tracker.finalize_task(&key, outcome).await.unwrap()
        }));
    }

    let mut applied = Vec::new();
    let mut observed = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        if let TaskFinalization::Applied(status) = result {
            applied.push(status);
        }
        observed.push(result.status());
    }

    assert_eq!(applied.len(), 1, "exactly one finalization must apply");
    assert!(observed.iter().all(|s| *s == applied[0]));

    let stored = tracker
        .store()
        .get_task(&TaskKey::new("run-race", "C - 3"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, applied[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_memory_first_terminal_status_wins() {
    concurrent_finalizations_agree(Arc::new(InMemoryStatusStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_first_terminal_status_wins() {
    let dir = tempfile::tempdir().unwrap();
    concurrent_finalizations_agree(sqlite_store(&dir).await).await;
}

#[tokio::test]
async fn test_run_status_never_moves_backwards() {
    let store: Arc<dyn StatusStore> = Arc::new(InMemoryStatusStore::new());
    let tracker = StatusTracker::new(store.clone());
    tracker.register_run(&sample_run("run-mono")).await.unwrap();

    assert!(tracker.mark_run_running("run-mono").await.unwrap());
    assert!(tracker
        .try_transition_run("run-mono", RunStatus::Running, RunStatus::Failed)
        .await
        .unwrap());
    assert!(!tracker.mark_run_running("run-mono").await.unwrap());
    assert!(!store
        .update_run_status_if("run-mono", RunStatus::Running, RunStatus::Finished)
        .await
        .unwrap());
    assert_eq!(
        tracker.get_run("run-mono").await.unwrap().status,
        RunStatus::Failed
    );
}
