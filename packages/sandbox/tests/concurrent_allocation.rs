// ABOUTME: Tests SSH port allocation and single-flight guards under concurrent requests
// ABOUTME: Uses a file-backed SQLite database so requests really race across pool connections

use sandcastle_sandbox::storage::{connect, migrate, NewSandbox};
use sandcastle_sandbox::test_utils::seed_user;
use sandcastle_sandbox::{JobKind, SandboxStorage};
use std::collections::HashSet;

async fn file_storage(dir: &tempfile::TempDir) -> SandboxStorage {
    let url = format!("sqlite:{}", dir.path().join("sandcastle.db").display());
    let pool = connect(&url).await.expect("Failed to open database");
    migrate(&pool).await.expect("Failed to migrate");
    SandboxStorage::new(pool)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_get_distinct_ports() {
    let dir = tempfile::tempdir().unwrap();
    let storage = file_storage(&dir).await;
    let alice = seed_user(&storage, "alice").await;

    let mut handles = Vec::new();
    for i in 0..5 {
        let storage = storage.clone();
        let user_id = alice.id;
        handles.push(tokio::spawn(async move {
            storage
                .create_sandbox(&NewSandbox {
                    user_id,
                    name: format!("box{}", i),
                    image: "sandcastle-sandbox:latest".to_string(),
                    ..Default::default()
                })
                .await
        }));
    }

    let mut ports = HashSet::new();
    for handle in handles {
        let sandbox = handle.await.unwrap().expect("Create should succeed");
        assert!(ports.insert(sandbox.ssh_port), "port {} reused", sandbox.ssh_port);
    }
    assert_eq!(ports, (2201..=2205).collect::<HashSet<u16>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_one_reservation_wins() {
    let dir = tempfile::tempdir().unwrap();
    let storage = file_storage(&dir).await;
    let alice = seed_user(&storage, "alice").await;
    let sandbox = storage
        .create_sandbox(&NewSandbox {
            user_id: alice.id,
            name: "dev".to_string(),
            image: "sandcastle-sandbox:latest".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut handles = Vec::new();
    for kind in [JobKind::Starting, JobKind::Stopping, JobKind::Destroying, JobKind::Restoring] {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            storage.reserve_job(sandbox.id, kind).await
        }));
    }

    let mut won = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            won += 1;
        }
    }
    assert_eq!(won, 1);
}
