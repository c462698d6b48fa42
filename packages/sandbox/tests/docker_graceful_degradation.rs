// ABOUTME: Tests that an unreachable container engine degrades gracefully instead of panicking
// ABOUTME: Status reports surface the runtime error while storage-backed operations keep working

use bollard::{Docker, API_DEFAULT_VERSION};
use sandcastle_sandbox::runtime::{DockerRuntime, IncusRuntime};
use sandcastle_sandbox::test_utils::{seed_user, test_pool};
use sandcastle_sandbox::{
    CreateSandboxRequest, LogNotifier, RuntimeClient, Sandcastle, SandboxStatus, SandboxStorage,
    SandcastleConfig,
};
use std::sync::Arc;

fn unreachable_docker() -> DockerRuntime {
    let client = Docker::connect_with_unix("/nonexistent/sandcastle/docker.sock", 2, API_DEFAULT_VERSION)
        .expect("Client construction does not touch the socket");
    DockerRuntime::with_client(client, None)
}

async fn service_with(runtime: Arc<dyn RuntimeClient>) -> (tempfile::TempDir, Sandcastle) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SandcastleConfig::with_data_dir(dir.path());
    config.propagation_delay = false;
    let service = Sandcastle::new(
        Arc::new(config),
        SandboxStorage::new(test_pool().await),
        runtime,
        Arc::new(LogNotifier),
    );
    (dir, service)
}

/// The status report carries the connection error instead of failing
#[tokio::test]
async fn test_status_reports_unreachable_docker() {
    let (_dir, service) = service_with(Arc::new(unreachable_docker())).await;

    let status = service.status().await.expect("Status should not fail");

    assert_eq!(status.backend, "docker");
    assert!(!status.is_healthy());
    assert!(status.runtime.is_none());
    assert_eq!(status.sandboxes["running"], 0);
}

#[tokio::test]
async fn test_status_reports_unreachable_incus() {
    let runtime = IncusRuntime::new("http://127.0.0.1:1").unwrap();
    let (_dir, service) = service_with(Arc::new(runtime)).await;

    let status = service.status().await.unwrap();

    assert_eq!(status.backend, "incus");
    assert!(status.runtime_error.is_some());
}

/// Provisioning against a dead engine records the failure on the sandbox
#[tokio::test]
async fn test_provision_without_engine_marks_destroyed() {
    let (_dir, service) = service_with(Arc::new(unreachable_docker())).await;
    let alice = seed_user(service.storage(), "alice").await;

    let result = service
        .manager()
        .create(
            &alice,
            &CreateSandboxRequest {
                name: "dev".to_string(),
                ..Default::default()
            },
        )
        .await;

    assert!(result.is_err());
    let sandboxes = service
        .list_sandboxes(&sandcastle_sandbox::SandboxFilter {
            include_destroyed: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(sandboxes.len(), 1);
    assert_eq!(sandboxes[0].status, SandboxStatus::Destroyed);
    assert!(sandboxes[0].job_error.is_some());
}
