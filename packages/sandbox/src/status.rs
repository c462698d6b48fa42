// ABOUTME: Point-in-time system report combining runtime server info with sandbox counts
// ABOUTME: A runtime that cannot be reached is reported as an error instead of failing the report

use crate::error::Result;
use crate::queue::JobQueue;
use crate::runtime::{RuntimeClient, RuntimeInfo};
use crate::storage::SandboxStorage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub backend: String,
    pub runtime: Option<RuntimeInfo>,
    pub runtime_error: Option<String>,
    /// Sandbox count per status, including destroyed
    pub sandboxes: BTreeMap<String, i64>,
    pub queued_jobs: i64,
}

impl SystemStatus {
    pub async fn collect(
        runtime: &dyn RuntimeClient,
        storage: &SandboxStorage,
        queue: &JobQueue,
    ) -> Result<Self> {
        let (info, runtime_error) = match runtime.server_info().await {
            Ok(info) => (Some(info), None),
            Err(e) => {
                warn!("Runtime {} unavailable: {}", runtime.backend_name(), e);
                (None, Some(e.to_string()))
            }
        };

        let sandboxes = storage
            .count_by_status()
            .await?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();

        Ok(Self {
            backend: runtime.backend_name().to_string(),
            runtime: info,
            runtime_error,
            sandboxes,
            queued_jobs: queue.pending_count().await?,
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.runtime_error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeError;
    use crate::test_utils::{running_sandbox, test_pool, FakeRuntime};

    #[tokio::test]
    async fn test_collect_counts_and_runtime_info() {
        let pool = test_pool().await;
        let storage = SandboxStorage::new(pool.clone());
        let queue = JobQueue::new(pool);
        let runtime = FakeRuntime::new();
        running_sandbox(&storage, &runtime, "alice", "dev").await;

        let status = SystemStatus::collect(&runtime, &storage, &queue)
            .await
            .unwrap();

        assert!(status.is_healthy());
        assert_eq!(status.backend, "fake");
        assert_eq!(status.runtime.unwrap().instances_running, Some(1));
        assert_eq!(status.sandboxes["running"], 1);
        assert_eq!(status.sandboxes["destroyed"], 0);
        assert_eq!(status.queued_jobs, 0);
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_reported() {
        let pool = test_pool().await;
        let storage = SandboxStorage::new(pool.clone());
        let queue = JobQueue::new(pool);
        let runtime = FakeRuntime::new();
        runtime.fail_on(
            "server_info",
            RuntimeError::Backend("connection refused".into()),
        );

        let status = SystemStatus::collect(&runtime, &storage, &queue)
            .await
            .unwrap();

        assert!(!status.is_healthy());
        assert!(status
            .runtime_error
            .unwrap()
            .contains("connection refused"));
    }
}
