// ABOUTME: Periodic reconciliation of persisted sandbox state against what the runtime reports
// ABOUTME: Also reaps jobs stuck past the configured timeout; every step is best effort

use crate::error::Result;
use crate::manager::SandboxManager;
use crate::runtime::RuntimeError;
use crate::sidecar::SidecarKind;
use crate::storage::{JobLease, SandboxStatus, SandboxStorage};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, error, info, warn};

/// What a single reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub skipped_busy: usize,
    pub marked_destroyed: usize,
    pub status_corrected: usize,
    pub mesh_reset: usize,
    pub route_configs: usize,
    pub orphaned_sidecars: usize,
    pub errors: usize,
}

/// Fails jobs that have been in flight longer than the configured timeout.
pub struct StuckJobReaper {
    storage: SandboxStorage,
    timeout_minutes: u64,
}

impl StuckJobReaper {
    pub fn new(storage: SandboxStorage, timeout_minutes: u64) -> Self {
        Self {
            storage,
            timeout_minutes,
        }
    }

    pub async fn reap_once(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::minutes(self.timeout_minutes as i64);
        let stuck = self.storage.list_stuck_jobs(cutoff).await?;
        let message = format!("Job timed out after {} minutes", self.timeout_minutes);

        let mut reaped = 0;
        for sandbox in stuck {
            // Only the job observed here; one that replaced it meanwhile is left running.
            let Some(lease) = JobLease::held_on(&sandbox) else {
                continue;
            };
            match self.storage.fail_job(&lease, &message).await {
                Ok(true) => {
                    warn!(
                        "Reaped stuck {} job on {}",
                        lease.kind,
                        sandbox.full_name()
                    );
                    reaped += 1;
                }
                Ok(false) => {}
                Err(e) => error!("Failed to reap job on {}: {}", sandbox.full_name(), e),
            }
        }
        Ok(reaped)
    }
}

/// Reconciliation scheduler
pub struct Reconciler {
    manager: Arc<SandboxManager>,
    reaper: Arc<StuckJobReaper>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl Reconciler {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        let config = manager.config().clone();
        let reaper = Arc::new(StuckJobReaper::new(
            manager.storage().clone(),
            config.stuck_job_minutes,
        ));
        Self {
            manager,
            reaper,
            interval: config.reconcile_interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn reaper(&self) -> &Arc<StuckJobReaper> {
        &self.reaper
    }

    /// One full pass. Failures of individual items are logged and counted.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        Self::sync_sandboxes(&self.manager, &mut report).await?;
        Self::heal_mesh(&self.manager, &mut report).await?;

        match self.manager.routes().sync_all_configs().await {
            Ok(written) => report.route_configs = written,
            Err(e) => {
                warn!("Route config sync failed: {}", e);
                report.errors += 1;
            }
        }

        for kind in [SidecarKind::Terminal, SidecarKind::Vnc] {
            match self.manager.sidecar(kind).cleanup_orphaned().await {
                Ok(removed) => report.orphaned_sidecars += removed,
                Err(e) => {
                    warn!("Orphaned {} cleanup failed: {}", kind.as_str(), e);
                    report.errors += 1;
                }
            }
        }

        debug!("Reconciliation finished: {:?}", report);
        Ok(report)
    }

    async fn sync_sandboxes(manager: &SandboxManager, report: &mut ReconcileReport) -> Result<()> {
        let storage = manager.storage();
        for sandbox in storage.list_active_with_instance().await? {
            if sandbox.job_status.is_some() {
                report.skipped_busy += 1;
                continue;
            }
            let Some(instance) = sandbox.instance() else {
                continue;
            };
            report.checked += 1;

            let state = match manager.runtime().get_instance_state(instance).await {
                Ok(state) => state,
                Err(RuntimeError::NotFound(_)) => {
                    warn!(
                        "Instance of {} disappeared, marking destroyed",
                        sandbox.full_name()
                    );
                    manager.close_sidecars(&sandbox).await;
                    match storage.mark_destroyed(sandbox.id, None).await {
                        Ok(()) => report.marked_destroyed += 1,
                        Err(e) => {
                            error!("Failed to mark {} destroyed: {}", sandbox.full_name(), e);
                            report.errors += 1;
                        }
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Could not inspect {}: {}", sandbox.full_name(), e);
                    report.errors += 1;
                    continue;
                }
            };

            let observed = if state.is_running() {
                SandboxStatus::Running
            } else {
                SandboxStatus::Stopped
            };
            if observed == sandbox.status {
                continue;
            }

            info!(
                "{} is {} but recorded as {}, correcting",
                sandbox.full_name(),
                observed.as_str(),
                sandbox.status.as_str()
            );
            match storage.update_status(sandbox.id, observed).await {
                Ok(()) => report.status_corrected += 1,
                Err(e) => {
                    error!("Failed to correct {}: {}", sandbox.full_name(), e);
                    report.errors += 1;
                    continue;
                }
            }
            if observed == SandboxStatus::Stopped {
                manager.close_sidecars(&sandbox).await;
            }
        }
        Ok(())
    }

    async fn heal_mesh(manager: &SandboxManager, report: &mut ReconcileReport) -> Result<()> {
        for user in manager.storage().list_users_with_mesh().await? {
            match manager.mesh().heal_missing_sidecar(&user).await {
                Ok(true) => report.mesh_reset += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Mesh check for {} failed: {}", user.name, e);
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Spawn the loop: reconcile, reap, sleep. The first pass runs immediately.
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let manager = self.manager.clone();
        let reaper = self.reaper.clone();
        let interval = self.interval;
        let running_flag = self.running.clone();
        let reconciler = Reconciler {
            manager,
            reaper: reaper.clone(),
            interval,
            running: running_flag.clone(),
        };

        tokio::spawn(async move {
            info!("Reconciler started (every {:?})", interval);
            loop {
                if !*running_flag.read().await {
                    info!("Reconciler stopped");
                    break;
                }

                match reconciler.run_once().await {
                    Ok(report) if report != ReconcileReport::default() => {
                        info!("Reconciliation: {:?}", report)
                    }
                    Ok(_) => {}
                    Err(e) => error!("Reconciliation failed: {}", e),
                }
                match reaper.reap_once().await {
                    Ok(0) => {}
                    Ok(reaped) => info!("Reaped {} stuck job(s)", reaped),
                    Err(e) => error!("Stuck job reaping failed: {}", e),
                }

                time::sleep(interval).await;
            }
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandcastleConfig;
    use crate::storage::{JobKind, MeshState};
    use crate::test_utils::{running_sandbox, test_pool, FakeRuntime};

    async fn setup() -> (tempfile::TempDir, Arc<FakeRuntime>, Arc<SandboxManager>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandcastleConfig::with_data_dir(dir.path());
        config.propagation_delay = false;
        let runtime = Arc::new(FakeRuntime::new());
        let storage = SandboxStorage::new(test_pool().await);
        let manager = Arc::new(SandboxManager::new(
            Arc::new(config),
            storage,
            runtime.clone(),
        ));
        (dir, runtime, manager)
    }

    #[tokio::test]
    async fn test_vanished_instance_is_marked_destroyed() {
        let (_dir, runtime, manager) = setup().await;
        let storage = manager.storage().clone();
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        runtime.remove_out_of_band("alice-dev");

        let report = Reconciler::new(manager).run_once().await.unwrap();

        assert_eq!(report.marked_destroyed, 1);
        let sandbox = storage.get_sandbox(sandbox.id).await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Destroyed);
        assert_eq!(sandbox.container_id, None);
    }

    #[tokio::test]
    async fn test_routed_sandbox_regains_ingress() {
        let (_dir, runtime, manager) = setup().await;
        let storage = manager.storage().clone();
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        manager
            .routes()
            .add_route(&sandbox, "app.example.com", 8080)
            .await
            .unwrap();
        manager.routes().ingress().detach("alice-dev").await.unwrap();
        assert!(!runtime
            .state_of("alice-dev")
            .unwrap()
            .is_attached_to("sandcastle-web"));

        let report = Reconciler::new(manager).run_once().await.unwrap();

        assert_eq!(report.route_configs, 1);
        assert!(runtime
            .state_of("alice-dev")
            .unwrap()
            .is_attached_to("sandcastle-web"));
    }

    #[tokio::test]
    async fn test_status_drift_is_corrected() {
        let (_dir, runtime, manager) = setup().await;
        let storage = manager.storage().clone();
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        runtime.set_running("alice-dev", false);

        let reconciler = Reconciler::new(manager);
        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.status_corrected, 1);
        assert_eq!(
            storage.get_sandbox(sandbox.id).await.unwrap().status,
            SandboxStatus::Stopped
        );

        runtime.set_running("alice-dev", true);
        reconciler.run_once().await.unwrap();
        assert_eq!(
            storage.get_sandbox(sandbox.id).await.unwrap().status,
            SandboxStatus::Running
        );
    }

    #[tokio::test]
    async fn test_busy_sandbox_is_left_alone() {
        let (_dir, runtime, manager) = setup().await;
        let storage = manager.storage().clone();
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        storage
            .reserve_job(sandbox.id, JobKind::Stopping)
            .await
            .unwrap();
        runtime.remove_out_of_band("alice-dev");

        let report = Reconciler::new(manager).run_once().await.unwrap();

        assert_eq!(report.skipped_busy, 1);
        assert_eq!(
            storage.get_sandbox(sandbox.id).await.unwrap().status,
            SandboxStatus::Running
        );
    }

    #[tokio::test]
    async fn test_missing_mesh_sidecar_resets_user() {
        let (_dir, runtime, manager) = setup().await;
        let storage = manager.storage().clone();
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        let alice = storage.get_user(sandbox.user_id).await.unwrap();
        manager.mesh().enable(&alice, "tskey-auth-1").await.unwrap();
        manager.mesh().connect_sandbox(&sandbox).await.unwrap();
        runtime.remove_out_of_band("sc-ts-alice");

        let report = Reconciler::new(manager).run_once().await.unwrap();

        assert_eq!(report.mesh_reset, 1);
        let alice = storage.get_user(alice.id).await.unwrap();
        assert_eq!(alice.mesh_state, MeshState::Disabled);
        assert_eq!(alice.mesh_sidecar, None);
        assert!(!storage.get_sandbox(sandbox.id).await.unwrap().mesh);
    }

    #[tokio::test]
    async fn test_reaper_fails_old_jobs_only() {
        let (_dir, runtime, manager) = setup().await;
        let storage = manager.storage().clone();
        let old = running_sandbox(&storage, &runtime, "alice", "old").await;
        let fresh = running_sandbox(&storage, &runtime, "alice", "fresh").await;
        storage.reserve_job(old.id, JobKind::Starting).await.unwrap();
        storage.reserve_job(fresh.id, JobKind::Starting).await.unwrap();
        sqlx::query("UPDATE sandboxes SET job_started_at = ?1 WHERE id = ?2")
            .bind(crate::storage::timestamp(
                Utc::now() - chrono::Duration::minutes(6),
            ))
            .bind(old.id)
            .execute(storage.pool())
            .await
            .unwrap();

        let reaped = StuckJobReaper::new(storage.clone(), 5)
            .reap_once()
            .await
            .unwrap();

        assert_eq!(reaped, 1);
        let old = storage.get_sandbox(old.id).await.unwrap();
        assert_eq!(old.job_status, None);
        assert_eq!(
            old.job_error.as_deref(),
            Some("Job timed out after 5 minutes")
        );
        assert!(storage
            .get_sandbox(fresh.id)
            .await
            .unwrap()
            .job_status
            .is_some());
    }
}
