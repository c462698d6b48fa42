// ABOUTME: Sandcastle service facade wiring storage, runtime, engine, queue, workers and reconciler
// ABOUTME: Request methods validate, reserve the job slot and enqueue; they never call the runtime

use crate::config::{RuntimeBackend, SandcastleConfig};
use crate::error::{Result, SandboxError};
use crate::jobs::{Job, JobRunner};
use crate::manager::{ConnectInfo, CreateSandboxRequest, SandboxManager};
use crate::mesh::{LoginStatus, MeshStatus};
use crate::notify::Notifier;
use crate::queue::{JobQueue, WorkerPool};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::runtime::{DockerRuntime, IncusRuntime, RuntimeClient, SnapshotInfo};
use crate::sidecar::SidecarKind;
use crate::status::SystemStatus;
use crate::storage::{self, JobKind, Route, Sandbox, SandboxFilter, SandboxStatus, SandboxStorage, User};
use crate::validation::{validate_snapshot_name, validate_user_name};
use std::sync::Arc;
use tracing::{info, warn};

/// Build the runtime client selected by the configuration.
pub async fn runtime_from_config(config: &SandcastleConfig) -> Result<Arc<dyn RuntimeClient>> {
    let runtime: Arc<dyn RuntimeClient> = match config.runtime {
        RuntimeBackend::Docker => Arc::new(DockerRuntime::new(config.docker_runtime.clone())?),
        RuntimeBackend::Incus => match (&config.incus_client_cert, &config.incus_client_key) {
            (Some(cert), Some(key)) => {
                let cert_pem = tokio::fs::read(cert).await?;
                let key_pem = tokio::fs::read(key).await?;
                Arc::new(IncusRuntime::with_identity(
                    &config.incus_url,
                    &cert_pem,
                    &key_pem,
                    config.incus_accept_invalid_certs,
                )?)
            }
            _ => Arc::new(IncusRuntime::new(&config.incus_url)?),
        },
    };
    info!("Using {} runtime", runtime.backend_name());
    Ok(runtime)
}

/// Entry point for every caller: CLI, web layer and background services
pub struct Sandcastle {
    manager: Arc<SandboxManager>,
    queue: JobQueue,
    workers: WorkerPool,
    reconciler: Reconciler,
}

impl Sandcastle {
    pub fn new(
        config: Arc<SandcastleConfig>,
        storage: SandboxStorage,
        runtime: Arc<dyn RuntimeClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let workers = config.workers;
        let queue = JobQueue::new(storage.pool().clone());
        let manager = Arc::new(SandboxManager::new(config, storage, runtime));
        let runner = Arc::new(JobRunner::new(manager.clone(), notifier));
        Self {
            workers: WorkerPool::new(queue.clone(), runner, workers),
            reconciler: Reconciler::new(manager.clone()),
            manager,
            queue,
        }
    }

    /// Open the database, apply migrations and connect to the configured runtime.
    pub async fn open(config: SandcastleConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let pool = storage::connect(&config.database_url).await?;
        storage::migrate(&pool).await?;
        let runtime = runtime_from_config(&config).await?;
        Ok(Self::new(
            Arc::new(config),
            SandboxStorage::new(pool),
            runtime,
            notifier,
        ))
    }

    pub fn config(&self) -> &Arc<SandcastleConfig> {
        self.manager.config()
    }

    pub fn storage(&self) -> &SandboxStorage {
        self.manager.storage()
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Prepare the web layer and start workers and the reconciliation loop.
    pub async fn start(&self) -> Result<()> {
        self.manager.routes().ingress().ensure_network().await?;
        self.manager.routes().write_web_config().await?;
        self.workers.start().await?;
        self.reconciler.start().await;
        info!("Sandcastle services started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.reconciler.stop().await;
        self.workers.stop().await;
        info!("Sandcastle services stopped");
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler.run_once().await
    }

    pub async fn reap_stuck_jobs(&self) -> Result<usize> {
        self.reconciler.reaper().reap_once().await
    }

    pub async fn status(&self) -> Result<SystemStatus> {
        SystemStatus::collect(
            self.manager.runtime().as_ref(),
            self.storage(),
            &self.queue,
        )
        .await
    }

    // ========================================================================
    // USERS
    // ========================================================================

    pub async fn add_user(&self, name: &str, ssh_public_key: Option<&str>, admin: bool) -> Result<User> {
        validate_user_name(name)?;
        let user = self
            .storage()
            .create_user(name, ssh_public_key, admin)
            .await?;
        info!("Added user {}", name);
        Ok(user)
    }

    pub async fn user(&self, name: &str) -> Result<User> {
        Ok(self.storage().get_user_by_name(name).await?)
    }

    pub async fn set_ssh_key(&self, user: &User, key: Option<&str>) -> Result<User> {
        self.storage().update_ssh_key(user.id, key).await?;
        Ok(self.storage().get_user(user.id).await?)
    }

    // ========================================================================
    // SANDBOX REQUESTS
    // ========================================================================

    /// The owner's non-destroyed sandbox called `name`.
    pub async fn sandbox(&self, owner: &User, name: &str) -> Result<Sandbox> {
        self.storage()
            .find_active_sandbox(owner.id, name)
            .await?
            .ok_or_else(|| SandboxError::NotFound(format!("sandbox {}-{}", owner.name, name)))
    }

    pub async fn list_sandboxes(&self, filter: &SandboxFilter) -> Result<Vec<Sandbox>> {
        Ok(self.storage().list_sandboxes(filter).await?)
    }

    /// Persist a `pending` sandbox and queue its provisioning.
    pub async fn request_create(&self, owner: &User, request: &CreateSandboxRequest) -> Result<Sandbox> {
        let sandbox = self.manager.create_record(owner, request).await?;
        self.submit(&sandbox, Job::Provision {
            sandbox_id: sandbox.id,
        })
        .await?;
        Ok(self.storage().get_sandbox(sandbox.id).await?)
    }

    pub async fn request_start(&self, sandbox: &Sandbox) -> Result<()> {
        let sandbox = self.live(sandbox).await?;
        self.submit(&sandbox, Job::Start {
            sandbox_id: sandbox.id,
        })
        .await
    }

    pub async fn request_stop(&self, sandbox: &Sandbox) -> Result<()> {
        let sandbox = self.live(sandbox).await?;
        self.submit(&sandbox, Job::Stop {
            sandbox_id: sandbox.id,
        })
        .await
    }

    pub async fn request_destroy(&self, sandbox: &Sandbox, keep_volume: bool) -> Result<()> {
        let sandbox = self.live(sandbox).await?;
        self.submit(&sandbox, Job::Destroy {
            sandbox_id: sandbox.id,
            keep_volume,
        })
        .await
    }

    pub async fn request_restore(&self, sandbox: &Sandbox, snapshot: &str) -> Result<()> {
        validate_snapshot_name(snapshot)?;
        let sandbox = self.live(sandbox).await?;
        self.submit(&sandbox, Job::Restore {
            sandbox_id: sandbox.id,
            snapshot: snapshot.to_string(),
        })
        .await
    }

    pub async fn request_open_terminal(&self, sandbox: &Sandbox) -> Result<()> {
        self.request_open(sandbox, SidecarKind::Terminal).await
    }

    pub async fn request_open_vnc(&self, sandbox: &Sandbox) -> Result<()> {
        self.request_open(sandbox, SidecarKind::Vnc).await
    }

    async fn request_open(&self, sandbox: &Sandbox, kind: SidecarKind) -> Result<()> {
        let sandbox = self.live(sandbox).await?;
        if sandbox.status != SandboxStatus::Running {
            return Err(SandboxError::Validation(format!(
                "{} is not running",
                sandbox.full_name()
            )));
        }
        let job = match kind {
            SidecarKind::Terminal => Job::OpenTerminal {
                sandbox_id: sandbox.id,
            },
            SidecarKind::Vnc => Job::OpenVnc {
                sandbox_id: sandbox.id,
            },
        };
        self.submit(&sandbox, job).await
    }

    /// Reserve the sandbox's job slot and queue `job`. The slot is released if queueing fails.
    async fn submit(&self, sandbox: &Sandbox, job: Job) -> Result<()> {
        let lease = self.storage().reserve_job(sandbox.id, job.job_kind()).await?;
        if let Err(e) = self.queue.enqueue(&job).await {
            warn!("Failed to queue {} for {}: {}", job.name(), sandbox.full_name(), e);
            self.storage()
                .fail_job(&lease, &format!("Failed to queue {}: {}", job.name(), e))
                .await?;
            return Err(e.into());
        }
        info!("Queued {} for {}", job.name(), sandbox.full_name());
        Ok(())
    }

    async fn live(&self, sandbox: &Sandbox) -> Result<Sandbox> {
        let sandbox = self.storage().get_sandbox(sandbox.id).await?;
        if sandbox.status == SandboxStatus::Destroyed {
            return Err(SandboxError::Validation(format!(
                "{} is destroyed",
                sandbox.full_name()
            )));
        }
        Ok(sandbox)
    }

    // ========================================================================
    // SNAPSHOTS AND ACCESS
    // ========================================================================

    /// Snapshots run inline, guarded by the job slot.
    pub async fn snapshot(&self, sandbox: &Sandbox, name: Option<&str>) -> Result<SnapshotInfo> {
        let sandbox = self.live(sandbox).await?;
        let lease = self
            .storage()
            .reserve_job(sandbox.id, JobKind::Snapshotting)
            .await?;
        match self.manager.snapshot(&sandbox, name).await {
            Ok(info) => {
                self.storage().finish_job(&lease).await?;
                Ok(info)
            }
            Err(e) => {
                self.storage()
                    .fail_job(&lease, &format!("Failed to snapshot: {}", e))
                    .await?;
                Err(e)
            }
        }
    }

    pub async fn list_snapshots(&self, sandbox: &Sandbox) -> Result<Vec<SnapshotInfo>> {
        self.manager.list_snapshots(sandbox).await
    }

    pub async fn delete_snapshot(&self, sandbox: &Sandbox, name: &str) -> Result<()> {
        self.manager.delete_snapshot(sandbox, name).await
    }

    pub async fn connect_info(&self, sandbox: &Sandbox) -> Result<ConnectInfo> {
        self.manager.connect_info(sandbox).await
    }

    pub async fn close_terminal(&self, sandbox: &Sandbox) {
        self.manager.sidecar(SidecarKind::Terminal).close(sandbox).await
    }

    pub async fn close_vnc(&self, sandbox: &Sandbox) {
        self.manager.sidecar(SidecarKind::Vnc).close(sandbox).await
    }

    pub fn terminal_url(&self, sandbox: &Sandbox) -> String {
        self.manager.sidecar(SidecarKind::Terminal).url(sandbox)
    }

    pub fn vnc_url(&self, sandbox: &Sandbox) -> String {
        self.manager.sidecar(SidecarKind::Vnc).url(sandbox)
    }

    // ========================================================================
    // ROUTES
    // ========================================================================

    pub async fn add_route(&self, sandbox: &Sandbox, domain: &str, port: u32) -> Result<Route> {
        let sandbox = self.live(sandbox).await?;
        self.manager.routes().add_route(&sandbox, domain, port).await
    }

    pub async fn remove_route(&self, sandbox: &Sandbox, domain: &str) -> Result<()> {
        self.manager.routes().remove_route(sandbox, domain).await
    }

    pub async fn list_routes(&self, sandbox: &Sandbox) -> Result<Vec<Route>> {
        self.manager.routes().list_routes(sandbox).await
    }

    // ========================================================================
    // MESH
    // ========================================================================

    pub async fn mesh_enable(&self, user: &User, auth_key: &str) -> Result<User> {
        self.manager.mesh().enable(user, auth_key).await
    }

    pub async fn mesh_start_login(&self, user: &User) -> Result<LoginStatus> {
        self.manager.mesh().start_login(user).await
    }

    pub async fn mesh_check_login(&self, user: &User) -> Result<LoginStatus> {
        self.manager.mesh().check_login(user).await
    }

    pub async fn mesh_disable(&self, user: &User) -> Result<()> {
        self.manager.mesh().disable(user).await
    }

    pub async fn mesh_set_auto_connect(&self, user: &User, enabled: bool) -> Result<User> {
        self.manager.mesh().set_auto_connect(user, enabled).await
    }

    pub async fn mesh_status(&self, user: &User) -> Result<MeshStatus> {
        self.manager.mesh().status(user).await
    }

    pub async fn mesh_connect(&self, sandbox: &Sandbox) -> Result<()> {
        let sandbox = self.live(sandbox).await?;
        self.manager.mesh().connect_sandbox(&sandbox).await
    }

    pub async fn mesh_disconnect(&self, sandbox: &Sandbox) -> Result<()> {
        let sandbox = self.live(sandbox).await?;
        self.manager.mesh().disconnect_sandbox(&sandbox).await
    }
}
