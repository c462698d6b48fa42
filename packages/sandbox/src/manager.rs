// ABOUTME: Sandbox lifecycle engine driving the runtime through create, start, stop, destroy and restore
// ABOUTME: Owns the status state machine and coordinates routes, mesh networking and access sidecars

use crate::config::SandcastleConfig;
use crate::error::{Result, SandboxError};
use crate::mesh::MeshManager;
use crate::routes::RouteManager;
use crate::runtime::{
    argv, shell, Device, InstanceAction, InstanceSpec, InstanceState, PortForward,
    RestartPolicy, RuntimeClient, RuntimeError, SnapshotInfo,
};
use crate::sidecar::{SidecarKind, SidecarManager};
use crate::storage::{MeshState, NewSandbox, Sandbox, SandboxStatus, SandboxStorage, User};
use crate::validation::{
    validate_data_path, validate_image, validate_sandbox_name, validate_snapshot_name,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DESTROY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Request to create a new sandbox
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub name: String,
    /// Falls back to the configured default image
    pub image: Option<String>,
    #[serde(default)]
    pub persistent_volume: bool,
    #[serde(default)]
    pub mount_home: bool,
    /// Relative path under the owner's data directory, mounted at `/data`
    pub data_path: Option<String>,
    /// Join the owner's mesh once running; unset follows the owner's auto-connect setting
    #[serde(default)]
    pub mesh: Option<bool>,
    #[serde(default)]
    pub temporary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub command: String,
    pub mesh_ip: Option<String>,
    pub mesh_command: Option<String>,
}

/// Sandbox lifecycle manager
pub struct SandboxManager {
    config: Arc<SandcastleConfig>,
    storage: SandboxStorage,
    runtime: Arc<dyn RuntimeClient>,
    routes: Arc<RouteManager>,
    mesh: Arc<MeshManager>,
    terminal: Arc<SidecarManager>,
    vnc: Arc<SidecarManager>,
}

impl SandboxManager {
    pub fn new(
        config: Arc<SandcastleConfig>,
        storage: SandboxStorage,
        runtime: Arc<dyn RuntimeClient>,
    ) -> Self {
        let routes = Arc::new(RouteManager::new(
            config.clone(),
            storage.clone(),
            runtime.clone(),
        ));
        let mesh = Arc::new(MeshManager::new(
            config.clone(),
            storage.clone(),
            runtime.clone(),
        ));
        let terminal = Arc::new(SidecarManager::new(
            SidecarKind::Terminal,
            config.clone(),
            storage.clone(),
            runtime.clone(),
        ));
        let vnc = Arc::new(SidecarManager::new(
            SidecarKind::Vnc,
            config.clone(),
            storage.clone(),
            runtime.clone(),
        ));

        Self {
            config,
            storage,
            runtime,
            routes,
            mesh,
            terminal,
            vnc,
        }
    }

    pub fn config(&self) -> &Arc<SandcastleConfig> {
        &self.config
    }

    pub fn storage(&self) -> &SandboxStorage {
        &self.storage
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }

    pub fn routes(&self) -> &Arc<RouteManager> {
        &self.routes
    }

    pub fn mesh(&self) -> &Arc<MeshManager> {
        &self.mesh
    }

    pub fn sidecar(&self, kind: SidecarKind) -> &Arc<SidecarManager> {
        match kind {
            SidecarKind::Terminal => &self.terminal,
            SidecarKind::Vnc => &self.vnc,
        }
    }

    /// Create the record and provision it in one go.
    pub async fn create(&self, owner: &User, request: &CreateSandboxRequest) -> Result<Sandbox> {
        let sandbox = self.create_record(owner, request).await?;
        self.provision(sandbox.id).await
    }

    /// Validate and persist a `pending` sandbox. Nothing is written on failure.
    pub async fn create_record(
        &self,
        owner: &User,
        request: &CreateSandboxRequest,
    ) -> Result<Sandbox> {
        validate_sandbox_name(&request.name)?;
        let image = request
            .image
            .clone()
            .filter(|i| !i.trim().is_empty())
            .unwrap_or_else(|| self.config.default_image.clone());
        validate_image(&image)?;
        if let Some(data_path) = &request.data_path {
            validate_data_path(data_path)?;
        }

        let full_name = format!("{}-{}", owner.name, request.name);
        let mesh = request.mesh.unwrap_or_else(|| {
            owner.mesh_auto_connect && owner.mesh_state == MeshState::Enabled
        });
        let volume_path = request
            .persistent_volume
            .then(|| self.config.volume_dir(&full_name).to_string_lossy().into_owned());

        let sandbox = self
            .storage
            .create_sandbox(&NewSandbox {
                user_id: owner.id,
                name: request.name.clone(),
                image,
                persistent_volume: request.persistent_volume,
                volume_path,
                mount_home: request.mount_home,
                data_path: request.data_path.clone(),
                mesh,
                temporary: request.temporary,
            })
            .await?;

        info!(
            "Created sandbox record {} (id {}, ssh port {})",
            full_name, sandbox.id, sandbox.ssh_port
        );
        Ok(sandbox)
    }

    /// Bring a `pending` sandbox up. Any failure marks it destroyed with the error recorded.
    pub async fn provision(&self, sandbox_id: i64) -> Result<Sandbox> {
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;
        match sandbox.status {
            SandboxStatus::Pending => {}
            SandboxStatus::Running => return Ok(sandbox),
            SandboxStatus::Destroyed => {
                return Err(SandboxError::Validation(format!(
                    "{} is destroyed",
                    sandbox.full_name()
                )))
            }
            SandboxStatus::Stopped => {
                return Err(SandboxError::Conflict(format!(
                    "{} is already provisioned",
                    sandbox.full_name()
                )))
            }
        }

        match self.provision_instance(&sandbox).await {
            Ok(()) => {
                info!("Sandbox {} is running", sandbox.full_name());
                Ok(self.storage.get_sandbox(sandbox_id).await?)
            }
            Err(e) => {
                error!("Provisioning {} failed: {}", sandbox.full_name(), e);
                let full_name = sandbox.full_name();
                if let Err(cleanup) = self
                    .runtime
                    .stop_and_delete(&full_name, DESTROY_STOP_TIMEOUT)
                    .await
                {
                    warn!("Failed to remove partial instance {}: {}", full_name, cleanup);
                }
                self.storage
                    .mark_destroyed(sandbox_id, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn provision_instance(&self, sandbox: &Sandbox) -> Result<()> {
        let owner = self.storage.get_user(sandbox.user_id).await?;

        if sandbox.mount_home {
            tokio::fs::create_dir_all(self.config.user_home_dir(&owner.name)).await?;
        }
        if let Some(volume) = &sandbox.volume_path {
            tokio::fs::create_dir_all(volume).await?;
        }
        if let Some(data_path) = &sandbox.data_path {
            tokio::fs::create_dir_all(self.config.user_data_dir(&owner.name, data_path)).await?;
        }

        self.runtime.ensure_image(&sandbox.image).await?;

        let instance = self
            .runtime
            .create_instance(&self.sandbox_spec(sandbox, &owner))
            .await?;
        self.storage.set_container(sandbox.id, Some(&instance)).await?;
        debug!("Created instance {} for {}", instance, sandbox.full_name());

        self.runtime
            .change_state(
                &instance,
                InstanceAction::Start,
                false,
                self.config.operation_timeout,
            )
            .await?;

        if sandbox.mesh {
            if owner.mesh_state == MeshState::Enabled {
                let current = self.storage.get_sandbox(sandbox.id).await?;
                self.mesh.connect_sandbox(&current).await?;
            } else {
                warn!(
                    "Mesh requested for {} but not enabled for {}",
                    sandbox.full_name(),
                    owner.name
                );
                self.storage.set_mesh_flag(sandbox.id, false).await?;
            }
        }

        self.storage
            .update_status(sandbox.id, SandboxStatus::Running)
            .await?;
        Ok(())
    }

    fn sandbox_spec(&self, sandbox: &Sandbox, owner: &User) -> InstanceSpec {
        let full_name = sandbox.full_name();

        let mut env = HashMap::from([("SANDCASTLE_USER".to_string(), owner.name.clone())]);
        if let Some(key) = &owner.ssh_public_key {
            env.insert("SANDCASTLE_SSH_KEY".to_string(), key.clone());
        }

        let mut devices = Vec::new();
        if sandbox.mount_home {
            devices.push(Device::disk(
                "home",
                self.config.user_home_dir(&owner.name).to_string_lossy(),
                format!("/home/{}", owner.name),
            ));
        }
        if let Some(volume) = &sandbox.volume_path {
            devices.push(Device::disk("workspace", volume.as_str(), "/workspace"));
        }
        if let Some(data_path) = &sandbox.data_path {
            devices.push(Device::disk(
                "data",
                self.config
                    .user_data_dir(&owner.name, data_path)
                    .to_string_lossy(),
                "/data",
            ));
        }

        InstanceSpec {
            name: full_name.clone(),
            image: sandbox.image.clone(),
            hostname: Some(full_name),
            env,
            labels: HashMap::from([
                ("sandcastle.role".to_string(), "sandbox".to_string()),
                ("sandcastle.sandbox_id".to_string(), sandbox.id.to_string()),
            ]),
            ports: vec![PortForward {
                host_port: sandbox.ssh_port,
                instance_port: 22,
            }],
            devices,
            nested: true,
            restart: RestartPolicy::UnlessStopped,
            ..Default::default()
        }
    }

    pub async fn start(&self, sandbox: &Sandbox) -> Result<Sandbox> {
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        match sandbox.status {
            SandboxStatus::Running => return Ok(sandbox),
            SandboxStatus::Destroyed => {
                return Err(SandboxError::Validation(format!(
                    "{} is destroyed",
                    sandbox.full_name()
                )))
            }
            SandboxStatus::Pending | SandboxStatus::Stopped => {}
        }

        let instance = self.require_instance(&sandbox).await?;
        match self
            .runtime
            .change_state(
                &instance,
                InstanceAction::Start,
                false,
                self.config.operation_timeout,
            )
            .await
        {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => return Err(self.instance_gone(&sandbox).await),
            Err(e) => return Err(e.into()),
        }

        self.storage
            .update_status(sandbox.id, SandboxStatus::Running)
            .await?;
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        if let Err(e) = self.routes.reconnect_routes(&sandbox).await {
            warn!(
                "Failed to reconnect routes of {}: {}",
                sandbox.full_name(),
                e
            );
        }

        info!("Started sandbox {}", sandbox.full_name());
        Ok(sandbox)
    }

    pub async fn stop(&self, sandbox: &Sandbox) -> Result<Sandbox> {
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        match sandbox.status {
            SandboxStatus::Stopped => return Ok(sandbox),
            SandboxStatus::Destroyed => {
                return Err(SandboxError::Validation(format!(
                    "{} is destroyed",
                    sandbox.full_name()
                )))
            }
            SandboxStatus::Pending | SandboxStatus::Running => {}
        }

        let instance = self.require_instance(&sandbox).await?;
        self.close_sidecars(&sandbox).await;
        if let Err(e) = self.routes.suspend_routes(&sandbox).await {
            warn!("Failed to suspend routes of {}: {}", sandbox.full_name(), e);
        }

        match self
            .runtime
            .change_state(&instance, InstanceAction::Stop, false, STOP_TIMEOUT)
            .await
        {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => return Err(self.instance_gone(&sandbox).await),
            Err(e) => return Err(e.into()),
        }

        self.storage
            .update_status(sandbox.id, SandboxStatus::Stopped)
            .await?;
        info!("Stopped sandbox {}", sandbox.full_name());
        Ok(self.storage.get_sandbox(sandbox.id).await?)
    }

    /// Ordered teardown; each step is best effort. Destroyed sandboxes are returned as-is.
    pub async fn destroy(&self, sandbox: &Sandbox, keep_volume: bool) -> Result<Sandbox> {
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        if sandbox.status == SandboxStatus::Destroyed {
            debug!("{} already destroyed", sandbox.full_name());
            return Ok(sandbox);
        }
        let full_name = sandbox.full_name();

        self.close_sidecars(&sandbox).await;

        if let Err(e) = self.routes.remove_all_routes(&sandbox).await {
            warn!("Failed to remove routes of {}: {}", full_name, e);
        }

        if let Err(e) = self.mesh.disconnect_sandbox(&sandbox).await {
            warn!("Failed to detach {} from the mesh: {}", full_name, e);
        }

        if let Some(instance) = sandbox.instance() {
            match self
                .runtime
                .stop_and_delete(instance, DESTROY_STOP_TIMEOUT)
                .await
            {
                // Snapshot images are still in use until the instance is gone.
                Ok(()) => match self.runtime.purge_snapshots(&full_name).await {
                    Ok(0) => {}
                    Ok(removed) => debug!("Removed {} snapshots of {}", removed, full_name),
                    Err(e) => warn!("Failed to remove snapshots of {}: {}", full_name, e),
                },
                Err(e) => warn!("Failed to delete instance of {}: {}", full_name, e),
            }
        }

        if !keep_volume {
            if let Some(volume) = &sandbox.volume_path {
                match tokio::fs::remove_dir_all(volume).await {
                    Ok(()) => debug!("Removed volume {}", volume),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove volume {}: {}", volume, e),
                }
            }
        }

        self.storage.mark_destroyed(sandbox.id, None).await?;
        info!("Destroyed sandbox {}", full_name);
        Ok(self.storage.get_sandbox(sandbox.id).await?)
    }

    /// Snapshot a live instance. The name defaults to the UTC time as `YYYYMMDD-HHMMSS`.
    pub async fn snapshot(&self, sandbox: &Sandbox, name: Option<&str>) -> Result<SnapshotInfo> {
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        let instance = self.live_instance(&sandbox)?;
        let name = match name {
            Some(name) => name.to_string(),
            None => Utc::now().format("%Y%m%d-%H%M%S").to_string(),
        };
        validate_snapshot_name(&name)?;

        let info = self.runtime.create_snapshot(&instance, &name).await?;
        info!("Created snapshot {} of {}", name, sandbox.full_name());
        Ok(info)
    }

    pub async fn list_snapshots(&self, sandbox: &Sandbox) -> Result<Vec<SnapshotInfo>> {
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        let instance = self.live_instance(&sandbox)?;
        Ok(self.runtime.list_snapshots(&instance).await?)
    }

    pub async fn delete_snapshot(&self, sandbox: &Sandbox, name: &str) -> Result<()> {
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        let instance = self.live_instance(&sandbox)?;
        validate_snapshot_name(name)?;
        self.runtime.delete_snapshot(&instance, name).await?;
        info!("Deleted snapshot {} of {}", name, sandbox.full_name());
        Ok(())
    }

    /// Roll back to `snapshot` and come back up with routes, mesh and SSH key restored.
    pub async fn restore(&self, sandbox: &Sandbox, snapshot: &str) -> Result<Sandbox> {
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        let instance = self.live_instance(&sandbox)?;
        validate_snapshot_name(snapshot)?;
        self.runtime.get_snapshot(&instance, snapshot).await?;

        self.close_sidecars(&sandbox).await;
        if let Err(e) = self.routes.suspend_routes(&sandbox).await {
            warn!("Failed to suspend routes of {}: {}", sandbox.full_name(), e);
        }
        match self
            .runtime
            .change_state(&instance, InstanceAction::Stop, true, STOP_TIMEOUT)
            .await
        {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => return Err(self.instance_gone(&sandbox).await),
            Err(e) => return Err(e.into()),
        }

        let restored = self.runtime.restore_snapshot(&instance, snapshot).await?;
        self.storage
            .set_container(sandbox.id, Some(&restored))
            .await?;
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        debug!("Restored {} as {}", sandbox.full_name(), restored);

        if !self.routes.list_routes(&sandbox).await?.is_empty() {
            self.routes.ingress().attach(&restored).await?;
        }
        if sandbox.mesh {
            if let Err(e) = self.mesh.connect_sandbox(&sandbox).await {
                warn!(
                    "Could not re-attach {} to the mesh: {}",
                    sandbox.full_name(),
                    e
                );
                self.storage.set_mesh_flag(sandbox.id, false).await?;
            }
        }

        self.runtime
            .change_state(
                &restored,
                InstanceAction::Start,
                false,
                self.config.operation_timeout,
            )
            .await?;

        let owner = self.storage.get_user(sandbox.user_id).await?;
        if let Err(e) = self.apply_ssh_key(&restored, &owner).await {
            warn!(
                "Failed to re-apply SSH key in {}: {}",
                sandbox.full_name(),
                e
            );
        }

        self.storage
            .update_status(sandbox.id, SandboxStatus::Running)
            .await?;
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        if let Err(e) = self.routes.reconnect_routes(&sandbox).await {
            warn!(
                "Failed to reconnect routes of {}: {}",
                sandbox.full_name(),
                e
            );
        }

        info!("Restored {} from snapshot {}", sandbox.full_name(), snapshot);
        Ok(sandbox)
    }

    pub async fn connect_info(&self, sandbox: &Sandbox) -> Result<ConnectInfo> {
        let sandbox = self.storage.get_sandbox(sandbox.id).await?;
        let user = sandbox.owner_name.clone();
        let host = self.config.host.clone();

        let mesh_ip = if sandbox.mesh && sandbox.is_running() {
            self.mesh.sandbox_mesh_ip(&sandbox).await
        } else {
            None
        };

        Ok(ConnectInfo {
            command: format!("ssh -p {} {}@{}", sandbox.ssh_port, user, host),
            mesh_command: mesh_ip.as_ref().map(|ip| format!("ssh {}@{}", user, ip)),
            mesh_ip,
            port: sandbox.ssh_port,
            host,
            user,
        })
    }

    /// Runtime view of the instance; `None` when there is none.
    pub async fn instance_state(&self, sandbox: &Sandbox) -> Result<Option<InstanceState>> {
        let Some(instance) = sandbox.instance() else {
            return Ok(None);
        };
        match self.runtime.get_instance_state(instance).await {
            Ok(state) => Ok(Some(state)),
            Err(RuntimeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn close_sidecars(&self, sandbox: &Sandbox) {
        self.terminal.close(sandbox).await;
        self.vnc.close(sandbox).await;
    }

    /// Overwrite authorized_keys with the owner's current key.
    async fn apply_ssh_key(&self, instance: &str, owner: &User) -> Result<()> {
        let Some(key) = &owner.ssh_public_key else {
            return Ok(());
        };
        let ssh_dir = format!("/home/{}/.ssh", owner.name);
        let encoded = STANDARD.encode(format!("{}\n", key.trim()));

        self.runtime
            .exec_ok(instance, &argv(&["mkdir", "-p", &ssh_dir]))
            .await?;
        self.runtime
            .exec_ok(
                instance,
                &shell(&format!(
                    "echo {} | base64 -d > {}/authorized_keys",
                    encoded, ssh_dir
                )),
            )
            .await?;
        self.runtime
            .exec_ok(
                instance,
                &argv(&[
                    "chown",
                    "-R",
                    &format!("{}:{}", owner.name, owner.name),
                    &ssh_dir,
                ]),
            )
            .await?;
        self.runtime
            .exec_ok(
                instance,
                &argv(&["chmod", "600", &format!("{}/authorized_keys", ssh_dir)]),
            )
            .await?;
        Ok(())
    }

    fn live_instance(&self, sandbox: &Sandbox) -> Result<String> {
        if sandbox.status == SandboxStatus::Destroyed {
            return Err(SandboxError::Validation(format!(
                "{} is destroyed",
                sandbox.full_name()
            )));
        }
        sandbox
            .instance()
            .map(str::to_string)
            .ok_or_else(|| SandboxError::Validation(format!("{} has no instance", sandbox.full_name())))
    }

    async fn require_instance(&self, sandbox: &Sandbox) -> Result<String> {
        match sandbox.instance() {
            Some(instance) => Ok(instance.to_string()),
            None => Err(self.instance_gone(sandbox).await),
        }
    }

    /// The instance vanished: the record can only be recreated from scratch.
    async fn instance_gone(&self, sandbox: &Sandbox) -> SandboxError {
        warn!(
            "Instance of {} not found, marking destroyed",
            sandbox.full_name()
        );
        if let Err(e) = self.storage.mark_destroyed(sandbox.id, None).await {
            return e.into();
        }
        SandboxError::NotFound(format!(
            "Instance of {} not found; the sandbox must be recreated",
            sandbox.full_name()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{running_sandbox, seed_user, test_pool, FakeRuntime};
    use pretty_assertions::assert_eq;

    struct Harness {
        dir: tempfile::TempDir,
        runtime: Arc<FakeRuntime>,
        storage: SandboxStorage,
        manager: SandboxManager,
    }

    async fn setup() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandcastleConfig::with_data_dir(dir.path());
        config.propagation_delay = false;
        let runtime = Arc::new(FakeRuntime::new());
        let storage = SandboxStorage::new(test_pool().await);
        let manager = SandboxManager::new(Arc::new(config), storage.clone(), runtime.clone());
        Harness {
            dir,
            runtime,
            storage,
            manager,
        }
    }

    fn request(name: &str) -> CreateSandboxRequest {
        CreateSandboxRequest {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_provisions_running_instance() {
        let h = setup().await;
        let alice = seed_user(&h.storage, "alice").await;

        let sandbox = h.manager.create(&alice, &request("dev")).await.unwrap();

        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(sandbox.ssh_port, 2201);
        assert_eq!(sandbox.image, "sandcastle-sandbox:latest");
        assert_eq!(sandbox.container_id.as_deref(), Some("id-alice-dev"));
        assert!(h.runtime.state_of("alice-dev").unwrap().is_running());
        assert_eq!(h.runtime.call_count("pull_image"), 1);

        let spec = h.runtime.spec_of("alice-dev").unwrap();
        assert_eq!(spec.hostname.as_deref(), Some("alice-dev"));
        assert_eq!(spec.env["SANDCASTLE_USER"], "alice");
        assert!(spec.env.contains_key("SANDCASTLE_SSH_KEY"));
        assert_eq!(
            spec.ports,
            vec![PortForward {
                host_port: 2201,
                instance_port: 22
            }]
        );
        assert!(spec.nested);
        assert_eq!(spec.restart, RestartPolicy::UnlessStopped);
        assert!(spec.devices.is_empty());
    }

    #[tokio::test]
    async fn test_create_mounts_requested_storage() {
        let h = setup().await;
        let alice = seed_user(&h.storage, "alice").await;

        let sandbox = h
            .manager
            .create(
                &alice,
                &CreateSandboxRequest {
                    name: "dev".to_string(),
                    persistent_volume: true,
                    mount_home: true,
                    data_path: Some("projects/web".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let volume = h.dir.path().join("sandboxes/alice-dev/vol");
        assert_eq!(
            sandbox.volume_path.as_deref(),
            Some(volume.to_string_lossy().as_ref())
        );
        assert!(volume.is_dir());
        assert!(h.dir.path().join("users/alice/home").is_dir());
        assert!(h.dir.path().join("users/alice/data/projects/web").is_dir());

        let paths: Vec<String> = h
            .runtime
            .spec_of("alice-dev")
            .unwrap()
            .devices
            .iter()
            .filter_map(|d| match d {
                Device::Disk { path, .. } => Some(path.clone()),
                Device::Nic { .. } => None,
            })
            .collect();
        assert_eq!(paths, vec!["/home/alice", "/workspace", "/data"]);
    }

    #[tokio::test]
    async fn test_invalid_request_leaves_no_record() {
        let h = setup().await;
        let alice = seed_user(&h.storage, "alice").await;

        let err = h.manager.create(&alice, &request("Bad Name")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));

        let err = h
            .manager
            .create(
                &alice,
                &CreateSandboxRequest {
                    name: "dev".to_string(),
                    data_path: Some("../etc".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));

        let all = h
            .storage
            .list_sandboxes(&crate::storage::SandboxFilter {
                include_destroyed: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_active_name_conflicts() {
        let h = setup().await;
        let alice = seed_user(&h.storage, "alice").await;
        h.manager.create(&alice, &request("dev")).await.unwrap();

        let err = h.manager.create(&alice, &request("dev")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_failed_provision_marks_destroyed() {
        let h = setup().await;
        let alice = seed_user(&h.storage, "alice").await;
        h.runtime.fail_on(
            "change_state:start",
            RuntimeError::Backend("sysbox-runc not installed".into()),
        );

        let err = h.manager.create(&alice, &request("dev")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Backend(_)));

        let sandboxes = h
            .storage
            .list_sandboxes(&crate::storage::SandboxFilter {
                include_destroyed: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(sandboxes.len(), 1);
        assert_eq!(sandboxes[0].status, SandboxStatus::Destroyed);
        assert_eq!(sandboxes[0].container_id, None);
        assert!(sandboxes[0]
            .job_error
            .as_deref()
            .unwrap()
            .contains("sysbox-runc not installed"));
        assert!(!h.runtime.exists("alice-dev"));

        // The port is free again for the next sandbox.
        let next = h.manager.create(&alice, &request("dev")).await.unwrap();
        assert_eq!(next.ssh_port, 2201);
    }

    #[tokio::test]
    async fn test_mesh_request_without_enabled_mesh_is_dropped() {
        let h = setup().await;
        let alice = seed_user(&h.storage, "alice").await;

        let sandbox = h
            .manager
            .create(
                &alice,
                &CreateSandboxRequest {
                    name: "dev".to_string(),
                    mesh: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(!sandbox.mesh);
    }

    #[tokio::test]
    async fn test_unset_mesh_follows_auto_connect() {
        let h = setup().await;
        let alice = seed_user(&h.storage, "alice").await;
        let alice = h.manager.mesh().enable(&alice, "tskey-auth-1").await.unwrap();
        let alice = h.manager.mesh().set_auto_connect(&alice, true).await.unwrap();

        let joined = h.manager.create(&alice, &request("dev")).await.unwrap();
        assert!(joined.mesh);
        assert!(h
            .runtime
            .state_of("alice-dev")
            .unwrap()
            .is_attached_to("sc-ts-net-alice"));

        let opted_out = h
            .manager
            .create(
                &alice,
                &CreateSandboxRequest {
                    name: "scratch".to_string(),
                    mesh: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!opted_out.mesh);
        assert!(!h
            .runtime
            .state_of("alice-scratch")
            .unwrap()
            .is_attached_to("sc-ts-net-alice"));

        let alice = h.manager.mesh().set_auto_connect(&alice, false).await.unwrap();
        let plain = h.manager.create(&alice, &request("plain")).await.unwrap();
        assert!(!plain.mesh);
    }

    #[tokio::test]
    async fn test_start_and_stop_in_place_are_noops() {
        let h = setup().await;
        let sandbox = running_sandbox(&h.storage, &h.runtime, "alice", "dev").await;
        h.runtime.clear_calls();

        h.manager.start(&sandbox).await.unwrap();
        assert!(h.runtime.calls().is_empty());

        let stopped = h.manager.stop(&sandbox).await.unwrap();
        assert_eq!(stopped.status, SandboxStatus::Stopped);
        h.runtime.clear_calls();

        h.manager.stop(&stopped).await.unwrap();
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_then_start_suspends_and_restores_routes() {
        let h = setup().await;
        let sandbox = running_sandbox(&h.storage, &h.runtime, "alice", "dev").await;
        h.manager
            .routes()
            .add_route(&sandbox, "app.example.com", 8080)
            .await
            .unwrap();
        let route_file = h.manager.routes().config_path(sandbox.id);

        let stopped = h.manager.stop(&sandbox).await.unwrap();
        assert!(!route_file.exists());
        assert!(!h.runtime.state_of("alice-dev").unwrap().is_running());

        let started = h.manager.start(&stopped).await.unwrap();
        assert_eq!(started.status, SandboxStatus::Running);
        assert!(route_file.exists());
        assert!(h
            .runtime
            .state_of("alice-dev")
            .unwrap()
            .is_attached_to("sandcastle-web"));
    }

    #[tokio::test]
    async fn test_missing_instance_marks_destroyed() {
        let h = setup().await;
        let sandbox = running_sandbox(&h.storage, &h.runtime, "alice", "dev").await;
        h.runtime.remove_out_of_band("alice-dev");

        let err = h.manager.stop(&sandbox).await.unwrap_err();

        assert!(err.is_not_found());
        let sandbox = h.storage.get_sandbox(sandbox.id).await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Destroyed);
        assert_eq!(sandbox.container_id, None);

        let err = h.manager.start(&sandbox).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }

    #[tokio::test]
    async fn test_destroy_is_ordered_and_idempotent() {
        let h = setup().await;
        let alice = seed_user(&h.storage, "alice").await;
        let sandbox = h
            .manager
            .create(
                &alice,
                &CreateSandboxRequest {
                    name: "dev".to_string(),
                    persistent_volume: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        h.manager
            .routes()
            .add_route(&sandbox, "app.example.com", 8080)
            .await
            .unwrap();
        h.manager
            .sidecar(SidecarKind::Terminal)
            .open(&sandbox)
            .await
            .unwrap();
        h.runtime.clear_calls();

        let destroyed = h.manager.destroy(&sandbox, false).await.unwrap();

        assert_eq!(destroyed.status, SandboxStatus::Destroyed);
        assert_eq!(destroyed.container_id, None);
        assert!(!h.runtime.exists("alice-dev"));
        assert!(!h.runtime.exists("sc-wetty-alice-dev"));
        assert!(h.manager.routes().list_routes(&destroyed).await.unwrap().is_empty());
        assert!(!h.dir.path().join("sandboxes/alice-dev/vol").exists());

        let calls = h.runtime.calls();
        let sidecar_gone = calls.iter().position(|c| c == "delete_instance").unwrap();
        let detached = calls.iter().position(|c| c == "remove_device").unwrap();
        let last_delete = calls.iter().rposition(|c| c == "delete_instance").unwrap();
        assert!(sidecar_gone < detached);
        assert!(detached < last_delete);

        h.runtime.clear_calls();
        let again = h.manager.destroy(&destroyed, false).await.unwrap();
        assert_eq!(again.status, SandboxStatus::Destroyed);
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_snapshots() {
        let h = setup().await;
        let sandbox = running_sandbox(&h.storage, &h.runtime, "alice", "dev").await;
        h.manager.snapshot(&sandbox, Some("before")).await.unwrap();
        h.manager.snapshot(&sandbox, Some("after")).await.unwrap();

        h.manager.destroy(&sandbox, false).await.unwrap();

        assert!(!h.runtime.exists("alice-dev"));
        assert_eq!(h.runtime.leftover_snapshots("alice-dev"), 0);
        assert_eq!(h.runtime.call_count("purge_snapshots"), 1);
    }

    #[tokio::test]
    async fn test_snapshot_cleanup_failure_does_not_block_destroy() {
        let h = setup().await;
        let sandbox = running_sandbox(&h.storage, &h.runtime, "alice", "dev").await;
        h.manager.snapshot(&sandbox, Some("before")).await.unwrap();
        h.runtime.fail_on(
            "purge_snapshots",
            RuntimeError::Backend("image is busy".into()),
        );

        let destroyed = h.manager.destroy(&sandbox, false).await.unwrap();

        assert_eq!(destroyed.status, SandboxStatus::Destroyed);
        assert_eq!(h.runtime.leftover_snapshots("alice-dev"), 1);
    }

    #[tokio::test]
    async fn test_destroy_can_keep_volume() {
        let h = setup().await;
        let alice = seed_user(&h.storage, "alice").await;
        let sandbox = h
            .manager
            .create(
                &alice,
                &CreateSandboxRequest {
                    name: "dev".to_string(),
                    persistent_volume: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.manager.destroy(&sandbox, true).await.unwrap();

        assert!(h.dir.path().join("sandboxes/alice-dev/vol").is_dir());
    }

    #[tokio::test]
    async fn test_snapshot_default_name_and_listing() {
        let h = setup().await;
        let sandbox = running_sandbox(&h.storage, &h.runtime, "alice", "dev").await;

        let info = h.manager.snapshot(&sandbox, None).await.unwrap();
        assert_eq!(info.name.len(), 15);
        assert_eq!(&info.name[8..9], "-");

        h.manager
            .snapshot(&sandbox, Some("before-upgrade"))
            .await
            .unwrap();
        assert_eq!(h.manager.list_snapshots(&sandbox).await.unwrap().len(), 2);

        h.manager
            .delete_snapshot(&sandbox, "before-upgrade")
            .await
            .unwrap();
        assert_eq!(h.manager.list_snapshots(&sandbox).await.unwrap().len(), 1);

        let err = h
            .manager
            .snapshot(&sandbox, Some("../escape"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }

    #[tokio::test]
    async fn test_restore_recreates_and_reconnects() {
        let h = setup().await;
        let sandbox = running_sandbox(&h.storage, &h.runtime, "alice", "dev").await;
        h.manager
            .routes()
            .add_route(&sandbox, "app.example.com", 8080)
            .await
            .unwrap();
        h.manager.snapshot(&sandbox, Some("base")).await.unwrap();

        let restored = h.manager.restore(&sandbox, "base").await.unwrap();

        assert_eq!(restored.status, SandboxStatus::Running);
        assert_eq!(restored.container_id.as_deref(), Some("id-alice-dev-r1"));
        let state = h.runtime.state_of("alice-dev").unwrap();
        assert!(state.is_running());
        assert!(state.is_attached_to("sandcastle-web"));
        assert!(h.manager.routes().config_path(sandbox.id).exists());
        assert!(h
            .runtime
            .exec_log()
            .iter()
            .any(|(_, cmd)| cmd.contains("> /home/alice/.ssh/authorized_keys")));
    }

    #[tokio::test]
    async fn test_restore_unknown_snapshot_is_not_found() {
        let h = setup().await;
        let sandbox = running_sandbox(&h.storage, &h.runtime, "alice", "dev").await;

        let err = h.manager.restore(&sandbox, "missing").await.unwrap_err();

        assert!(err.is_not_found());
        assert!(h.runtime.state_of("alice-dev").unwrap().is_running());
    }

    #[tokio::test]
    async fn test_connect_info_includes_mesh_address() {
        let h = setup().await;
        let sandbox = running_sandbox(&h.storage, &h.runtime, "alice", "dev").await;
        let alice = h.storage.get_user(sandbox.user_id).await.unwrap();

        let info = h.manager.connect_info(&sandbox).await.unwrap();
        assert_eq!(info.command, "ssh -p 2201 alice@localhost");
        assert_eq!(info.mesh_ip, None);

        h.manager.mesh().enable(&alice, "tskey-auth-1").await.unwrap();
        h.manager.mesh().connect_sandbox(&sandbox).await.unwrap();
        h.runtime.set_address("alice-dev", "eth1", "172.100.0.9");

        let info = h.manager.connect_info(&sandbox).await.unwrap();
        assert_eq!(info.mesh_ip.as_deref(), Some("172.100.0.9"));
        assert_eq!(info.mesh_command.as_deref(), Some("ssh alice@172.100.0.9"));
    }
}
