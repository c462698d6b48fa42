// ABOUTME: Per-user private mesh network backed by a Tailscale sidecar instance
// ABOUTME: Handles key-based and interactive two-phase login plus sandbox NIC attachment

use crate::config::SandcastleConfig;
use crate::error::{Result, SandboxError};
use crate::runtime::{
    argv, Device, InstanceAction, InstanceSpec, NetworkSpec, RestartPolicy, RuntimeClient,
    RuntimeError,
};
use crate::storage::{MeshState, MeshSubnet, Sandbox, SandboxStorage, User};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// NIC device attaching a sandbox to its owner's mesh network.
pub const MESH_DEVICE: &str = "ts-nic";

const STATE_DIR: &str = "/var/lib/tailscale";

static LOGIN_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://login\.tailscale\.com/\S+").expect("valid login url regex")
});

pub fn network_name(user: &User) -> String {
    owner_network(&user.name)
}

fn owner_network(owner: &str) -> String {
    format!("sc-ts-net-{}", owner)
}

pub fn sidecar_name(user: &User) -> String {
    format!("sc-ts-{}", user.name)
}

/// Progress of an interactive login, reported one step at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginStatus {
    Starting,
    WaitingForUrl,
    LoginReady {
        url: String,
    },
    Authenticated {
        ip: Option<String>,
        hostname: Option<String>,
        tailnet: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSandbox {
    pub name: String,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStatus {
    pub state: MeshState,
    pub running: bool,
    pub sidecar: String,
    pub network: Option<String>,
    pub subnet: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub tailnet: Option<String>,
    pub online: Option<bool>,
    pub sandboxes: Vec<MeshSandbox>,
}

/// Subset of `tailscale status --json`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailscaleStatus {
    #[serde(default)]
    backend_state: Option<String>,
    #[serde(rename = "Self", default)]
    self_node: Option<TailscaleNode>,
    #[serde(rename = "MagicDNSSuffix", default)]
    magic_dns_suffix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailscaleNode {
    #[serde(default)]
    host_name: Option<String>,
    #[serde(default)]
    online: Option<bool>,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Vec<String>,
}

impl TailscaleStatus {
    fn is_running(&self) -> bool {
        self.backend_state.as_deref() == Some("Running")
    }

    fn hostname(&self) -> Option<String> {
        self.self_node.as_ref().and_then(|n| n.host_name.clone())
    }

    fn ipv4(&self) -> Option<String> {
        self.self_node
            .as_ref()
            .and_then(|n| n.tailscale_ips.iter().find(|ip| ip.contains('.')).cloned())
    }
}

pub struct MeshManager {
    config: Arc<SandcastleConfig>,
    storage: SandboxStorage,
    runtime: Arc<dyn RuntimeClient>,
}

impl MeshManager {
    pub fn new(
        config: Arc<SandcastleConfig>,
        storage: SandboxStorage,
        runtime: Arc<dyn RuntimeClient>,
    ) -> Self {
        Self {
            config,
            storage,
            runtime,
        }
    }

    /// One-shot join with a pre-issued auth key.
    pub async fn enable(&self, user: &User, auth_key: &str) -> Result<User> {
        let user = self.storage.get_user(user.id).await?;
        if user.mesh_state != MeshState::Disabled {
            return Err(SandboxError::Conflict(format!(
                "Mesh already active for {}",
                user.name
            )));
        }
        if auth_key.trim().is_empty() {
            return Err(SandboxError::Validation("Auth key is required".to_string()));
        }
        let subnet = self.storage.allocate_mesh_subnet(user.id).await?;

        match self.start_sidecar(&user, subnet, Some(auth_key.trim())).await {
            Ok((network, sidecar)) => {
                self.storage
                    .set_mesh_credentials(user.id, Some(auth_key.trim()), user.mesh_auto_connect)
                    .await?;
                self.storage
                    .set_mesh_state(user.id, MeshState::Enabled, Some(&sidecar), Some(&network))
                    .await?;
                // Usually not up yet; `status` fills it in later.
                if let Some(ip) = self.mesh_ip(&sidecar).await {
                    self.storage.set_mesh_ip(user.id, Some(&ip)).await?;
                }
                info!("Mesh enabled for {} via {} on {}", user.name, sidecar, subnet);
                Ok(self.storage.get_user(user.id).await?)
            }
            Err(e) => {
                self.cleanup_on_failure(&user).await;
                Err(e)
            }
        }
    }

    /// Phase one of interactive login: bring up a keyless sidecar.
    pub async fn start_login(&self, user: &User) -> Result<LoginStatus> {
        let user = self.storage.get_user(user.id).await?;
        match user.mesh_state {
            MeshState::Enabled => {
                return Err(SandboxError::Conflict(format!(
                    "Mesh already active for {}",
                    user.name
                )))
            }
            MeshState::Pending => {
                debug!("Discarding previous login attempt for {}", user.name);
                self.cleanup_sidecar(&user).await?;
                self.storage.reset_mesh(user.id).await?;
            }
            MeshState::Disabled => {}
        }
        self.storage.set_mesh_login_url(user.id, None).await?;
        let subnet = self.storage.allocate_mesh_subnet(user.id).await?;

        match self.start_sidecar(&user, subnet, None).await {
            Ok((network, sidecar)) => {
                self.storage
                    .set_mesh_state(user.id, MeshState::Pending, Some(&sidecar), Some(&network))
                    .await?;
                info!("Mesh login started for {}", user.name);
                Ok(LoginStatus::Starting)
            }
            Err(e) => {
                self.cleanup_on_failure(&user).await;
                Err(e)
            }
        }
    }

    /// Phase two, polled by the client until it reports `Authenticated`.
    pub async fn check_login(&self, user: &User) -> Result<LoginStatus> {
        let user = self.storage.get_user(user.id).await?;
        if user.mesh_state != MeshState::Pending {
            return Err(SandboxError::Validation(format!(
                "No pending mesh login for {}",
                user.name
            )));
        }
        let (Some(sidecar), Some(subnet)) = (user.mesh_sidecar.clone(), user.mesh_subnet) else {
            self.storage.reset_mesh(user.id).await?;
            return Err(SandboxError::NotFound(format!(
                "Mesh sidecar of {}",
                user.name
            )));
        };

        let state = match self.runtime.get_instance_state(&sidecar).await {
            Ok(state) => state,
            Err(RuntimeError::NotFound(_)) => {
                warn!("Mesh sidecar {} disappeared during login", sidecar);
                self.storage.reset_mesh(user.id).await?;
                return Err(SandboxError::NotFound(format!(
                    "Mesh sidecar {} disappeared",
                    sidecar
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if !state.is_running() {
            return Ok(LoginStatus::Starting);
        }

        let Some(url) = user.mesh_login_url.clone() else {
            return match self.fetch_login_url(&user, subnet, &sidecar).await {
                Some(url) => {
                    self.storage.set_mesh_login_url(user.id, Some(&url)).await?;
                    info!("Mesh login URL ready for {}", user.name);
                    Ok(LoginStatus::LoginReady { url })
                }
                None => Ok(LoginStatus::WaitingForUrl),
            };
        };

        let status = self.read_status(&sidecar).await;
        if !status.is_running() {
            return Ok(LoginStatus::LoginReady { url });
        }

        self.storage
            .set_mesh_state(
                user.id,
                MeshState::Enabled,
                Some(&sidecar),
                user.mesh_network.as_deref(),
            )
            .await?;
        let ip = self.mesh_ip(&sidecar).await.or_else(|| status.ipv4());
        self.storage.set_mesh_ip(user.id, ip.as_deref()).await?;
        info!("Mesh login completed for {} ({:?})", user.name, ip);

        Ok(LoginStatus::Authenticated {
            ip,
            hostname: status.hostname(),
            tailnet: status.magic_dns_suffix,
        })
    }

    pub async fn disable(&self, user: &User) -> Result<()> {
        let user = self.storage.get_user(user.id).await?;
        if user.mesh_state == MeshState::Disabled {
            return Err(SandboxError::Validation(format!(
                "Mesh is not active for {}",
                user.name
            )));
        }

        for sandbox in self.storage.list_mesh_sandboxes(user.id).await? {
            if let Err(e) = self.disconnect_sandbox(&sandbox).await {
                warn!(
                    "Failed to disconnect {} from the mesh: {}",
                    sandbox.full_name(),
                    e
                );
            }
        }

        self.cleanup_sidecar(&user).await?;
        self.storage.reset_mesh(user.id).await?;
        info!("Mesh disabled for {}", user.name);
        Ok(())
    }

    /// Whether the user's new sandboxes join the mesh unless the request says otherwise.
    pub async fn set_auto_connect(&self, user: &User, enabled: bool) -> Result<User> {
        let user = self.storage.get_user(user.id).await?;
        self.storage
            .set_mesh_credentials(user.id, user.mesh_auth_key.as_deref(), enabled)
            .await?;
        info!(
            "Mesh auto-connect {} for {}",
            if enabled { "on" } else { "off" },
            user.name
        );
        Ok(self.storage.get_user(user.id).await?)
    }

    pub async fn connect_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let user = self.storage.get_user(sandbox.user_id).await?;
        if user.mesh_state != MeshState::Enabled {
            return Err(SandboxError::Validation(format!(
                "Mesh is not enabled for {}",
                user.name
            )));
        }
        let instance = sandbox.instance().ok_or_else(|| {
            SandboxError::Validation(format!("{} has no instance", sandbox.full_name()))
        })?;
        let network = user
            .mesh_network
            .clone()
            .unwrap_or_else(|| network_name(&user));

        self.runtime
            .add_device(instance, &Device::nic(MESH_DEVICE, &network))
            .await?;
        self.storage.set_mesh_flag(sandbox.id, true).await?;
        info!("Connected {} to {}", sandbox.full_name(), network);
        Ok(())
    }

    pub async fn disconnect_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        if !sandbox.mesh {
            return Ok(());
        }
        if let Some(instance) = sandbox.instance() {
            let device = Device::nic(MESH_DEVICE, owner_network(&sandbox.owner_name));
            match self.runtime.remove_device(instance, &device).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.storage.set_mesh_flag(sandbox.id, false).await?;
        info!("Disconnected {} from the mesh", sandbox.full_name());
        Ok(())
    }

    /// The sandbox's address inside its owner's mesh subnet, when attached.
    pub async fn sandbox_mesh_ip(&self, sandbox: &Sandbox) -> Option<String> {
        if !sandbox.mesh {
            return None;
        }
        let instance = sandbox.instance()?;
        let subnet = match self.storage.get_user(sandbox.user_id).await {
            Ok(owner) => owner.mesh_subnet?,
            Err(e) => {
                debug!("No mesh owner for {}: {}", sandbox.full_name(), e);
                return None;
            }
        };
        match self.runtime.get_instance_state(instance).await {
            Ok(state) => state.ipv4_with_prefix(&subnet.prefix()).map(str::to_string),
            Err(e) => {
                debug!("No mesh address for {}: {}", sandbox.full_name(), e);
                None
            }
        }
    }

    pub async fn status(&self, user: &User) -> Result<MeshStatus> {
        let user = self.storage.get_user(user.id).await?;
        if user.mesh_state == MeshState::Disabled {
            return Err(SandboxError::Validation(format!(
                "Mesh is not active for {}",
                user.name
            )));
        }
        let sidecar = user.mesh_sidecar.clone().ok_or_else(|| {
            SandboxError::NotFound(format!("Mesh sidecar of {}", user.name))
        })?;

        let running = match self.runtime.get_instance_state(&sidecar).await {
            Ok(state) => state.is_running(),
            Err(RuntimeError::NotFound(_)) => {
                return Err(SandboxError::NotFound(format!(
                    "Mesh sidecar {} not found; disable and re-enable the mesh",
                    sidecar
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let mut sandboxes = Vec::new();
        for sandbox in self.storage.list_mesh_sandboxes(user.id).await? {
            sandboxes.push(MeshSandbox {
                ip: self.sandbox_mesh_ip(&sandbox).await,
                name: sandbox.name,
            });
        }

        let mut report = MeshStatus {
            state: user.mesh_state,
            running,
            sidecar: sidecar.clone(),
            network: user.mesh_network.clone(),
            subnet: user.mesh_subnet.map(|s| s.cidr()),
            ip: user.mesh_ip.clone(),
            hostname: None,
            tailnet: None,
            online: None,
            sandboxes,
        };
        if running {
            let status = self.read_status(&sidecar).await;
            let live_ip = self.mesh_ip(&sidecar).await.or_else(|| status.ipv4());
            if live_ip.is_some() && live_ip != user.mesh_ip {
                self.storage.set_mesh_ip(user.id, live_ip.as_deref()).await?;
                report.ip = live_ip;
            }
            report.hostname = status.hostname();
            report.online = status.self_node.as_ref().and_then(|n| n.online);
            report.tailnet = status.magic_dns_suffix;
        }
        Ok(report)
    }

    /// Reset a user whose sidecar vanished. Returns whether anything was healed.
    pub async fn heal_missing_sidecar(&self, user: &User) -> Result<bool> {
        let present = match user.mesh_sidecar.as_deref() {
            Some(sidecar) => self.runtime.instance_exists(sidecar).await?,
            None => false,
        };
        if present {
            return Ok(false);
        }

        warn!(
            "Mesh sidecar of {} is gone, resetting mesh state",
            user.name
        );
        self.storage.reset_mesh(user.id).await?;
        let cleared = self.storage.clear_mesh_flags_for_user(user.id).await?;
        if cleared > 0 {
            info!("Cleared mesh flag on {} sandbox(es) of {}", cleared, user.name);
        }
        Ok(true)
    }

    fn sidecar_spec(
        &self,
        user: &User,
        subnet: MeshSubnet,
        network: &str,
        auth_key: Option<&str>,
    ) -> InstanceSpec {
        let subnet = subnet.cidr();
        let hostname = format!("sc-{}", user.name);
        let state_dir = self.state_dir(user);

        let mut env = HashMap::from([
            ("TS_ROUTES".to_string(), subnet.clone()),
            ("TS_HOSTNAME".to_string(), hostname.clone()),
            ("TS_STATE_DIR".to_string(), STATE_DIR.to_string()),
            ("TS_EXTRA_ARGS".to_string(), "--accept-routes".to_string()),
            ("TS_USERSPACE".to_string(), "false".to_string()),
        ]);
        let user_data = match auth_key {
            Some(key) => {
                env.insert("TS_AUTHKEY".to_string(), key.to_string());
                format!(
                    "#cloud-config\nruncmd:\n  - tailscale up --authkey={} --advertise-routes={} --accept-routes --hostname={}\n",
                    key, subnet, hostname
                )
            }
            None => "#cloud-config\nruncmd:\n  - systemctl start tailscaled\n".to_string(),
        };

        InstanceSpec {
            name: sidecar_name(user),
            image: self.config.mesh_image.clone(),
            hostname: Some(hostname),
            env,
            labels: HashMap::from([
                ("sandcastle.role".to_string(), "mesh".to_string()),
                ("sandcastle.user".to_string(), user.name.clone()),
            ]),
            devices: vec![
                Device::nic("ts-net", network),
                Device::disk("ts-state", state_dir.to_string_lossy(), STATE_DIR),
            ],
            nested: false,
            restart: RestartPolicy::UnlessStopped,
            user_data: Some(user_data),
            cap_add: vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()],
            ..Default::default()
        }
    }

    fn state_dir(&self, user: &User) -> std::path::PathBuf {
        self.config
            .data_dir
            .join("users")
            .join(&user.name)
            .join("tailscale")
    }

    /// Create network and sidecar, then start it. Returns `(network, sidecar)`.
    async fn start_sidecar(
        &self,
        user: &User,
        subnet: MeshSubnet,
        auth_key: Option<&str>,
    ) -> Result<(String, String)> {
        let network = network_name(user);
        let sidecar = sidecar_name(user);

        self.runtime
            .create_network(&NetworkSpec {
                name: network.clone(),
                subnet: Some(subnet.cidr()),
                gateway: Some(subnet.gateway()),
                nat: true,
            })
            .await?;
        tokio::fs::create_dir_all(self.state_dir(user)).await?;
        self.runtime.ensure_image(&self.config.mesh_image).await?;

        let instance = self
            .runtime
            .create_instance(&self.sidecar_spec(user, subnet, &network, auth_key))
            .await?;
        self.runtime
            .change_state(
                &instance,
                InstanceAction::Start,
                false,
                self.config.operation_timeout,
            )
            .await?;

        debug!("Mesh sidecar {} started on {}", sidecar, network);
        Ok((network, sidecar))
    }

    async fn fetch_login_url(&self, user: &User, subnet: MeshSubnet, sidecar: &str) -> Option<String> {
        let command = vec![
            "tailscale".to_string(),
            "up".to_string(),
            "--reset".to_string(),
            format!("--advertise-routes={}", subnet.cidr()),
            "--accept-routes".to_string(),
            format!("--hostname=sc-{}", user.name),
            "--timeout=10s".to_string(),
        ];
        match self.runtime.exec(sidecar, &command, &HashMap::new()).await {
            Ok(output) => LOGIN_URL
                .find(&output.combined())
                .map(|m| m.as_str().to_string()),
            Err(e) => {
                debug!("tailscale up on {} failed: {}", sidecar, e);
                None
            }
        }
    }

    async fn read_status(&self, sidecar: &str) -> TailscaleStatus {
        let command = argv(&["tailscale", "status", "--json"]);
        match self.runtime.exec(sidecar, &command, &HashMap::new()).await {
            Ok(output) if !output.stdout.trim().is_empty() => {
                serde_json::from_str(&output.stdout).unwrap_or_default()
            }
            Ok(_) => TailscaleStatus::default(),
            Err(e) => {
                debug!("tailscale status on {} failed: {}", sidecar, e);
                TailscaleStatus::default()
            }
        }
    }

    async fn mesh_ip(&self, sidecar: &str) -> Option<String> {
        let command = argv(&["tailscale", "ip", "--4"]);
        match self.runtime.exec(sidecar, &command, &HashMap::new()).await {
            Ok(output) => output
                .stdout
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string),
            Err(_) => None,
        }
    }

    async fn cleanup_sidecar(&self, user: &User) -> Result<()> {
        if let Some(sidecar) = user.mesh_sidecar.as_deref() {
            self.runtime
                .stop_and_delete(sidecar, Duration::from_secs(5))
                .await?;
        }
        if let Some(network) = user.mesh_network.as_deref() {
            match self.runtime.delete_network(network).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Remove the deterministic sidecar and network, then reset the user.
    async fn cleanup_on_failure(&self, user: &User) {
        let sidecar = sidecar_name(user);
        if let Err(e) = self
            .runtime
            .stop_and_delete(&sidecar, Duration::from_secs(5))
            .await
        {
            warn!("Failed to remove mesh sidecar {}: {}", sidecar, e);
        }
        let network = network_name(user);
        match self.runtime.delete_network(&network).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!("Failed to remove mesh network {}: {}", network, e),
        }
        if let Err(e) = self.storage.reset_mesh(user.id).await {
            warn!("Failed to reset mesh state of {}: {}", user.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ExecOutput;
    use crate::test_utils::{running_sandbox, seed_user, test_pool, FakeRuntime};
    use pretty_assertions::assert_eq;

    async fn setup() -> (tempfile::TempDir, Arc<FakeRuntime>, SandboxStorage, MeshManager) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(SandcastleConfig::with_data_dir(dir.path()));
        let runtime = Arc::new(FakeRuntime::new());
        let storage = SandboxStorage::new(test_pool().await);
        let mesh = MeshManager::new(config, storage.clone(), runtime.clone());
        (dir, runtime, storage, mesh)
    }

    fn stdout(text: &str) -> ExecOutput {
        ExecOutput {
            stdout: text.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_users_a_hundred_ids_apart_get_distinct_subnets() {
        let (_dir, runtime, storage, mesh) = setup().await;
        let first = seed_user(&storage, "user1").await;
        for i in 2..=100 {
            seed_user(&storage, &format!("user{}", i)).await;
        }
        let hundred_first = seed_user(&storage, "user101").await;
        assert_eq!((first.id, hundred_first.id), (1, 101));

        let a = mesh.enable(&first, "tskey-auth-1").await.unwrap();
        let b = mesh.enable(&hundred_first, "tskey-auth-2").await.unwrap();

        let (a, b) = (a.mesh_subnet.unwrap(), b.mesh_subnet.unwrap());
        assert_ne!(a, b);
        assert_eq!(
            runtime.spec_of("sc-ts-user1").unwrap().env["TS_ROUTES"],
            a.cidr()
        );
        assert_eq!(
            runtime.spec_of("sc-ts-user101").unwrap().env["TS_ROUTES"],
            b.cidr()
        );
    }

    #[tokio::test]
    async fn test_enable_without_free_subnet_is_capacity_error() {
        let (_dir, runtime, storage, mesh) = setup().await;
        for i in 0..crate::storage::MESH_SUBNET_OCTETS.len() {
            let user = seed_user(&storage, &format!("user{}", i)).await;
            storage.allocate_mesh_subnet(user.id).await.unwrap();
        }
        let late = seed_user(&storage, "late").await;

        let err = mesh.enable(&late, "tskey-auth-1").await.unwrap_err();

        assert!(matches!(err, SandboxError::Capacity(_)));
        assert!(!runtime.exists("sc-ts-late"));
        assert!(!runtime.has_network("sc-ts-net-late"));
        let err = mesh.start_login(&late).await.unwrap_err();
        assert!(matches!(err, SandboxError::Capacity(_)));
        assert_eq!(
            storage.get_user(late.id).await.unwrap().mesh_state,
            MeshState::Disabled
        );
    }

    #[tokio::test]
    async fn test_enable_creates_network_and_sidecar() {
        let (_dir, runtime, storage, mesh) = setup().await;
        let user = seed_user(&storage, "alice").await;

        let enabled = mesh.enable(&user, "tskey-auth-123").await.unwrap();

        assert_eq!(enabled.mesh_state, MeshState::Enabled);
        assert_eq!(enabled.mesh_sidecar.as_deref(), Some("sc-ts-alice"));
        assert_eq!(enabled.mesh_network.as_deref(), Some("sc-ts-net-alice"));
        assert!(runtime.has_network("sc-ts-net-alice"));
        assert!(runtime.state_of("sc-ts-alice").unwrap().is_running());
        let spec = runtime.spec_of("sc-ts-alice").unwrap();
        assert_eq!(spec.env["TS_AUTHKEY"], "tskey-auth-123");
        assert!(spec.user_data.unwrap().contains("--authkey=tskey-auth-123"));

        let err = mesh.enable(&enabled, "tskey-auth-123").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_enable_failure_cleans_up() {
        let (_dir, runtime, storage, mesh) = setup().await;
        let user = seed_user(&storage, "alice").await;
        runtime.fail_on(
            "change_state:start",
            RuntimeError::Backend("no tun device".into()),
        );

        assert!(mesh.enable(&user, "tskey-auth-123").await.is_err());

        let user = storage.get_user(user.id).await.unwrap();
        assert_eq!(user.mesh_state, MeshState::Disabled);
        assert_eq!(user.mesh_subnet, None);
        assert!(!runtime.exists("sc-ts-alice"));
        assert!(!runtime.has_network("sc-ts-net-alice"));
    }

    #[tokio::test]
    async fn test_interactive_login_progresses_in_order() {
        let (_dir, runtime, storage, mesh) = setup().await;
        let user = seed_user(&storage, "alice").await;

        assert_eq!(mesh.start_login(&user).await.unwrap(), LoginStatus::Starting);
        assert_eq!(
            storage.get_user(user.id).await.unwrap().mesh_state,
            MeshState::Pending
        );

        // tailscaled not ready yet: no URL in the output
        assert_eq!(
            mesh.check_login(&user).await.unwrap(),
            LoginStatus::WaitingForUrl
        );

        runtime.push_exec(
            "tailscale up",
            ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "To authenticate, visit:\n\n\thttps://login.tailscale.com/a/abc123\n"
                    .to_string(),
            },
        );
        let url = "https://login.tailscale.com/a/abc123".to_string();
        assert_eq!(
            mesh.check_login(&user).await.unwrap(),
            LoginStatus::LoginReady { url: url.clone() }
        );

        runtime.push_exec("status --json", stdout(r#"{"BackendState":"NeedsLogin"}"#));
        runtime.push_exec(
            "status --json",
            stdout(
                r#"{"BackendState":"Running","Self":{"HostName":"sc-alice","Online":true,"TailscaleIPs":["100.64.0.5","fd7a::5"]},"MagicDNSSuffix":"tail1234.ts.net"}"#,
            ),
        );
        runtime.push_exec("ip --4", stdout("100.64.0.5\n"));

        assert_eq!(
            mesh.check_login(&user).await.unwrap(),
            LoginStatus::LoginReady { url }
        );
        assert_eq!(
            mesh.check_login(&user).await.unwrap(),
            LoginStatus::Authenticated {
                ip: Some("100.64.0.5".to_string()),
                hostname: Some("sc-alice".to_string()),
                tailnet: Some("tail1234.ts.net".to_string()),
            }
        );
        let stored = storage.get_user(user.id).await.unwrap();
        assert_eq!(stored.mesh_state, MeshState::Enabled);
        assert_eq!(stored.mesh_ip.as_deref(), Some("100.64.0.5"));

        let status = mesh.status(&stored).await.unwrap();
        assert_eq!(status.ip.as_deref(), Some("100.64.0.5"));
        assert_eq!(status.subnet, stored.mesh_subnet.map(|s| s.cidr()));
    }

    #[tokio::test]
    async fn test_check_login_reports_starting_until_running() {
        let (_dir, runtime, storage, mesh) = setup().await;
        let user = seed_user(&storage, "alice").await;
        mesh.start_login(&user).await.unwrap();
        runtime.set_running("sc-ts-alice", false);

        assert_eq!(mesh.check_login(&user).await.unwrap(), LoginStatus::Starting);
        assert_eq!(runtime.call_count("exec"), 0);
    }

    #[tokio::test]
    async fn test_vanished_sidecar_resets_login() {
        let (_dir, runtime, storage, mesh) = setup().await;
        let user = seed_user(&storage, "alice").await;
        mesh.start_login(&user).await.unwrap();
        runtime.remove_out_of_band("sc-ts-alice");

        let err = mesh.check_login(&user).await.unwrap_err();

        assert!(err.is_not_found());
        let user = storage.get_user(user.id).await.unwrap();
        assert_eq!(user.mesh_state, MeshState::Disabled);
        assert_eq!(user.mesh_sidecar, None);
    }

    #[tokio::test]
    async fn test_restarting_login_replaces_pending_attempt() {
        let (_dir, runtime, storage, mesh) = setup().await;
        let user = seed_user(&storage, "alice").await;
        mesh.start_login(&user).await.unwrap();
        runtime.clear_calls();

        mesh.start_login(&user).await.unwrap();

        assert_eq!(runtime.call_count("delete_instance"), 1);
        assert_eq!(runtime.call_count("create_instance"), 1);
        assert!(runtime.exists("sc-ts-alice"));
    }

    #[tokio::test]
    async fn test_connect_disconnect_and_disable() {
        let (_dir, runtime, storage, mesh) = setup().await;
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        let user = storage.get_user(sandbox.user_id).await.unwrap();

        let err = mesh.connect_sandbox(&sandbox).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));

        mesh.enable(&user, "tskey-auth-123").await.unwrap();
        mesh.connect_sandbox(&sandbox).await.unwrap();
        assert!(runtime
            .state_of("alice-dev")
            .unwrap()
            .is_attached_to("sc-ts-net-alice"));

        let sandbox = storage.get_sandbox(sandbox.id).await.unwrap();
        assert!(sandbox.mesh);
        let prefix = storage
            .get_user(user.id)
            .await
            .unwrap()
            .mesh_subnet
            .unwrap()
            .prefix();
        runtime.set_address("alice-dev", "eth1", &format!("{}0.7", prefix));
        assert_eq!(
            mesh.sandbox_mesh_ip(&sandbox).await,
            Some(format!("{}0.7", prefix))
        );

        let status = mesh.status(&user).await.unwrap();
        assert!(status.running);
        assert_eq!(status.sandboxes.len(), 1);
        assert_eq!(status.sandboxes[0].name, "dev");

        mesh.disable(&user).await.unwrap();
        let sandbox = storage.get_sandbox(sandbox.id).await.unwrap();
        assert!(!sandbox.mesh);
        assert!(!runtime
            .state_of("alice-dev")
            .unwrap()
            .is_attached_to("sc-ts-net-alice"));
        assert!(!runtime.exists("sc-ts-alice"));
        assert!(!runtime.has_network("sc-ts-net-alice"));
        let user = storage.get_user(user.id).await.unwrap();
        assert_eq!(user.mesh_state, MeshState::Disabled);
        assert_eq!(user.mesh_subnet, None);
        assert_eq!(user.mesh_ip, None);
    }

    #[tokio::test]
    async fn test_auto_connect_toggle_keeps_auth_key() {
        let (_dir, _runtime, storage, mesh) = setup().await;
        let user = seed_user(&storage, "alice").await;
        let user = mesh.enable(&user, "tskey-auth-123").await.unwrap();
        assert!(!user.mesh_auto_connect);

        let user = mesh.set_auto_connect(&user, true).await.unwrap();
        assert!(user.mesh_auto_connect);
        assert_eq!(user.mesh_auth_key.as_deref(), Some("tskey-auth-123"));

        let user = mesh.set_auto_connect(&user, false).await.unwrap();
        assert!(!user.mesh_auto_connect);
    }

    #[tokio::test]
    async fn test_heal_missing_sidecar_clears_flags() {
        let (_dir, runtime, storage, mesh) = setup().await;
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        let user = storage.get_user(sandbox.user_id).await.unwrap();
        let user = mesh.enable(&user, "tskey-auth-123").await.unwrap();
        mesh.connect_sandbox(&sandbox).await.unwrap();

        assert!(!mesh.heal_missing_sidecar(&user).await.unwrap());
        runtime.remove_out_of_band("sc-ts-alice");
        assert!(mesh.heal_missing_sidecar(&user).await.unwrap());

        assert_eq!(
            storage.get_user(user.id).await.unwrap().mesh_state,
            MeshState::Disabled
        );
        assert!(!storage.get_sandbox(sandbox.id).await.unwrap().mesh);
    }
}
