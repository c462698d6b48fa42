// ABOUTME: Ephemeral browser access sidecars (web terminal and VNC) attached to running sandboxes
// ABOUTME: Creates the gateway instance, its forward-auth proxy route and keys, and sweeps orphans

pub mod keys;

use crate::config::SandcastleConfig;
use crate::error::{Result, SandboxError};
use crate::routes::Ingress;
use crate::runtime::{
    argv, shell, Device, InstanceAction, InstanceSpec, RestartPolicy, RuntimeClient, RuntimeError,
};
use crate::storage::{JobKind, Sandbox, SandboxStatus, SandboxStorage, StorageError};
use crate::traefik::{self, DynamicConfig, Middleware, Router, Service};
use crate::validation::is_valid_full_name;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(3);
const ROUTE_PRIORITY: u32 = 100;
const SIDECAR_KEY_PATH: &str = "/etc/wetty/key";

pub const ROLE_LABEL: &str = "sandcastle.role";
pub const SANDBOX_LABEL: &str = "sandcastle.sandbox_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarKind {
    Terminal,
    Vnc,
}

impl SidecarKind {
    /// Prefix of the proxy config file and router names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Vnc => "vnc",
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::Terminal => "wetty",
            Self::Vnc => "novnc",
        }
    }

    fn instance_prefix(&self) -> &'static str {
        match self {
            Self::Terminal => "sc-wetty-",
            Self::Vnc => "sc-vnc-",
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Terminal => 3000,
            Self::Vnc => 8080,
        }
    }

    fn memory_mb(&self) -> u64 {
        match self {
            Self::Terminal => 128,
            Self::Vnc => 256,
        }
    }

    pub fn auth_path(&self) -> &'static str {
        match self {
            Self::Terminal => "/terminal/auth",
            Self::Vnc => "/vnc/auth",
        }
    }

    /// Time the proxy needs to pick up a new route file.
    fn propagation_delay(&self) -> Duration {
        match self {
            Self::Terminal => Duration::from_secs(1),
            Self::Vnc => Duration::from_secs(2),
        }
    }

    pub fn job_kind(&self) -> JobKind {
        match self {
            Self::Terminal => JobKind::OpeningTerminal,
            Self::Vnc => JobKind::OpeningVnc,
        }
    }

    /// What the user is told failed to open.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Vnc => "browser",
        }
    }

    pub fn url_for(&self, sandbox_id: i64) -> String {
        match self {
            Self::Terminal => format!("/terminal/{}/wetty", sandbox_id),
            Self::Vnc => format!("/vnc/{}/novnc", sandbox_id),
        }
    }
}

pub struct SidecarManager {
    kind: SidecarKind,
    config: Arc<SandcastleConfig>,
    storage: SandboxStorage,
    runtime: Arc<dyn RuntimeClient>,
    ingress: Ingress,
}

impl SidecarManager {
    pub fn new(
        kind: SidecarKind,
        config: Arc<SandcastleConfig>,
        storage: SandboxStorage,
        runtime: Arc<dyn RuntimeClient>,
    ) -> Self {
        let ingress = Ingress::new(runtime.clone(), config.ingress_network.clone());
        Self {
            kind,
            config,
            storage,
            runtime,
            ingress,
        }
    }

    pub fn kind(&self) -> SidecarKind {
        self.kind
    }

    pub fn instance_name(&self, sandbox: &Sandbox) -> String {
        format!("{}{}", self.kind.instance_prefix(), sandbox.full_name())
    }

    pub fn url(&self, sandbox: &Sandbox) -> String {
        self.kind.url_for(sandbox.id)
    }

    pub fn config_path(&self, sandbox_id: i64) -> PathBuf {
        self.config
            .dynamic_dir()
            .join(format!("{}-{}.yml", self.kind.as_str(), sandbox_id))
    }

    fn image(&self) -> &str {
        match self.kind {
            SidecarKind::Terminal => &self.config.wetty_image,
            SidecarKind::Vnc => &self.config.novnc_image,
        }
    }

    /// Start (or reuse) the sidecar and return the URL path it is served on.
    pub async fn open(&self, sandbox: &Sandbox) -> Result<String> {
        if sandbox.status != SandboxStatus::Running {
            return Err(SandboxError::Validation(format!(
                "{} is not running",
                sandbox.full_name()
            )));
        }
        let instance = sandbox.instance().ok_or_else(|| {
            SandboxError::Validation(format!("{} has no instance", sandbox.full_name()))
        })?;

        if self.is_active(sandbox).await? {
            debug!(
                "{} sidecar for {} already running",
                self.kind.as_str(),
                sandbox.full_name()
            );
            return Ok(self.url(sandbox));
        }

        match self.launch(sandbox, instance).await {
            Ok(url) => {
                info!(
                    "Opened {} for {} at {}",
                    self.kind.as_str(),
                    sandbox.full_name(),
                    url
                );
                Ok(url)
            }
            Err(e) => {
                warn!(
                    "Opening {} for {} failed, cleaning up: {}",
                    self.kind.as_str(),
                    sandbox.full_name(),
                    e
                );
                self.close(sandbox).await;
                Err(e)
            }
        }
    }

    async fn launch(&self, sandbox: &Sandbox, instance: &str) -> Result<String> {
        self.runtime.ensure_image(self.image()).await?;
        self.ingress.attach(instance).await?;

        // Written first so the proxy has time to load it while the sidecar boots.
        traefik::write_config(&self.config_path(sandbox.id), &self.build_config(sandbox)).await?;

        let keypair = match self.kind {
            SidecarKind::Terminal => Some(self.install_keypair(sandbox, instance).await?),
            SidecarKind::Vnc => None,
        };

        let name = self.instance_name(sandbox);
        self.runtime.stop_and_delete(&name, STOP_TIMEOUT).await?;
        let sidecar = self.runtime.create_instance(&self.sidecar_spec(sandbox)).await?;
        self.runtime
            .change_state(
                &sidecar,
                InstanceAction::Start,
                false,
                self.config.operation_timeout,
            )
            .await?;

        if let Some(keypair) = keypair {
            self.runtime
                .exec_ok(&sidecar, &argv(&["mkdir", "-p", "/etc/wetty"]))
                .await?;
            self.runtime
                .push_file(
                    &sidecar,
                    SIDECAR_KEY_PATH,
                    keypair.private_pem.as_bytes(),
                    0o600,
                )
                .await?;
        }

        if self.config.propagation_delay {
            tokio::time::sleep(self.kind.propagation_delay()).await;
        }
        Ok(self.url(sandbox))
    }

    /// Stop the sidecar and drop its route, keys and authorized key. Never fails.
    pub async fn close(&self, sandbox: &Sandbox) {
        let name = self.instance_name(sandbox);
        if let Err(e) = self.runtime.stop_and_delete(&name, STOP_TIMEOUT).await {
            warn!("Failed to remove sidecar {}: {}", name, e);
        }

        if let Err(e) = traefik::remove_config(&self.config_path(sandbox.id)).await {
            warn!(
                "Failed to remove {} route of {}: {}",
                self.kind.as_str(),
                sandbox.full_name(),
                e
            );
        }

        if self.kind == SidecarKind::Terminal {
            self.remove_key_dir(&sandbox.full_name()).await;
            self.remove_public_key(sandbox).await;
        }
        debug!("Closed {} for {}", self.kind.as_str(), sandbox.full_name());
    }

    pub async fn is_active(&self, sandbox: &Sandbox) -> Result<bool> {
        match self
            .runtime
            .get_instance_state(&self.instance_name(sandbox))
            .await
        {
            Ok(state) => Ok(state.is_running()),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove sidecars whose sandbox is gone or no longer running. Returns the count removed.
    pub async fn cleanup_orphaned(&self) -> Result<usize> {
        let sidecars = self
            .runtime
            .list_instances(ROLE_LABEL, self.kind.role())
            .await?;

        let mut removed = 0;
        for sidecar in sidecars {
            let sandbox_id = sidecar
                .labels
                .get(SANDBOX_LABEL)
                .and_then(|raw| raw.parse::<i64>().ok());

            let keep = match sandbox_id {
                Some(id) => match self.storage.get_sandbox(id).await {
                    Ok(sandbox) => sandbox.status == SandboxStatus::Running,
                    Err(StorageError::NotFound(_)) => false,
                    Err(e) => {
                        warn!("Skipping sidecar {}: {}", sidecar.name, e);
                        true
                    }
                },
                None => false,
            };
            if keep {
                continue;
            }

            if let Err(e) = self.runtime.stop_and_delete(&sidecar.id, STOP_TIMEOUT).await {
                warn!("Failed to remove orphaned sidecar {}: {}", sidecar.name, e);
                continue;
            }
            removed += 1;
            info!("Removed orphaned {} sidecar {}", self.kind.role(), sidecar.name);

            if let Some(id) = sandbox_id {
                if let Err(e) = traefik::remove_config(&self.config_path(id)).await {
                    warn!("Failed to remove route of orphan {}: {}", sidecar.name, e);
                }
            }

            if self.kind == SidecarKind::Terminal {
                match sidecar.name.strip_prefix(self.kind.instance_prefix()) {
                    Some(full_name) if is_valid_full_name(full_name) => {
                        self.remove_key_dir(full_name).await
                    }
                    _ => warn!("Skipping key cleanup for unexpected name {}", sidecar.name),
                }
            }
        }
        Ok(removed)
    }

    pub fn build_config(&self, sandbox: &Sandbox) -> DynamicConfig {
        let kind = self.kind.as_str();
        let router_name = format!("{}-{}", kind, sandbox.id);
        let middleware_name = format!("{}-auth-{}", kind, sandbox.id);
        let rule = format!(
            "{} && PathPrefix(`{}`)",
            traefik::public_host_rule(&self.config),
            self.url(sandbox)
        );

        let mut router = Router::new(rule, &router_name, &self.config);
        router.priority = Some(ROUTE_PRIORITY);
        router.middlewares = vec![middleware_name.clone()];

        let mut dynamic = DynamicConfig::default();
        dynamic.http.routers.insert(router_name.clone(), router);
        dynamic.http.middlewares.insert(
            middleware_name,
            Middleware::forward_auth(self.config.auth_url(self.kind.auth_path())),
        );
        dynamic.http.services.insert(
            router_name,
            Service::single(format!(
                "http://{}:{}",
                self.instance_name(sandbox),
                self.kind.port()
            )),
        );
        dynamic
    }

    fn sidecar_spec(&self, sandbox: &Sandbox) -> InstanceSpec {
        let url = self.url(sandbox);
        let env = match self.kind {
            SidecarKind::Terminal => {
                let ssh = [
                    "ssh -p 22",
                    "-o StrictHostKeyChecking=no",
                    "-o UserKnownHostsFile=/dev/null",
                    "-o LogLevel=ERROR",
                ]
                .join(" ");
                HashMap::from([
                    (
                        "COMMAND".to_string(),
                        format!(
                            "{} -i {} {}@{} -t \"tmux new-session -A -s main\"",
                            ssh,
                            SIDECAR_KEY_PATH,
                            sandbox.owner_name,
                            sandbox.full_name()
                        ),
                    ),
                    ("BASE".to_string(), url),
                ])
            }
            SidecarKind::Vnc => HashMap::from([
                ("RUN_NOVNC".to_string(), "true".to_string()),
                ("NOVNC_BASE_PATH".to_string(), url),
                (
                    "VNC_SERVER".to_string(),
                    format!("{}:5900", sandbox.full_name()),
                ),
            ]),
        };

        InstanceSpec {
            name: self.instance_name(sandbox),
            image: self.image().to_string(),
            env,
            labels: HashMap::from([
                (SANDBOX_LABEL.to_string(), sandbox.id.to_string()),
                (ROLE_LABEL.to_string(), self.kind.role().to_string()),
            ]),
            devices: vec![Device::nic("eth0", self.ingress.network())],
            memory_mb: Some(self.kind.memory_mb()),
            cpu_limit: Some(0.5),
            restart: RestartPolicy::Never,
            ..Default::default()
        }
    }

    /// Fresh keypair on disk, public half appended to the sandbox user's authorized_keys.
    async fn install_keypair(&self, sandbox: &Sandbox, instance: &str) -> Result<keys::SshKeypair> {
        let full_name = sandbox.full_name();
        let keypair = keys::generate(&format!("wetty-{}", full_name));
        let key_dir = self.config.wetty_key_dir(&full_name);
        self.remove_key_dir(&full_name).await;
        keys::write_keypair(&key_dir, &keypair).await?;

        let owner = &sandbox.owner_name;
        let ssh_dir = format!("/home/{}/.ssh", owner);
        let encoded = STANDARD.encode(format!("{}\n", keypair.public_line));

        self.runtime
            .exec_ok(instance, &argv(&["mkdir", "-p", &ssh_dir]))
            .await?;
        self.runtime
            .exec_ok(
                instance,
                &shell(&format!(
                    "echo {} | base64 -d >> {}/authorized_keys",
                    encoded, ssh_dir
                )),
            )
            .await?;
        self.runtime
            .exec_ok(
                instance,
                &argv(&["chown", "-R", &format!("{}:{}", owner, owner), &ssh_dir]),
            )
            .await?;
        self.runtime
            .exec_ok(
                instance,
                &argv(&["chmod", "600", &format!("{}/authorized_keys", ssh_dir)]),
            )
            .await?;
        Ok(keypair)
    }

    /// Strip this sidecar's key line. The `$` anchor keeps `wetty-alice-dev`
    /// from matching `wetty-alice-dev2`.
    async fn remove_public_key(&self, sandbox: &Sandbox) {
        let Some(instance) = sandbox.instance() else {
            return;
        };
        let keys_file = format!("/home/{}/.ssh/authorized_keys", sandbox.owner_name);
        let command = format!(
            "grep -v 'wetty-{}$' {} > /tmp/ak_clean && mv /tmp/ak_clean {} || true",
            sandbox.full_name(),
            keys_file,
            keys_file
        );
        if let Err(e) = self
            .runtime
            .exec(instance, &shell(&command), &HashMap::new())
            .await
        {
            debug!(
                "Could not remove sidecar key from {}: {}",
                sandbox.full_name(),
                e
            );
        }
    }

    async fn remove_key_dir(&self, full_name: &str) {
        let root = self.config.wetty_root();
        let key_dir = self.config.wetty_key_dir(full_name);
        if !is_direct_child(&root, &key_dir) {
            warn!("Refusing to remove key directory {}", key_dir.display());
            return;
        }
        match tokio::fs::remove_dir_all(&key_dir).await {
            Ok(()) => debug!("Removed key directory {}", key_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", key_dir.display(), e),
        }
    }
}

fn is_direct_child(root: &Path, path: &Path) -> bool {
    path.parent() == Some(root)
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(is_valid_full_name)
}
