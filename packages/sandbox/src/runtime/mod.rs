// ABOUTME: Runtime client abstraction over container engines and instance managers
// ABOUTME: Defines backend-neutral instance, device, snapshot and network types shared by all adapters

pub mod docker;
pub mod incus;

pub use docker::DockerRuntime;
pub use incus::IncusRuntime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound for any single long-running backend operation.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    Start,
    Stop,
}

impl InstanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Other(String),
}

impl InstanceStatus {
    /// Normalizes the state names used by both engine and instance-manager APIs.
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "running" | "restarting" => Self::Running,
            "stopped" | "exited" | "created" | "dead" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAddress {
    pub interface: String,
    /// "inet" or "inet6"
    pub family: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub status: InstanceStatus,
    pub pid: Option<i64>,
    pub addresses: Vec<InstanceAddress>,
    /// Names of the networks the instance is attached to
    pub networks: Vec<String>,
    pub memory_usage_bytes: Option<u64>,
}

impl InstanceState {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// First IPv4 address starting with `prefix`, skipping loopback.
    pub fn ipv4_with_prefix(&self, prefix: &str) -> Option<&str> {
        self.addresses
            .iter()
            .filter(|a| a.family == "inet" && !a.address.starts_with("127."))
            .map(|a| a.address.as_str())
            .find(|addr| addr.starts_with(prefix))
    }

    pub fn is_attached_to(&self, network: &str) -> bool {
        self.networks.iter().any(|n| n == network)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Device {
    Nic {
        name: String,
        network: String,
    },
    Disk {
        name: String,
        source: String,
        path: String,
    },
}

impl Device {
    pub fn nic(name: impl Into<String>, network: impl Into<String>) -> Self {
        Self::Nic {
            name: name.into(),
            network: network.into(),
        }
    }

    pub fn disk(
        name: impl Into<String>,
        source: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::Disk {
            name: name.into(),
            source: source.into(),
            path: path.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Nic { name, .. } | Self::Disk { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub host_port: u16,
    pub instance_port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Never,
    UnlessStopped,
}

/// Backend-neutral description of an instance. Adapters map the fields their
/// backend understands and ignore the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortForward>,
    pub devices: Vec<Device>,
    pub memory_mb: Option<u64>,
    pub cpu_limit: Option<f64>,
    /// Allow nested containers (sysbox runtime on engines, security.nesting on instance managers)
    pub nested: bool,
    pub restart: RestartPolicy,
    pub command: Option<Vec<String>>,
    /// cloud-init user data, honoured by instance managers only
    pub user_data: Option<String>,
    pub cap_add: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub instance: String,
    /// Backend reference: committed image id or snapshot path
    pub reference: String,
    pub created_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    /// CIDR, e.g. "172.101.0.0/16"
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub nat: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub backend: String,
    pub version: String,
    pub instances: Option<u64>,
    pub instances_running: Option<u64>,
    pub images: Option<u64>,
    pub runtimes: Vec<String>,
}

/// Uniform control surface over a container/instance backend.
///
/// Backends whose API is asynchronous wait for their operations internally,
/// bounded by [`OPERATION_TIMEOUT`], so every call here completes or fails.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn server_info(&self) -> Result<RuntimeInfo>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) an instance. Returns the reference used by all other calls.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String>;

    async fn delete_instance(&self, instance: &str) -> Result<()>;

    async fn change_state(
        &self,
        instance: &str,
        action: InstanceAction,
        force: bool,
        timeout: Duration,
    ) -> Result<()>;

    async fn get_instance_state(&self, instance: &str) -> Result<InstanceState>;

    /// All instances (running or not) carrying `label=value`.
    async fn list_instances(&self, label: &str, value: &str) -> Result<Vec<InstanceSummary>>;

    async fn exec(
        &self,
        instance: &str,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExecOutput>;

    async fn push_file(&self, instance: &str, path: &str, content: &[u8], mode: u32)
        -> Result<()>;

    async fn create_snapshot(&self, instance: &str, name: &str) -> Result<SnapshotInfo>;

    async fn list_snapshots(&self, instance: &str) -> Result<Vec<SnapshotInfo>>;

    async fn get_snapshot(&self, instance: &str, name: &str) -> Result<SnapshotInfo>;

    async fn delete_snapshot(&self, instance: &str, name: &str) -> Result<()>;

    /// Roll the instance back to `name`. The instance is left stopped and the
    /// returned reference replaces the old one (engines recreate the container).
    async fn restore_snapshot(&self, instance: &str, name: &str) -> Result<String>;

    /// Remove snapshots that outlive their instance, keyed by instance name.
    /// Backends that delete snapshots together with the instance keep the default.
    async fn purge_snapshots(&self, _instance_name: &str) -> Result<usize> {
        Ok(0)
    }

    /// Attach a device. Attaching an identical device twice is a no-op.
    async fn add_device(&self, instance: &str, device: &Device) -> Result<()>;

    async fn remove_device(&self, instance: &str, device: &Device) -> Result<()>;

    /// Create a network. An existing network with the same name is accepted.
    async fn create_network(&self, spec: &NetworkSpec) -> Result<()>;

    async fn delete_network(&self, name: &str) -> Result<()>;

    async fn instance_exists(&self, instance: &str) -> Result<bool> {
        match self.get_instance_state(instance).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            debug!("Image {} already present", image);
            return Ok(());
        }
        self.pull_image(image).await
    }

    /// Run a command and fail unless it exits zero.
    async fn exec_ok(&self, instance: &str, command: &[String]) -> Result<ExecOutput> {
        let output = self.exec(instance, command, &HashMap::new()).await?;
        if !output.success() {
            return Err(RuntimeError::Backend(format!(
                "`{}` exited with {}: {}",
                command.join(" "),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Stop then delete, treating an already-missing instance as success.
    async fn stop_and_delete(&self, instance: &str, stop_timeout: Duration) -> Result<()> {
        match self
            .change_state(instance, InstanceAction::Stop, true, stop_timeout)
            .await
        {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => return Ok(()),
            Err(e) => warn!("Stop before delete failed for {}: {}", instance, e),
        }

        match self.delete_instance(instance).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Run `fut`, failing with [`RuntimeError::Timeout`] once `limit` elapses.
pub async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout(format!(
            "{} did not complete within {:?}",
            what, limit
        ))),
    }
}

pub(crate) fn shell(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

pub(crate) fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_status_parse() {
        assert_eq!(InstanceStatus::parse("Running"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::parse("exited"), InstanceStatus::Stopped);
        assert_eq!(InstanceStatus::parse("Stopped"), InstanceStatus::Stopped);
        assert_eq!(
            InstanceStatus::parse("Frozen"),
            InstanceStatus::Other("frozen".to_string())
        );
    }

    #[test]
    fn test_ipv4_with_prefix_skips_other_families() {
        let state = InstanceState {
            status: InstanceStatus::Running,
            pid: Some(42),
            addresses: vec![
                InstanceAddress {
                    interface: "lo".to_string(),
                    family: "inet".to_string(),
                    address: "127.0.0.1".to_string(),
                },
                InstanceAddress {
                    interface: "eth1".to_string(),
                    family: "inet6".to_string(),
                    address: "fd42::1".to_string(),
                },
                InstanceAddress {
                    interface: "eth1".to_string(),
                    family: "inet".to_string(),
                    address: "172.105.0.7".to_string(),
                },
            ],
            networks: vec!["sc-ts-net-alice".to_string()],
            memory_usage_bytes: None,
        };

        assert_eq!(state.ipv4_with_prefix("172.105."), Some("172.105.0.7"));
        assert_eq!(state.ipv4_with_prefix("172.106."), None);
        assert!(state.is_attached_to("sc-ts-net-alice"));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<()> = bounded(Duration::from_millis(10), "sleep", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(RuntimeError::Timeout(_))));
    }
}
