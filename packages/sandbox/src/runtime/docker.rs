// ABOUTME: Docker Engine runtime adapter built on bollard
// ABOUTME: Maps instances to containers, snapshots to committed images and NIC devices to networks

use super::{
    bounded, Device, ExecOutput, InstanceAction, InstanceAddress, InstanceSpec, InstanceState,
    InstanceStatus, InstanceSummary, NetworkSpec, RestartPolicy, Result, RuntimeClient,
    RuntimeError, RuntimeInfo, SnapshotInfo, OPERATION_TIMEOUT,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
        StartContainerOptions, StatsOptions, StopContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::{CommitContainerOptions, CreateImageOptions, ListImagesOptions, RemoveImageOptions},
    models::{
        EndpointSettings, HostConfig, Ipam, IpamConfig, PortBinding, RestartPolicyNameEnum,
    },
    network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions},
    Docker,
};
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Repository prefix for committed snapshot images.
const SNAPSHOT_REPO_PREFIX: &str = "sc-snapshot";

pub struct DockerRuntime {
    client: Docker,
    /// OCI runtime used for instances that allow nesting (e.g. "sysbox-runc")
    nested_runtime: Option<String>,
    /// Images pulled by this process, to skip redundant registry round-trips
    image_cache: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    pull_timeout: Duration,
}

impl DockerRuntime {
    /// Connect using DOCKER_HOST or the local socket
    pub fn new(nested_runtime: Option<String>) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Backend(format!("Docker connection failed: {}", e)))?;
        Ok(Self::with_client(client, nested_runtime))
    }

    pub fn with_client(client: Docker, nested_runtime: Option<String>) -> Self {
        Self {
            client,
            nested_runtime,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    fn to_bollard_config(&self, spec: &InstanceSpec) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port.instance_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }

        let binds: Vec<String> = spec
            .devices
            .iter()
            .filter_map(|d| match d {
                Device::Disk { source, path, .. } => Some(format!("{}:{}", source, path)),
                Device::Nic { .. } => None,
            })
            .collect();

        // The first NIC becomes the primary network; the rest are connected after create.
        let network_mode = spec.devices.iter().find_map(|d| match d {
            Device::Nic { network, .. } => Some(network.clone()),
            Device::Disk { .. } => None,
        });

        let mut env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode,
            memory: spec.memory_mb.map(|mb| (mb * 1024 * 1024) as i64),
            nano_cpus: spec.cpu_limit.map(|cpus| (cpus * 1_000_000_000.0) as i64),
            runtime: if spec.nested {
                self.nested_runtime.clone()
            } else {
                None
            },
            restart_policy: Some(bollard::models::RestartPolicy {
                name: Some(match spec.restart {
                    RestartPolicy::Never => RestartPolicyNameEnum::NO,
                    RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
                }),
                maximum_retry_count: None,
            }),
            cap_add: if spec.cap_add.is_empty() {
                None
            } else {
                Some(spec.cap_add.clone())
            },
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            hostname: spec.hostname.clone(),
            cmd: spec.command.clone(),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn container_name(&self, instance: &str) -> Result<String> {
        let inspect = self
            .client
            .inspect_container(instance, None)
            .await
            .map_err(|e| classify(e, instance))?;
        Ok(inspect
            .name
            .unwrap_or_else(|| instance.to_string())
            .trim_start_matches('/')
            .to_string())
    }

    async fn inspect_snapshot_image(&self, instance_name: &str, name: &str) -> Result<SnapshotInfo> {
        let reference = snapshot_image(instance_name, name);
        let image = self
            .client
            .inspect_image(&reference)
            .await
            .map_err(|e| classify(e, &reference))?;

        Ok(SnapshotInfo {
            name: name.to_string(),
            instance: instance_name.to_string(),
            reference: image.id.unwrap_or(reference),
            created_at: image.created,
            size_bytes: image.size.and_then(|s| u64::try_from(s).ok()),
        })
    }

    /// Snapshot images committed from `instance_name`, oldest first. Works
    /// after the container itself is gone.
    async fn snapshot_images(&self, instance_name: &str) -> Result<Vec<SnapshotInfo>> {
        let repo = format!("{}/{}", SNAPSHOT_REPO_PREFIX, instance_name);

        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![format!("{}:*", repo)]);
        let images = self
            .client
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| classify(e, "list images"))?;

        let prefix = format!("{}:", repo);
        let mut snapshots = Vec::new();
        for image in images {
            let created_at = Utc.timestamp_opt(image.created, 0).single();
            let size_bytes = u64::try_from(image.size).ok();
            for tag in &image.repo_tags {
                if let Some(name) = tag.strip_prefix(prefix.as_str()) {
                    snapshots.push(SnapshotInfo {
                        name: name.to_string(),
                        instance: instance_name.to_string(),
                        reference: image.id.clone(),
                        created_at,
                        size_bytes,
                    });
                }
            }
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snapshots)
    }

    async fn remove_snapshot_image(&self, reference: &str) -> Result<()> {
        info!("Removing snapshot image {}", reference);
        self.client
            .remove_image(
                reference,
                Some(RemoveImageOptions {
                    force: false,
                    noprune: false,
                }),
                None,
            )
            .await
            .map(|_| ())
            .map_err(|e| classify(e, reference))
    }
}

fn snapshot_image(instance_name: &str, name: &str) -> String {
    format!("{}/{}:{}", SNAPSHOT_REPO_PREFIX, instance_name, name)
}

/// Map a bollard error into the runtime taxonomy.
fn classify(error: bollard::errors::Error, subject: &str) -> RuntimeError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{}: {}", subject, message)),
        other => RuntimeError::Backend(format!("{}: {}", subject, other)),
    }
}

fn is_status(error: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

/// Single-entry tar archive holding `content` at `file_name`.
fn single_file_tar(file_name: &str, content: &[u8], mode: u32) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    archive.append_data(&mut header, file_name, content)?;
    archive.into_inner()
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn server_info(&self) -> Result<RuntimeInfo> {
        let version = self
            .client
            .version()
            .await
            .map_err(|e| classify(e, "version"))?;
        let info = self.client.info().await.map_err(|e| classify(e, "info"))?;

        let mut runtimes: Vec<String> = info
            .runtimes
            .map(|r| r.into_keys().collect())
            .unwrap_or_default();
        runtimes.sort();

        Ok(RuntimeInfo {
            backend: "docker".to_string(),
            version: version.version.unwrap_or_else(|| "unknown".to_string()),
            instances: info.containers.and_then(|n| u64::try_from(n).ok()),
            instances_running: info.containers_running.and_then(|n| u64::try_from(n).ok()),
            images: info.images.and_then(|n| u64::try_from(n).ok()),
            runtimes,
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(classify(e, image)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) && self.image_exists(image).await? {
            debug!("Image {} found in cache, skipping pull", image);
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        bounded(self.pull_timeout, &format!("pull of {}", image), async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let progress = result.map_err(|e| {
                    RuntimeError::Backend(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = progress.error {
                    return Err(RuntimeError::Backend(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = progress.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await?;

        info!("Successfully pulled image: {}", image);
        self.image_cache
            .write()
            .await
            .insert(image.to_string(), Utc::now());
        Ok(())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), self.to_bollard_config(spec))
            .await
            .map_err(|e| classify(e, &spec.name))?;

        debug!("Created container {} ({})", spec.name, container.id);

        // Extra NICs beyond the primary network_mode
        let extra_nics = spec
            .devices
            .iter()
            .filter(|d| matches!(d, Device::Nic { .. }))
            .skip(1);
        for device in extra_nics {
            self.add_device(&container.id, device).await?;
        }

        Ok(container.id)
    }

    async fn delete_instance(&self, instance: &str) -> Result<()> {
        info!("Removing container: {}", instance);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(instance, Some(options))
            .await
            .map_err(|e| classify(e, instance))
    }

    async fn change_state(
        &self,
        instance: &str,
        action: InstanceAction,
        force: bool,
        timeout: Duration,
    ) -> Result<()> {
        info!(
            "Changing container {} state: {} (force: {}, timeout: {:?})",
            instance,
            action.as_str(),
            force,
            timeout
        );

        let what = format!("{} of {}", action.as_str(), instance);
        match action {
            InstanceAction::Start => {
                bounded(OPERATION_TIMEOUT, &what, async {
                    self.client
                        .start_container(instance, None::<StartContainerOptions<String>>)
                        .await
                        .map_err(|e| (is_status(&e, 304), classify(e, instance)))
                        .or_else(already_in_state)
                })
                .await
            }
            InstanceAction::Stop => {
                let grace = if force { 0 } else { timeout.as_secs() as i64 };
                bounded(timeout + OPERATION_TIMEOUT, &what, async {
                    self.client
                        .stop_container(instance, Some(StopContainerOptions { t: grace }))
                        .await
                        .map_err(|e| (is_status(&e, 304), classify(e, instance)))
                        .or_else(already_in_state)
                })
                .await
            }
        }
    }

    async fn get_instance_state(&self, instance: &str) -> Result<InstanceState> {
        let inspect = self
            .client
            .inspect_container(instance, None)
            .await
            .map_err(|e| classify(e, instance))?;

        let state = inspect.state.unwrap_or_default();
        let status = if state.running.unwrap_or(false) {
            InstanceStatus::Running
        } else {
            state
                .status
                .as_ref()
                .map(|s| InstanceStatus::parse(&s.to_string()))
                .unwrap_or(InstanceStatus::Stopped)
        };

        let mut addresses = Vec::new();
        let mut networks = Vec::new();
        if let Some(endpoints) = inspect.network_settings.and_then(|ns| ns.networks) {
            for (network, endpoint) in endpoints {
                if let Some(ip) = endpoint.ip_address.filter(|ip| !ip.is_empty()) {
                    addresses.push(InstanceAddress {
                        interface: network.clone(),
                        family: "inet".to_string(),
                        address: ip,
                    });
                }
                if let Some(ip) = endpoint.global_ipv6_address.filter(|ip| !ip.is_empty()) {
                    addresses.push(InstanceAddress {
                        interface: network.clone(),
                        family: "inet6".to_string(),
                        address: ip,
                    });
                }
                networks.push(network);
            }
        }
        networks.sort();

        let memory_usage_bytes = if status == InstanceStatus::Running {
            let options = StatsOptions {
                stream: false,
                one_shot: true,
            };
            match self.client.stats(instance, Some(options)).next().await {
                Some(Ok(stats)) => stats.memory_stats.usage,
                _ => None,
            }
        } else {
            None
        };

        Ok(InstanceState {
            status,
            pid: state.pid.filter(|pid| *pid > 0),
            addresses,
            networks,
            memory_usage_bytes,
        })
    }

    async fn list_instances(&self, label: &str, value: &str) -> Result<Vec<InstanceSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}={}", label, value)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| classify(e, "list containers"))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(InstanceSummary {
                    id,
                    name,
                    labels: c.labels.unwrap_or_default(),
                    running: c.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }

    async fn exec(
        &self,
        instance: &str,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ExecOutput> {
        debug!("Executing in container {}: {:?}", instance, command);

        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let exec_config = CreateExecOptions {
            cmd: Some(command.to_vec()),
            env: if env.is_empty() { None } else { Some(env) },
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(instance, exec_config)
            .await
            .map_err(|e| classify(e, instance))?;

        let started = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(e, instance))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match started {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(classify(e, instance)),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Backend(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(e, instance))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(0),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn push_file(
        &self,
        instance: &str,
        path: &str,
        content: &[u8],
        mode: u32,
    ) -> Result<()> {
        let (dir, file_name) = match path.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((dir, name)) => (dir, name),
            None => ("/", path),
        };

        let archive = single_file_tar(file_name, content, mode)
            .map_err(|e| RuntimeError::Backend(format!("Failed to build archive: {}", e)))?;

        let options = UploadToContainerOptions {
            path: dir.to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(instance, Some(options), archive.into())
            .await
            .map_err(|e| classify(e, instance))
    }

    async fn create_snapshot(&self, instance: &str, name: &str) -> Result<SnapshotInfo> {
        let instance_name = self.container_name(instance).await?;
        info!("Committing container {} as snapshot {}", instance_name, name);

        let options = CommitContainerOptions {
            container: instance.to_string(),
            repo: format!("{}/{}", SNAPSHOT_REPO_PREFIX, instance_name),
            tag: name.to_string(),
            comment: format!("Snapshot {} of {}", name, instance_name),
            pause: true,
            ..Default::default()
        };
        bounded(OPERATION_TIMEOUT, "container commit", async {
            self.client
                .commit_container(options, Config::<String>::default())
                .await
                .map(|_| ())
                .map_err(|e| classify(e, instance))
        })
        .await?;

        self.inspect_snapshot_image(&instance_name, name).await
    }

    async fn list_snapshots(&self, instance: &str) -> Result<Vec<SnapshotInfo>> {
        let instance_name = self.container_name(instance).await?;
        self.snapshot_images(&instance_name).await
    }

    async fn get_snapshot(&self, instance: &str, name: &str) -> Result<SnapshotInfo> {
        let instance_name = self.container_name(instance).await?;
        self.inspect_snapshot_image(&instance_name, name).await
    }

    async fn delete_snapshot(&self, instance: &str, name: &str) -> Result<()> {
        let instance_name = self.container_name(instance).await?;
        self.remove_snapshot_image(&snapshot_image(&instance_name, name))
            .await
    }

    async fn purge_snapshots(&self, instance_name: &str) -> Result<usize> {
        let mut removed = 0;
        for snapshot in self.snapshot_images(instance_name).await? {
            let reference = snapshot_image(instance_name, &snapshot.name);
            match self.remove_snapshot_image(&reference).await {
                Ok(()) => removed += 1,
                Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    async fn restore_snapshot(&self, instance: &str, name: &str) -> Result<String> {
        let inspect = self
            .client
            .inspect_container(instance, None)
            .await
            .map_err(|e| classify(e, instance))?;
        let instance_name = inspect
            .name
            .clone()
            .unwrap_or_else(|| instance.to_string())
            .trim_start_matches('/')
            .to_string();

        let snapshot = self.inspect_snapshot_image(&instance_name, name).await?;
        info!(
            "Restoring container {} from snapshot {} ({})",
            instance_name, name, snapshot.reference
        );

        // Engines cannot roll a container back in place: recreate it from the committed image.
        let previous = inspect.config.unwrap_or_default();
        let config = Config {
            image: Some(snapshot_image(&instance_name, name)),
            hostname: previous.hostname,
            env: previous.env,
            cmd: previous.cmd,
            entrypoint: previous.entrypoint,
            working_dir: previous.working_dir,
            user: previous.user,
            labels: previous.labels,
            exposed_ports: previous.exposed_ports,
            host_config: inspect.host_config,
            ..Default::default()
        };

        match self
            .change_state(instance, InstanceAction::Stop, false, Duration::from_secs(5))
            .await
        {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!("Stop before restore failed for {}: {}", instance_name, e),
        }
        self.delete_instance(instance).await?;

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: instance_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| classify(e, &instance_name))?;

        Ok(created.id)
    }

    async fn add_device(&self, instance: &str, device: &Device) -> Result<()> {
        match device {
            Device::Nic { network, .. } => {
                let state = self.get_instance_state(instance).await?;
                if state.is_attached_to(network) {
                    debug!("Container {} already attached to {}", instance, network);
                    return Ok(());
                }

                info!("Connecting container {} to network {}", instance, network);
                self.client
                    .connect_network(
                        network,
                        ConnectNetworkOptions {
                            container: instance.to_string(),
                            endpoint_config: EndpointSettings::default(),
                        },
                    )
                    .await
                    .map_err(|e| classify(e, network))
            }
            Device::Disk { name, .. } => Err(RuntimeError::Backend(format!(
                "Disk device {} can only be attached when the container is created",
                name
            ))),
        }
    }

    async fn remove_device(&self, instance: &str, device: &Device) -> Result<()> {
        match device {
            Device::Nic { network, .. } => {
                info!("Disconnecting container {} from network {}", instance, network);
                self.client
                    .disconnect_network(
                        network,
                        DisconnectNetworkOptions {
                            container: instance.to_string(),
                            force: true,
                        },
                    )
                    .await
                    .map_err(|e| classify(e, network))
            }
            Device::Disk { name, .. } => Err(RuntimeError::Backend(format!(
                "Disk device {} cannot be detached from a container",
                name
            ))),
        }
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        match self
            .client
            .inspect_network::<String>(&spec.name, None)
            .await
        {
            Ok(_) => {
                debug!("Network {} already exists", spec.name);
                return Ok(());
            }
            Err(e) if is_status(&e, 404) => {}
            Err(e) => return Err(classify(e, &spec.name)),
        }

        info!("Creating network {}", spec.name);

        let ipam = Ipam {
            config: spec.subnet.as_ref().map(|subnet| {
                vec![IpamConfig {
                    subnet: Some(subnet.clone()),
                    gateway: spec.gateway.clone(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        };
        let mut options = HashMap::new();
        options.insert(
            "com.docker.network.bridge.enable_ip_masquerade".to_string(),
            spec.nat.to_string(),
        );

        match self
            .client
            .create_network(CreateNetworkOptions {
                name: spec.name.clone(),
                driver: "bridge".to_string(),
                ipam,
                options,
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => Ok(()),
            Err(e) => Err(classify(e, &spec.name)),
        }
    }

    async fn delete_network(&self, name: &str) -> Result<()> {
        info!("Removing network {}", name);
        self.client
            .remove_network(name)
            .await
            .map_err(|e| classify(e, name))
    }
}

/// Docker answers 304 when a container is already started/stopped.
fn already_in_state((not_modified, error): (bool, RuntimeError)) -> Result<()> {
    if not_modified {
        Ok(())
    } else {
        Err(error)
    }
}
