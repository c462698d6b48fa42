// ABOUTME: Incus REST API runtime adapter built on reqwest
// ABOUTME: Waits async operations server-side and maps devices onto the instance device map

use super::{
    bounded, Device, ExecOutput, InstanceAction, InstanceAddress, InstanceSpec, InstanceState,
    InstanceStatus, InstanceSummary, NetworkSpec, RestartPolicy, Result, RuntimeClient,
    RuntimeError, RuntimeInfo, SnapshotInfo, OPERATION_TIMEOUT,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Config key prefix under which instance labels are stored.
const LABEL_PREFIX: &str = "user.";

pub struct IncusRuntime {
    client: Client,
    base_url: String,
}

impl IncusRuntime {
    /// Plain HTTP endpoint, e.g. a local unix-socket proxy.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(OPERATION_TIMEOUT + Duration::from_secs(10))
            .build()
            .map_err(|e| RuntimeError::Backend(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    /// HTTPS endpoint authenticated with a trusted client certificate.
    pub fn with_identity(
        base_url: impl Into<String>,
        cert_pem: &[u8],
        key_pem: &[u8],
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let identity = reqwest::Identity::from_pkcs8_pem(cert_pem, key_pem)
            .map_err(|e| RuntimeError::Backend(format!("Invalid client certificate: {}", e)))?;
        let client = Client::builder()
            .identity(identity)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(OPERATION_TIMEOUT + Duration::from_secs(10))
            .build()
            .map_err(|e| RuntimeError::Backend(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
    }

    /// Send a request and return the response envelope, classifying API errors.
    async fn execute(&self, request: RequestBuilder, subject: &str) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| RuntimeError::Backend(format!("{}: request failed: {}", subject, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RuntimeError::Backend(format!("{}: unreadable response: {}", subject, e)))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if status.is_success() {
            return Ok(body);
        }

        let message = body
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| body.as_str().map(str::to_string))
            .unwrap_or_default();

        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(format!("{}: {}", subject, message)));
        }
        Err(RuntimeError::Backend(format!(
            "Incus API error ({}) for {}: {}",
            status.as_u16(),
            subject,
            message
        )))
    }

    /// Execute and return the metadata, waiting for async operations to finish.
    async fn call(&self, request: RequestBuilder, subject: &str) -> Result<Value> {
        let envelope = self.execute(request, subject).await?;

        if envelope.get("type").and_then(Value::as_str) == Some("async") {
            let operation = envelope
                .get("operation")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    RuntimeError::Backend(format!("{}: async response without operation", subject))
                })?;
            return self.wait_for_operation(operation, subject).await;
        }

        Ok(envelope.get("metadata").cloned().unwrap_or(Value::Null))
    }

    /// Block on `/1.0/operations/<id>/wait` and return the finished operation.
    async fn wait_for_operation(&self, operation: &str, subject: &str) -> Result<Value> {
        let id = operation.rsplit('/').next().unwrap_or(operation);
        let path = format!(
            "/1.0/operations/{}/wait?timeout={}",
            id,
            OPERATION_TIMEOUT.as_secs()
        );
        debug!("Waiting for Incus operation {} ({})", id, subject);

        let envelope = bounded(
            OPERATION_TIMEOUT + Duration::from_secs(5),
            &format!("operation {} for {}", id, subject),
            self.execute(self.request(Method::GET, &path), subject),
        )
        .await?;

        let op = envelope.get("metadata").cloned().unwrap_or(Value::Null);
        match op.get("status").and_then(Value::as_str) {
            Some("Success") => Ok(op),
            Some("Failure") | Some("Cancelled") => Err(RuntimeError::Backend(format!(
                "{}: {}",
                subject,
                op.get("err").and_then(Value::as_str).unwrap_or("operation failed")
            ))),
            other => Err(RuntimeError::Timeout(format!(
                "{}: operation {} still {}",
                subject,
                id,
                other.unwrap_or("pending")
            ))),
        }
    }

    async fn fetch_text(&self, path: &str, subject: &str) -> Result<String> {
        match self.execute(self.request(Method::GET, path), subject).await? {
            Value::String(text) => Ok(text),
            other => Ok(other.to_string()),
        }
    }

    async fn get_instance(&self, name: &str) -> Result<Value> {
        self.call(
            self.request(Method::GET, &format!("/1.0/instances/{}", name)),
            name,
        )
        .await
    }

    async fn patch_devices(&self, name: &str, devices: Map<String, Value>) -> Result<()> {
        self.call(
            self.request(Method::PATCH, &format!("/1.0/instances/{}", name))
                .json(&json!({ "devices": devices })),
            name,
        )
        .await
        .map(|_| ())
    }
}

fn device_json(device: &Device) -> Value {
    match device {
        Device::Nic { network, .. } => json!({ "type": "nic", "network": network }),
        Device::Disk { source, path, .. } => {
            json!({ "type": "disk", "source": source, "path": path })
        }
    }
}

fn instance_body(spec: &InstanceSpec) -> Value {
    let mut config = Map::new();
    for (key, value) in &spec.env {
        config.insert(format!("environment.{}", key), json!(value));
    }
    for (key, value) in &spec.labels {
        config.insert(format!("{}{}", LABEL_PREFIX, key), json!(value));
    }
    if let Some(mb) = spec.memory_mb {
        config.insert("limits.memory".to_string(), json!(format!("{}MiB", mb)));
    }
    if let Some(cpus) = spec.cpu_limit {
        config.insert(
            "limits.cpu.allowance".to_string(),
            json!(format!("{}%", (cpus * 100.0).round() as u64)),
        );
    }
    if spec.nested {
        config.insert("security.nesting".to_string(), json!("true"));
    }
    if spec.restart == RestartPolicy::UnlessStopped {
        config.insert("boot.autostart".to_string(), json!("true"));
    }
    if let Some(user_data) = &spec.user_data {
        config.insert("cloud-init.user-data".to_string(), json!(user_data));
    }

    let mut devices = Map::new();
    for device in &spec.devices {
        devices.insert(device.name().to_string(), device_json(device));
    }
    for port in &spec.ports {
        devices.insert(
            format!("port-{}", port.host_port),
            json!({
                "type": "proxy",
                "listen": format!("tcp:0.0.0.0:{}", port.host_port),
                "connect": format!("tcp:127.0.0.1:{}", port.instance_port),
            }),
        );
    }

    json!({
        "name": spec.name,
        "type": "container",
        "source": { "type": "image", "alias": spec.image },
        "profiles": ["default"],
        "config": config,
        "devices": devices,
    })
}

fn snapshot_from(instance: &str, value: &Value) -> SnapshotInfo {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    SnapshotInfo {
        reference: format!("{}/{}", instance, name),
        name,
        instance: instance.to_string(),
        created_at: value
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        size_bytes: value.get("size").and_then(Value::as_u64),
    }
}

fn labels_from(config: Option<&Value>) -> HashMap<String, String> {
    config
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| {
                    let key = k.strip_prefix(LABEL_PREFIX)?;
                    Some((key.to_string(), v.as_str()?.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Incus rejects a state change that is already in effect; that is a success for us.
fn already_in_state(error: &RuntimeError) -> bool {
    match error {
        RuntimeError::Backend(message) => {
            let message = message.to_lowercase();
            message.contains("already running")
                || message.contains("already stopped")
                || message.contains("is not running")
        }
        _ => false,
    }
}

#[async_trait]
impl RuntimeClient for IncusRuntime {
    fn backend_name(&self) -> &'static str {
        "incus"
    }

    async fn server_info(&self) -> Result<RuntimeInfo> {
        let server = self.call(self.request(Method::GET, "/1.0"), "server").await?;
        let instances = self
            .call(
                self.request(Method::GET, "/1.0/instances?recursion=1"),
                "instances",
            )
            .await?;
        let images = self
            .call(self.request(Method::GET, "/1.0/images"), "images")
            .await?;

        let listed = instances.as_array().cloned().unwrap_or_default();
        let running = listed
            .iter()
            .filter(|i| i.get("status").and_then(Value::as_str) == Some("Running"))
            .count();

        Ok(RuntimeInfo {
            backend: "incus".to_string(),
            version: server
                .pointer("/environment/server_version")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            instances: Some(listed.len() as u64),
            instances_running: Some(running as u64),
            images: images.as_array().map(|a| a.len() as u64),
            runtimes: server
                .pointer("/environment/driver")
                .and_then(Value::as_str)
                .map(|d| d.split(" | ").map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let path = format!("/1.0/images/aliases/{}", image);
        match self.call(self.request(Method::GET, &path), image).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        Err(RuntimeError::Backend(format!(
            "Image {} is not published on the Incus server",
            image
        )))
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        info!("Creating Incus instance: {}", spec.name);
        self.call(
            self.request(Method::POST, "/1.0/instances")
                .json(&instance_body(spec)),
            &spec.name,
        )
        .await?;
        Ok(spec.name.clone())
    }

    async fn delete_instance(&self, instance: &str) -> Result<()> {
        info!("Deleting Incus instance: {}", instance);
        self.call(
            self.request(Method::DELETE, &format!("/1.0/instances/{}", instance)),
            instance,
        )
        .await
        .map(|_| ())
    }

    async fn change_state(
        &self,
        instance: &str,
        action: InstanceAction,
        force: bool,
        timeout: Duration,
    ) -> Result<()> {
        info!(
            "Changing Incus instance {} state: {} (force: {})",
            instance,
            action.as_str(),
            force
        );

        let body = json!({
            "action": action.as_str(),
            "timeout": timeout.as_secs(),
            "force": force,
        });
        match self
            .call(
                self.request(Method::PUT, &format!("/1.0/instances/{}/state", instance))
                    .json(&body),
                instance,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if already_in_state(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_instance_state(&self, instance: &str) -> Result<InstanceState> {
        let state = self
            .call(
                self.request(Method::GET, &format!("/1.0/instances/{}/state", instance)),
                instance,
            )
            .await?;

        let mut addresses = Vec::new();
        if let Some(interfaces) = state.get("network").and_then(Value::as_object) {
            for (interface, details) in interfaces {
                let listed = details
                    .get("addresses")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for address in listed {
                    if let (Some(family), Some(addr)) = (
                        address.get("family").and_then(Value::as_str),
                        address.get("address").and_then(Value::as_str),
                    ) {
                        addresses.push(InstanceAddress {
                            interface: interface.clone(),
                            family: family.to_string(),
                            address: addr.to_string(),
                        });
                    }
                }
            }
        }

        let details = self.get_instance(instance).await?;
        let mut networks: Vec<String> = details
            .get("expanded_devices")
            .and_then(Value::as_object)
            .map(|devices| {
                devices
                    .values()
                    .filter(|d| d.get("type").and_then(Value::as_str) == Some("nic"))
                    .filter_map(|d| {
                        d.get("network")
                            .or_else(|| d.get("parent"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();
        networks.sort();

        Ok(InstanceState {
            status: InstanceStatus::parse(
                state.get("status").and_then(Value::as_str).unwrap_or("unknown"),
            ),
            pid: state.get("pid").and_then(Value::as_i64).filter(|p| *p > 0),
            addresses,
            networks,
            memory_usage_bytes: state.pointer("/memory/usage").and_then(Value::as_u64),
        })
    }

    async fn list_instances(&self, label: &str, value: &str) -> Result<Vec<InstanceSummary>> {
        let listed = self
            .call(
                self.request(Method::GET, "/1.0/instances?recursion=1"),
                "instances",
            )
            .await?;

        Ok(listed
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|instance| {
                let labels = labels_from(instance.get("config"));
                if labels.get(label).map(String::as_str) != Some(value) {
                    return None;
                }
                let name = instance.get("name").and_then(Value::as_str)?.to_string();
                Some(InstanceSummary {
                    id: name.clone(),
                    name,
                    running: instance.get("status").and_then(Value::as_str) == Some("Running"),
                    labels,
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
        debug!("Executing in Incus instance {}: {:?}", instance, command);

        let body = json!({
            "command": command,
            "environment": env,
            "interactive": false,
            "wait-for-websocket": false,
            "record-output": true,
        });
        let op = self
            .call(
                self.request(Method::POST, &format!("/1.0/instances/{}/exec", instance))
                    .json(&body),
                instance,
            )
            .await?;

        let metadata = op.get("metadata").cloned().unwrap_or(Value::Null);
        let mut output = ExecOutput {
            exit_code: metadata.get("return").and_then(Value::as_i64).unwrap_or(-1),
            ..Default::default()
        };
        if let Some(path) = metadata.pointer("/output/1").and_then(Value::as_str) {
            output.stdout = self.fetch_text(path, instance).await?;
        }
        if let Some(path) = metadata.pointer("/output/2").and_then(Value::as_str) {
            output.stderr = self.fetch_text(path, instance).await?;
        }
        Ok(output)
    }

    async fn push_file(
        &self,
        instance: &str,
        path: &str,
        content: &[u8],
        mode: u32,
    ) -> Result<()> {
        self.call(
            self.request(Method::POST, &format!("/1.0/instances/{}/files", instance))
                .query(&[("path", path)])
                .header("Content-Type", "application/octet-stream")
                .header("X-Incus-type", "file")
                .header("X-Incus-uid", "0")
                .header("X-Incus-gid", "0")
                .header("X-Incus-mode", format!("{:04o}", mode))
                .body(content.to_vec()),
            instance,
        )
        .await
        .map(|_| ())
    }

    async fn create_snapshot(&self, instance: &str, name: &str) -> Result<SnapshotInfo> {
        info!("Creating snapshot {} of Incus instance {}", name, instance);
        self.call(
            self.request(Method::POST, &format!("/1.0/instances/{}/snapshots", instance))
                .json(&json!({ "name": name, "stateful": false })),
            instance,
        )
        .await?;
        self.get_snapshot(instance, name).await
    }

    async fn list_snapshots(&self, instance: &str) -> Result<Vec<SnapshotInfo>> {
        let listed = self
            .call(
                self.request(
                    Method::GET,
                    &format!("/1.0/instances/{}/snapshots?recursion=1", instance),
                ),
                instance,
            )
            .await?;
        let mut snapshots: Vec<SnapshotInfo> = listed
            .as_array()
            .map(|items| items.iter().map(|s| snapshot_from(instance, s)).collect())
            .unwrap_or_default();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snapshots)
    }

    async fn get_snapshot(&self, instance: &str, name: &str) -> Result<SnapshotInfo> {
        let snapshot = self
            .call(
                self.request(
                    Method::GET,
                    &format!("/1.0/instances/{}/snapshots/{}", instance, name),
                ),
                instance,
            )
            .await?;
        Ok(snapshot_from(instance, &snapshot))
    }

    async fn delete_snapshot(&self, instance: &str, name: &str) -> Result<()> {
        info!("Deleting snapshot {} of Incus instance {}", name, instance);
        self.call(
            self.request(
                Method::DELETE,
                &format!("/1.0/instances/{}/snapshots/{}", instance, name),
            ),
            instance,
        )
        .await
        .map(|_| ())
    }

    async fn restore_snapshot(&self, instance: &str, name: &str) -> Result<String> {
        info!("Restoring Incus instance {} to snapshot {}", instance, name);
        self.call(
            self.request(Method::PUT, &format!("/1.0/instances/{}", instance))
                .json(&json!({ "restore": name })),
            instance,
        )
        .await?;
        Ok(instance.to_string())
    }

    async fn add_device(&self, instance: &str, device: &Device) -> Result<()> {
        let details = self.get_instance(instance).await?;
        let mut devices = details
            .get("devices")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let wanted = device_json(device);
        if devices.get(device.name()) == Some(&wanted) {
            debug!("Device {} already present on {}", device.name(), instance);
            return Ok(());
        }

        info!("Adding device {} to Incus instance {}", device.name(), instance);
        devices.insert(device.name().to_string(), wanted);
        self.patch_devices(instance, devices).await
    }

    async fn remove_device(&self, instance: &str, device: &Device) -> Result<()> {
        let details = self.get_instance(instance).await?;
        let mut devices = details
            .get("devices")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if devices.remove(device.name()).is_none() {
            debug!("Device {} not present on {}", device.name(), instance);
            return Ok(());
        }

        info!(
            "Removing device {} from Incus instance {}",
            device.name(),
            instance
        );
        self.patch_devices(instance, devices).await
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        let mut config = Map::new();
        let address = match (&spec.gateway, &spec.subnet) {
            (Some(gateway), Some(subnet)) => {
                let prefix = subnet.rsplit_once('/').map(|(_, p)| p).unwrap_or("24");
                format!("{}/{}", gateway, prefix)
            }
            _ => "auto".to_string(),
        };
        config.insert("ipv4.address".to_string(), json!(address));
        config.insert("ipv4.nat".to_string(), json!(spec.nat.to_string()));
        config.insert("ipv6.address".to_string(), json!("none"));

        info!("Creating Incus network {}", spec.name);
        let body = json!({ "name": spec.name, "type": "bridge", "config": config });
        match self
            .call(
                self.request(Method::POST, "/1.0/networks").json(&body),
                &spec.name,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(RuntimeError::Backend(message)) if message.contains("already exists") => {
                debug!("Network {} already exists", spec.name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_network(&self, name: &str) -> Result<()> {
        info!("Deleting Incus network {}", name);
        self.call(
            self.request(Method::DELETE, &format!("/1.0/networks/{}", name)),
            name,
        )
        .await
        .map(|_| ())
    }
}
