// ABOUTME: Test helpers: in-memory runtime double, in-memory database and seeded records
// ABOUTME: Compiled for unit tests and for integration tests through the test-utils feature

use crate::runtime::{
    Device, ExecOutput, InstanceAction, InstanceAddress, InstanceSpec, InstanceState,
    InstanceStatus, InstanceSummary, NetworkSpec, Result, RuntimeClient, RuntimeError,
    RuntimeInfo, SnapshotInfo,
};
use crate::storage::{self, NewSandbox, Sandbox, SandboxStatus, SandboxStorage, User};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory database with migrations applied. One connection keeps it alive.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    storage::migrate(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Existing user `name`, created with a test SSH key on first use.
pub async fn seed_user(storage: &SandboxStorage, name: &str) -> User {
    if let Ok(user) = storage.get_user_by_name(name).await {
        return user;
    }
    let key = format!("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITEST {}@test", name);
    storage
        .create_user(name, Some(&key), false)
        .await
        .expect("Failed to seed user")
}

/// A `running` sandbox backed by a running fake instance named `<owner>-<name>`.
pub async fn running_sandbox(
    storage: &SandboxStorage,
    runtime: &FakeRuntime,
    owner: &str,
    name: &str,
) -> Sandbox {
    let user = seed_user(storage, owner).await;
    let sandbox = storage
        .create_sandbox(&NewSandbox {
            user_id: user.id,
            name: name.to_string(),
            image: "sandcastle-sandbox:latest".to_string(),
            ..Default::default()
        })
        .await
        .expect("Failed to create sandbox");
    let id = runtime.add_instance(&sandbox.full_name(), true);
    storage
        .set_container(sandbox.id, Some(&id))
        .await
        .expect("Failed to set container");
    storage
        .update_status(sandbox.id, SandboxStatus::Running)
        .await
        .expect("Failed to mark running");
    storage
        .get_sandbox(sandbox.id)
        .await
        .expect("Failed to reload sandbox")
}

#[derive(Debug, Clone)]
struct FakeInstance {
    id: String,
    name: String,
    spec: InstanceSpec,
    running: bool,
    devices: Vec<Device>,
    addresses: Vec<InstanceAddress>,
    snapshots: Vec<SnapshotInfo>,
    files: HashMap<String, (Vec<u8>, u32)>,
}

impl FakeInstance {
    fn networks(&self) -> Vec<String> {
        let mut networks: Vec<String> = self
            .devices
            .iter()
            .filter_map(|d| match d {
                Device::Nic { network, .. } => Some(network.clone()),
                Device::Disk { .. } => None,
            })
            .collect();
        networks.sort();
        networks.dedup();
        networks
    }
}

#[derive(Default)]
struct FakeState {
    instances: Vec<FakeInstance>,
    networks: HashSet<String>,
    images: HashSet<String>,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<RuntimeError>>,
    exec_script: Vec<(String, VecDeque<ExecOutput>)>,
    exec_log: Vec<(String, String)>,
    restores: usize,
    // Snapshots left behind by deleted instances, keyed by instance name.
    leftover_snapshots: HashMap<String, Vec<SnapshotInfo>>,
}

impl FakeState {
    fn position(&self, instance: &str) -> Option<usize> {
        self.instances
            .iter()
            .position(|i| i.id == instance || i.name == instance)
    }

    fn find(&mut self, instance: &str) -> Result<&mut FakeInstance> {
        match self.position(instance) {
            Some(idx) => Ok(&mut self.instances[idx]),
            None => Err(RuntimeError::NotFound(format!("instance {}", instance))),
        }
    }
}

/// In-memory [`RuntimeClient`] recording every call, with scripted exec output
/// and one-shot failure injection. Instance ids are `id-<name>`.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, op: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(op.to_string());
        if let Some(queue) = state.failures.get_mut(op) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Make the next call of `op` fail (ops are trait method names; state changes
    /// are `change_state:start` / `change_state:stop`).
    pub fn fail_on(&self, op: &str, error: RuntimeError) {
        self.lock()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(error);
    }

    /// Queue outputs for commands containing `pattern`. The last output repeats.
    pub fn push_exec(&self, pattern: &str, output: ExecOutput) {
        let mut state = self.lock();
        if let Some((_, queue)) = state.exec_script.iter_mut().find(|(p, _)| p == pattern) {
            queue.push_back(output);
        } else {
            state
                .exec_script
                .push((pattern.to_string(), VecDeque::from([output])));
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == op).count()
    }

    /// `(instance name, command joined by spaces)` for every exec.
    pub fn exec_log(&self) -> Vec<(String, String)> {
        self.lock().exec_log.clone()
    }

    pub fn add_instance(&self, name: &str, running: bool) -> String {
        let id = format!("id-{}", name);
        self.lock().instances.push(FakeInstance {
            id: id.clone(),
            name: name.to_string(),
            spec: InstanceSpec {
                name: name.to_string(),
                ..Default::default()
            },
            running,
            devices: Vec::new(),
            addresses: Vec::new(),
            snapshots: Vec::new(),
            files: HashMap::new(),
        });
        id
    }

    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    /// Simulate an instance deleted behind our back.
    pub fn remove_out_of_band(&self, instance: &str) {
        let mut state = self.lock();
        if let Some(idx) = state.position(instance) {
            state.instances.remove(idx);
        }
    }

    pub fn set_running(&self, instance: &str, running: bool) {
        if let Ok(found) = self.lock().find(instance) {
            found.running = running;
        }
    }

    pub fn set_address(&self, instance: &str, interface: &str, address: &str) {
        if let Ok(found) = self.lock().find(instance) {
            found.addresses.retain(|a| a.interface != interface);
            found.addresses.push(InstanceAddress {
                interface: interface.to_string(),
                family: "inet".to_string(),
                address: address.to_string(),
            });
        }
    }

    pub fn state_of(&self, instance: &str) -> Option<InstanceState> {
        let mut state = self.lock();
        state.find(instance).ok().map(|i| snapshot_state(i))
    }

    pub fn spec_of(&self, instance: &str) -> Option<InstanceSpec> {
        self.lock().find(instance).ok().map(|i| i.spec.clone())
    }

    pub fn id_of(&self, instance: &str) -> Option<String> {
        self.lock().find(instance).ok().map(|i| i.id.clone())
    }

    pub fn exists(&self, instance: &str) -> bool {
        self.lock().position(instance).is_some()
    }

    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().instances.iter().map(|i| i.name.clone()).collect();
        names.sort();
        names
    }

    pub fn file(&self, instance: &str, path: &str) -> Option<(Vec<u8>, u32)> {
        self.lock()
            .find(instance)
            .ok()
            .and_then(|i| i.files.get(path).cloned())
    }

    /// Snapshots still stored for a deleted instance.
    pub fn leftover_snapshots(&self, instance_name: &str) -> usize {
        self.lock()
            .leftover_snapshots
            .get(instance_name)
            .map_or(0, Vec::len)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains(name)
    }
}

fn snapshot_state(instance: &FakeInstance) -> InstanceState {
    InstanceState {
        status: if instance.running {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        },
        pid: instance.running.then_some(100),
        addresses: instance.addresses.clone(),
        networks: instance.networks(),
        memory_usage_bytes: instance.running.then_some(64 * 1024 * 1024),
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn server_info(&self) -> Result<RuntimeInfo> {
        self.enter("server_info")?;
        let state = self.lock();
        Ok(RuntimeInfo {
            backend: "fake".to_string(),
            version: "test".to_string(),
            instances: Some(state.instances.len() as u64),
            instances_running: Some(state.instances.iter().filter(|i| i.running).count() as u64),
            images: Some(state.images.len() as u64),
            runtimes: vec!["runc".to_string()],
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.enter("image_exists")?;
        Ok(self.lock().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.enter("pull_image")?;
        self.lock().images.insert(image.to_string());
        Ok(())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        self.enter("create_instance")?;
        let mut state = self.lock();
        if state.position(&spec.name).is_some() {
            return Err(RuntimeError::Backend(format!(
                "name {} already in use",
                spec.name
            )));
        }
        let id = format!("id-{}", spec.name);
        state.instances.push(FakeInstance {
            id: id.clone(),
            name: spec.name.clone(),
            spec: spec.clone(),
            running: false,
            devices: spec.devices.clone(),
            addresses: Vec::new(),
            snapshots: Vec::new(),
            files: HashMap::new(),
        });
        Ok(id)
    }

    async fn delete_instance(&self, instance: &str) -> Result<()> {
        self.enter("delete_instance")?;
        let mut state = self.lock();
        match state.position(instance) {
            Some(idx) => {
                let removed = state.instances.remove(idx);
                if !removed.snapshots.is_empty() {
                    state
                        .leftover_snapshots
                        .entry(removed.name)
                        .or_default()
                        .extend(removed.snapshots);
                }
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("instance {}", instance))),
        }
    }

    async fn change_state(
        &self,
        instance: &str,
        action: InstanceAction,
        _force: bool,
        _timeout: Duration,
    ) -> Result<()> {
        self.enter(&format!("change_state:{}", action.as_str()))?;
        let mut state = self.lock();
        let found = state.find(instance)?;
        found.running = action == InstanceAction::Start;
        Ok(())
    }

    async fn get_instance_state(&self, instance: &str) -> Result<InstanceState> {
        self.enter("get_instance_state")?;
        let mut state = self.lock();
        state.find(instance).map(|i| snapshot_state(i))
    }

    async fn list_instances(&self, label: &str, value: &str) -> Result<Vec<InstanceSummary>> {
        self.enter("list_instances")?;
        let state = self.lock();
        Ok(state
            .instances
            .iter()
            .filter(|i| i.spec.labels.get(label).map(String::as_str) == Some(value))
            .map(|i| InstanceSummary {
                id: i.id.clone(),
                name: i.name.clone(),
                labels: i.spec.labels.clone(),
                running: i.running,
            })
            .collect())
    }

    async fn exec(
        &self,
        instance: &str,
        command: &[String],
        _env: &HashMap<String, String>,
    ) -> Result<ExecOutput> {
        self.enter("exec")?;
        let mut state = self.lock();
        let name = state.find(instance)?.name.clone();
        let joined = command.join(" ");
        state.exec_log.push((name, joined.clone()));

        let scripted = state
            .exec_script
            .iter_mut()
            .find(|(pattern, _)| joined.contains(pattern.as_str()))
            .and_then(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });
        Ok(scripted.unwrap_or_default())
    }

    async fn push_file(
        &self,
        instance: &str,
        path: &str,
        content: &[u8],
        mode: u32,
    ) -> Result<()> {
        self.enter("push_file")?;
        let mut state = self.lock();
        state
            .find(instance)?
            .files
            .insert(path.to_string(), (content.to_vec(), mode));
        Ok(())
    }

    async fn create_snapshot(&self, instance: &str, name: &str) -> Result<SnapshotInfo> {
        self.enter("create_snapshot")?;
        let mut state = self.lock();
        let found = state.find(instance)?;
        if found.snapshots.iter().any(|s| s.name == name) {
            return Err(RuntimeError::Backend(format!(
                "snapshot {} already exists",
                name
            )));
        }
        let info = SnapshotInfo {
            name: name.to_string(),
            instance: found.name.clone(),
            reference: format!("{}/{}", found.name, name),
            created_at: Some(Utc::now()),
            size_bytes: Some(1024),
        };
        found.snapshots.push(info.clone());
        Ok(info)
    }

    async fn list_snapshots(&self, instance: &str) -> Result<Vec<SnapshotInfo>> {
        self.enter("list_snapshots")?;
        let mut state = self.lock();
        Ok(state.find(instance)?.snapshots.clone())
    }

    async fn get_snapshot(&self, instance: &str, name: &str) -> Result<SnapshotInfo> {
        self.enter("get_snapshot")?;
        let mut state = self.lock();
        state
            .find(instance)?
            .snapshots
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("snapshot {}", name)))
    }

    async fn delete_snapshot(&self, instance: &str, name: &str) -> Result<()> {
        self.enter("delete_snapshot")?;
        let mut state = self.lock();
        let found = state.find(instance)?;
        let before = found.snapshots.len();
        found.snapshots.retain(|s| s.name != name);
        if found.snapshots.len() == before {
            return Err(RuntimeError::NotFound(format!("snapshot {}", name)));
        }
        Ok(())
    }

    async fn purge_snapshots(&self, instance_name: &str) -> Result<usize> {
        self.enter("purge_snapshots")?;
        Ok(self
            .lock()
            .leftover_snapshots
            .remove(instance_name)
            .map(|snapshots| snapshots.len())
            .unwrap_or(0))
    }

    /// Behaves like an engine: the instance comes back stopped under a new id.
    async fn restore_snapshot(&self, instance: &str, name: &str) -> Result<String> {
        self.enter("restore_snapshot")?;
        let mut state = self.lock();
        state.restores += 1;
        let generation = state.restores;
        let found = state.find(instance)?;
        if !found.snapshots.iter().any(|s| s.name == name) {
            return Err(RuntimeError::NotFound(format!("snapshot {}", name)));
        }
        found.id = format!("id-{}-r{}", found.name, generation);
        found.running = false;
        found.devices = found.spec.devices.clone();
        found.addresses.clear();
        Ok(found.id.clone())
    }

    async fn add_device(&self, instance: &str, device: &Device) -> Result<()> {
        self.enter("add_device")?;
        let mut state = self.lock();
        if let Device::Nic { network, .. } = device {
            if !state.networks.contains(network) {
                return Err(RuntimeError::NotFound(format!("network {}", network)));
            }
        }
        let found = state.find(instance)?;
        if !found.devices.iter().any(|d| d.name() == device.name()) {
            found.devices.push(device.clone());
        }
        Ok(())
    }

    async fn remove_device(&self, instance: &str, device: &Device) -> Result<()> {
        self.enter("remove_device")?;
        let mut state = self.lock();
        let found = state.find(instance)?;
        let before = found.devices.len();
        found.devices.retain(|d| d.name() != device.name());
        if found.devices.len() == before {
            return Err(RuntimeError::NotFound(format!(
                "device {} on {}",
                device.name(),
                found.name
            )));
        }
        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        self.enter("create_network")?;
        self.lock().networks.insert(spec.name.clone());
        Ok(())
    }

    async fn delete_network(&self, name: &str) -> Result<()> {
        self.enter("delete_network")?;
        if self.lock().networks.remove(name) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(format!("network {}", name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_runtime_lifecycle() {
        let runtime = FakeRuntime::new();
        let id = runtime
            .create_instance(&InstanceSpec {
                name: "alice-dev".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(id, "id-alice-dev");

        runtime
            .change_state(&id, InstanceAction::Start, false, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(runtime.state_of("alice-dev").unwrap().is_running());

        runtime.fail_on("delete_instance", RuntimeError::Backend("busy".into()));
        assert!(runtime.delete_instance(&id).await.is_err());
        runtime.delete_instance(&id).await.unwrap();
        assert!(!runtime.exists("alice-dev"));
    }

    #[tokio::test]
    async fn test_exec_script_repeats_last_output() {
        let runtime = FakeRuntime::new();
        runtime.add_instance("sc-ts-alice", true);
        runtime.push_exec(
            "status",
            ExecOutput {
                stdout: "first".into(),
                ..Default::default()
            },
        );
        runtime.push_exec(
            "status",
            ExecOutput {
                stdout: "second".into(),
                ..Default::default()
            },
        );
        let cmd = vec!["tailscale".to_string(), "status".to_string()];

        let mut outputs = Vec::new();
        for _ in 0..3 {
            let output = runtime
                .exec("sc-ts-alice", &cmd, &HashMap::new())
                .await
                .unwrap();
            outputs.push(output.stdout);
        }
        assert_eq!(outputs, vec!["first", "second", "second"]);
    }
}
