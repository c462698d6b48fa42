// ABOUTME: Maps sandbox ports to public domains and keeps the proxy file provider in sync
// ABOUTME: Owns ingress network attachment for routed sandboxes and the web-layer router file

use crate::config::SandcastleConfig;
use crate::error::{Result, SandboxError};
use crate::runtime::{Device, NetworkSpec, RuntimeClient, RuntimeError};
use crate::storage::{Route, Sandbox, SandboxStatus, SandboxStorage};
use crate::traefik::{self, DynamicConfig, Router, Service};
use crate::validation::{normalize_domain, validate_port};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// NIC device name used for the ingress attachment.
pub const INGRESS_DEVICE: &str = "ingress";

/// Shared ingress network handling for routed sandboxes and access sidecars.
#[derive(Clone)]
pub struct Ingress {
    runtime: Arc<dyn RuntimeClient>,
    network: String,
}

impl Ingress {
    pub fn new(runtime: Arc<dyn RuntimeClient>, network: impl Into<String>) -> Self {
        Self {
            runtime,
            network: network.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn device(&self) -> Device {
        Device::nic(INGRESS_DEVICE, &self.network)
    }

    pub async fn ensure_network(&self) -> Result<()> {
        self.runtime
            .create_network(&NetworkSpec {
                name: self.network.clone(),
                subnet: None,
                gateway: None,
                nat: true,
            })
            .await?;
        Ok(())
    }

    pub async fn attach(&self, instance: &str) -> Result<()> {
        self.ensure_network().await?;
        self.runtime.add_device(instance, &self.device()).await?;
        Ok(())
    }

    /// Detach, treating a missing instance or attachment as done.
    pub async fn detach(&self, instance: &str) -> Result<()> {
        match self.runtime.remove_device(instance, &self.device()).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct RouteManager {
    config: Arc<SandcastleConfig>,
    storage: SandboxStorage,
    ingress: Ingress,
}

impl RouteManager {
    pub fn new(
        config: Arc<SandcastleConfig>,
        storage: SandboxStorage,
        runtime: Arc<dyn RuntimeClient>,
    ) -> Self {
        let ingress = Ingress::new(runtime, config.ingress_network.clone());
        Self {
            config,
            storage,
            ingress,
        }
    }

    pub fn ingress(&self) -> &Ingress {
        &self.ingress
    }

    pub fn config_path(&self, sandbox_id: i64) -> PathBuf {
        self.config
            .dynamic_dir()
            .join(format!("sandbox-{}.yml", sandbox_id))
    }

    pub async fn add_route(&self, sandbox: &Sandbox, domain: &str, port: u32) -> Result<Route> {
        if sandbox.status != SandboxStatus::Running {
            return Err(SandboxError::Validation(format!(
                "{} must be running to add a route",
                sandbox.full_name()
            )));
        }
        let domain = normalize_domain(domain)?;
        let port = validate_port(port)?;
        let instance = sandbox.instance().ok_or_else(|| {
            SandboxError::Validation(format!("{} has no instance", sandbox.full_name()))
        })?;

        if let Some(existing) = self.storage.get_route_by_domain(&domain).await? {
            if existing.sandbox_id != sandbox.id {
                return Err(SandboxError::Conflict(format!(
                    "Domain {} is routed to another sandbox",
                    domain
                )));
            }
            if existing.port == port {
                debug!("Route {} -> {} already present", domain, port);
                self.ingress.attach(instance).await?;
                self.write_sandbox_config(sandbox).await?;
                return Ok(existing);
            }
            self.storage.delete_route(sandbox.id, &domain).await?;
        }

        let route = self.storage.insert_route(sandbox.id, &domain, port).await?;
        info!(
            "Added route {} -> {}:{}",
            domain,
            sandbox.full_name(),
            port
        );

        self.ingress.attach(instance).await?;
        self.write_sandbox_config(sandbox).await?;
        Ok(route)
    }

    pub async fn remove_route(&self, sandbox: &Sandbox, domain: &str) -> Result<()> {
        let domain = domain.trim().to_lowercase();
        if !self.storage.delete_route(sandbox.id, &domain).await? {
            return Err(SandboxError::NotFound(format!(
                "Route {} on {}",
                domain,
                sandbox.full_name()
            )));
        }
        info!("Removed route {} from {}", domain, sandbox.full_name());

        if self.storage.list_routes(sandbox.id).await?.is_empty() {
            traefik::remove_config(&self.config_path(sandbox.id)).await?;
            self.detach_if_unused(sandbox).await;
        } else {
            self.write_sandbox_config(sandbox).await?;
        }
        Ok(())
    }

    pub async fn list_routes(&self, sandbox: &Sandbox) -> Result<Vec<Route>> {
        Ok(self.storage.list_routes(sandbox.id).await?)
    }

    /// Take the routes offline without forgetting them.
    pub async fn suspend_routes(&self, sandbox: &Sandbox) -> Result<()> {
        traefik::remove_config(&self.config_path(sandbox.id)).await?;
        if let Some(instance) = sandbox.instance() {
            if !self.storage.list_routes(sandbox.id).await?.is_empty() {
                self.ingress.detach(instance).await?;
            }
        }
        debug!("Suspended routes of {}", sandbox.full_name());
        Ok(())
    }

    /// Bring suspended routes back: ingress attachment plus config file.
    pub async fn reconnect_routes(&self, sandbox: &Sandbox) -> Result<()> {
        let routes = self.storage.list_routes(sandbox.id).await?;
        if routes.is_empty() {
            return Ok(());
        }
        if let Some(instance) = sandbox.instance() {
            self.ingress.attach(instance).await?;
        }
        self.write_config_for(sandbox, &routes).await?;
        info!(
            "Reconnected {} route(s) of {}",
            routes.len(),
            sandbox.full_name()
        );
        Ok(())
    }

    pub async fn remove_all_routes(&self, sandbox: &Sandbox) -> Result<()> {
        let removed = self.storage.delete_routes_for_sandbox(sandbox.id).await?;
        traefik::remove_config(&self.config_path(sandbox.id)).await?;
        if removed > 0 {
            info!("Removed {} route(s) of {}", removed, sandbox.full_name());
            self.detach_if_unused(sandbox).await;
        }
        Ok(())
    }

    /// Drop stale `sandbox-*.yml` files, re-attach routed running sandboxes to the
    /// ingress network and rewrite their files.
    pub async fn sync_all_configs(&self) -> Result<usize> {
        let sandboxes = self.storage.list_routed_running_sandboxes().await?;
        let wanted: HashSet<String> = sandboxes
            .iter()
            .map(|s| format!("sandbox-{}.yml", s.id))
            .collect();

        let dir = self.config.dynamic_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("sandbox-") && name.ends_with(".yml") && !wanted.contains(&name) {
                info!("Removing stale route config {}", name);
                if let Err(e) = traefik::remove_config(&entry.path()).await {
                    warn!("Failed to remove stale route config {}: {}", name, e);
                }
            }
        }

        let mut written = 0;
        for sandbox in &sandboxes {
            if let Some(instance) = sandbox.instance() {
                if let Err(e) = self.ingress.attach(instance).await {
                    warn!(
                        "Failed to attach {} to {}: {}",
                        sandbox.full_name(),
                        self.ingress.network(),
                        e
                    );
                }
            }
            match self.write_sandbox_config(sandbox).await {
                Ok(()) => written += 1,
                Err(e) => warn!(
                    "Failed to write route config for {}: {}",
                    sandbox.full_name(),
                    e
                ),
            }
        }
        Ok(written)
    }

    /// Router for the web layer on the public host.
    pub async fn write_web_config(&self) -> Result<PathBuf> {
        let mut dynamic = DynamicConfig::default();
        dynamic.http.routers.insert(
            "sandcastle-web".to_string(),
            Router::new(
                traefik::public_host_rule(&self.config),
                "sandcastle-web",
                &self.config,
            ),
        );
        dynamic.http.services.insert(
            "sandcastle-web".to_string(),
            Service::single(&self.config.web_backend),
        );

        let path = self.config.dynamic_dir().join("web.yml");
        traefik::write_config(&path, &dynamic).await?;
        info!("Wrote web router for {}", self.config.host);
        Ok(path)
    }

    async fn write_sandbox_config(&self, sandbox: &Sandbox) -> Result<()> {
        let routes = self.storage.list_routes(sandbox.id).await?;
        self.write_config_for(sandbox, &routes).await
    }

    async fn write_config_for(&self, sandbox: &Sandbox, routes: &[Route]) -> Result<()> {
        let path = self.config_path(sandbox.id);
        if routes.is_empty() {
            traefik::remove_config(&path).await?;
            return Ok(());
        }
        traefik::write_config(&path, &self.build_config(sandbox, routes)).await?;
        Ok(())
    }

    pub fn build_config(&self, sandbox: &Sandbox, routes: &[Route]) -> DynamicConfig {
        let mut dynamic = DynamicConfig::default();
        for route in routes {
            let name = format!("sandbox-{}-{}", sandbox.id, route.domain.replace('.', "-"));
            dynamic.http.routers.insert(
                name.clone(),
                Router::new(traefik::host_rule(&route.domain), &name, &self.config),
            );
            dynamic.http.services.insert(
                name,
                Service::single(format!("http://{}:{}", sandbox.full_name(), route.port)),
            );
        }
        dynamic
    }

    /// Leave the ingress network unless an access sidecar still needs it.
    async fn detach_if_unused(&self, sandbox: &Sandbox) {
        let Some(instance) = sandbox.instance() else {
            return;
        };
        let dir = self.config.dynamic_dir();
        let sidecar_open = ["terminal", "vnc"]
            .iter()
            .any(|kind| dir.join(format!("{}-{}.yml", kind, sandbox.id)).exists());
        if sidecar_open {
            return;
        }
        if let Err(e) = self.ingress.detach(instance).await {
            warn!(
                "Failed to detach {} from {}: {}",
                sandbox.full_name(),
                self.ingress.network(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{running_sandbox, test_pool, FakeRuntime};
    use pretty_assertions::assert_eq;

    async fn setup() -> (
        tempfile::TempDir,
        Arc<FakeRuntime>,
        SandboxStorage,
        RouteManager,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(SandcastleConfig::with_data_dir(dir.path()));
        let runtime = Arc::new(FakeRuntime::new());
        let storage = SandboxStorage::new(test_pool().await);
        let routes = RouteManager::new(config, storage.clone(), runtime.clone());
        (dir, runtime, storage, routes)
    }

    #[tokio::test]
    async fn test_route_config_targets_sandbox_port() {
        let (_dir, runtime, storage, routes) = setup().await;
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;

        routes
            .add_route(&sandbox, "D.Example.com", 9000)
            .await
            .unwrap();

        let written = traefik::read_config(&routes.config_path(sandbox.id))
            .await
            .unwrap();
        let router = written.http.routers.values().next().unwrap();
        assert_eq!(router.rule, "Host(`d.example.com`)");
        let service = written.http.services.values().next().unwrap();
        assert_eq!(
            service.load_balancer.servers[0].url,
            "http://alice-dev:9000"
        );
        assert!(runtime
            .state_of("alice-dev")
            .unwrap()
            .is_attached_to("sandcastle-web"));

        routes.remove_route(&sandbox, "d.example.com").await.unwrap();
        assert!(!routes.config_path(sandbox.id).exists());
        assert!(!runtime
            .state_of("alice-dev")
            .unwrap()
            .is_attached_to("sandcastle-web"));
    }

    #[tokio::test]
    async fn test_domain_owned_elsewhere_conflicts() {
        let (_dir, runtime, storage, routes) = setup().await;
        let a = running_sandbox(&storage, &runtime, "alice", "a").await;
        let b = running_sandbox(&storage, &runtime, "alice", "b").await;

        routes.add_route(&a, "app.example.com", 8080).await.unwrap();
        let err = routes
            .add_route(&b, "app.example.com", 8080)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_same_domain_new_port_replaces() {
        let (_dir, runtime, storage, routes) = setup().await;
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;

        routes.add_route(&sandbox, "app.example.com", 8080).await.unwrap();
        routes.add_route(&sandbox, "app.example.com", 3000).await.unwrap();

        let listed = routes.list_routes(&sandbox).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].port, 3000);
    }

    #[tokio::test]
    async fn test_route_requires_running_sandbox() {
        let (_dir, runtime, storage, routes) = setup().await;
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        storage
            .update_status(sandbox.id, SandboxStatus::Stopped)
            .await
            .unwrap();
        let stopped = storage.get_sandbox(sandbox.id).await.unwrap();

        let err = routes
            .add_route(&stopped, "app.example.com", 8080)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }

    #[tokio::test]
    async fn test_suspend_and_reconnect_keep_records() {
        let (_dir, runtime, storage, routes) = setup().await;
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        routes.add_route(&sandbox, "app.example.com", 8080).await.unwrap();

        routes.suspend_routes(&sandbox).await.unwrap();
        assert!(!routes.config_path(sandbox.id).exists());
        assert_eq!(routes.list_routes(&sandbox).await.unwrap().len(), 1);

        routes.reconnect_routes(&sandbox).await.unwrap();
        assert!(routes.config_path(sandbox.id).exists());
    }

    #[tokio::test]
    async fn test_sync_removes_stale_files() {
        let (dir, runtime, storage, routes) = setup().await;
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        routes.add_route(&sandbox, "app.example.com", 8080).await.unwrap();

        let dynamic = dir.path().join("traefik").join("dynamic");
        tokio::fs::write(dynamic.join("sandbox-999.yml"), "http: {}\n")
            .await
            .unwrap();
        tokio::fs::remove_file(routes.config_path(sandbox.id))
            .await
            .unwrap();

        let written = routes.sync_all_configs().await.unwrap();

        assert_eq!(written, 1);
        assert!(!dynamic.join("sandbox-999.yml").exists());
        assert!(routes.config_path(sandbox.id).exists());
    }

    #[tokio::test]
    async fn test_sync_reattaches_lost_ingress() {
        let (_dir, runtime, storage, routes) = setup().await;
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        routes.add_route(&sandbox, "app.example.com", 8080).await.unwrap();
        runtime
            .remove_device("alice-dev", &routes.ingress().device())
            .await
            .unwrap();

        routes.sync_all_configs().await.unwrap();

        assert!(runtime
            .state_of("alice-dev")
            .unwrap()
            .is_attached_to("sandcastle-web"));
    }

    #[tokio::test]
    async fn test_re_adding_same_route_reattaches_ingress() {
        let (_dir, runtime, storage, routes) = setup().await;
        let sandbox = running_sandbox(&storage, &runtime, "alice", "dev").await;
        routes.add_route(&sandbox, "app.example.com", 8080).await.unwrap();
        routes.ingress().detach("alice-dev").await.unwrap();

        routes.add_route(&sandbox, "app.example.com", 8080).await.unwrap();

        assert!(runtime
            .state_of("alice-dev")
            .unwrap()
            .is_attached_to("sandcastle-web"));
        assert_eq!(routes.list_routes(&sandbox).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_web_config_self_signed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandcastleConfig::with_data_dir(dir.path());
        config.tls_mode = crate::config::TlsMode::SelfSigned;
        let routes = RouteManager::new(
            Arc::new(config),
            SandboxStorage::new(test_pool().await),
            Arc::new(FakeRuntime::new()),
        );

        let path = routes.write_web_config().await.unwrap();
        let written = traefik::read_config(&path).await.unwrap();
        let router = &written.http.routers["sandcastle-web"];

        assert_eq!(router.rule, "HostRegexp(`.+`)");
        assert_eq!(router.tls.cert_resolver, None);
        assert_eq!(
            written.http.services["sandcastle-web"].load_balancer.servers[0].url,
            "http://sandcastle-web:80"
        );
    }
}
