// ABOUTME: Deployment configuration loaded once from the environment
// ABOUTME: Holds backend selection, image names, timing knobs and derives every on-disk path

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidNumber { key: String, value: String },
    #[error("Invalid boolean for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("Invalid TLS mode: {0} (expected letsencrypt or selfsigned)")]
    InvalidTlsMode(String),
    #[error("Invalid runtime backend: {0} (expected docker or incus)")]
    InvalidRuntime(String),
    #[error("{0} must be greater than zero")]
    Zero(String),
    #[error("INCUS_CLIENT_CERT and INCUS_CLIENT_KEY must be set together")]
    IncompleteIncusIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    LetsEncrypt,
    SelfSigned,
}

impl FromStr for TlsMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "letsencrypt" => Ok(TlsMode::LetsEncrypt),
            "selfsigned" => Ok(TlsMode::SelfSigned),
            _ => Err(ConfigError::InvalidTlsMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeBackend {
    Docker,
    Incus,
}

impl FromStr for RuntimeBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(RuntimeBackend::Docker),
            "incus" => Ok(RuntimeBackend::Incus),
            _ => Err(ConfigError::InvalidRuntime(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandcastleConfig {
    pub data_dir: PathBuf,
    /// Public host name of the web layer
    pub host: String,
    pub tls_mode: TlsMode,
    pub runtime: RuntimeBackend,

    pub default_image: String,
    pub ingress_network: String,
    /// Upstream of the web layer, also the forward-auth target
    pub web_backend: String,
    pub wetty_image: String,
    pub novnc_image: String,
    pub mesh_image: String,
    /// OCI runtime for nested sandboxes on Docker; `None` uses the engine default
    pub docker_runtime: Option<String>,

    pub incus_url: String,
    pub incus_client_cert: Option<PathBuf>,
    pub incus_client_key: Option<PathBuf>,
    pub incus_accept_invalid_certs: bool,

    pub reconcile_interval: Duration,
    pub stuck_job_minutes: u64,
    pub workers: usize,
    pub operation_timeout: Duration,
    pub database_url: String,

    /// Wait for the reverse proxy to pick up new sidecar routes before returning URLs
    pub propagation_delay: bool,
}

impl Default for SandcastleConfig {
    fn default() -> Self {
        Self::with_data_dir("/data")
    }
}

impl SandcastleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = get("SANDCASTLE_DATA_DIR").unwrap_or_else(|| "/data".to_string());
        let mut config = Self::with_data_dir(&data_dir);

        if let Some(host) = get("SANDCASTLE_HOST") {
            config.host = host;
        }
        if let Some(mode) = get("SANDCASTLE_TLS_MODE") {
            config.tls_mode = mode.parse()?;
        }
        if let Some(runtime) = get("SANDCASTLE_RUNTIME") {
            config.runtime = runtime.parse()?;
        }
        if let Some(image) = get("SANDCASTLE_DEFAULT_IMAGE") {
            config.default_image = image;
        }
        if let Some(network) = get("SANDCASTLE_INGRESS_NETWORK") {
            config.ingress_network = network;
        }
        if let Some(backend) = get("SANDCASTLE_WEB_BACKEND") {
            config.web_backend = backend.trim_end_matches('/').to_string();
        }
        if let Some(image) = get("SANDCASTLE_WETTY_IMAGE") {
            config.wetty_image = image;
        }
        if let Some(image) = get("SANDCASTLE_NOVNC_IMAGE") {
            config.novnc_image = image;
        }
        if let Some(image) = get("SANDCASTLE_MESH_IMAGE") {
            config.mesh_image = image;
        }
        // Present-but-empty disables the nested runtime.
        if let Some(runtime) = lookup("SANDCASTLE_DOCKER_RUNTIME") {
            let runtime = runtime.trim().to_string();
            config.docker_runtime = if runtime.is_empty() { None } else { Some(runtime) };
        }

        if let Some(url) = get("INCUS_URL") {
            config.incus_url = url.trim_end_matches('/').to_string();
        }
        config.incus_client_cert = get("INCUS_CLIENT_CERT").map(PathBuf::from);
        config.incus_client_key = get("INCUS_CLIENT_KEY").map(PathBuf::from);
        if config.incus_client_cert.is_some() != config.incus_client_key.is_some() {
            return Err(ConfigError::IncompleteIncusIdentity);
        }
        if let Some(raw) = get("INCUS_ACCEPT_INVALID_CERTS") {
            config.incus_accept_invalid_certs = parse_bool("INCUS_ACCEPT_INVALID_CERTS", &raw)?;
        }

        if let Some(raw) = get("SANDCASTLE_RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval =
                Duration::from_secs(parse_positive("SANDCASTLE_RECONCILE_INTERVAL_SECS", &raw)?);
        }
        if let Some(raw) = get("SANDCASTLE_STUCK_JOB_MINUTES") {
            config.stuck_job_minutes = parse_positive("SANDCASTLE_STUCK_JOB_MINUTES", &raw)?;
        }
        if let Some(raw) = get("SANDCASTLE_WORKERS") {
            config.workers = parse_positive("SANDCASTLE_WORKERS", &raw)? as usize;
        }
        if let Some(raw) = get("SANDCASTLE_OPERATION_TIMEOUT_SECS") {
            config.operation_timeout =
                Duration::from_secs(parse_positive("SANDCASTLE_OPERATION_TIMEOUT_SECS", &raw)?);
        }
        if let Some(url) = get("SANDCASTLE_DATABASE_URL") {
            config.database_url = url;
        }

        Ok(config)
    }

    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let database_url = format!("sqlite:{}", data_dir.join("sandcastle.db").display());

        Self {
            data_dir,
            host: "localhost".to_string(),
            tls_mode: TlsMode::LetsEncrypt,
            runtime: RuntimeBackend::Docker,
            default_image: "sandcastle-sandbox:latest".to_string(),
            ingress_network: "sandcastle-web".to_string(),
            web_backend: "http://sandcastle-web:80".to_string(),
            wetty_image: "wettyoss/wetty:latest".to_string(),
            novnc_image: "theasp/novnc:latest".to_string(),
            mesh_image: "sandcastle-tailscale".to_string(),
            docker_runtime: Some("sysbox-runc".to_string()),
            incus_url: "https://127.0.0.1:8443".to_string(),
            incus_client_cert: None,
            incus_client_key: None,
            incus_accept_invalid_certs: false,
            reconcile_interval: Duration::from_secs(60),
            stuck_job_minutes: 5,
            workers: 4,
            operation_timeout: Duration::from_secs(30),
            database_url,
            propagation_delay: true,
        }
    }

    pub fn is_self_signed(&self) -> bool {
        self.tls_mode == TlsMode::SelfSigned
    }

    /// Directory watched by the reverse proxy's file provider.
    pub fn dynamic_dir(&self) -> PathBuf {
        self.data_dir.join("traefik").join("dynamic")
    }

    pub fn user_home_dir(&self, owner: &str) -> PathBuf {
        self.data_dir.join("users").join(owner).join("home")
    }

    pub fn user_data_dir(&self, owner: &str, data_path: &str) -> PathBuf {
        self.data_dir
            .join("users")
            .join(owner)
            .join("data")
            .join(data_path)
    }

    pub fn volume_dir(&self, full_name: &str) -> PathBuf {
        self.data_dir.join("sandboxes").join(full_name).join("vol")
    }

    pub fn wetty_root(&self) -> PathBuf {
        self.data_dir.join("wetty")
    }

    pub fn wetty_key_dir(&self, full_name: &str) -> PathBuf {
        self.wetty_root().join(full_name)
    }

    /// Forward-auth endpoint for a sidecar auth path like `/terminal/auth`.
    pub fn auth_url(&self, auth_path: &str) -> String {
        format!("{}{}", self.web_backend, auth_path)
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, ConfigError> {
    let value = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: raw.to_string(),
        })?;
    if value == 0 {
        return Err(ConfigError::Zero(key.to_string()));
    }
    Ok(value)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Convenience for tests and tools that assemble config from pairs.
pub fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}
