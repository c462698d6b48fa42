// ABOUTME: Traefik dynamic configuration model and file materialization
// ABOUTME: Serializes routers, services and forward-auth middlewares into the file provider directory

use crate::config::{SandcastleConfig, TlsMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use tracing::debug;

pub const ENTRY_POINT: &str = "websecure";
pub const CERT_RESOLVER: &str = "letsencrypt";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, Router>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: BTreeMap<String, Middleware>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub rule: String,
    pub entry_points: Vec<String>,
    pub service: String,
    pub tls: Tls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
}

/// `{}` lets Traefik serve its default (self-signed) certificate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub load_balancer: LoadBalancer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Middleware {
    pub forward_auth: ForwardAuth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardAuth {
    pub address: String,
    pub trust_forward_header: bool,
}

impl Service {
    pub fn single(url: impl Into<String>) -> Self {
        Self {
            load_balancer: LoadBalancer {
                servers: vec![Server { url: url.into() }],
            },
        }
    }
}

impl Middleware {
    pub fn forward_auth(address: impl Into<String>) -> Self {
        Self {
            forward_auth: ForwardAuth {
                address: address.into(),
                trust_forward_header: true,
            },
        }
    }
}

impl Router {
    pub fn new(rule: String, service: impl Into<String>, config: &SandcastleConfig) -> Self {
        Self {
            rule,
            entry_points: vec![ENTRY_POINT.to_string()],
            service: service.into(),
            tls: tls_for(config.tls_mode),
            priority: None,
            middlewares: Vec::new(),
        }
    }
}

pub fn tls_for(mode: TlsMode) -> Tls {
    match mode {
        TlsMode::SelfSigned => Tls::default(),
        TlsMode::LetsEncrypt => Tls {
            cert_resolver: Some(CERT_RESOLVER.to_string()),
        },
    }
}

pub fn host_rule(domain: &str) -> String {
    format!("Host(`{}`)", domain)
}

/// Host match for the public host; any host when certificates are self-signed.
pub fn public_host_rule(config: &SandcastleConfig) -> String {
    if config.is_self_signed() {
        "HostRegexp(`.+`)".to_string()
    } else {
        host_rule(&config.host)
    }
}

pub fn render(config: &DynamicConfig) -> io::Result<String> {
    serde_yaml::to_string(config).map_err(io::Error::other)
}

/// Write via a temp file and rename so the proxy never reads a partial file.
pub async fn write_config(path: &Path, config: &DynamicConfig) -> io::Result<()> {
    let rendered = render(config)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("config.yml");
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    tokio::fs::write(&tmp, rendered).await?;
    tokio::fs::rename(&tmp, path).await?;

    debug!("Wrote proxy config {}", path.display());
    Ok(())
}

/// Delete a config file; a missing file is fine.
pub async fn remove_config(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed proxy config {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub async fn read_config(path: &Path) -> io::Result<DynamicConfig> {
    let raw = tokio::fs::read_to_string(path).await?;
    serde_yaml::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_router_yaml_shape() {
        let config = SandcastleConfig::with_data_dir("/data");
        let mut dynamic = DynamicConfig::default();
        dynamic.http.routers.insert(
            "web".to_string(),
            Router::new(public_host_rule(&config), "web", &config),
        );
        dynamic
            .http
            .services
            .insert("web".to_string(), Service::single("http://sandcastle-web:80"));

        let yaml = render(&dynamic).unwrap();

        assert!(yaml.contains("Host(`localhost`)"));
        assert!(yaml.contains("entryPoints:"));
        assert!(yaml.contains("- websecure"));
        assert!(yaml.contains("certResolver: letsencrypt"));
        assert!(yaml.contains("loadBalancer:"));
        assert!(!yaml.contains("middlewares"));
        assert!(!yaml.contains("priority"));
    }

    #[test]
    fn test_self_signed_uses_empty_tls_and_any_host() {
        let mut config = SandcastleConfig::with_data_dir("/data");
        config.tls_mode = TlsMode::SelfSigned;

        assert_eq!(public_host_rule(&config), "HostRegexp(`.+`)");
        let yaml = serde_yaml::to_string(&tls_for(config.tls_mode)).unwrap();
        assert_eq!(yaml.trim(), "{}");
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynamic").join("sandbox-1.yml");
        let mut dynamic = DynamicConfig::default();
        dynamic.http.middlewares.insert(
            "terminal-auth-1".to_string(),
            Middleware::forward_auth("http://sandcastle-web:80/terminal/auth"),
        );

        write_config(&path, &dynamic).await.unwrap();
        assert_eq!(read_config(&path).await.unwrap(), dynamic);
        assert!(!path.with_file_name(".sandbox-1.yml.tmp").exists());

        remove_config(&path).await.unwrap();
        remove_config(&path).await.unwrap();
        assert!(!path.exists());
    }
}
