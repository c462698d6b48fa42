// ABOUTME: Shared CLI helpers: sandbox target parsing, service bootstrap and table rendering
// ABOUTME: Request commands drain the job queue inline unless a server is expected to pick them up

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, ContentArrangement, Table};
use sandcastle_sandbox::{LogNotifier, Sandbox, SandboxStatus, Sandcastle, SandcastleConfig};
use std::path::Path;
use std::sync::Arc;

/// A sandbox addressed on the command line as `<owner>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub owner: String,
    pub name: String,
}

impl std::str::FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self {
                    owner: owner.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(format!("expected <owner>/<name>, got '{}'", s)),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Open the service from `SANDCASTLE_*` environment variables.
pub async fn open_service() -> Result<Sandcastle> {
    let config = SandcastleConfig::from_env().context("Invalid configuration")?;
    let service = Sandcastle::open(config, Arc::new(LogNotifier))
        .await
        .context("Failed to open Sandcastle")?;
    Ok(service)
}

pub async fn resolve(service: &Sandcastle, target: &Target) -> Result<Sandbox> {
    let owner = service.user(&target.owner).await?;
    Ok(service.sandbox(&owner, &target.name).await?)
}

/// Run queued work to completion, or leave it for a running server.
pub async fn settle(service: &Sandcastle, no_wait: bool) -> Result<()> {
    if no_wait {
        println!("{}", "Request queued; a running server will process it.".yellow());
        return Ok(());
    }
    service.workers().drain().await?;
    Ok(())
}

/// Report the outcome recorded on the sandbox after its job ran.
pub async fn report(service: &Sandcastle, sandbox_id: i64, done: &str) -> Result<Sandbox> {
    let sandbox = service.storage().get_sandbox(sandbox_id).await?;
    match (&sandbox.job_status, &sandbox.job_error) {
        (Some(kind), _) => println!(
            "{} {} is still {}",
            "⏳".yellow(),
            sandbox.full_name(),
            kind.as_str()
        ),
        (None, Some(error)) => return Err(anyhow!("{}", error)),
        (None, None) => println!("{} {}", "✅".green(), done),
    }
    Ok(sandbox)
}

pub fn read_key(key: Option<String>, file: Option<&Path>) -> Result<Option<String>> {
    match (key, file) {
        (Some(_), Some(_)) => Err(anyhow!("Pass either --ssh-key or --ssh-key-file, not both")),
        (Some(key), None) => Ok(Some(key.trim().to_string())),
        (None, Some(path)) => {
            let key = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(Some(key.trim().to_string()))
        }
        (None, None) => Ok(None),
    }
}

pub fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn status_label(status: SandboxStatus) -> ColoredString {
    match status {
        SandboxStatus::Running => status.as_str().green(),
        SandboxStatus::Stopped => status.as_str().yellow(),
        SandboxStatus::Pending => status.as_str().cyan(),
        SandboxStatus::Destroyed => status.as_str().red(),
    }
}

pub fn format_date(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M").to_string()
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

pub fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("—").to_string()
}
