// ABOUTME: CLI commands for the sandbox lifecycle, snapshots, routes and browser sidecars
// ABOUTME: Lifecycle requests go through the job queue and are drained inline by default

use super::utils::{
    format_date, format_size, new_table, or_dash, report, resolve, settle, status_label, Target,
};
use anyhow::Result;
use clap::Subcommand;
use colored::*;
use sandcastle_sandbox::{CreateSandboxRequest, SandboxFilter, Sandcastle, SidecarKind};

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Create and provision a sandbox
    Create {
        /// Sandbox to create, as <owner>/<name>
        target: Target,

        /// Image to run (default: SANDCASTLE_DEFAULT_IMAGE)
        #[arg(long)]
        image: Option<String>,

        /// Keep /workspace on a host volume that survives destroy
        #[arg(long)]
        persistent: bool,

        /// Mount the owner's shared home directory
        #[arg(long)]
        mount_home: bool,

        /// Mount a subdirectory of the owner's data area at /data
        #[arg(long)]
        data_path: Option<String>,

        /// Join the owner's mesh network once running (defaults to the owner's auto-connect setting)
        #[arg(long, conflicts_with = "no_mesh")]
        mesh: bool,

        /// Stay off the mesh even when the owner auto-connects
        #[arg(long)]
        no_mesh: bool,

        /// Mark the sandbox as throwaway
        #[arg(long)]
        temporary: bool,

        /// Queue the request without waiting for it
        #[arg(long)]
        no_wait: bool,
    },

    /// List sandboxes
    List {
        /// Only show sandboxes owned by this user
        #[arg(long)]
        user: Option<String>,

        /// Include destroyed sandboxes
        #[arg(long)]
        all: bool,
    },

    /// Show a sandbox in detail
    Show { target: Target },

    /// Start a stopped sandbox
    Start {
        target: Target,
        #[arg(long)]
        no_wait: bool,
    },

    /// Stop a running sandbox
    Stop {
        target: Target,
        #[arg(long)]
        no_wait: bool,
    },

    /// Destroy a sandbox and release its resources
    Destroy {
        target: Target,

        /// Leave the persistent volume on disk
        #[arg(long)]
        keep_volume: bool,

        #[arg(long)]
        no_wait: bool,
    },

    /// Print SSH connection details
    Connect { target: Target },

    /// Take a named snapshot (default name: current timestamp)
    Snapshot {
        target: Target,
        #[arg(long)]
        name: Option<String>,
    },

    /// List snapshots of a sandbox
    Snapshots { target: Target },

    /// Delete a snapshot
    DeleteSnapshot { target: Target, snapshot: String },

    /// Roll a sandbox back to a snapshot
    Restore {
        target: Target,
        snapshot: String,
        #[arg(long)]
        no_wait: bool,
    },
}

#[derive(Subcommand)]
pub enum RouteCommands {
    /// Publish a sandbox port on a domain
    Add {
        target: Target,
        domain: String,
        port: u32,
    },

    /// Remove a domain route
    Remove { target: Target, domain: String },

    /// List a sandbox's routes
    List { target: Target },
}

/// Shared shape of the `terminal` and `vnc` command groups.
#[derive(Subcommand)]
pub enum SidecarCommands {
    /// Launch the sidecar and print its URL
    Open {
        target: Target,
        #[arg(long)]
        no_wait: bool,
    },

    /// Tear the sidecar down
    Close { target: Target },
}

impl SandboxCommands {
    pub async fn execute(&self, service: &Sandcastle) -> Result<()> {
        match self {
            SandboxCommands::Create {
                target,
                image,
                persistent,
                mount_home,
                data_path,
                mesh,
                no_mesh,
                temporary,
                no_wait,
            } => {
                let owner = service.user(&target.owner).await?;
                let request = CreateSandboxRequest {
                    name: target.name.clone(),
                    image: image.clone(),
                    persistent_volume: *persistent,
                    mount_home: *mount_home,
                    data_path: data_path.clone(),
                    mesh: match (*mesh, *no_mesh) {
                        (true, _) => Some(true),
                        (_, true) => Some(false),
                        _ => None,
                    },
                    temporary: *temporary,
                };
                let sandbox = service.request_create(&owner, &request).await?;
                println!(
                    "📦 Creating {} on SSH port {}",
                    sandbox.full_name().cyan(),
                    sandbox.ssh_port
                );
                settle(service, *no_wait).await?;
                if !*no_wait {
                    report(service, sandbox.id, &format!("{} is ready", sandbox.full_name())).await?;
                }
            }
            SandboxCommands::List { user, all } => {
                let user_id = match user {
                    Some(name) => Some(service.user(name).await?.id),
                    None => None,
                };
                list_command(service, user_id, *all).await?;
            }
            SandboxCommands::Show { target } => {
                let sandbox = resolve(service, target).await?;
                println!("{}", format!("📦 {}", sandbox.full_name()).blue().bold());
                println!();
                println!("{:<15} {}", "ID:".cyan(), sandbox.id);
                println!("{:<15} {}", "Status:".cyan(), status_label(sandbox.status));
                println!("{:<15} {}", "Image:".cyan(), sandbox.image);
                println!("{:<15} {}", "SSH port:".cyan(), sandbox.ssh_port);
                println!("{:<15} {}", "Instance:".cyan(), or_dash(sandbox.instance()));
                println!("{:<15} {}", "Volume:".cyan(), or_dash(sandbox.volume_path.as_deref()));
                println!("{:<15} {}", "Home mount:".cyan(), sandbox.mount_home);
                println!("{:<15} {}", "Data path:".cyan(), or_dash(sandbox.data_path.as_deref()));
                println!("{:<15} {}", "Mesh:".cyan(), sandbox.mesh);
                println!("{:<15} {}", "Temporary:".cyan(), sandbox.temporary);
                println!(
                    "{:<15} {}",
                    "Job:".cyan(),
                    or_dash(sandbox.job_status.map(|k| k.as_str()))
                );
                if let Some(error) = &sandbox.job_error {
                    println!("{:<15} {}", "Last error:".cyan(), error.red());
                }
                println!("{:<15} {}", "Created:".cyan(), format_date(&sandbox.created_at));
            }
            SandboxCommands::Start { target, no_wait } => {
                let sandbox = resolve(service, target).await?;
                service.request_start(&sandbox).await?;
                settle(service, *no_wait).await?;
                if !*no_wait {
                    report(service, sandbox.id, &format!("{} started", sandbox.full_name())).await?;
                }
            }
            SandboxCommands::Stop { target, no_wait } => {
                let sandbox = resolve(service, target).await?;
                service.request_stop(&sandbox).await?;
                settle(service, *no_wait).await?;
                if !*no_wait {
                    report(service, sandbox.id, &format!("{} stopped", sandbox.full_name())).await?;
                }
            }
            SandboxCommands::Destroy {
                target,
                keep_volume,
                no_wait,
            } => {
                let sandbox = resolve(service, target).await?;
                service.request_destroy(&sandbox, *keep_volume).await?;
                settle(service, *no_wait).await?;
                if !*no_wait {
                    report(service, sandbox.id, &format!("{} destroyed", sandbox.full_name())).await?;
                }
            }
            SandboxCommands::Connect { target } => {
                let sandbox = resolve(service, target).await?;
                let info = service.connect_info(&sandbox).await?;
                println!("{:<15} {}", "Host:".cyan(), info.host);
                println!("{:<15} {}", "Port:".cyan(), info.port);
                println!("{:<15} {}", "User:".cyan(), info.user);
                println!("{:<15} {}", "Command:".cyan(), info.command.green());
                if let (Some(ip), Some(command)) = (&info.mesh_ip, &info.mesh_command) {
                    println!("{:<15} {}", "Mesh IP:".cyan(), ip);
                    println!("{:<15} {}", "Mesh command:".cyan(), command.green());
                }
            }
            SandboxCommands::Snapshot { target, name } => {
                let sandbox = resolve(service, target).await?;
                let snapshot = service.snapshot(&sandbox, name.as_deref()).await?;
                println!(
                    "{} Created snapshot {} of {}",
                    "✅".green(),
                    snapshot.name.cyan(),
                    sandbox.full_name()
                );
            }
            SandboxCommands::Snapshots { target } => {
                let sandbox = resolve(service, target).await?;
                let snapshots = service.list_snapshots(&sandbox).await?;
                if snapshots.is_empty() {
                    println!("{}", "No snapshots found.".yellow());
                    return Ok(());
                }
                let mut table = new_table();
                table.set_header(vec!["Name", "Created", "Size"]);
                for snapshot in &snapshots {
                    table.add_row(vec![
                        snapshot.name.clone(),
                        snapshot
                            .created_at
                            .as_ref()
                            .map(format_date)
                            .unwrap_or_else(|| "—".to_string()),
                        snapshot
                            .size_bytes
                            .map(format_size)
                            .unwrap_or_else(|| "—".to_string()),
                    ]);
                }
                println!("{}", table);
            }
            SandboxCommands::DeleteSnapshot { target, snapshot } => {
                let sandbox = resolve(service, target).await?;
                service.delete_snapshot(&sandbox, snapshot).await?;
                println!("{} Deleted snapshot {}", "✅".green(), snapshot);
            }
            SandboxCommands::Restore {
                target,
                snapshot,
                no_wait,
            } => {
                let sandbox = resolve(service, target).await?;
                service.request_restore(&sandbox, snapshot).await?;
                settle(service, *no_wait).await?;
                if !*no_wait {
                    report(
                        service,
                        sandbox.id,
                        &format!("{} restored from {}", sandbox.full_name(), snapshot),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}

async fn list_command(service: &Sandcastle, user_id: Option<i64>, all: bool) -> Result<()> {
    let sandboxes = service
        .list_sandboxes(&SandboxFilter {
            user_id,
            include_destroyed: all,
            ..Default::default()
        })
        .await?;

    if sandboxes.is_empty() {
        println!("{}", "No sandboxes found.".yellow());
        return Ok(());
    }

    println!("{}", "📦 Sandboxes".blue().bold());
    println!();

    let mut table = new_table();
    table.set_header(vec!["ID", "Sandbox", "Status", "Job", "SSH", "Image", "Created"]);
    for sandbox in &sandboxes {
        table.add_row(vec![
            sandbox.id.to_string(),
            sandbox.full_name(),
            sandbox.status.as_str().to_string(),
            or_dash(sandbox.job_status.map(|k| k.as_str())),
            sandbox.ssh_port.to_string(),
            sandbox.image.clone(),
            format_date(&sandbox.created_at),
        ]);
    }

    println!("{}", table);
    println!("Total: {} sandboxes", sandboxes.len().to_string().cyan());
    Ok(())
}

impl RouteCommands {
    pub async fn execute(&self, service: &Sandcastle) -> Result<()> {
        match self {
            RouteCommands::Add {
                target,
                domain,
                port,
            } => {
                let sandbox = resolve(service, target).await?;
                let route = service.add_route(&sandbox, domain, *port).await?;
                println!(
                    "{} {} → {}:{}",
                    "✅".green(),
                    route.domain.cyan(),
                    sandbox.full_name(),
                    route.port
                );
            }
            RouteCommands::Remove { target, domain } => {
                let sandbox = resolve(service, target).await?;
                service.remove_route(&sandbox, domain).await?;
                println!("{} Removed route {}", "✅".green(), domain);
            }
            RouteCommands::List { target } => {
                let sandbox = resolve(service, target).await?;
                let routes = service.list_routes(&sandbox).await?;
                if routes.is_empty() {
                    println!("{}", "No routes found.".yellow());
                    return Ok(());
                }
                let mut table = new_table();
                table.set_header(vec!["Domain", "Port", "Created"]);
                for route in &routes {
                    table.add_row(vec![
                        route.domain.clone(),
                        route.port.to_string(),
                        format_date(&route.created_at),
                    ]);
                }
                println!("{}", table);
            }
        }
        Ok(())
    }
}

impl SidecarCommands {
    pub async fn execute(&self, service: &Sandcastle, kind: SidecarKind) -> Result<()> {
        match self {
            SidecarCommands::Open { target, no_wait } => {
                let sandbox = resolve(service, target).await?;
                match kind {
                    SidecarKind::Terminal => service.request_open_terminal(&sandbox).await?,
                    SidecarKind::Vnc => service.request_open_vnc(&sandbox).await?,
                }
                settle(service, *no_wait).await?;
                if !*no_wait {
                    report(service, sandbox.id, "Sidecar is up").await?;
                }
                let url = match kind {
                    SidecarKind::Terminal => service.terminal_url(&sandbox),
                    SidecarKind::Vnc => service.vnc_url(&sandbox),
                };
                println!(
                    "{:<15} {}",
                    "URL:".cyan(),
                    format!("https://{}{}", service.config().host, url).green()
                );
            }
            SidecarCommands::Close { target } => {
                let sandbox = resolve(service, target).await?;
                match kind {
                    SidecarKind::Terminal => service.close_terminal(&sandbox).await,
                    SidecarKind::Vnc => service.close_vnc(&sandbox).await,
                }
                println!("{} Closed", "✅".green());
            }
        }
        Ok(())
    }
}
