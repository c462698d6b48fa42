// ABOUTME: CLI commands for a user's private mesh network and sandbox membership
// ABOUTME: Supports both auth-key enrollment and the interactive login flow

use super::utils::{new_table, or_dash, resolve, Target};
use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use colored::*;
use sandcastle_sandbox::{LoginStatus, Sandcastle};

#[derive(Clone, Copy, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
pub enum MeshCommands {
    /// Enable the mesh for a user with a pre-issued auth key
    Enable {
        user: String,
        #[arg(long)]
        auth_key: String,
    },

    /// Start an interactive login and print the login URL once available
    Login { user: String },

    /// Check progress of an interactive login
    Check { user: String },

    /// Tear down a user's mesh and detach their sandboxes
    Disable { user: String },

    /// Show mesh state for a user
    Status { user: String },

    /// Choose whether new sandboxes join the user's mesh by default
    AutoConnect {
        user: String,
        #[arg(value_enum)]
        setting: Toggle,
    },

    /// Attach a sandbox to its owner's mesh network
    Connect { target: Target },

    /// Detach a sandbox from its owner's mesh network
    Disconnect { target: Target },
}

impl MeshCommands {
    pub async fn execute(&self, service: &Sandcastle) -> Result<()> {
        match self {
            MeshCommands::Enable { user, auth_key } => {
                let user = service.user(user).await?;
                let user = service.mesh_enable(&user, auth_key).await?;
                println!(
                    "{} Mesh enabled for {} on {}",
                    "✅".green(),
                    user.name.cyan(),
                    or_dash(user.mesh_network.as_deref())
                );
            }
            MeshCommands::Login { user } => {
                let user = service.user(user).await?;
                let status = service.mesh_start_login(&user).await?;
                print_login(&status);
            }
            MeshCommands::Check { user } => {
                let user = service.user(user).await?;
                let status = service.mesh_check_login(&user).await?;
                print_login(&status);
            }
            MeshCommands::Disable { user } => {
                let user = service.user(user).await?;
                service.mesh_disable(&user).await?;
                println!("{} Mesh disabled for {}", "✅".green(), user.name.cyan());
            }
            MeshCommands::Status { user } => {
                let user = service.user(user).await?;
                let status = service.mesh_status(&user).await?;
                println!("{}", format!("🕸  Mesh for {}", user.name).blue().bold());
                println!();
                println!("{:<15} {}", "State:".cyan(), status.state.as_str());
                println!(
                    "{:<15} {}",
                    "Sidecar:".cyan(),
                    if status.running {
                        format!("{} (running)", status.sidecar).green()
                    } else {
                        format!("{} (stopped)", status.sidecar).yellow()
                    }
                );
                println!("{:<15} {}", "Network:".cyan(), or_dash(status.network.as_deref()));
                println!("{:<15} {}", "Subnet:".cyan(), or_dash(status.subnet.as_deref()));
                println!("{:<15} {}", "IP:".cyan(), or_dash(status.ip.as_deref()));
                println!("{:<15} {}", "Hostname:".cyan(), or_dash(status.hostname.as_deref()));
                println!("{:<15} {}", "Tailnet:".cyan(), or_dash(status.tailnet.as_deref()));
                if let Some(online) = status.online {
                    println!("{:<15} {}", "Online:".cyan(), online);
                }
                if !status.sandboxes.is_empty() {
                    println!();
                    let mut table = new_table();
                    table.set_header(vec!["Sandbox", "Mesh IP"]);
                    for sandbox in &status.sandboxes {
                        table.add_row(vec![sandbox.name.clone(), or_dash(sandbox.ip.as_deref())]);
                    }
                    println!("{}", table);
                }
            }
            MeshCommands::AutoConnect { user, setting } => {
                let user = service.user(user).await?;
                let enabled = matches!(setting, Toggle::On);
                let user = service.mesh_set_auto_connect(&user, enabled).await?;
                println!(
                    "{} New sandboxes of {} {} the mesh by default",
                    "✅".green(),
                    user.name.cyan(),
                    if user.mesh_auto_connect { "join" } else { "stay off" }
                );
            }
            MeshCommands::Connect { target } => {
                let sandbox = resolve(service, target).await?;
                service.mesh_connect(&sandbox).await?;
                println!("{} {} joined the mesh", "✅".green(), sandbox.full_name().cyan());
            }
            MeshCommands::Disconnect { target } => {
                let sandbox = resolve(service, target).await?;
                service.mesh_disconnect(&sandbox).await?;
                println!("{} {} left the mesh", "✅".green(), sandbox.full_name().cyan());
            }
        }
        Ok(())
    }
}

fn print_login(status: &LoginStatus) {
    match status {
        LoginStatus::Starting => println!("{}", "⏳ Mesh sidecar is starting".yellow()),
        LoginStatus::WaitingForUrl => {
            println!("{}", "⏳ Waiting for a login URL; run `mesh check` again".yellow())
        }
        LoginStatus::LoginReady { url } => {
            println!("🔗 Open this URL to authenticate:");
            println!("   {}", url.green());
        }
        LoginStatus::Authenticated {
            ip,
            hostname,
            tailnet,
        } => {
            println!("{} Authenticated", "✅".green());
            println!("{:<15} {}", "IP:".cyan(), or_dash(ip.as_deref()));
            println!("{:<15} {}", "Hostname:".cyan(), or_dash(hostname.as_deref()));
            println!("{:<15} {}", "Tailnet:".cyan(), or_dash(tailnet.as_deref()));
        }
    }
}
