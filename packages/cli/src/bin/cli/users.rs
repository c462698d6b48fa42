// ABOUTME: CLI commands for registering users and managing their SSH keys
// ABOUTME: Keys can be passed inline or read from a public key file

use super::utils::{format_date, or_dash, read_key};
use anyhow::{bail, Result};
use clap::Subcommand;
use colored::*;
use sandcastle_sandbox::Sandcastle;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum UserCommands {
    /// Register a user
    Add {
        name: String,

        /// SSH public key installed in the user's sandboxes
        #[arg(long)]
        ssh_key: Option<String>,

        /// Read the SSH public key from a file
        #[arg(long)]
        ssh_key_file: Option<PathBuf>,

        #[arg(long)]
        admin: bool,
    },

    /// Replace or clear a user's SSH key
    SetKey {
        name: String,

        #[arg(long)]
        ssh_key: Option<String>,

        #[arg(long)]
        ssh_key_file: Option<PathBuf>,

        /// Remove the stored key
        #[arg(long)]
        clear: bool,
    },

    /// Show a user
    Show { name: String },
}

impl UserCommands {
    pub async fn execute(&self, service: &Sandcastle) -> Result<()> {
        match self {
            UserCommands::Add {
                name,
                ssh_key,
                ssh_key_file,
                admin,
            } => {
                let key = read_key(ssh_key.clone(), ssh_key_file.as_deref())?;
                let user = service.add_user(name, key.as_deref(), *admin).await?;
                println!("{} Added user {}", "✅".green(), user.name.cyan());
            }
            UserCommands::SetKey {
                name,
                ssh_key,
                ssh_key_file,
                clear,
            } => {
                let key = read_key(ssh_key.clone(), ssh_key_file.as_deref())?;
                if key.is_none() && !*clear {
                    bail!("Pass --ssh-key, --ssh-key-file or --clear");
                }
                if key.is_some() && *clear {
                    bail!("--clear cannot be combined with a key");
                }
                let user = service.user(name).await?;
                service.set_ssh_key(&user, key.as_deref()).await?;
                println!("{} Updated SSH key for {}", "✅".green(), name.cyan());
                println!(
                    "{}",
                    "Running sandboxes pick up the new key on their next restore or recreate."
                        .yellow()
                );
            }
            UserCommands::Show { name } => {
                let user = service.user(name).await?;
                println!("{}", format!("👤 {}", user.name).blue().bold());
                println!();
                println!("{:<15} {}", "ID:".cyan(), user.id);
                println!("{:<15} {}", "Admin:".cyan(), user.admin);
                println!(
                    "{:<15} {}",
                    "SSH key:".cyan(),
                    if user.ssh_public_key.is_some() { "set" } else { "—" }
                );
                println!("{:<15} {}", "Mesh:".cyan(), user.mesh_state.as_str());
                println!(
                    "{:<15} {}",
                    "Mesh network:".cyan(),
                    or_dash(user.mesh_network.as_deref())
                );
                println!("{:<15} {}", "Created:".cyan(), format_date(&user.created_at));
            }
        }
        Ok(())
    }
}
