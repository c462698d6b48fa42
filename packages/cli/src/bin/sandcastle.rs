// ABOUTME: Entry point for the sandcastle command-line tool
// ABOUTME: Runs the background services or issues one-shot sandbox, user, route and mesh commands

use clap::{Parser, Subcommand};
use colored::*;
use std::process;

mod cli;

use cli::mesh::MeshCommands;
use cli::sandbox::{RouteCommands, SandboxCommands, SidecarCommands};
use cli::users::UserCommands;
use cli::utils::{new_table, open_service};
use sandcastle_sandbox::SidecarKind;

#[derive(Parser)]
#[command(name = "sandcastle")]
#[command(about = "Sandcastle - per-user development sandboxes on Docker or Incus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job workers and the reconciler until interrupted
    Serve,
    /// Show runtime health, sandbox counts and queue depth
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one reconciliation pass against the runtime
    Reconcile,
    /// Fail jobs stuck longer than SANDCASTLE_STUCK_JOB_MINUTES
    Reap,
    /// Manage users
    #[command(subcommand)]
    User(UserCommands),
    /// Manage sandboxes
    #[command(subcommand)]
    Sandbox(SandboxCommands),
    /// Manage domain routes
    #[command(subcommand)]
    Route(RouteCommands),
    /// Manage mesh networking
    #[command(subcommand)]
    Mesh(MeshCommands),
    /// Browser terminal sidecar
    #[command(subcommand)]
    Terminal(SidecarCommands),
    /// Browser desktop sidecar
    #[command(subcommand)]
    Vnc(SidecarCommands),
}

#[tokio::main]
async fn main() {
    // Load .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let service = open_service().await?;

    match command {
        Commands::Serve => {
            service.start().await?;
            println!("🚀 Sandcastle is running. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await?;
            println!("🛑 Shutting down...");
            service.shutdown().await;
        }
        Commands::Status { json } => {
            let status = service.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            println!("{}", "🏰 Sandcastle".blue().bold());
            println!();
            match (&status.runtime, &status.runtime_error) {
                (Some(info), _) => {
                    println!(
                        "{:<15} {} {}",
                        "Runtime:".cyan(),
                        info.backend,
                        info.version.green()
                    );
                    if let (Some(total), Some(running)) = (info.instances, info.instances_running)
                    {
                        println!("{:<15} {} ({} running)", "Instances:".cyan(), total, running);
                    }
                }
                (None, Some(error)) => println!(
                    "{:<15} {} {}",
                    "Runtime:".cyan(),
                    status.backend,
                    format!("unavailable: {}", error).red()
                ),
                (None, None) => println!("{:<15} {}", "Runtime:".cyan(), status.backend),
            }
            println!("{:<15} {}", "Queued jobs:".cyan(), status.queued_jobs);
            println!();

            let mut table = new_table();
            table.set_header(vec!["Status", "Sandboxes"]);
            for (state, count) in &status.sandboxes {
                table.add_row(vec![state.clone(), count.to_string()]);
            }
            println!("{}", table);

            if !status.is_healthy() {
                anyhow::bail!("runtime is unreachable");
            }
        }
        Commands::Reconcile => {
            let report = service.reconcile().await?;
            println!("{} Reconciled {} sandboxes", "✅".green(), report.checked);
            println!("{:<20} {}", "Skipped (busy):".cyan(), report.skipped_busy);
            println!("{:<20} {}", "Marked destroyed:".cyan(), report.marked_destroyed);
            println!("{:<20} {}", "Status corrected:".cyan(), report.status_corrected);
            println!("{:<20} {}", "Mesh flags reset:".cyan(), report.mesh_reset);
            println!("{:<20} {}", "Route configs:".cyan(), report.route_configs);
            println!("{:<20} {}", "Orphaned sidecars:".cyan(), report.orphaned_sidecars);
            if report.errors > 0 {
                println!("{:<20} {}", "Errors:".cyan(), report.errors.to_string().red());
            }
        }
        Commands::Reap => {
            let reaped = service.reap_stuck_jobs().await?;
            println!("{} Failed {} stuck jobs", "✅".green(), reaped);
        }
        Commands::User(cmd) => cmd.execute(&service).await?,
        Commands::Sandbox(cmd) => cmd.execute(&service).await?,
        Commands::Route(cmd) => cmd.execute(&service).await?,
        Commands::Mesh(cmd) => cmd.execute(&service).await?,
        Commands::Terminal(cmd) => cmd.execute(&service, SidecarKind::Terminal).await?,
        Commands::Vnc(cmd) => cmd.execute(&service, SidecarKind::Vnc).await?,
    }

    Ok(())
}
