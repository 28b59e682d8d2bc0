//! Fleet CLI - inspect cluster profiles and aggregate groups.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleet::FleetConfig;

/// Fleet CLI - multi-cluster profile management.
#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Inspect virtualization cluster profiles and groups")]
#[command(version)]
struct Cli {
    /// Configuration file (or set `FLEET_CONFIG` env var).
    #[arg(long, env = "FLEET_CONFIG", default_value = "fleet.yaml")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the configuration for settings that cannot work.
    Validate,

    /// List configured profiles.
    Profiles,

    /// List aggregate groups and their member profiles.
    Groups {
        /// Show only this group.
        #[arg(long)]
        name: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = FleetConfig::load(&cli.config)?;

    match cli.command {
        Commands::Validate => {
            config.validate()?;
            info!(path = %cli.config.display(), "Configuration is valid");
            println!(
                "✅ {} is valid ({} profiles, {} groups)",
                cli.config.display(),
                config.profiles.len(),
                config.groups().len()
            );
        }

        Commands::Profiles => {
            println!(
                "\n{:<16} {:<40} {:<16} {:<8} {:<20}",
                "NAME", "ADDRESS", "USER", "AUTH", "GROUPS"
            );
            println!("{}", "-".repeat(100));
            for profile in config.profiles.values() {
                let auth = if profile.token_id.is_some() {
                    "token"
                } else if profile.password.is_some() {
                    "password"
                } else {
                    "none"
                };
                let marker = if config.default_profile.as_deref() == Some(profile.name.as_str()) {
                    "*"
                } else {
                    ""
                };
                println!(
                    "{:<16} {:<40} {:<16} {:<8} {:<20}",
                    format!("{}{marker}", profile.name),
                    profile.addr,
                    format!("{}@{}", profile.user, profile.realm),
                    auth,
                    profile.groups.join(",")
                );
            }
        }

        Commands::Groups { name } => {
            let groups = config.groups();
            if let Some(name) = &name {
                if !groups.contains_key(name) {
                    bail!("group '{name}' is not defined");
                }
            }

            println!("\n{:<20} {:<8} {:<50}", "GROUP", "COUNT", "PROFILES");
            println!("{}", "-".repeat(80));
            for (group, members) in &groups {
                if name.as_ref().is_some_and(|n| n != group) {
                    continue;
                }
                println!("{:<20} {:<8} {:<50}", group, members.len(), members.join(", "));
            }
        }
    }

    Ok(())
}
