//! Ransomguard - endpoint ransomware containment agent
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (begins monitoring the protected tree)
//! sudo ransomguard start
//!
//! # Take an encrypted backup of the protected tree
//! sudo ransomguard backup
//!
//! # Check status
//! sudo ransomguard status
//! ```

use clap::{Parser, Subcommand};
use ransomguard::{daemon, Config};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ransomguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ransomguard/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Ransomguard daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the Ransomguard daemon
    Stop,

    /// Restart the Ransomguard daemon
    Restart,

    /// Check daemon status
    Status,

    /// Monitoring control
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },

    /// Create an encrypted backup
    Backup {
        /// Directory to back up (defaults to the protected root)
        path: Option<PathBuf>,
    },

    /// Restore a backup
    Restore {
        /// Backup id, as shown by `backups`
        backup_id: String,

        /// Restore into this directory instead of the original root
        #[arg(short, long)]
        destination: Option<PathBuf>,
    },

    /// List available backups
    Backups,

    /// List current alerts
    Alerts,

    /// List incidents
    Incidents,

    /// Acknowledge (close) a contained incident
    Ack {
        /// Incident id
        incident_id: u64,
    },

    /// Rotate the active backup key
    RotateKey,

    /// View activity logs
    Logs {
        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,

        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },

    /// Show configuration
    Config,
}

#[derive(Subcommand)]
enum MonitorAction {
    /// Start monitoring the protected tree
    Start,

    /// Stop monitoring
    Stop,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        if cli.config.exists() {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
        info!("Using default configuration");
        Config::default()
    });

    match cli.command {
        Commands::Start { foreground } => {
            info!("Starting Ransomguard daemon...");
            daemon::start(config, foreground).await?;
        }

        Commands::Stop => {
            info!("Stopping Ransomguard daemon...");
            daemon::stop(&config).await?;
        }

        Commands::Restart => {
            info!("Restarting Ransomguard daemon...");
            daemon::stop(&config).await?;
            daemon::start(config, false).await?;
        }

        Commands::Status => {
            daemon::status(&config).await?;
        }

        Commands::Monitor { action } => match action {
            MonitorAction::Start => {
                daemon::send_command(&config, daemon::Command::MonitorStart).await?;
            }
            MonitorAction::Stop => {
                daemon::send_command(&config, daemon::Command::MonitorStop).await?;
            }
        },

        Commands::Backup { path } => {
            let path = path.unwrap_or_else(|| config.protected.clone());
            info!("Backing up {:?}", path);
            daemon::send_command(&config, daemon::Command::Backup(path)).await?;
        }

        Commands::Restore {
            backup_id,
            destination,
        } => {
            info!("Restoring backup {}", backup_id);
            daemon::send_command(
                &config,
                daemon::Command::Restore {
                    backup_id,
                    destination,
                },
            )
            .await?;
        }

        Commands::Backups => {
            daemon::send_command(&config, daemon::Command::Backups).await?;
        }

        Commands::Alerts => {
            daemon::send_command(&config, daemon::Command::Alerts).await?;
        }

        Commands::Incidents => {
            daemon::send_command(&config, daemon::Command::Incidents).await?;
        }

        Commands::Ack { incident_id } => {
            daemon::send_command(&config, daemon::Command::Acknowledge(incident_id)).await?;
        }

        Commands::RotateKey => {
            daemon::send_command(&config, daemon::Command::RotateKey).await?;
        }

        Commands::Logs { lines, follow } => {
            daemon::show_logs(&config, lines, follow).await?;
        }

        Commands::Config => {
            println!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}
