//! Daemon management for Ransomguard

use crate::backup::{BackupManifest, RestoreReport};
use crate::config::Config;
use crate::detect::Alert;
use crate::incident::Incident;
use crate::Agent;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info};

/// Commands that can be sent to the daemon
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Command {
    /// Start monitoring the protected tree
    MonitorStart,
    /// Stop monitoring
    MonitorStop,
    /// Create an encrypted backup of a directory
    Backup(PathBuf),
    /// Restore a backup, optionally into a different root
    Restore {
        backup_id: String,
        destination: Option<PathBuf>,
    },
    /// List available backups
    Backups,
    /// List current alerts
    Alerts,
    /// List incidents
    Incidents,
    /// Acknowledge (close) an incident
    Acknowledge(u64),
    /// Rotate the active backup key
    RotateKey,
    /// Get current status
    Status,
    /// Shutdown the daemon
    Shutdown,
}

/// Response from daemon
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    Status(DaemonStatus),
    Alerts(Vec<Alert>),
    Incidents(Vec<Incident>),
    Backups(Vec<BackupManifest>),
    BackupCreated(BackupManifest),
    Restored(RestoreReport),
    KeyRotated(String),
}

/// Daemon status information
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: u32,
    pub monitoring: bool,
    pub protected: PathBuf,
    pub alerts: usize,
    pub incidents: usize,
}

/// Start the Ransomguard daemon
pub async fn start(config: Config, foreground: bool) -> anyhow::Result<()> {
    if is_running(&config) {
        anyhow::bail!("Ransomguard is already running");
    }

    if !foreground {
        daemonize(&config)?;
    }

    write_pid_file(&config.daemon.pid_file)?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    let _ = std::fs::remove_file(&config.daemon.socket);
    let listener = UnixListener::bind(&config.daemon.socket)?;

    info!(
        "Ransomguard daemon started, listening on {:?}",
        config.daemon.socket
    );

    let agent = Agent::new(config.clone())?;

    if let Err(e) = agent.start_monitoring() {
        error!("Failed to start monitoring at startup: {e}");
    }

    loop {
        tokio::select! {
            Ok((stream, _)) = listener.accept() => {
                match handle_client(stream, &agent).await {
                    Ok(true) => {
                        info!("Shutdown requested over IPC");
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => error!("IPC client error: {e}"),
                }
            }

            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }

            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
        }
    }

    agent.stop_monitoring();
    cleanup(&config);

    Ok(())
}

/// Stop the Ransomguard daemon
pub async fn stop(config: &Config) -> anyhow::Result<()> {
    if !is_running(config) {
        println!("Ransomguard is not running");
        return Ok(());
    }

    let pid = read_pid_file(&config.daemon.pid_file)?;

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    )?;

    println!("Sent shutdown signal to Ransomguard (PID {})", pid);

    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if !is_running(config) {
            println!("Ransomguard stopped");
            return Ok(());
        }
    }

    println!("Ransomguard did not stop gracefully, sending SIGKILL");
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )?;

    Ok(())
}

/// Check daemon status
pub async fn status(config: &Config) -> anyhow::Result<()> {
    if !is_running(config) {
        println!("Ransomguard is not running");
        return Ok(());
    }

    if let Err(e) = send_command(config, Command::Status).await {
        println!("Ransomguard is running but not responding: {}", e);
    }

    Ok(())
}

/// Send a command to the running daemon and print the response
pub async fn send_command(config: &Config, cmd: Command) -> anyhow::Result<()> {
    let mut stream = UnixStream::connect(&config.daemon.socket).await?;

    let cmd_bytes = serde_json::to_vec(&cmd)?;
    let len = cmd_bytes.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(&cmd_bytes).await?;

    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut response_bytes = vec![0u8; len];
    stream.read_exact(&mut response_bytes).await?;

    let response: Response = serde_json::from_slice(&response_bytes)?;

    match response {
        Response::Ok => println!("OK"),
        Response::Error(e) => println!("Error: {}", e),
        Response::Status(status) => print_status(&status),
        Response::Alerts(alerts) => print_alerts(&alerts),
        Response::Incidents(incidents) => print_incidents(&incidents),
        Response::Backups(manifests) => {
            println!("Backups:");
            for m in manifests {
                println!(
                    "  {}  {}  {} files  (key {})",
                    m.backup_id,
                    m.created_at.format("%Y-%m-%d %H:%M:%S"),
                    m.entries.len(),
                    &m.key_fingerprint[..16.min(m.key_fingerprint.len())],
                );
            }
        }
        Response::BackupCreated(m) => {
            println!("Backup {} committed ({} files)", m.backup_id, m.entries.len());
        }
        Response::Restored(report) => {
            println!(
                "Restore of {}: {} restored, {} failed",
                report.backup_id,
                report.restored.len(),
                report.failed.len()
            );
            for failure in &report.failed {
                println!(
                    "  FAILED {:?}: {}",
                    failure.relative_path, failure.detail
                );
            }
        }
        Response::KeyRotated(fingerprint) => {
            println!("Active backup key is now {}", &fingerprint[..16]);
        }
    }

    Ok(())
}

/// Show daemon logs
pub async fn show_logs(config: &Config, lines: usize, follow: bool) -> anyhow::Result<()> {
    let log_path = &config.daemon.log_file;

    if !log_path.exists() {
        println!("No log file found at {:?}", log_path);
        return Ok(());
    }

    if follow {
        let mut cmd = tokio::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(log_path)
            .spawn()?;

        cmd.wait().await?;
    } else {
        let output = tokio::process::Command::new("tail")
            .args(["-n", &lines.to_string()])
            .arg(log_path)
            .output()
            .await?;

        print!("{}", String::from_utf8_lossy(&output.stdout));
    }

    Ok(())
}

// Helper functions

/// Serve one IPC client. Returns `true` when the client asked for shutdown;
/// the response frame is always written first so the client sees the
/// acknowledgment before the daemon exits.
async fn handle_client(mut stream: UnixStream, agent: &Agent) -> anyhow::Result<bool> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut cmd_bytes = vec![0u8; len];
    stream.read_exact(&mut cmd_bytes).await?;

    let cmd: Command = serde_json::from_slice(&cmd_bytes)?;

    let mut shutdown = false;
    let response = match cmd {
        Command::MonitorStart => match agent.start_monitoring() {
            Ok(true) => Response::Ok,
            Ok(false) => Response::Error("monitoring is already active".to_string()),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::MonitorStop => {
            if agent.stop_monitoring() {
                Response::Ok
            } else {
                Response::Error("monitoring is not active".to_string())
            }
        }
        Command::Backup(path) => match agent.create_backup(path).await {
            Ok(manifest) => Response::BackupCreated(manifest),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::Restore {
            backup_id,
            destination,
        } => match agent.restore(backup_id, destination).await {
            Ok(report) => Response::Restored(report),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::Backups => match agent.list_backups().await {
            Ok(manifests) => Response::Backups(manifests),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::Alerts => Response::Alerts(agent.alerts()),
        Command::Incidents => Response::Incidents(agent.incidents().await),
        Command::Acknowledge(incident_id) => match agent.acknowledge(incident_id).await {
            Ok(_) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        Command::RotateKey => match agent.rotate_key() {
            Ok(fingerprint) => Response::KeyRotated(fingerprint),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::Status => Response::Status(DaemonStatus {
            running: true,
            pid: std::process::id(),
            monitoring: agent.monitoring_active(),
            protected: agent.config().protected.clone(),
            alerts: agent.alerts().len(),
            incidents: agent.incidents().await.len(),
        }),
        Command::Shutdown => {
            shutdown = true;
            Response::Ok
        }
    };

    let response_bytes = serde_json::to_vec(&response)?;
    let len = response_bytes.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(&response_bytes).await?;

    Ok(shutdown)
}

fn daemonize(config: &Config) -> anyhow::Result<()> {
    use daemonize::Daemonize;

    let stdout = std::fs::File::create(&config.daemon.log_file)?;
    let stderr = stdout.try_clone()?;

    let daemonize = Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start()?;

    Ok(())
}

fn write_pid_file(path: &std::path::Path) -> anyhow::Result<()> {
    let pid = std::process::id();
    std::fs::write(path, pid.to_string())?;
    Ok(())
}

fn read_pid_file(path: &std::path::Path) -> anyhow::Result<u32> {
    let content = std::fs::read_to_string(path)?;
    let pid: u32 = content.trim().parse()?;
    Ok(pid)
}

fn is_running(config: &Config) -> bool {
    if !config.daemon.pid_file.exists() {
        return false;
    }

    if let Ok(pid) = read_pid_file(&config.daemon.pid_file) {
        let proc_path = format!("/proc/{}", pid);
        return std::path::Path::new(&proc_path).exists();
    }

    false
}

fn cleanup(config: &Config) {
    let _ = std::fs::remove_file(&config.daemon.pid_file);
    let _ = std::fs::remove_file(&config.daemon.socket);
}

fn print_status(status: &DaemonStatus) {
    println!("Ransomguard Status");
    println!("───────────────────────────────");
    println!(
        "Status:          {}",
        if status.running { "● Running" } else { "○ Stopped" }
    );
    println!("PID:             {}", status.pid);
    println!(
        "Monitoring:      {}",
        if status.monitoring { "active" } else { "stopped" }
    );
    println!("Protected root:  {:?}", status.protected);
    println!("Open alerts:     {}", status.alerts);
    println!("Incidents:       {}", status.incidents);
}

fn print_alerts(alerts: &[Alert]) {
    if alerts.is_empty() {
        println!("No alerts");
        return;
    }
    println!("Alerts:");
    for alert in alerts {
        println!(
            "  #{}  {:?}  {:?}  {}  ({} evidence, first {})",
            alert.id,
            alert.kind,
            alert.severity,
            alert.subject,
            alert.evidence.len(),
            alert.first_observed.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

fn print_incidents(incidents: &[Incident]) {
    if incidents.is_empty() {
        println!("No incidents");
        return;
    }
    println!("Incidents:");
    for incident in incidents {
        println!(
            "  #{}  {:?}  {}  (alert #{}, {} transitions)",
            incident.id,
            incident.state,
            incident.subject,
            incident.alert_id,
            incident.history.len(),
        );
    }
}
