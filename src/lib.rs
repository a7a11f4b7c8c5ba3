//! Ransomguard - endpoint ransomware containment library
//!
//! Watches a protected directory tree, classifies suspicious write patterns,
//! drives automated containment (process termination, network isolation),
//! and keeps tamper-resistant encrypted backups for recovery.
//!
//! # Pipeline
//!
//! Monitor -> (event) -> Detection Engine -> (alert) -> Incident State
//! Machine -> (action) -> Containment Actuator. Backup and restore operate
//! on demand against the protected tree and the crypto keystore.
//!
//! # Example
//!
//! ```rust,no_run
//! use ransomguard::{Agent, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let agent = Agent::new(Config::default())?;
//!     agent.start_monitoring()?;
//!     let manifest = agent.create_backup("/home/user/documents".into()).await?;
//!     println!("backup {} committed", manifest.backup_id);
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod config;
pub mod contain;
pub mod daemon;
pub mod detect;
pub mod error;
pub mod incident;
pub mod monitor;

pub use backup::{BackupManager, BackupManifest, Keystore, RestoreManager, RestoreReport};
pub use config::Config;
pub use contain::Actuator;
pub use detect::{Alert, AlertRegistry, Engine, Sampler};
pub use error::{Error, Result};
pub use incident::{Incident, IncidentManager};
pub use monitor::{FileEvent, Monitor, StartOutcome};

use backup::RootLocks;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct PipelineHandles {
    engine: JoinHandle<()>,
    sampler: JoinHandle<()>,
    incident_feed: JoinHandle<()>,
}

/// The agent owns all process-wide state: the monitor lifecycle, the alert
/// registry, incident tracking, and the backup subsystem.
pub struct Agent {
    config: Config,
    monitor: Arc<Monitor>,
    registry: Arc<AlertRegistry>,
    incidents: Arc<IncidentManager>,
    backups: Arc<BackupManager>,
    restorer: Arc<RestoreManager>,
    keystore: Arc<Keystore>,
    pipeline: Mutex<Option<PipelineHandles>>,
}

impl Agent {
    /// Construct the agent. Only configuration-level failures are possible
    /// here (unusable backup dir, inaccessible keystore) and they are fatal.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let keystore = Arc::new(Keystore::open(&config.backup.keystore_dir)?);
        let locks = Arc::new(RootLocks::default());
        let backups = Arc::new(BackupManager::new(
            &config.backup.dir,
            Arc::clone(&keystore),
            Arc::clone(&locks),
            config.backup.read_retries,
            &config.exclude,
        )?);
        let restorer = Arc::new(RestoreManager::new(
            &config.backup.dir,
            Arc::clone(&keystore),
            locks,
        ));

        let actuator = Arc::new(Actuator::new(&config.containment));
        let incidents = Arc::new(IncidentManager::new(&config.daemon.audit_log, actuator));
        let registry = Arc::new(AlertRegistry::new(config.detection.debounce_window()));
        let monitor = Arc::new(Monitor::new(
            config.queue.capacity,
            config.queue.enqueue_wait(),
        ));

        Ok(Self {
            config,
            monitor,
            registry,
            incidents,
            backups,
            restorer,
            keystore,
            pipeline: Mutex::new(None),
        })
    }

    /// Start the monitoring pipeline on the protected root. Returns `false`
    /// without side effects when already active.
    pub fn start_monitoring(&self) -> Result<bool> {
        let mut pipeline = self.pipeline.lock();

        let events = match self
            .monitor
            .start(&self.config.protected)
            .map_err(|e| Error::Config(e.to_string()))?
        {
            StartOutcome::Started(rx) => rx,
            StartOutcome::AlreadyActive => return Ok(false),
        };

        let (sample_tx, sample_rx) = mpsc::channel(self.config.queue.capacity);
        let (alert_tx, mut alert_rx) = mpsc::channel(64);

        let engine = Engine::new(&self.config, Arc::clone(&self.registry), alert_tx);
        let engine = tokio::spawn(engine.run(events, sample_rx));

        let sampler = Sampler::new(std::time::Duration::from_secs(
            self.config.detection.sample_interval_secs,
        ));
        let sampler = tokio::spawn(sampler.run(sample_tx));

        let incidents = Arc::clone(&self.incidents);
        let incident_feed = tokio::spawn(async move {
            while let Some(alert) = alert_rx.recv().await {
                incidents.handle_alert(alert).await;
            }
        });

        *pipeline = Some(PipelineHandles {
            engine,
            sampler,
            incident_feed,
        });
        Ok(true)
    }

    /// Stop monitoring. Returns `false` when nothing was active; safe to
    /// call repeatedly.
    pub fn stop_monitoring(&self) -> bool {
        let mut pipeline = self.pipeline.lock();
        if !self.monitor.is_active() {
            return false;
        }
        self.monitor.stop();

        if let Some(handles) = pipeline.take() {
            // The engine drains what was queued and exits when the event
            // channel closes; the incident feed follows when the alert
            // sender drops. The sampler has no upstream close, so abort it.
            handles.sampler.abort();
            drop(handles.engine);
            drop(handles.incident_feed);
        }
        true
    }

    pub fn monitoring_active(&self) -> bool {
        self.monitor.is_active()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.registry.snapshot()
    }

    pub async fn incidents(&self) -> Vec<Incident> {
        self.incidents.snapshot().await
    }

    pub async fn acknowledge(&self, incident_id: u64) -> Result<Incident> {
        self.incidents.acknowledge(incident_id).await
    }

    /// Create an encrypted backup of `source`. Runs on the blocking pool;
    /// a concurrent operation on the same root fails fast with `Busy`.
    pub async fn create_backup(&self, source: PathBuf) -> Result<BackupManifest> {
        let backups = Arc::clone(&self.backups);
        tokio::task::spawn_blocking(move || backups.create_backup(&source))
            .await
            .map_err(|e| Error::Config(format!("backup task panicked: {e}")))?
    }

    /// Restore a backup into `destination`, or into its original source
    /// root when no destination is given.
    pub async fn restore(
        &self,
        backup_id: String,
        destination: Option<PathBuf>,
    ) -> Result<RestoreReport> {
        let backups = Arc::clone(&self.backups);
        let restorer = Arc::clone(&self.restorer);
        tokio::task::spawn_blocking(move || {
            let manifest = backups.load_manifest(&backup_id)?;
            let destination = destination.unwrap_or_else(|| manifest.source_root.clone());
            restorer.restore(&manifest, &destination)
        })
        .await
        .map_err(|e| Error::Config(format!("restore task panicked: {e}")))?
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupManifest>> {
        let backups = Arc::clone(&self.backups);
        tokio::task::spawn_blocking(move || backups.list_backups())
            .await
            .map_err(|e| Error::Config(format!("list task panicked: {e}")))?
    }

    pub fn rotate_key(&self) -> Result<String> {
        self.keystore.rotate()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
