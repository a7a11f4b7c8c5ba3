//! Detection engine
//!
//! Consumes file events and resource samples, runs each through a set of
//! pluggable evaluators, and turns findings into deduplicated alerts. New
//! heuristics plug in by implementing [`Evaluator`]; the pipeline itself
//! never changes.

pub mod content;
pub mod resource;

pub use content::ContentHeuristic;
pub use resource::{ResourceHeuristic, ResourceSample, Sampler};

use crate::config::Config;
use crate::monitor::FileEvent;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What an alert is about: a path in the protected tree or a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subject {
    Path(PathBuf),
    Process { pid: u32, name: String },
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Path(p) => write!(f, "{}", p.display()),
            Subject::Process { pid, name } => write!(f, "{name} (pid {pid})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    SuspiciousWrite,
    HighResourceProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Suspicious,
    Critical,
}

/// One piece of supporting observation attached to an alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub observed_at: DateTime<Utc>,
    pub detail: String,
}

/// A deduplicated detection result. Created once; later matching evidence
/// within the debounce window is appended, never a second alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub kind: AlertKind,
    pub subject: Subject,
    pub severity: Severity,
    pub first_observed: DateTime<Utc>,
    pub evidence: Vec<Evidence>,
}

/// Raw output of an evaluator, before deduplication.
#[derive(Debug, Clone)]
pub struct Finding {
    pub kind: AlertKind,
    pub subject: Subject,
    pub severity: Severity,
    pub detail: String,
}

/// Input signal for evaluators.
#[derive(Debug, Clone)]
pub enum Signal {
    File(FileEvent),
    Resource(ResourceSample),
}

/// The pluggable heuristic interface. Evaluators must treat unreadable
/// files as "no evidence", never as a pipeline fault.
pub trait Evaluator: Send {
    fn name(&self) -> &'static str;
    fn evaluate(&mut self, signal: &Signal) -> Option<Finding>;
}

/// Result of recording a finding.
pub enum RecordOutcome {
    /// First occurrence within the window: a new alert was raised.
    New(Alert),
    /// Evidence merged into an existing alert.
    Merged(u64),
}

struct RegistryState {
    alerts: Vec<Alert>,
    index: HashMap<u64, usize>,
    dedup: HashMap<(AlertKind, Subject), (u64, Instant)>,
    next_id: u64,
}

/// Shared alert store with (kind, subject) deduplication inside a debounce
/// window. Queryable by the daemon for `get_alerts`.
pub struct AlertRegistry {
    state: Mutex<RegistryState>,
    window: Duration,
}

impl AlertRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                alerts: Vec::new(),
                index: HashMap::new(),
                dedup: HashMap::new(),
                next_id: 1,
            }),
            window,
        }
    }

    pub fn record(&self, finding: Finding) -> RecordOutcome {
        let now = Instant::now();
        let mut state = self.state.lock();
        let key = (finding.kind, finding.subject.clone());

        if let Some(&(alert_id, raised_at)) = state.dedup.get(&key) {
            if now.duration_since(raised_at) < self.window {
                let evidence = Evidence {
                    observed_at: Utc::now(),
                    detail: finding.detail,
                };
                if let Some(&idx) = state.index.get(&alert_id) {
                    let alert = &mut state.alerts[idx];
                    alert.evidence.push(evidence);
                    if finding.severity > alert.severity {
                        alert.severity = finding.severity;
                    }
                }
                return RecordOutcome::Merged(alert_id);
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let alert = Alert {
            id,
            kind: finding.kind,
            subject: finding.subject,
            severity: finding.severity,
            first_observed: Utc::now(),
            evidence: vec![Evidence {
                observed_at: Utc::now(),
                detail: finding.detail,
            }],
        };
        let idx = state.alerts.len();
        state.alerts.push(alert.clone());
        state.index.insert(id, idx);
        state.dedup.insert(key, (id, now));
        RecordOutcome::New(alert)
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        self.state.lock().alerts.clone()
    }

    pub fn get(&self, id: u64) -> Option<Alert> {
        let state = self.state.lock();
        state.index.get(&id).map(|&idx| state.alerts[idx].clone())
    }
}

/// Detection engine task: drains the event and sample queues through the
/// evaluators and forwards newly raised alerts downstream.
pub struct Engine {
    config: Config,
    evaluators: Vec<Box<dyn Evaluator>>,
    registry: std::sync::Arc<AlertRegistry>,
    alert_tx: mpsc::Sender<Alert>,
}

impl Engine {
    pub fn new(
        config: &Config,
        registry: std::sync::Arc<AlertRegistry>,
        alert_tx: mpsc::Sender<Alert>,
    ) -> Self {
        let evaluators: Vec<Box<dyn Evaluator>> = vec![
            Box::new(ContentHeuristic::new(&config.detection)),
            Box::new(ResourceHeuristic::new(&config.detection)),
        ];
        Self {
            config: config.clone(),
            evaluators,
            registry,
            alert_tx,
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<FileEvent>,
        mut samples: mpsc::Receiver<ResourceSample>,
    ) {
        let mut samples_open = true;
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.dispatch(Signal::File(ev)).await,
                    None => break,
                },
                sample = samples.recv(), if samples_open => match sample {
                    Some(sample) => self.dispatch(Signal::Resource(sample)).await,
                    None => samples_open = false,
                },
            }
        }
        info!("Detection engine stopped");
    }

    async fn dispatch(&mut self, signal: Signal) {
        if let Signal::File(ref event) = signal {
            if self.config.is_excluded(&event.path) {
                return;
            }
        }

        for evaluator in &mut self.evaluators {
            if let Some(finding) = evaluator.evaluate(&signal) {
                debug!(
                    evaluator = evaluator.name(),
                    subject = %finding.subject,
                    "Evidence found"
                );
                match self.registry.record(finding) {
                    RecordOutcome::New(alert) => {
                        warn!(
                            alert_id = alert.id,
                            kind = ?alert.kind,
                            subject = %alert.subject,
                            "Alert raised"
                        );
                        if self.alert_tx.send(alert).await.is_err() {
                            debug!("Alert consumer gone, alert kept in registry only");
                        }
                    }
                    RecordOutcome::Merged(id) => {
                        debug!(alert_id = id, "Evidence merged into existing alert");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(detail: &str) -> Finding {
        Finding {
            kind: AlertKind::SuspiciousWrite,
            subject: Subject::Path(PathBuf::from("/data/doc.txt")),
            severity: Severity::Suspicious,
            detail: detail.to_string(),
        }
    }

    #[test]
    fn test_dedup_within_window() {
        let registry = AlertRegistry::new(Duration::from_secs(5));

        let first = registry.record(finding("one"));
        assert!(matches!(first, RecordOutcome::New(_)));

        for i in 0..10 {
            let outcome = registry.record(finding(&format!("more {i}")));
            assert!(matches!(outcome, RecordOutcome::Merged(1)));
        }

        let alerts = registry.snapshot();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].evidence.len(), 11);
    }

    #[test]
    fn test_new_alert_after_window() {
        let registry = AlertRegistry::new(Duration::from_millis(50));

        assert!(matches!(registry.record(finding("a")), RecordOutcome::New(_)));
        std::thread::sleep(Duration::from_millis(80));
        assert!(matches!(registry.record(finding("b")), RecordOutcome::New(_)));

        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_different_subjects_independent() {
        let registry = AlertRegistry::new(Duration::from_secs(5));

        registry.record(finding("a"));
        let other = Finding {
            subject: Subject::Path(PathBuf::from("/data/other.txt")),
            ..finding("b")
        };
        assert!(matches!(registry.record(other), RecordOutcome::New(_)));
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_merge_escalates_severity() {
        let registry = AlertRegistry::new(Duration::from_secs(5));
        registry.record(finding("weak"));

        let critical = Finding {
            severity: Severity::Critical,
            ..finding("strong")
        };
        registry.record(critical);

        let alerts = registry.snapshot();
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn test_ids_monotonic() {
        let registry = AlertRegistry::new(Duration::from_millis(1));
        for _ in 0..3 {
            registry.record(finding("x"));
            std::thread::sleep(Duration::from_millis(3));
        }
        let ids: Vec<u64> = registry.snapshot().iter().map(|a| a.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
