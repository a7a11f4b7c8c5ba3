//! Incident lifecycle tracking
//!
//! Every alert maps to exactly one incident. Incidents move through
//! `New -> Analyzing -> Containing -> {Contained, ContainmentFailed} ->
//! Closed` and never regress; `Closed` is the sole terminal state and only
//! an operator acknowledgment reaches it. Transitions for a single incident
//! are serialized; independent incidents progress in parallel. Every
//! transition is appended to a JSONL audit log.

use crate::contain::{ActionKind, ActionStatus, Actuator, ContainmentAction};
use crate::detect::{Alert, Subject};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentState {
    New,
    Analyzing,
    Containing,
    Contained,
    ContainmentFailed,
    Closed,
}

impl IncidentState {
    /// Position in the partial order. `Contained` and `ContainmentFailed`
    /// share a rank: they are alternative outcomes, not a sequence.
    pub fn rank(self) -> u8 {
        match self {
            IncidentState::New => 0,
            IncidentState::Analyzing => 1,
            IncidentState::Containing => 2,
            IncidentState::Contained | IncidentState::ContainmentFailed => 3,
            IncidentState::Closed => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub state: IncidentState,
    pub at: DateTime<Utc>,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: u64,
    pub alert_id: u64,
    pub subject: Subject,
    pub state: IncidentState,
    pub history: Vec<Transition>,
}

impl Incident {
    fn new(alert: &Alert) -> Self {
        Self {
            id: alert.id,
            alert_id: alert.id,
            subject: alert.subject.clone(),
            state: IncidentState::New,
            history: vec![Transition {
                state: IncidentState::New,
                at: Utc::now(),
                outcome: "incident opened".to_string(),
            }],
        }
    }
}

/// Append-only transition log, one JSON record per line.
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuditRecord {
    incident_id: u64,
    alert_id: u64,
    state: IncidentState,
    outcome: String,
    at: DateTime<Utc>,
}

impl AuditLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Log failures must never take down the pipeline; they are logged and
    /// swallowed here.
    fn append(&self, incident: &Incident, transition: &Transition) {
        let record = AuditRecord {
            incident_id: incident.id,
            alert_id: incident.alert_id,
            state: transition.state,
            outcome: transition.outcome.clone(),
            at: transition.at,
        };
        let _guard = self.write_lock.lock();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                let line = serde_json::to_string(&record)?;
                writeln!(file, "{line}")
            });
        if let Err(e) = result {
            error!("Failed to append audit record: {e}");
        }
    }
}

/// What `handle_alert` did with an alert.
#[derive(Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    Created(u64),
    MergedInto(u64),
}

pub struct IncidentManager {
    incidents: Mutex<HashMap<u64, Arc<AsyncMutex<Incident>>>>,
    /// Subject -> open incident, so re-entrant alerts merge instead of
    /// opening duplicates. Entries are removed on close.
    by_subject: Mutex<HashMap<Subject, u64>>,
    audit: AuditLog,
    actuator: Arc<Actuator>,
}

impl IncidentManager {
    pub fn new(audit_path: &Path, actuator: Arc<Actuator>) -> Self {
        Self {
            incidents: Mutex::new(HashMap::new()),
            by_subject: Mutex::new(HashMap::new()),
            audit: AuditLog::new(audit_path),
            actuator,
        }
    }

    /// Open an incident for the alert and drive it through containment, or
    /// merge into the subject's existing open incident.
    pub async fn handle_alert(&self, alert: Alert) -> HandleOutcome {
        let handle = {
            let mut by_subject = self.by_subject.lock();
            if let Some(&existing) = by_subject.get(&alert.subject) {
                info!(
                    incident_id = existing,
                    alert_id = alert.id,
                    "Re-entrant alert merged into open incident"
                );
                return HandleOutcome::MergedInto(existing);
            }
            let incident = Incident::new(&alert);
            let id = incident.id;
            let handle = Arc::new(AsyncMutex::new(incident));
            self.incidents.lock().insert(id, Arc::clone(&handle));
            by_subject.insert(alert.subject.clone(), id);
            handle
        };

        let mut incident = handle.lock().await;
        let id = incident.id;

        // Placeholder stage reserved for future correlation logic.
        let _ = self.transition(&mut incident, IncidentState::Analyzing, "auto-advanced");
        let _ = self.transition(
            &mut incident,
            IncidentState::Containing,
            "dispatching containment actions",
        );

        let mut all_succeeded = true;
        let mut outcomes = Vec::new();
        for kind in plan_actions(&alert) {
            let mut action = ContainmentAction::new(id, kind);
            let outcome = self.actuator.execute(&mut action).await;
            if outcome.status != ActionStatus::Succeeded {
                all_succeeded = false;
            }
            outcomes.push(outcome.detail);
        }

        let summary = outcomes.join("; ");
        if all_succeeded {
            let _ = self.transition(&mut incident, IncidentState::Contained, &summary);
        } else {
            warn!(incident_id = id, "Containment failed: {summary}");
            let _ = self.transition(&mut incident, IncidentState::ContainmentFailed, &summary);
        }

        HandleOutcome::Created(id)
    }

    /// Operator acknowledgment: the only path to `Closed`. Frees the subject
    /// so later alerts open a fresh incident.
    pub async fn acknowledge(&self, incident_id: u64) -> Result<Incident> {
        let handle = self
            .incidents
            .lock()
            .get(&incident_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no incident {incident_id}")))?;

        let mut incident = handle.lock().await;
        self.transition(&mut incident, IncidentState::Closed, "operator acknowledged")?;
        self.by_subject.lock().remove(&incident.subject);
        Ok(incident.clone())
    }

    pub async fn snapshot(&self) -> Vec<Incident> {
        let handles: Vec<_> = self.incidents.lock().values().cloned().collect();
        let mut incidents = Vec::with_capacity(handles.len());
        for handle in handles {
            incidents.push(handle.lock().await.clone());
        }
        incidents.sort_by_key(|i| i.id);
        incidents
    }

    /// Advance an incident. Regressions and departures from a closed
    /// incident are rejected; every accepted transition is audited.
    fn transition(
        &self,
        incident: &mut Incident,
        next: IncidentState,
        outcome: &str,
    ) -> Result<()> {
        if incident.state == IncidentState::Closed {
            return Err(Error::Config(format!(
                "incident {} is closed; history is frozen",
                incident.id
            )));
        }
        if next.rank() <= incident.state.rank() {
            return Err(Error::Config(format!(
                "refusing transition {:?} -> {:?} for incident {}",
                incident.state, next, incident.id
            )));
        }

        let transition = Transition {
            state: next,
            at: Utc::now(),
            outcome: outcome.to_string(),
        };
        incident.state = next;
        self.audit.append(incident, &transition);
        incident.history.push(transition);
        info!(incident_id = incident.id, state = ?next, "Incident transition");
        Ok(())
    }
}

/// Containment plan for an alert's subject: kill plus network isolation for
/// a process, network isolation alone for a path.
fn plan_actions(alert: &Alert) -> Vec<ActionKind> {
    match &alert.subject {
        Subject::Process { pid, .. } => vec![
            ActionKind::KillProcess { pid: *pid },
            ActionKind::BlockNetwork {
                rule: format!("ransomguard-pid-{pid}"),
            },
        ],
        Subject::Path(path) => vec![ActionKind::BlockNetwork {
            rule: format!(
                "ransomguard-{}",
                path.display().to_string().replace('/', "-")
            ),
        }],
    }
}
