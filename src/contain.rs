//! Containment actuator
//!
//! Executes kill-process and block-network actions on behalf of the incident
//! state machine. Actions for the same subject are serialized so duplicate
//! evidence can never double-kill or double-install; different subjects run
//! concurrently. Every action gets a bounded retry budget with exponential
//! backoff, and an action already confirmed `Succeeded` is never re-executed.

use crate::config::ContainmentConfig;
use crate::error::Error;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    KillProcess { pid: u32 },
    BlockNetwork { rule: String },
}

impl ActionKind {
    /// Serialization key: actions sharing a key never run concurrently.
    fn subject_key(&self) -> String {
        match self {
            ActionKind::KillProcess { pid } => format!("pid:{pid}"),
            ActionKind::BlockNetwork { rule } => format!("rule:{rule}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainmentAction {
    pub incident_id: u64,
    pub kind: ActionKind,
    pub status: ActionStatus,
    pub attempt: u32,
}

impl ContainmentAction {
    pub fn new(incident_id: u64, kind: ActionKind) -> Self {
        Self {
            incident_id,
            kind,
            status: ActionStatus::Pending,
            attempt: 0,
        }
    }
}

/// Result of driving one action to completion.
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub detail: String,
}

pub struct Actuator {
    max_attempts: u32,
    base_backoff: Duration,
    kill_grace: Duration,
    firewall_cmd: Vec<String>,
    subject_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    installed_rules: Mutex<HashSet<String>>,
}

impl Actuator {
    pub fn new(config: &ContainmentConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.backoff(),
            kill_grace: config.kill_grace(),
            firewall_cmd: config.firewall_cmd.clone(),
            subject_locks: Mutex::new(HashMap::new()),
            installed_rules: Mutex::new(HashSet::new()),
        }
    }

    fn subject_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.subject_locks.lock();
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Drive an action through its retry budget. Updates `status` and
    /// `attempt` in place and returns the final outcome.
    pub async fn execute(&self, action: &mut ContainmentAction) -> ActionOutcome {
        if action.status == ActionStatus::Succeeded {
            return ActionOutcome {
                status: ActionStatus::Succeeded,
                detail: "already succeeded, not re-executed".to_string(),
            };
        }

        let lock = self.subject_lock(&action.kind.subject_key());
        let _guard = lock.lock().await;

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            action.attempt = attempt;
            match self.attempt(&action.kind).await {
                Ok(detail) => {
                    action.status = ActionStatus::Succeeded;
                    info!(
                        incident_id = action.incident_id,
                        attempt, "Containment action succeeded: {detail}"
                    );
                    return ActionOutcome {
                        status: ActionStatus::Succeeded,
                        detail,
                    };
                }
                Err(e) => {
                    warn!(
                        incident_id = action.incident_id,
                        attempt, "Containment attempt failed: {e}"
                    );
                    last_error = e;
                    if attempt < self.max_attempts {
                        let backoff = self.base_backoff * 2u32.pow(attempt - 1);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        action.status = ActionStatus::Failed;
        let failure = Error::ActionFailed {
            attempts: self.max_attempts,
            reason: last_error,
        };
        ActionOutcome {
            status: ActionStatus::Failed,
            detail: failure.to_string(),
        }
    }

    async fn attempt(&self, kind: &ActionKind) -> Result<String, String> {
        match kind {
            ActionKind::KillProcess { pid } => self.kill_process(*pid).await,
            ActionKind::BlockNetwork { rule } => self.block_network(rule).await,
        }
    }

    /// Graceful-then-forceful termination. A process that no longer exists
    /// means the goal is already achieved and is recorded as such.
    async fn kill_process(&self, pid: u32) -> Result<String, String> {
        let target = Pid::from_raw(pid as i32);

        match kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(format!("process {pid} already exited")),
            Err(Errno::EPERM) => {
                return Err(format!("termination of {pid} denied by privilege"))
            }
            Err(e) => return Err(format!("SIGTERM to {pid} failed: {e}")),
        }

        tokio::time::sleep(self.kill_grace).await;

        // Still alive after the grace period? Escalate.
        if kill(target, None).is_ok() {
            match kill(target, Signal::SIGKILL) {
                Ok(()) => Ok(format!("process {pid} terminated forcefully")),
                Err(Errno::ESRCH) => Ok(format!("process {pid} exited during grace period")),
                Err(e) => Err(format!("SIGKILL to {pid} failed: {e}")),
            }
        } else {
            Ok(format!("process {pid} terminated gracefully"))
        }
    }

    /// Install a host firewall rule through the configured command template.
    /// Idempotent: a rule already installed is a success, not an error.
    async fn block_network(&self, rule: &str) -> Result<String, String> {
        if self.installed_rules.lock().contains(rule) {
            return Ok(format!("rule {rule} already installed"));
        }

        let mut parts = self
            .firewall_cmd
            .iter()
            .map(|arg| arg.replace("{rule}", rule));
        let program = parts
            .next()
            .ok_or_else(|| "empty firewall command template".to_string())?;

        let status = tokio::process::Command::new(&program)
            .args(parts)
            .status()
            .await
            .map_err(|e| format!("failed to spawn {program}: {e}"))?;

        if status.success() {
            self.installed_rules.lock().insert(rule.to_string());
            Ok(format!("rule {rule} installed"))
        } else {
            Err(format!("{program} exited with {status}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actuator_with_cmd(cmd: Vec<&str>) -> Actuator {
        let config = ContainmentConfig {
            max_attempts: 3,
            backoff_ms: 10,
            kill_grace_ms: 50,
            firewall_cmd: cmd.into_iter().map(String::from).collect(),
        };
        Actuator::new(&config)
    }

    #[tokio::test]
    async fn test_kill_vanished_process_is_success_equivalent() {
        let actuator = actuator_with_cmd(vec!["true"]);
        // Near the default pid_max ceiling; nothing real lives there.
        let mut action =
            ContainmentAction::new(1, ActionKind::KillProcess { pid: 4_000_000 });

        let outcome = actuator.execute(&mut action).await;
        assert_eq!(outcome.status, ActionStatus::Succeeded);
        assert!(outcome.detail.contains("already exited"));
        assert_eq!(action.attempt, 1);
    }

    #[tokio::test]
    async fn test_kill_real_process() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();

        let actuator = actuator_with_cmd(vec!["true"]);
        let mut action = ContainmentAction::new(2, ActionKind::KillProcess { pid });
        let outcome = actuator.execute(&mut action).await;
        assert_eq!(outcome.status, ActionStatus::Succeeded);

        // Reap the child so the test leaves nothing behind.
        let _ = std::process::Command::new("true").status();
        let mut child = child;
        let _ = child.wait();
    }

    #[tokio::test]
    async fn test_block_network_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("invocations");
        let script = format!("echo x >> {}", marker.display());
        let actuator = actuator_with_cmd(vec!["sh", "-c", &script]);

        let mut first =
            ContainmentAction::new(3, ActionKind::BlockNetwork { rule: "r1".into() });
        let mut second =
            ContainmentAction::new(3, ActionKind::BlockNetwork { rule: "r1".into() });

        assert_eq!(
            actuator.execute(&mut first).await.status,
            ActionStatus::Succeeded
        );
        let outcome = actuator.execute(&mut second).await;
        assert_eq!(outcome.status, ActionStatus::Succeeded);
        assert!(outcome.detail.contains("already installed"));

        let invocations = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(invocations.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_retries_then_failed() {
        let actuator = actuator_with_cmd(vec!["false"]);
        let mut action =
            ContainmentAction::new(4, ActionKind::BlockNetwork { rule: "r2".into() });

        let outcome = actuator.execute(&mut action).await;
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert_eq!(action.attempt, 3);
        assert_eq!(action.status, ActionStatus::Failed);
    }

    #[tokio::test]
    async fn test_succeeded_action_not_reexecuted() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("invocations");
        let script = format!("echo x >> {}", marker.display());
        let actuator = actuator_with_cmd(vec!["sh", "-c", &script]);

        let mut action =
            ContainmentAction::new(5, ActionKind::BlockNetwork { rule: "r3".into() });
        actuator.execute(&mut action).await;
        assert_eq!(action.status, ActionStatus::Succeeded);

        let outcome = actuator.execute(&mut action).await;
        assert!(outcome.detail.contains("not re-executed"));
        assert_eq!(
            std::fs::read_to_string(&marker).unwrap().lines().count(),
            1
        );
    }

    #[tokio::test]
    async fn test_same_subject_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("invocations");
        let script = format!("sleep 0.1; echo x >> {}", marker.display());
        let actuator = Arc::new(actuator_with_cmd(vec!["sh", "-c", &script]));

        let a = Arc::clone(&actuator);
        let b = Arc::clone(&actuator);
        let t1 = tokio::spawn(async move {
            let mut action =
                ContainmentAction::new(6, ActionKind::BlockNetwork { rule: "dup".into() });
            a.execute(&mut action).await.status
        });
        let t2 = tokio::spawn(async move {
            let mut action =
                ContainmentAction::new(6, ActionKind::BlockNetwork { rule: "dup".into() });
            b.execute(&mut action).await.status
        });

        assert_eq!(t1.await.unwrap(), ActionStatus::Succeeded);
        assert_eq!(t2.await.unwrap(), ActionStatus::Succeeded);

        // Serialization means the loser of the race observed the installed
        // rule and skipped the command: exactly one invocation.
        let invocations = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(invocations.lines().count(), 1);
    }
}
