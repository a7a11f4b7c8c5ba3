//! Resource heuristic and process sampler
//!
//! A process is flagged only when its CPU utilization stays above the
//! threshold across at least two consecutive samples. One-shot spikes
//! (a compiler starting, a browser tab) pass without evidence.

use super::{AlertKind, Evaluator, Finding, Severity, Signal, Subject};
use crate::config::DetectionConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Periodic observation of one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub pid: u32,
    pub process_name: String,
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub sampled_at: DateTime<Utc>,
}

/// Previous over-threshold observation for a pid.
struct OverSample {
    cpu: f32,
    seen: DateTime<Utc>,
}

/// Flags processes with sustained high CPU. Name-substring matches from the
/// suspicious list escalate severity to critical.
pub struct ResourceHeuristic {
    threshold: f32,
    suspicious_names: Vec<String>,
    /// Pids currently over the threshold. Entries expire after missing a
    /// sampling round, so processes that exit never leave residue and a
    /// reused pid never inherits a stale streak.
    over_last_sample: HashMap<u32, OverSample>,
    stale_after: chrono::Duration,
}

impl ResourceHeuristic {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            threshold: config.cpu_threshold,
            suspicious_names: config
                .suspicious_names
                .iter()
                .map(|n| n.to_lowercase())
                .collect(),
            over_last_sample: HashMap::new(),
            stale_after: chrono::Duration::seconds(
                config.sample_interval_secs.saturating_mul(2).max(1) as i64,
            ),
        }
    }

    fn is_suspicious_name(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.suspicious_names.iter().any(|n| lower.contains(n))
    }
}

impl Evaluator for ResourceHeuristic {
    fn name(&self) -> &'static str {
        "resource"
    }

    fn evaluate(&mut self, signal: &Signal) -> Option<Finding> {
        let sample = match signal {
            Signal::Resource(sample) => sample,
            Signal::File(_) => return None,
        };

        let cutoff = sample.sampled_at - self.stale_after;
        self.over_last_sample.retain(|_, prev| prev.seen >= cutoff);

        if sample.cpu_percent < self.threshold {
            // Streak broken; a later spike starts the debounce over.
            self.over_last_sample.remove(&sample.pid);
            return None;
        }

        let previous = self.over_last_sample.insert(
            sample.pid,
            OverSample {
                cpu: sample.cpu_percent,
                seen: sample.sampled_at,
            },
        );
        let previous = previous?;

        let severity = if self.is_suspicious_name(&sample.process_name) {
            Severity::Critical
        } else {
            Severity::Suspicious
        };
        Some(Finding {
            kind: AlertKind::HighResourceProcess,
            subject: Subject::Process {
                pid: sample.pid,
                name: sample.process_name.clone(),
            },
            severity,
            detail: format!(
                "CPU {:.1}% after {:.1}% on previous sample (threshold {:.1}%)",
                sample.cpu_percent, previous.cpu, self.threshold
            ),
        })
    }
}

/// Independent periodic task producing `ResourceSample`s from the OS.
pub struct Sampler {
    system: System,
    interval: Duration,
}

impl Sampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            system: System::new_all(),
            interval,
        }
    }

    /// Runs until the sample channel closes or the task is aborted.
    pub async fn run(mut self, tx: mpsc::Sender<ResourceSample>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let total_memory = self.system.total_memory().max(1);

        loop {
            ticker.tick().await;
            self.system.refresh_processes();
            let sampled_at = Utc::now();

            for (pid, process) in self.system.processes() {
                let sample = ResourceSample {
                    pid: pid.as_u32(),
                    process_name: process.name().to_string(),
                    cpu_percent: process.cpu_usage(),
                    mem_percent: (process.memory() as f32 / total_memory as f32) * 100.0,
                    sampled_at,
                };
                if tx.send(sample).await.is_err() {
                    info!("Sample consumer gone, sampler stopping");
                    return;
                }
            }
            debug!("Resource sampling round complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pid: u32, name: &str, cpu: f32) -> Signal {
        sample_at(pid, name, cpu, Utc::now())
    }

    fn sample_at(pid: u32, name: &str, cpu: f32, sampled_at: DateTime<Utc>) -> Signal {
        Signal::Resource(ResourceSample {
            pid,
            process_name: name.to_string(),
            cpu_percent: cpu,
            mem_percent: 1.0,
            sampled_at,
        })
    }

    fn heuristic() -> ResourceHeuristic {
        ResourceHeuristic::new(&DetectionConfig::default())
    }

    #[test]
    fn test_two_consecutive_high_samples_fire() {
        let mut h = heuristic();
        assert!(h.evaluate(&sample(42, "suspicious_test", 85.0)).is_none());
        let finding = h.evaluate(&sample(42, "suspicious_test", 90.0)).unwrap();
        assert_eq!(finding.kind, AlertKind::HighResourceProcess);
        assert_eq!(finding.severity, Severity::Critical);
        assert_eq!(
            finding.subject,
            Subject::Process {
                pid: 42,
                name: "suspicious_test".to_string()
            }
        );
    }

    #[test]
    fn test_single_spike_does_not_fire() {
        let mut h = heuristic();
        assert!(h.evaluate(&sample(7, "builder", 95.0)).is_none());
        assert!(h.evaluate(&sample(7, "builder", 10.0)).is_none());
        // Spike after the streak broke starts over.
        assert!(h.evaluate(&sample(7, "builder", 95.0)).is_none());
    }

    #[test]
    fn test_unsuspicious_name_rates_suspicious() {
        let mut h = heuristic();
        h.evaluate(&sample(9, "ffmpeg", 99.0));
        let finding = h.evaluate(&sample(9, "ffmpeg", 99.0)).unwrap();
        assert_eq!(finding.severity, Severity::Suspicious);
    }

    #[test]
    fn test_exited_pid_entry_expires() {
        let mut h = heuristic();
        let t0 = Utc::now();

        // Pid 42 goes over threshold once, then the process exits.
        assert!(h.evaluate(&sample_at(42, "encryptor", 90.0, t0)).is_none());

        // Samples keep arriving for other processes long afterwards.
        let later = t0 + chrono::Duration::seconds(30);
        assert!(h.evaluate(&sample_at(7, "other", 90.0, later)).is_none());
        assert!(h.over_last_sample.get(&42).is_none());

        // The pid is reused: the old observation must not count as a streak.
        assert!(h.evaluate(&sample_at(42, "fresh", 95.0, later)).is_none());
    }

    #[test]
    fn test_consecutive_samples_within_interval_still_fire() {
        let mut h = heuristic();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);

        assert!(h.evaluate(&sample_at(9, "ffmpeg", 99.0, t0)).is_none());
        assert!(h.evaluate(&sample_at(9, "ffmpeg", 99.0, t1)).is_some());
    }

    #[test]
    fn test_pids_tracked_independently() {
        let mut h = heuristic();
        h.evaluate(&sample(1, "a", 90.0));
        h.evaluate(&sample(2, "b", 90.0));
        assert!(h.evaluate(&sample(1, "a", 90.0)).is_some());
        assert!(h.evaluate(&sample(2, "b", 90.0)).is_some());
    }

    #[test]
    fn test_file_signal_ignored() {
        use crate::monitor::{FileEvent, FileEventKind};
        let mut h = heuristic();
        let signal = Signal::File(FileEvent {
            path: "/tmp/x".into(),
            kind: FileEventKind::Modified,
            timestamp: Utc::now(),
            size_delta: 0,
        });
        assert!(h.evaluate(&signal).is_none());
    }
}
