//! Content heuristic for suspicious writes
//!
//! Two signals, either of which produces evidence:
//!
//! 1. The first bytes of a created/modified file match a known
//!    encrypted-container or archive signature. The zip prefix is a weak
//!    proxy (legitimate archive writes match too), so alone it only rates
//!    `Suspicious`.
//! 2. Write frequency for a path exceeds a rate threshold inside a sliding
//!    window. Mass rewrites are the ransomware signature proper and rate
//!    `Critical`.
//!
//! Failing to read a file (vanished, permission) is "no evidence", never an
//! engine fault.

use super::{AlertKind, Evaluator, Finding, Severity, Signal, Subject};
use crate::config::DetectionConfig;
use crate::monitor::FileEventKind;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

pub struct ContentHeuristic {
    prefixes: Vec<Vec<u8>>,
    probe_bytes: usize,
    bursts: BurstTracker,
}

impl ContentHeuristic {
    pub fn new(config: &DetectionConfig) -> Self {
        let prefixes = config
            .magic_prefixes
            .iter()
            .filter_map(|p| match hex::decode(p) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    debug!("Ignoring undecodable magic prefix {p}: {e}");
                    None
                }
            })
            .collect();
        Self {
            prefixes,
            probe_bytes: config.probe_bytes,
            bursts: BurstTracker::new(config.burst_limit, config.burst_window()),
        }
    }

    /// Read the head of the file and compare against the signature table.
    fn probe_magic(&self, path: &Path) -> Option<String> {
        let mut file = std::fs::File::open(path).ok()?;
        let mut head = vec![0u8; self.probe_bytes];
        let n = file.read(&mut head).ok()?;
        let head = &head[..n];

        for prefix in &self.prefixes {
            if head.len() >= prefix.len() && &head[..prefix.len()] == prefix.as_slice() {
                return Some(hex::encode(prefix));
            }
        }
        None
    }
}

impl Evaluator for ContentHeuristic {
    fn name(&self) -> &'static str {
        "content"
    }

    fn evaluate(&mut self, signal: &Signal) -> Option<Finding> {
        let event = match signal {
            Signal::File(event) => event,
            Signal::Resource(_) => return None,
        };
        if !matches!(
            event.kind,
            FileEventKind::Created | FileEventKind::Modified
        ) {
            return None;
        }

        // Burst detection first: it holds even when the file is unreadable.
        let writes = self.bursts.record(&event.path);
        if writes >= self.bursts.limit {
            return Some(Finding {
                kind: AlertKind::SuspiciousWrite,
                subject: Subject::Path(event.path.clone()),
                severity: Severity::Critical,
                detail: format!(
                    "{writes} writes to path within {:?} (limit {})",
                    self.bursts.window, self.bursts.limit
                ),
            });
        }

        if let Some(signature) = self.probe_magic(&event.path) {
            return Some(Finding {
                kind: AlertKind::SuspiciousWrite,
                subject: Subject::Path(event.path.clone()),
                severity: Severity::Suspicious,
                detail: format!("file head matches container signature {signature}"),
            });
        }

        None
    }
}

/// How many `record` calls pass between prune sweeps.
const PRUNE_INTERVAL: u64 = 1024;

/// Per-path write counter over a fixed window. Counts reset when the window
/// expires; stale paths are pruned periodically so the map stays bounded by
/// recently-written paths, not by every path ever touched.
pub struct BurstTracker {
    limit: u32,
    window: Duration,
    paths: HashMap<PathBuf, PathStats>,
    records: u64,
}

struct PathStats {
    writes: u32,
    window_start: Instant,
}

impl BurstTracker {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            paths: HashMap::new(),
            records: 0,
        }
    }

    /// Record a write and return the count in the current window.
    pub fn record(&mut self, path: &Path) -> u32 {
        self.records += 1;
        if self.records % PRUNE_INTERVAL == 0 {
            self.prune();
        }

        let now = Instant::now();
        let stats = self.paths.entry(path.to_path_buf()).or_insert(PathStats {
            writes: 0,
            window_start: now,
        });

        if now.duration_since(stats.window_start) > self.window {
            stats.writes = 0;
            stats.window_start = now;
        }
        stats.writes += 1;
        stats.writes
    }

    pub fn count(&self, path: &Path) -> u32 {
        self.paths.get(path).map(|s| s.writes).unwrap_or(0)
    }

    /// Drop paths whose window expired long ago.
    fn prune(&mut self) {
        let stale = self.window * 5;
        self.paths
            .retain(|_, stats| stats.window_start.elapsed() < stale);
    }
}
