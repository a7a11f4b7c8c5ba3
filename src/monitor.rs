//! File event monitor
//!
//! Watches the protected directory tree recursively and emits ordered
//! `FileEvent`s into a bounded queue. The monitor owns its whole lifecycle
//! (`Stopped -> Starting -> Active -> Stopping -> Stopped`) behind a mutex,
//! so start/stop are idempotent and race-free: a second `start` while active
//! reports "already active", and `stop` does not return until the watch
//! thread has quiesced.
//!
//! Backpressure: when the queue is full the producer blocks up to a bounded
//! wait, then logs a dropped-event warning and moves on. Bounded loss under
//! sustained overload beats silent unbounded buffering.

use chrono::{DateTime, Utc};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A single observed change in the protected tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
    pub timestamp: DateTime<Utc>,
    /// Size change relative to the last observation of this path, in bytes.
    pub size_delta: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// Monitor lifecycle. Transient states are only visible while the control
/// mutex is held; callers observe `Stopped` or `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorLifecycle {
    Stopped,
    Starting,
    Active,
    Stopping,
}

/// Outcome of a `start` call.
pub enum StartOutcome {
    /// Monitoring began; events arrive on the receiver until `stop`.
    Started(mpsc::Receiver<FileEvent>),
    /// A watch is already active; observable state unchanged.
    AlreadyActive,
}

struct MonitorInner {
    lifecycle: MonitorLifecycle,
    /// Dropping the watcher joins its backing thread.
    watcher: Option<RecommendedWatcher>,
    /// Gate checked by the handler before delivering; cleared on stop so no
    /// event is emitted after `stop` returns.
    live: Option<Arc<AtomicBool>>,
    root: Option<PathBuf>,
}

/// Controller for the protected-tree watch.
pub struct Monitor {
    inner: Mutex<MonitorInner>,
    queue_capacity: usize,
    enqueue_wait: Duration,
}

impl Monitor {
    pub fn new(queue_capacity: usize, enqueue_wait: Duration) -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                lifecycle: MonitorLifecycle::Stopped,
                watcher: None,
                live: None,
                root: None,
            }),
            queue_capacity,
            enqueue_wait,
        }
    }

    /// Begin watching `root` recursively. Returns the event stream, or
    /// `AlreadyActive` if a watch is running; never spawns a second watch.
    pub fn start(&self, root: &Path) -> anyhow::Result<StartOutcome> {
        let mut inner = self.inner.lock();

        match inner.lifecycle {
            MonitorLifecycle::Stopped => {}
            _ => return Ok(StartOutcome::AlreadyActive),
        }
        inner.lifecycle = MonitorLifecycle::Starting;

        let live = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handler = event_handler(tx, Arc::clone(&live), self.enqueue_wait);

        let mut watcher = match notify::recommended_watcher(handler) {
            Ok(w) => w,
            Err(e) => {
                inner.lifecycle = MonitorLifecycle::Stopped;
                return Err(e.into());
            }
        };
        if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
            inner.lifecycle = MonitorLifecycle::Stopped;
            return Err(e.into());
        }

        inner.watcher = Some(watcher);
        inner.live = Some(live);
        inner.root = Some(root.to_path_buf());
        inner.lifecycle = MonitorLifecycle::Active;

        info!("Monitoring started on {:?}", root);
        Ok(StartOutcome::Started(rx))
    }

    /// Stop the watch and wait for the watch thread to quiesce. Safe to call
    /// when nothing is active: that is an idempotent no-op.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();

        if inner.lifecycle != MonitorLifecycle::Active {
            return;
        }
        inner.lifecycle = MonitorLifecycle::Stopping;

        if let Some(live) = inner.live.take() {
            live.store(false, Ordering::SeqCst);
        }
        // Dropping the watcher stops and joins its thread; combined with the
        // cleared gate, no event is delivered after this point.
        inner.watcher = None;
        let root = inner.root.take();
        inner.lifecycle = MonitorLifecycle::Stopped;

        info!("Monitoring stopped on {:?}", root);
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().lifecycle == MonitorLifecycle::Active
    }

    pub fn watched_root(&self) -> Option<PathBuf> {
        self.inner.lock().root.clone()
    }
}

/// Build the notify callback. Runs on the watcher's own thread; keeps a
/// per-path size map so events carry a size delta, and enqueues with a
/// bounded blocking wait.
fn event_handler(
    tx: mpsc::Sender<FileEvent>,
    live: Arc<AtomicBool>,
    enqueue_wait: Duration,
) -> impl FnMut(notify::Result<Event>) {
    let mut last_sizes: HashMap<PathBuf, u64> = HashMap::new();

    move |result: notify::Result<Event>| {
        if !live.load(Ordering::SeqCst) {
            return;
        }

        let event = match result {
            Ok(event) => event,
            Err(e) => {
                // A failing watch on a subtree (permission, deletion) must
                // not abort the rest of the tree.
                warn!("Watch error, continuing: {}", e);
                return;
            }
        };

        let kind = match event.kind {
            EventKind::Create(_) => FileEventKind::Created,
            EventKind::Modify(ModifyKind::Name(_)) => FileEventKind::Renamed,
            EventKind::Modify(_) => FileEventKind::Modified,
            EventKind::Remove(_) => FileEventKind::Deleted,
            _ => return,
        };

        for path in event.paths {
            let size_delta = size_delta(&mut last_sizes, &path, kind);
            let file_event = FileEvent {
                path,
                kind,
                timestamp: Utc::now(),
                size_delta,
            };
            enqueue(&tx, file_event, enqueue_wait);
        }
    }
}

fn size_delta(last_sizes: &mut HashMap<PathBuf, u64>, path: &Path, kind: FileEventKind) -> i64 {
    let previous = last_sizes.get(path).copied().unwrap_or(0);
    let current = match kind {
        FileEventKind::Deleted => 0,
        _ => std::fs::metadata(path).map(|m| m.len()).unwrap_or(previous),
    };
    if kind == FileEventKind::Deleted {
        last_sizes.remove(path);
    } else {
        last_sizes.insert(path.to_path_buf(), current);
    }
    current as i64 - previous as i64
}

/// Enqueue with backpressure: block up to `wait` on a full queue, then drop
/// with a warning. Events for a given path stay in emission order because
/// this runs on the single watch thread.
fn enqueue(tx: &mpsc::Sender<FileEvent>, event: FileEvent, wait: Duration) {
    let deadline = Instant::now() + wait;
    let mut pending = event;
    loop {
        match tx.try_send(pending) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(ev)) => {
                if Instant::now() >= deadline {
                    warn!("Event queue full, dropping event for {:?}", ev.path);
                    return;
                }
                pending = ev;
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(mpsc::error::TrySendError::Closed(ev)) => {
                debug!("Event queue closed, discarding event for {:?}", ev.path);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_monitor() -> Monitor {
        Monitor::new(64, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_start_receives_events() {
        let dir = tempdir().unwrap();
        let monitor = test_monitor();

        let mut rx = match monitor.start(dir.path()).unwrap() {
            StartOutcome::Started(rx) => rx,
            StartOutcome::AlreadyActive => panic!("fresh monitor reported active"),
        };

        // Give the watch a moment to establish before writing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("victim.txt"), b"hello").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream closed");
        assert!(event.path.ends_with("victim.txt"));

        monitor.stop();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempdir().unwrap();
        let monitor = test_monitor();

        let _rx = match monitor.start(dir.path()).unwrap() {
            StartOutcome::Started(rx) => rx,
            StartOutcome::AlreadyActive => panic!("fresh monitor reported active"),
        };
        assert!(monitor.is_active());

        // Second start while active must not spawn a second watch.
        match monitor.start(dir.path()).unwrap() {
            StartOutcome::AlreadyActive => {}
            StartOutcome::Started(_) => panic!("second watch spawned"),
        }
        assert!(monitor.is_active());

        monitor.stop();
        assert!(!monitor.is_active());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let monitor = test_monitor();

        // Stop before any start: no-op, no panic.
        monitor.stop();
        assert!(!monitor.is_active());

        let dir = tempdir().unwrap();
        let _rx = monitor.start(dir.path()).unwrap();
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_active());
    }

    #[tokio::test]
    async fn test_no_events_after_stop() {
        let dir = tempdir().unwrap();
        let monitor = test_monitor();

        let mut rx = match monitor.start(dir.path()).unwrap() {
            StartOutcome::Started(rx) => rx,
            StartOutcome::AlreadyActive => unreachable!(),
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        monitor.stop();

        std::fs::write(dir.path().join("late.txt"), b"after stop").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Drain whatever was queued before stop; nothing for late.txt.
        while let Ok(event) = rx.try_recv() {
            assert!(!event.path.ends_with("late.txt"));
        }
    }
}
