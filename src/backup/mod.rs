//! Immutable encrypted backups
//!
//! A backup is a directory under the backup root: `<id>/data/` mirrors the
//! source tree with one AES-GCM-sealed file per entry, and `<id>/manifest.json`
//! is written last via write-to-temp-then-rename. A crash mid-backup can
//! therefore never leave a manifest pointing at incomplete data, and once a
//! manifest exists its archive is never rewritten; a new backup always gets
//! a fresh identifier.

pub mod keystore;
pub mod restore;

pub use keystore::Keystore;
pub use restore::{RestoreManager, RestoreReport};

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DATA_DIR: &str = "data";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub relative_path: PathBuf,
    pub plaintext_size: u64,
    /// SHA-256 of the plaintext, hex.
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub source_root: PathBuf,
    pub key_fingerprint: String,
    pub entries: Vec<ManifestEntry>,
}

impl BackupManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All-or-nothing commit: serialize to a temp file in the same
    /// directory, then rename over the final path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Config(format!("manifest path {path:?} has no parent")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        tmp.persist(path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

/// In-process mutual exclusion per backup/restore root. Concurrent
/// operations on the same root fail fast with `Busy` instead of corrupting
/// each other.
#[derive(Default)]
pub struct RootLocks {
    active: Mutex<HashSet<PathBuf>>,
}

impl RootLocks {
    pub fn acquire(self: &Arc<Self>, root: &Path) -> Result<RootGuard> {
        let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mut active = self.active.lock();
        if !active.insert(canonical.clone()) {
            return Err(Error::Busy { root: canonical });
        }
        Ok(RootGuard {
            locks: Arc::clone(self),
            root: canonical,
        })
    }
}

pub struct RootGuard {
    locks: Arc<RootLocks>,
    root: PathBuf,
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        self.locks.active.lock().remove(&self.root);
    }
}

pub struct BackupManager {
    backup_dir: PathBuf,
    keystore: Arc<Keystore>,
    locks: Arc<RootLocks>,
    read_retries: u32,
    /// Same patterns the monitor excludes; excluded files are not archived.
    exclude: GlobSet,
}

impl BackupManager {
    pub fn new(
        backup_dir: &Path,
        keystore: Arc<Keystore>,
        locks: Arc<RootLocks>,
        read_retries: u32,
        exclude_patterns: &[String],
    ) -> Result<Self> {
        std::fs::create_dir_all(backup_dir)
            .map_err(|e| Error::Config(format!("cannot create backup dir {backup_dir:?}: {e}")))?;

        let mut globs = GlobSetBuilder::new();
        for pattern in exclude_patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    globs.add(glob);
                }
                Err(e) => warn!("Ignoring invalid exclude pattern {pattern}: {e}"),
            }
        }
        let exclude = globs
            .build()
            .map_err(|e| Error::Config(format!("cannot compile exclude patterns: {e}")))?;

        Ok(Self {
            backup_dir: backup_dir.to_path_buf(),
            keystore,
            locks,
            read_retries,
            exclude,
        })
    }

    /// Walk the source tree, seal every file with the active key, and commit
    /// the manifest last. Per-file failures are skipped with a logged
    /// outcome; they never abort the whole backup.
    pub fn create_backup(&self, source_root: &Path) -> Result<BackupManifest> {
        let _guard = self.locks.acquire(source_root)?;

        let backup_id = self.fresh_backup_id()?;
        let backup_path = self.backup_dir.join(&backup_id);
        let data_dir = backup_path.join(DATA_DIR);
        std::fs::create_dir_all(&data_dir)?;

        let key_fingerprint = self.keystore.active_fingerprint();
        let mut entries = Vec::new();

        for dir_entry in WalkDir::new(source_root).follow_links(false) {
            let dir_entry = match dir_entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable tree entry: {e}");
                    continue;
                }
            };
            if !dir_entry.file_type().is_file() {
                continue;
            }
            let path = dir_entry.path();
            if self.exclude.is_match(path) {
                continue;
            }
            let relative = match path.strip_prefix(source_root) {
                Ok(r) => r.to_path_buf(),
                Err(_) => continue,
            };

            let plaintext = match self.read_with_retry(path) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Skipping {path:?}: {e}");
                    continue;
                }
            };

            let content_hash = hex::encode(Sha256::digest(&plaintext));
            let sealed = self.keystore.encrypt(&plaintext)?;

            let target = data_dir.join(&relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &sealed)?;

            entries.push(ManifestEntry {
                relative_path: relative,
                plaintext_size: plaintext.len() as u64,
                content_hash,
            });
        }

        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let manifest = BackupManifest {
            version: 1,
            backup_id: backup_id.clone(),
            created_at: Utc::now(),
            source_root: source_root.to_path_buf(),
            key_fingerprint,
            entries,
        };
        manifest.save(&backup_path.join(MANIFEST_FILE))?;

        info!(
            backup_id,
            files = manifest.entries.len(),
            "Backup committed"
        );
        Ok(manifest)
    }

    /// Load the manifest of an existing backup.
    pub fn load_manifest(&self, backup_id: &str) -> Result<BackupManifest> {
        let path = self.backup_dir.join(backup_id).join(MANIFEST_FILE);
        BackupManifest::load(&path)
    }

    /// List committed backups, oldest first. Directories without a manifest
    /// are incomplete (crashed mid-backup) and are not listed.
    pub fn list_backups(&self) -> Result<Vec<BackupManifest>> {
        let mut manifests = Vec::new();
        for entry in std::fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let manifest_path = entry.path().join(MANIFEST_FILE);
            if manifest_path.exists() {
                match BackupManifest::load(&manifest_path) {
                    Ok(m) => manifests.push(m),
                    Err(e) => warn!("Skipping unreadable manifest {manifest_path:?}: {e}"),
                }
            }
        }
        manifests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(manifests)
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn fresh_backup_id(&self) -> Result<String> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        for counter in 0u32.. {
            let candidate = if counter == 0 {
                format!("backup-{stamp}")
            } else {
                format!("backup-{stamp}-{counter}")
            };
            if !self.backup_dir.join(&candidate).exists() {
                return Ok(candidate);
            }
        }
        Err(Error::Config("exhausted backup id space".to_string()))
    }

    fn read_with_retry(&self, path: &Path) -> Result<Vec<u8>> {
        let mut last = None;
        for attempt in 0..=self.read_retries {
            match std::fs::read(path) {
                Ok(data) => return Ok(data),
                Err(e) => {
                    let classified = Error::classify_io(path, e);
                    if !classified.is_transient() {
                        return Err(classified);
                    }
                    last = Some(classified);
                    if attempt < self.read_retries {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::Config("retry loop without attempts".to_string())))
    }
}
