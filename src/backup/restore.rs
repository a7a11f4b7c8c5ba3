//! Restore from encrypted backups
//!
//! Restores fail closed per entry: an entry whose ciphertext does not
//! authenticate, or whose decrypted content does not match the manifest
//! hash, is reported and skipped while the rest of the restore proceeds.
//! Partial restores are always visible in the report, never silent.

use super::keystore::{DecryptFailure, Keystore};
use super::{BackupManifest, RootLocks, DATA_DIR, MANIFEST_FILE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Decrypted content does not match the manifest hash, or the
    /// ciphertext failed authentication.
    Integrity,
    /// No available key matches the manifest's fingerprint.
    KeyMismatch,
    /// Archive member unreadable or destination unwritable.
    Io,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryFailure {
    pub relative_path: PathBuf,
    pub kind: FailureKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub restored: Vec<PathBuf>,
    pub failed: Vec<EntryFailure>,
}

pub struct RestoreManager {
    backup_dir: PathBuf,
    keystore: Arc<Keystore>,
    locks: Arc<RootLocks>,
}

impl RestoreManager {
    pub fn new(backup_dir: &Path, keystore: Arc<Keystore>, locks: Arc<RootLocks>) -> Self {
        Self {
            backup_dir: backup_dir.to_path_buf(),
            keystore,
            locks,
        }
    }

    /// Restore a backup by id into `destination_root`.
    pub fn restore_by_id(&self, backup_id: &str, destination_root: &Path) -> Result<RestoreReport> {
        let manifest_path = self.backup_dir.join(backup_id).join(MANIFEST_FILE);
        let manifest = BackupManifest::load(&manifest_path)?;
        self.restore(&manifest, destination_root)
    }

    /// Reconstruct every manifest entry under `destination_root`. Entry
    /// failures abort only that entry and land in the report.
    pub fn restore(
        &self,
        manifest: &BackupManifest,
        destination_root: &Path,
    ) -> Result<RestoreReport> {
        std::fs::create_dir_all(destination_root)?;
        let _guard = self.locks.acquire(destination_root)?;

        let data_dir = self.backup_dir.join(&manifest.backup_id).join(DATA_DIR);
        let mut report = RestoreReport {
            backup_id: manifest.backup_id.clone(),
            restored: Vec::new(),
            failed: Vec::new(),
        };

        for entry in &manifest.entries {
            match self.restore_entry(manifest, &data_dir, destination_root, entry) {
                Ok(()) => report.restored.push(entry.relative_path.clone()),
                Err(e) => {
                    warn!("Restore of {:?} failed: {e}", entry.relative_path);
                    report.failed.push(EntryFailure {
                        relative_path: entry.relative_path.clone(),
                        kind: match e {
                            Error::IntegrityViolation { .. } => FailureKind::Integrity,
                            Error::KeyMismatch { .. } => FailureKind::KeyMismatch,
                            _ => FailureKind::Io,
                        },
                        detail: e.to_string(),
                    });
                }
            }
        }

        info!(
            backup_id = manifest.backup_id,
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Restore complete"
        );
        Ok(report)
    }

    fn restore_entry(
        &self,
        manifest: &BackupManifest,
        data_dir: &Path,
        destination_root: &Path,
        entry: &super::ManifestEntry,
    ) -> Result<()> {
        let member = data_dir.join(&entry.relative_path);
        let sealed =
            std::fs::read(&member).map_err(|e| Error::classify_io(&member, e))?;

        let plaintext = self
            .keystore
            .decrypt(&manifest.key_fingerprint, &sealed)
            .map_err(|failure| match failure {
                DecryptFailure::UnknownKey(fingerprint) => Error::KeyMismatch { fingerprint },
                DecryptFailure::Corrupt => Error::IntegrityViolation {
                    entry: entry.relative_path.clone(),
                },
            })?;

        let recomputed = hex::encode(Sha256::digest(&plaintext));
        if recomputed != entry.content_hash {
            return Err(Error::IntegrityViolation {
                entry: entry.relative_path.clone(),
            });
        }

        let target = destination_root.join(&entry.relative_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &plaintext)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use rand::RngCore;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        source: PathBuf,
        backups: BackupManager,
        restorer: RestoreManager,
        locks: Arc<RootLocks>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let keystore = Arc::new(Keystore::open(&dir.path().join("keys")).unwrap());
        let locks = Arc::new(RootLocks::default());
        let backup_dir = dir.path().join("backups");
        let backups = BackupManager::new(
            &backup_dir,
            Arc::clone(&keystore),
            Arc::clone(&locks),
            2,
            &[],
        )
        .unwrap();
        let restorer = RestoreManager::new(&backup_dir, keystore, Arc::clone(&locks));
        let source = dir.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        Fixture {
            _dir: dir,
            source,
            backups,
            restorer,
            locks,
        }
    }

    #[test]
    fn test_round_trip_byte_identical() {
        let fx = fixture();
        let mut big = vec![0u8; 1024 * 1024];
        rand::thread_rng().fill_bytes(&mut big);
        std::fs::write(fx.source.join("a.txt"), b"hello").unwrap();
        std::fs::write(fx.source.join("b.bin"), &big).unwrap();

        let manifest = fx.backups.create_backup(&fx.source).unwrap();
        assert_eq!(manifest.entries.len(), 2);

        let dest = fx.source.parent().unwrap().join("restored");
        let report = fx.restorer.restore(&manifest, &dest).unwrap();
        assert_eq!(report.restored.len(), 2);
        assert!(report.failed.is_empty());

        assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"hello");
        assert_eq!(std::fs::read(dest.join("b.bin")).unwrap(), big);
    }

    #[test]
    fn test_corrupted_entry_fails_alone() {
        let fx = fixture();
        let mut big = vec![0u8; 1024 * 1024];
        rand::thread_rng().fill_bytes(&mut big);
        std::fs::write(fx.source.join("a.txt"), b"hello").unwrap();
        std::fs::write(fx.source.join("b.bin"), &big).unwrap();

        let manifest = fx.backups.create_backup(&fx.source).unwrap();

        // Flip one byte of a.txt's ciphertext.
        let member = fx
            .backups
            .backup_dir()
            .join(&manifest.backup_id)
            .join(DATA_DIR)
            .join("a.txt");
        let mut sealed = std::fs::read(&member).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        std::fs::write(&member, &sealed).unwrap();

        let dest = fx.source.parent().unwrap().join("restored");
        let report = fx.restorer.restore(&manifest, &dest).unwrap();

        assert_eq!(report.restored, vec![PathBuf::from("b.bin")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].relative_path, PathBuf::from("a.txt"));
        assert_eq!(report.failed[0].kind, FailureKind::Integrity);
        assert_eq!(std::fs::read(dest.join("b.bin")).unwrap(), big);
        assert!(!dest.join("a.txt").exists());
    }

    #[test]
    fn test_key_mismatch_reported() {
        let fx = fixture();
        std::fs::write(fx.source.join("a.txt"), b"hello").unwrap();
        let mut manifest = fx.backups.create_backup(&fx.source).unwrap();

        // Pretend the backup was sealed by a key this host never had.
        manifest.key_fingerprint = "00".repeat(32);

        let dest = fx.source.parent().unwrap().join("restored");
        let report = fx.restorer.restore(&manifest, &dest).unwrap();
        assert!(report.restored.is_empty());
        assert_eq!(report.failed[0].kind, FailureKind::KeyMismatch);
    }

    #[test]
    fn test_tampered_manifest_hash_detected() {
        let fx = fixture();
        std::fs::write(fx.source.join("a.txt"), b"hello").unwrap();
        let mut manifest = fx.backups.create_backup(&fx.source).unwrap();
        manifest.entries[0].content_hash = "11".repeat(32);

        let dest = fx.source.parent().unwrap().join("restored");
        let report = fx.restorer.restore(&manifest, &dest).unwrap();
        assert_eq!(report.failed[0].kind, FailureKind::Integrity);
    }

    #[test]
    fn test_restore_into_busy_root_rejected() {
        let fx = fixture();
        std::fs::write(fx.source.join("a.txt"), b"hello").unwrap();
        let manifest = fx.backups.create_backup(&fx.source).unwrap();

        let dest = fx.source.parent().unwrap().join("restored");
        std::fs::create_dir_all(&dest).unwrap();
        let _guard = fx.locks.acquire(&dest).unwrap();

        let err = fx.restorer.restore(&manifest, &dest).unwrap_err();
        assert!(matches!(err, Error::Busy { .. }));
    }

    #[test]
    fn test_backup_and_restore_same_root_exclusive() {
        let fx = fixture();
        std::fs::write(fx.source.join("a.txt"), b"hello").unwrap();
        let manifest = fx.backups.create_backup(&fx.source).unwrap();

        // Restoring into the tree currently being backed up is forbidden:
        // whichever operation claims the root first wins, the other gets Busy.
        let _guard = fx.locks.acquire(&fx.source).unwrap();
        let backup_err = fx.backups.create_backup(&fx.source).unwrap_err();
        let restore_err = fx.restorer.restore(&manifest, &fx.source).unwrap_err();
        assert!(matches!(backup_err, Error::Busy { .. }));
        assert!(matches!(restore_err, Error::Busy { .. }));
    }

    #[test]
    fn test_restore_by_id() {
        let fx = fixture();
        std::fs::write(fx.source.join("a.txt"), b"hello").unwrap();
        let manifest = fx.backups.create_backup(&fx.source).unwrap();

        let dest = fx.source.parent().unwrap().join("restored");
        let report = fx
            .restorer
            .restore_by_id(&manifest.backup_id, &dest)
            .unwrap();
        assert_eq!(report.restored.len(), 1);
    }
}
