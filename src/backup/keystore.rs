//! Crypto keystore
//!
//! Holds the active AES-256-GCM key plus any historical keys, identified by
//! fingerprint (SHA-256 of the raw key, hex). Every backup records the
//! fingerprint of the key that sealed it, so a rotation can never silently
//! corrupt old backups: restore refuses with `KeyMismatch` when no matching
//! key is available.
//!
//! Layout of the keystore directory: one `<fingerprint>.key` file per key
//! (raw 32 bytes, mode 0600) and an `active` file naming the current one.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const ACTIVE_FILE: &str = "active";

/// Why a decrypt failed; the restore manager maps these onto the error
/// taxonomy with the entry path attached.
#[derive(Debug)]
pub enum DecryptFailure {
    /// No active or historical key matches the requested fingerprint.
    UnknownKey(String),
    /// Authentication failed: ciphertext or tag corrupted.
    Corrupt,
}

pub struct Keystore {
    dir: PathBuf,
    keys: RwLock<HashMap<String, Aes256Gcm>>,
    active: RwLock<String>,
}

impl Keystore {
    /// Open the keystore, generating an initial key on first use. Failure
    /// here is fatal at startup per the recovery policy.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("cannot create keystore dir {dir:?}: {e}")))?;

        let mut keys = HashMap::new();
        for entry in std::fs::read_dir(dir)
            .map_err(|e| Error::Config(format!("cannot read keystore dir {dir:?}: {e}")))?
        {
            let entry = entry.map_err(|e| Error::Config(format!("keystore dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("key") {
                continue;
            }
            match load_key(&path) {
                Ok((fingerprint, cipher)) => {
                    keys.insert(fingerprint, cipher);
                }
                Err(e) => warn!("Skipping unreadable key file {path:?}: {e}"),
            }
        }

        let active_path = dir.join(ACTIVE_FILE);
        let active = match std::fs::read_to_string(&active_path) {
            Ok(fp) => {
                let fp = fp.trim().to_string();
                if !keys.contains_key(&fp) {
                    return Err(Error::Config(format!(
                        "active key {fp} missing from keystore {dir:?}"
                    )));
                }
                fp
            }
            Err(_) => {
                let (fingerprint, cipher) = generate_key(dir)?;
                std::fs::write(&active_path, &fingerprint)
                    .map_err(|e| Error::Config(format!("cannot write {active_path:?}: {e}")))?;
                info!("Generated initial backup key {}", short(&fingerprint));
                keys.insert(fingerprint.clone(), cipher);
                fingerprint
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            keys: RwLock::new(keys),
            active: RwLock::new(active),
        })
    }

    pub fn active_fingerprint(&self) -> String {
        self.active.read().clone()
    }

    /// Seal plaintext with the active key. Output is nonce || ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let active = self.active.read();
        let keys = self.keys.read();
        let cipher = keys
            .get(active.as_str())
            .ok_or_else(|| Error::Config("active key vanished from keystore".to_string()))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Config("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed blob with the key identified by `fingerprint`.
    pub fn decrypt(
        &self,
        fingerprint: &str,
        data: &[u8],
    ) -> std::result::Result<Vec<u8>, DecryptFailure> {
        let keys = self.keys.read();
        let cipher = keys
            .get(fingerprint)
            .ok_or_else(|| DecryptFailure::UnknownKey(fingerprint.to_string()))?;

        if data.len() < NONCE_LEN {
            return Err(DecryptFailure::Corrupt);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| DecryptFailure::Corrupt)
    }

    /// Install a fresh active key. Old keys stay available for restoring
    /// backups sealed before the rotation.
    pub fn rotate(&self) -> Result<String> {
        let (fingerprint, cipher) = generate_key(&self.dir)?;
        let active_path = self.dir.join(ACTIVE_FILE);
        std::fs::write(&active_path, &fingerprint)
            .map_err(|e| Error::Config(format!("cannot write {active_path:?}: {e}")))?;

        self.keys.write().insert(fingerprint.clone(), cipher);
        *self.active.write() = fingerprint.clone();
        info!("Rotated backup key to {}", short(&fingerprint));
        Ok(fingerprint)
    }
}

fn fingerprint_of(key: &[u8]) -> String {
    hex::encode(Sha256::digest(key))
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(16)]
}

fn load_key(path: &Path) -> Result<(String, Aes256Gcm)> {
    let bytes = std::fs::read(path)?;
    if bytes.len() != KEY_LEN {
        return Err(Error::Config(format!(
            "key file {path:?} has {} bytes, expected {KEY_LEN}",
            bytes.len()
        )));
    }
    let fingerprint = fingerprint_of(&bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes));
    Ok((fingerprint, cipher))
}

fn generate_key(dir: &Path) -> Result<(String, Aes256Gcm)> {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    let fingerprint = fingerprint_of(key.as_slice());
    let path = dir.join(format!("{fingerprint}.key"));

    std::fs::write(&path, key.as_slice())
        .map_err(|e| Error::Config(format!("cannot write key file {path:?}: {e}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .map_err(|e| Error::Config(format!("cannot chmod key file {path:?}: {e}")))?;
    }

    let cipher = Aes256Gcm::new(&key);
    Ok((fingerprint, cipher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_generates_initial_key() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::open(dir.path()).unwrap();
        let fp = keystore.active_fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(dir.path().join(format!("{fp}.key")).exists());
    }

    #[test]
    fn test_reopen_keeps_active_key() {
        let dir = tempdir().unwrap();
        let first = Keystore::open(dir.path()).unwrap().active_fingerprint();
        let second = Keystore::open(dir.path()).unwrap().active_fingerprint();
        assert_eq!(first, second);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::open(dir.path()).unwrap();
        let fp = keystore.active_fingerprint();

        let sealed = keystore.encrypt(b"the plaintext").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"the plaintext".as_slice());

        let opened = keystore.decrypt(&fp, &sealed).unwrap();
        assert_eq!(opened, b"the plaintext");
    }

    #[test]
    fn test_unknown_fingerprint_rejected() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::open(dir.path()).unwrap();
        let sealed = keystore.encrypt(b"data").unwrap();

        let err = keystore.decrypt("deadbeef", &sealed).unwrap_err();
        assert!(matches!(err, DecryptFailure::UnknownKey(_)));
    }

    #[test]
    fn test_corrupted_ciphertext_rejected() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::open(dir.path()).unwrap();
        let fp = keystore.active_fingerprint();

        let mut sealed = keystore.encrypt(b"data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let err = keystore.decrypt(&fp, &sealed).unwrap_err();
        assert!(matches!(err, DecryptFailure::Corrupt));
    }

    #[test]
    fn test_rotation_keeps_historical_keys() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::open(dir.path()).unwrap();
        let old_fp = keystore.active_fingerprint();
        let sealed = keystore.encrypt(b"pre-rotation").unwrap();

        let new_fp = keystore.rotate().unwrap();
        assert_ne!(old_fp, new_fp);
        assert_eq!(keystore.active_fingerprint(), new_fp);

        // Old backups still open with the historical key.
        let opened = keystore.decrypt(&old_fp, &sealed).unwrap();
        assert_eq!(opened, b"pre-rotation");
    }
}
