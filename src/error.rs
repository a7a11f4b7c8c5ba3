//! Error taxonomy for the containment agent
//!
//! Background tasks never crash on these: transient failures are retried or
//! skipped, and everything that is caught gets classified and logged. Only
//! `Config` errors are fatal, and only at startup.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// File temporarily unavailable. Retry or skip, never fatal to the pipeline.
    #[error("transient I/O failure on {path}: {source}")]
    TransientIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Logged and surfaced, operation aborted for that item only.
    #[error("permission denied on {path}")]
    PermissionDenied { path: PathBuf },

    /// Restore-time hash mismatch. Aborts that entry, the rest continue.
    #[error("integrity violation for {entry:?}: decrypted content does not match manifest hash")]
    IntegrityViolation { entry: PathBuf },

    /// No available key matches the fingerprint recorded in a manifest.
    #[error("no key matching fingerprint {fingerprint}")]
    KeyMismatch { fingerprint: String },

    /// Containment action exhausted its retry budget.
    #[error("containment action failed after {attempts} attempts: {reason}")]
    ActionFailed { attempts: u32, reason: String },

    /// Concurrent backup/restore conflict on the same root. Caller retries later.
    #[error("{root:?} is busy with another backup or restore")]
    Busy { root: PathBuf },

    /// Fatal at startup: backup directory or keystore unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Uncategorized I/O outside the retry/skip paths.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Classify a per-file I/O failure per the recovery policy: permission
    /// problems abort the item, everything else is treated as transient.
    pub fn classify_io(path: &std::path::Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied {
                path: path.to_path_buf(),
            }
        } else {
            Error::TransientIo {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// True for failures worth retrying before giving up on an item.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIo { .. })
    }
}
