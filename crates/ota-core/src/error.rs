//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::path::PathBuf;

use ota_persistence::PersistenceError;

use crate::result::ResultCode;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Failures surfaced by the update engine.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Neither an online refresh nor the cached metadata could be loaded.
    #[error("update metadata unavailable: {0}")]
    MetadataUnavailable(String),
    /// The image could not be fetched.
    #[error("download of {target} failed: {reason}")]
    DownloadFailed { target: String, reason: String },
    /// The fetched image did not verify and the policy aborts.
    #[error("verification of {target} failed: {reason}")]
    VerificationFailed { target: String, reason: String },
    /// The installer reported a non-success result.
    #[error("install failed ({code}): {description}")]
    InstallFailed {
        code: ResultCode,
        description: String,
    },
    /// The update lock could not be taken.
    #[error("unable to lock {}: {source}", path.display())]
    LockUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The reboot command could not be run or exited non-zero.
    #[error("reboot command failed: {0}")]
    RebootTriggerFailed(String),
    /// A startup requirement is not met.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// Ledger access failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] PersistenceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Errors that end the daemon rather than a single attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UpdateError::RebootTriggerFailed(_)
                | UpdateError::Precondition(_)
                | UpdateError::Ledger(_)
        )
    }
}
