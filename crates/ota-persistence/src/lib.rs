//! ---
//! ota_section: "03-persistence-logging"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Installed-version ledger and storage bindings."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Durable record of what is installed on the device.
//!
//! The ledger keeps two slots (`current`, `pending`) in a hashed envelope
//! plus an append-only installation log used for rollback lookups.

use std::path::PathBuf;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing ledger files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// The ledger state failed integrity verification.
    #[error("ledger corrupted: hash mismatch in {}", path.display())]
    LedgerCorrupted {
        /// File that failed verification.
        path: PathBuf,
    },
    /// The envelope was written by a newer, unknown format.
    #[error("unsupported ledger version {0}")]
    UnsupportedVersion(u16),
}

pub mod identity;
pub mod install_log;
pub mod ledger;
pub mod state;

pub use identity::load_or_create_serial;
pub use install_log::{InstallLogEntry, InstallLogReader, InstallLogWriter, InstallMode};
pub use ledger::{FileLedger, Ledger};
pub use state::{load_state, save_state, verify_state, LedgerState, LEDGER_VERSION};
