//! ---
//! ota_section: "03-persistence-logging"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Installed-version ledger and storage bindings."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use ota_common::Target;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{PersistenceError, Result};

/// Current ledger envelope version.
pub const LEDGER_VERSION: u16 = 1;

/// The two installed-version slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    /// Target the device is known to be running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<Target>,
    /// Target installed but awaiting a reboot to take effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Target>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEnvelope {
    version: u16,
    written_at: DateTime<Utc>,
    hash: String,
    state: LedgerState,
}

/// Persist the ledger state atomically (temp file then rename).
pub fn save_state(state: &LedgerState, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let envelope = StateEnvelope {
        version: LEDGER_VERSION,
        written_at: Utc::now(),
        hash: compute_hash(state)?,
        state: state.clone(),
    };

    let tmp = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(&serde_json::to_vec_pretty(&envelope)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load the ledger state; a missing file is an empty ledger.
pub fn load_state(path: &Path) -> Result<LedgerState> {
    if !path.exists() {
        return Ok(LedgerState::default());
    }
    let envelope = load_envelope(path)?;
    if envelope.version > LEDGER_VERSION {
        return Err(PersistenceError::UnsupportedVersion(envelope.version));
    }
    if envelope.hash != compute_hash(&envelope.state)? {
        return Err(PersistenceError::LedgerCorrupted {
            path: path.to_path_buf(),
        });
    }
    Ok(envelope.state)
}

/// Verify the integrity of a stored state without returning it.
pub fn verify_state(path: &Path) -> bool {
    match load_envelope(path) {
        Ok(envelope) => compute_hash(&envelope.state)
            .map(|hash| hash == envelope.hash)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn load_envelope(path: &Path) -> Result<StateEnvelope> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn compute_hash(state: &LedgerState) -> Result<String> {
    let serialized = serde_json::to_vec(state)?;
    Ok(hex::encode(Sha256::digest(serialized)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> LedgerState {
        LedgerState {
            current: Some(Target::new("lmp-41", "aa11").with_version("41")),
            pending: Some(Target::new("lmp-42", "bb22").with_version("42")),
        }
    }

    #[test]
    fn save_and_load_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("installed_versions.json");

        save_state(&sample(), &path).unwrap();
        assert!(verify_state(&path));
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded.current.unwrap().filename, "lmp-41");
        assert_eq!(loaded.pending.unwrap().custom_version, "42");
    }

    #[test]
    fn missing_file_is_empty_ledger() {
        let dir = tempdir().unwrap();
        let state = load_state(&dir.path().join("absent.json")).unwrap();
        assert!(state.current.is_none());
        assert!(state.pending.is_none());
    }

    #[test]
    fn tampered_state_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("installed_versions.json");
        save_state(&sample(), &path).unwrap();

        let mut envelope: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        envelope["state"]["pending"]["filename"] = serde_json::json!("lmp-666");
        fs::write(&path, serde_json::to_vec_pretty(&envelope).unwrap()).unwrap();

        assert!(!verify_state(&path));
        assert!(matches!(
            load_state(&path),
            Err(PersistenceError::LedgerCorrupted { .. })
        ));
    }

    #[test]
    fn newer_envelope_version_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("installed_versions.json");
        save_state(&LedgerState::default(), &path).unwrap();

        let mut envelope: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        envelope["version"] = serde_json::json!(LEDGER_VERSION + 1);
        fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

        assert!(matches!(
            load_state(&path),
            Err(PersistenceError::UnsupportedVersion(_))
        ));
    }
}
