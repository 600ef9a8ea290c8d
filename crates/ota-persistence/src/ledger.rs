//! ---
//! ota_section: "03-persistence-logging"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Installed-version ledger and storage bindings."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use ota_common::{Target, TargetHash};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::install_log::{read_entries, InstallLogEntry, InstallLogWriter, InstallMode};
use crate::state::{load_state, save_state, LedgerState};
use crate::Result;

/// File name of the two-slot state envelope.
pub const STATE_FILE: &str = "installed_versions.json";
/// File name of the append-only installation log.
pub const LOG_FILE: &str = "installation.log";

/// Installed-version store consulted and mutated by the update engine.
///
/// At most one target is `pending` and at most one is `current`; every
/// mutation is also appended to the installation log.
pub trait Ledger: Send + Sync {
    /// Target installed but not yet booted, if any.
    fn load_pending(&self) -> Result<Option<Target>>;
    /// Target last confirmed running, if any.
    fn load_current(&self) -> Result<Option<Target>>;
    /// Record `target` as awaiting reboot, replacing any previous pending target.
    fn save_pending(&self, target: &Target) -> Result<()>;
    /// Record `target` as running; clears the pending slot if it held `target`.
    fn save_current(&self, target: &Target) -> Result<()>;
    /// Drop `target` from both slots, keeping it in the history.
    fn mark_none(&self, target: &Target) -> Result<()>;
    /// Append a history entry without touching the slots.
    fn append_log(&self, target: &Target, mode: InstallMode) -> Result<()>;
    /// Every logged target in chronological order.
    fn installation_log(&self) -> Result<Vec<Target>>;
    /// Most recent logged target carrying `hash`.
    fn find_by_hash(&self, hash: &TargetHash) -> Result<Option<Target>>;
}

struct Inner {
    state: LedgerState,
    writer: InstallLogWriter,
}

/// Ledger backed by `installed_versions.json` and `installation.log`.
pub struct FileLedger {
    dir: PathBuf,
    state_path: PathBuf,
    log_path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileLedger {
    /// Open (or create) the ledger stored under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let state_path = dir.join(STATE_FILE);
        let log_path = dir.join(LOG_FILE);
        let state = load_state(&state_path)?;
        let writer = InstallLogWriter::open(&log_path)?;
        debug!(
            dir = %dir.display(),
            current = ?state.current.as_ref().map(|t| t.filename.as_str()),
            pending = ?state.pending.as_ref().map(|t| t.filename.as_str()),
            "ledger opened"
        );
        Ok(Self {
            dir,
            state_path,
            log_path,
            inner: Mutex::new(Inner { state, writer }),
        })
    }

    /// Directory holding the ledger files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full history with modes and timestamps.
    pub fn history(&self) -> Result<Vec<InstallLogEntry>> {
        let _guard = self.inner.lock();
        read_entries(&self.log_path)
    }

    fn mutate<F>(&self, target: &Target, mode: InstallMode, update: F) -> Result<()>
    where
        F: FnOnce(&mut LedgerState),
    {
        let mut inner = self.inner.lock();
        let mut next = inner.state.clone();
        update(&mut next);
        save_state(&next, &self.state_path)?;
        inner.state = next;
        inner
            .writer
            .append(InstallLogEntry::new(stripped(target), mode))?;
        info!(
            target_name = %target.filename,
            mode = mode.as_str(),
            "installed version recorded"
        );
        Ok(())
    }
}

/// Correlation ids are per attempt; only the pending slot keeps one so the
/// post-reboot completion report links to its attempt.
fn stripped(target: &Target) -> Target {
    let mut target = target.clone();
    target.correlation_id = None;
    target
}

impl Ledger for FileLedger {
    fn load_pending(&self) -> Result<Option<Target>> {
        Ok(self.inner.lock().state.pending.clone())
    }

    fn load_current(&self) -> Result<Option<Target>> {
        Ok(self.inner.lock().state.current.clone())
    }

    fn save_pending(&self, target: &Target) -> Result<()> {
        self.mutate(target, InstallMode::Pending, |state| {
            state.pending = Some(target.clone());
        })
    }

    fn save_current(&self, target: &Target) -> Result<()> {
        self.mutate(target, InstallMode::Current, |state| {
            if state
                .pending
                .as_ref()
                .is_some_and(|pending| pending.same_content(target))
            {
                state.pending = None;
            }
            state.current = Some(stripped(target));
        })
    }

    fn mark_none(&self, target: &Target) -> Result<()> {
        self.mutate(target, InstallMode::None, |state| {
            if state
                .pending
                .as_ref()
                .is_some_and(|pending| pending.same_content(target))
            {
                state.pending = None;
            }
            if state
                .current
                .as_ref()
                .is_some_and(|current| current.same_content(target))
            {
                state.current = None;
            }
        })
    }

    fn append_log(&self, target: &Target, mode: InstallMode) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .writer
            .append(InstallLogEntry::new(stripped(target), mode))?;
        Ok(())
    }

    fn installation_log(&self) -> Result<Vec<Target>> {
        Ok(self
            .history()?
            .into_iter()
            .map(|entry| entry.target)
            .collect())
    }

    fn find_by_hash(&self, hash: &TargetHash) -> Result<Option<Target>> {
        Ok(self
            .history()?
            .into_iter()
            .rev()
            .map(|entry| entry.target)
            .find(|target| target.matches_hash(hash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pending_then_current_clears_pending() {
        let dir = tempdir().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();
        let target = Target::new("lmp-42", "bb22");

        ledger.save_pending(&target).unwrap();
        assert_eq!(ledger.load_pending().unwrap(), Some(target.clone()));
        assert!(ledger.load_current().unwrap().is_none());

        ledger.save_current(&target).unwrap();
        assert!(ledger.load_pending().unwrap().is_none());
        assert_eq!(ledger.load_current().unwrap(), Some(target));
    }

    #[test]
    fn second_pending_replaces_first() {
        let dir = tempdir().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();
        ledger.save_pending(&Target::new("lmp-1", "aa")).unwrap();
        ledger.save_pending(&Target::new("lmp-2", "bb")).unwrap();
        assert_eq!(
            ledger.load_pending().unwrap().unwrap().filename,
            "lmp-2"
        );
        assert_eq!(ledger.installation_log().unwrap().len(), 2);
    }

    #[test]
    fn mark_none_keeps_history() {
        let dir = tempdir().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();
        let current = Target::new("lmp-41", "aa11");
        let bad = Target::new("lmp-42", "bb22");
        ledger.save_current(&current).unwrap();
        ledger.save_pending(&bad).unwrap();

        ledger.mark_none(&bad).unwrap();
        assert!(ledger.load_pending().unwrap().is_none());
        assert_eq!(ledger.load_current().unwrap(), Some(current));
        let history = ledger.history().unwrap();
        assert_eq!(history.last().unwrap().mode, InstallMode::None);
        assert!(ledger
            .find_by_hash(&TargetHash::sha256("bb22"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn pending_keeps_correlation_id_across_reopen() {
        let dir = tempdir().unwrap();
        let mut target = Target::new("lmp-7", "cc33");
        target.correlation_id = Some("7-abc".into());
        {
            let ledger = FileLedger::open(dir.path()).unwrap();
            ledger.save_pending(&target).unwrap();
        }
        let ledger = FileLedger::open(dir.path()).unwrap();
        let pending = ledger.load_pending().unwrap().unwrap();
        assert_eq!(pending.filename, "lmp-7");
        assert_eq!(pending.correlation_id.as_deref(), Some("7-abc"));
        assert!(ledger.installation_log().unwrap()[0].correlation_id.is_none());

        ledger.save_current(&pending).unwrap();
        assert!(ledger.load_current().unwrap().unwrap().correlation_id.is_none());
    }

    #[test]
    fn find_by_hash_prefers_latest_entry() {
        let dir = tempdir().unwrap();
        let ledger = FileLedger::open(dir.path()).unwrap();
        ledger
            .save_current(&Target::new("lmp-1", "aa").with_version("1"))
            .unwrap();
        ledger
            .append_log(
                &Target::new("lmp-1-rebuilt", "aa").with_version("1b"),
                InstallMode::Current,
            )
            .unwrap();
        let found = ledger
            .find_by_hash(&TargetHash::sha256("AA"))
            .unwrap()
            .unwrap();
        assert_eq!(found.filename, "lmp-1-rebuilt");
        assert!(ledger
            .find_by_hash(&TargetHash::sha256("ff"))
            .unwrap()
            .is_none());
    }
}
