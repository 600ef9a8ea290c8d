//! ---
//! ota_section: "03-persistence-logging"
//! ota_subsection: "tests"
//! ota_type: "source"
//! ota_scope: "test"
//! ota_description: "Installed-version ledger integration tests."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::fs;

use ota_common::{Target, TargetHash};
use ota_persistence::ledger::STATE_FILE;
use ota_persistence::{FileLedger, InstallMode, Ledger, PersistenceError};
use tempfile::tempdir;

#[test]
fn install_reboot_cycle_is_durable() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let old = Target::new("lmp-41", "aa11").with_version("41");
    let new = Target::new("lmp-42", "bb22").with_version("42");

    {
        let ledger = FileLedger::open(dir.path())?;
        ledger.save_current(&old)?;
        ledger.save_pending(&new)?;
    }

    // Process restarts across the reboot boundary.
    let ledger = FileLedger::open(dir.path())?;
    assert_eq!(ledger.load_pending()?, Some(new.clone()));
    assert_eq!(ledger.load_current()?, Some(old));

    ledger.save_current(&new)?;
    assert!(ledger.load_pending()?.is_none());

    let modes: Vec<_> = ledger.history()?.into_iter().map(|e| e.mode).collect();
    assert_eq!(
        modes,
        vec![InstallMode::Current, InstallMode::Pending, InstallMode::Current]
    );
    Ok(())
}

#[test]
fn tampered_envelope_refuses_to_open() -> anyhow::Result<()> {
    let dir = tempdir()?;
    {
        let ledger = FileLedger::open(dir.path())?;
        ledger.save_pending(&Target::new("lmp-42", "bb22"))?;
    }
    let path = dir.path().join(STATE_FILE);
    let tampered = fs::read_to_string(&path)?.replace("bb22", "cc33");
    fs::write(&path, tampered)?;

    match FileLedger::open(dir.path()) {
        Err(PersistenceError::LedgerCorrupted { path: bad }) => assert_eq!(bad, path),
        other => panic!("expected corruption error, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[test]
fn rolled_back_target_remains_searchable() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let ledger = FileLedger::open(dir.path())?;
    let bad = Target::new("lmp-43", "dd44");
    ledger.save_pending(&bad)?;
    ledger.mark_none(&bad)?;

    assert!(ledger.load_pending()?.is_none());
    let found = ledger.find_by_hash(&TargetHash::sha256("dd44"))?;
    assert_eq!(found.map(|t| t.filename), Some("lmp-43".to_owned()));
    Ok(())
}
