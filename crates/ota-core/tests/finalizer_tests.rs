//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use ota_common::Target;
use ota_core::{BootFinalizationOutcome, BootOracle, ResultCode, UpdateError};
use ota_persistence::{InstallMode, Ledger};
use ota_testharness::{target, Harness};

const FACTORY: &str = "0000aaaa";
const NEW: &str = "1111bbbb";

fn installed(harness: &Harness, target: &Target) {
    harness.ledger.save_current(target).unwrap();
}

#[test]
fn pending_image_booted_becomes_current() {
    let harness = Harness::new(NEW).unwrap();
    let x = target("lmp-2", NEW, "2");
    harness.ledger.save_pending(&x).unwrap();

    let report = harness.finalizer().finalize().unwrap();

    assert_eq!(report.outcome, BootFinalizationOutcome::Completed(x.clone()));
    assert_eq!(report.outcome.result_code(), ResultCode::Ok);
    assert_eq!(report.active, x);
    assert_eq!(harness.ledger.load_current().unwrap(), Some(x));
    assert!(harness.ledger.load_pending().unwrap().is_none());

    let events = harness.reports.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].type_id(), "EcuInstallationCompleted");
    assert_eq!(events[0].event.success, Some(true));
    assert!(!harness.boot.flag_set());
}

#[test]
fn reboot_into_old_image_is_a_rollback() {
    let harness = Harness::new(FACTORY).unwrap();
    let factory = target("lmp-1", FACTORY, "1");
    let x = target("lmp-2", NEW, "2");
    installed(&harness, &factory);
    harness.ledger.save_pending(&x).unwrap();
    harness.boot.set_reboot_flag().unwrap();
    harness.reboot_into(FACTORY);

    let report = harness.finalizer().finalize().unwrap();

    assert_eq!(report.outcome, BootFinalizationOutcome::RolledBack(x.clone()));
    assert_eq!(report.outcome.result_code(), ResultCode::InstallFailed);
    assert_eq!(report.active, factory);
    assert!(harness.ledger.load_pending().unwrap().is_none());
    assert_eq!(harness.ledger.load_current().unwrap(), Some(factory));

    let history = harness.ledger.history().unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.mode, InstallMode::None);
    assert_eq!(last.target, x);

    let events = harness.reports.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.success, Some(false));
}

#[test]
fn pending_without_reboot_stays_pending() {
    let harness = Harness::new(FACTORY).unwrap();
    let x = target("lmp-2", NEW, "2");
    harness.ledger.save_pending(&x).unwrap();
    harness.boot.set_reboot_flag().unwrap();

    let report = harness.finalizer().finalize().unwrap();

    assert_eq!(report.outcome, BootFinalizationOutcome::StillPending(x.clone()));
    assert_eq!(harness.ledger.load_pending().unwrap(), Some(x));
    assert!(harness.boot.flag_set());
    assert_eq!(harness.reports.event_ids(), vec!["EcuInstallationApplied"]);
}

#[test]
fn older_history_entry_matches_without_notification() {
    let harness = Harness::new(FACTORY).unwrap();
    let y = target("lmp-1", FACTORY, "1");
    let z = target("lmp-2", NEW, "2");
    installed(&harness, &y);
    installed(&harness, &z);

    let report = harness.finalizer().finalize().unwrap();

    assert_eq!(report.outcome, BootFinalizationOutcome::HistoricalMatch(y.clone()));
    assert_eq!(report.outcome.result_code(), ResultCode::AlreadyProcessed);
    assert_eq!(report.active, y);
    assert!(harness.reports.events().is_empty());
}

#[test]
fn unknown_booted_image_reports_no_pending_update() {
    let harness = Harness::new(FACTORY).unwrap();

    let report = harness.finalizer().finalize().unwrap();

    assert_eq!(report.outcome, BootFinalizationOutcome::NoPendingUpdate);
    assert_eq!(report.outcome.result_code(), ResultCode::Unknown);
    assert!(report.active.is_unknown());
    assert_eq!(report.booted_hash, FACTORY);
    assert_eq!(harness.reports.count("EcuInstallationCompleted"), 1);
}

#[test]
fn unreadable_boot_state_is_fatal() {
    let harness = Harness::new(FACTORY).unwrap();
    harness.boot.fail_booted_hash(true);

    let err = harness.finalizer().finalize().unwrap_err();
    assert!(matches!(err, UpdateError::Precondition(_)));
    assert!(err.is_fatal());
}

#[test]
fn completed_install_survives_restart() {
    let mut harness = Harness::new(FACTORY).unwrap();
    let x = target("lmp-2", NEW, "2");
    harness.ledger.save_pending(&x).unwrap();
    harness.boot.set_reboot_flag().unwrap();

    harness.reboot_into(NEW);
    harness.restart().unwrap();
    let first = harness.finalizer().finalize().unwrap();
    assert_eq!(first.outcome, BootFinalizationOutcome::Completed(x.clone()));

    harness.restart().unwrap();
    harness.reports.clear();
    let second = harness.finalizer().finalize().unwrap();
    assert_eq!(second.outcome, BootFinalizationOutcome::HistoricalMatch(x.clone()));
    assert_eq!(second.active, x);
    assert!(harness.reports.events().is_empty());
}

#[tokio::test]
async fn completion_report_links_to_install_attempt() {
    let mut harness = Harness::new(FACTORY).unwrap();
    let x = target("lmp-2", NEW, "2");
    let report = harness.pipeline().run(&x, None).await.unwrap();
    assert_eq!(report.code, ResultCode::NeedCompletion);
    let attempt = report.target.correlation_id.clone().unwrap();
    drop(report);

    harness.restart().unwrap();
    harness.reboot_into(NEW);
    harness.reports.clear();
    let finalized = harness.finalizer().finalize().unwrap();

    assert!(matches!(finalized.outcome, BootFinalizationOutcome::Completed(_)));
    let events = harness.reports.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].type_id(), "EcuInstallationCompleted");
    assert_eq!(events[0].event.correlation_id, attempt);
    assert!(harness.ledger.load_current().unwrap().unwrap().correlation_id.is_none());
}
