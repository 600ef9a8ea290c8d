//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use ota_common::Target;
use ota_core::{DaemonState, Iteration, UpdateError, UpdateLock};
use ota_persistence::Ledger;
use ota_testharness::{target, FakeRebootTrigger, Harness, PackageCall};

const FACTORY: &str = "0000aaaa";
const NEW: &str = "1111bbbb";

fn factory() -> Target {
    target("lmp-1", FACTORY, "1")
}

fn seeded(booted: &str) -> Harness {
    let harness = Harness::new(booted).unwrap();
    harness.ledger.save_current(&factory()).unwrap();
    harness
}

#[tokio::test]
async fn new_target_triggers_exactly_one_reboot() {
    let harness = seeded(FACTORY);
    let y = target("lmp-2", NEW, "2");
    harness.metadata.publish(vec![factory(), y.clone()]);
    let mut daemon = harness.daemon(harness.daemon_settings().unwrap(), factory());

    assert_eq!(daemon.iterate().await.unwrap(), Iteration::RebootRequested(y.clone()));
    assert_eq!(harness.reboot.calls(), 1);
    assert!(daemon.state().is_awaiting_reboot());
    assert_eq!(harness.ledger.load_pending().unwrap(), Some(y.clone()));
    assert!(UpdateLock::try_acquire(harness.lockfile()).unwrap().is_none());

    assert_eq!(daemon.iterate().await.unwrap(), Iteration::Skipped(y.clone()));
    assert_eq!(daemon.iterate().await.unwrap(), Iteration::Skipped(y));
    assert_eq!(harness.reboot.calls(), 1);
    assert_eq!(harness.packages.calls().len(), 3);
    assert_eq!(harness.metadata.refreshes(), 3);
    assert_eq!(harness.reports.network_reports(), 3);
}

#[tokio::test]
async fn newer_target_waits_for_pending_reboot() {
    let harness = seeded(FACTORY);
    let y = target("lmp-2", NEW, "2");
    harness.metadata.publish(vec![factory(), y.clone()]);
    let mut daemon = harness.daemon(harness.daemon_settings().unwrap(), factory());
    assert_eq!(daemon.iterate().await.unwrap(), Iteration::RebootRequested(y.clone()));

    let z = target("lmp-3", "2222cccc", "3");
    harness.metadata.publish(vec![factory(), y.clone(), z.clone()]);
    let next = tokio::time::timeout(Duration::from_secs(3), daemon.iterate())
        .await
        .expect("iteration must not block on the retained lock")
        .unwrap();

    assert_eq!(next, Iteration::Skipped(z));
    assert_eq!(harness.packages.calls().len(), 3);
    assert_eq!(harness.reboot.calls(), 1);
    assert_eq!(harness.ledger.load_pending().unwrap(), Some(y));
    assert!(daemon.state().is_awaiting_reboot());
}

#[tokio::test]
async fn up_to_date_device_does_nothing() {
    let harness = seeded(FACTORY);
    harness.metadata.publish(vec![factory()]);
    let mut daemon = harness.daemon(harness.daemon_settings().unwrap(), factory());

    assert_eq!(daemon.iterate().await.unwrap(), Iteration::UpToDate);
    assert!(harness.packages.calls().is_empty());
    assert!(matches!(daemon.state(), DaemonState::Idle));
}

#[tokio::test]
async fn targets_for_other_hardware_are_ignored() {
    let harness = seeded(FACTORY);
    harness
        .metadata
        .publish(vec![Target::new("imx-9", NEW).with_version("9").with_hardware_id("imx8mm")]);
    let mut daemon = harness.daemon(harness.daemon_settings().unwrap(), factory());

    assert_eq!(daemon.iterate().await.unwrap(), Iteration::UpToDate);
    assert_eq!(harness.reboot.calls(), 0);
}

#[tokio::test]
async fn failed_reboot_command_is_fatal() {
    let mut harness = seeded(FACTORY);
    harness.reboot = Arc::new(FakeRebootTrigger::exiting_with(1));
    harness.metadata.publish(vec![target("lmp-2", NEW, "2")]);
    let mut daemon = harness.daemon(harness.daemon_settings().unwrap(), factory());

    let err = daemon.iterate().await.unwrap_err();
    assert!(matches!(err, UpdateError::RebootTriggerFailed(_)));
    assert!(err.is_fatal());
    assert_eq!(harness.reboot.calls(), 1);
}

#[tokio::test]
async fn unspawnable_reboot_command_is_fatal() {
    let harness = seeded(FACTORY);
    harness.reboot.fail_spawn();
    harness.metadata.publish(vec![target("lmp-2", NEW, "2")]);
    let mut daemon = harness.daemon(harness.daemon_settings().unwrap(), factory());

    assert!(matches!(
        daemon.iterate().await,
        Err(UpdateError::RebootTriggerFailed(_))
    ));
}

#[tokio::test]
async fn same_image_with_new_apps_is_adopted_without_reboot() {
    let harness = seeded(FACTORY);
    let running = factory().with_app("shellhttpd", "hub.example/shellhttpd@sha256:01");
    harness.ledger.save_current(&running).unwrap();
    let apps_update = target("lmp-3", FACTORY, "3")
        .with_app("shellhttpd", "hub.example/shellhttpd@sha256:02");
    harness.metadata.publish(vec![running.clone(), apps_update.clone()]);

    let mut settings = harness.daemon_settings().unwrap();
    settings.compare_apps = true;
    let mut daemon = harness.daemon(settings, running);

    assert_eq!(daemon.iterate().await.unwrap(), Iteration::Adopted(apps_update.clone()));
    assert_eq!(harness.reboot.calls(), 0);
    assert_eq!(daemon.active().filename, "lmp-3");
    assert!(matches!(daemon.state(), DaemonState::Idle));
    assert!(harness.ledger.load_pending().unwrap().is_none());
    assert_eq!(
        harness.ledger.load_current().unwrap().map(|t| t.filename),
        Some("lmp-3".to_owned())
    );
    assert!(UpdateLock::try_acquire(harness.lockfile()).unwrap().is_some());
    let history = harness.ledger.history().unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().filter(|e| e.target.filename == "lmp-3").count(), 1);

    assert_eq!(daemon.iterate().await.unwrap(), Iteration::UpToDate);
}

#[tokio::test]
async fn unavailable_metadata_backs_off() {
    let harness = seeded(FACTORY);
    harness.metadata.set_online(false);
    harness.metadata.seed_cache(vec![target("lmp-2", NEW, "2")]);
    let mut daemon = harness.daemon(harness.daemon_settings().unwrap(), factory());

    assert_eq!(daemon.iterate().await.unwrap(), Iteration::MetadataUnavailable);
    assert_eq!(harness.metadata.refreshes(), 1);
    assert_eq!(harness.reports.network_reports(), 0);
    assert!(harness.packages.calls().is_empty());

    harness.metadata.set_online(true);
    harness.metadata.publish(vec![factory()]);
    assert_eq!(daemon.iterate().await.unwrap(), Iteration::UpToDate);
}

#[tokio::test]
async fn rolled_back_target_is_not_retried() {
    let harness = seeded(FACTORY);
    let y = target("lmp-2", NEW, "2");
    harness.ledger.save_pending(&y).unwrap();
    harness.ledger.mark_none(&y).unwrap();
    harness.metadata.publish(vec![factory(), y.clone()]);
    let mut daemon = harness.daemon(harness.daemon_settings().unwrap(), factory());

    assert_eq!(daemon.iterate().await.unwrap(), Iteration::Skipped(y));
    assert!(harness.packages.calls().is_empty());
    assert_eq!(harness.reboot.calls(), 0);

    let z = target("lmp-3", "2222cccc", "3");
    harness.metadata.publish(vec![factory(), z.clone()]);
    assert_eq!(daemon.iterate().await.unwrap(), Iteration::RebootRequested(z));
}

#[tokio::test]
async fn download_failure_is_retried_next_iteration() {
    let harness = seeded(FACTORY);
    let y = target("lmp-2", NEW, "2");
    harness.metadata.publish(vec![y.clone()]);
    harness.packages.fail_download("timeout");
    let mut daemon = harness.daemon(harness.daemon_settings().unwrap(), factory());

    assert_eq!(daemon.iterate().await.unwrap(), Iteration::UpdateFailed(y.clone()));
    assert_eq!(daemon.iterate().await.unwrap(), Iteration::UpdateFailed(y));
    assert_eq!(
        harness.packages.calls(),
        vec![
            PackageCall::Download("lmp-2".into()),
            PackageCall::Download("lmp-2".into()),
        ]
    );
    assert_eq!(harness.reboot.calls(), 0);
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let harness = seeded(FACTORY);
    let y = target("lmp-2", NEW, "2");
    harness.metadata.publish(vec![y]);
    let daemon = harness.daemon(harness.daemon_settings().unwrap(), factory());

    daemon
        .run(tokio::time::sleep(Duration::from_millis(150)))
        .await
        .unwrap();

    assert_eq!(harness.reboot.calls(), 1);
    assert!(harness.metadata.refreshes() >= 2);
}

#[tokio::test]
async fn run_refuses_missing_repo_server() {
    let harness = seeded(FACTORY);
    let mut settings = harness.daemon_settings().unwrap();
    settings.repo_server = None;
    let daemon = harness.daemon(settings, factory());

    let err = daemon.run(std::future::pending::<()>()).await.unwrap_err();
    assert!(matches!(err, UpdateError::Precondition(_)));
    assert_eq!(harness.metadata.refreshes(), 0);
}
