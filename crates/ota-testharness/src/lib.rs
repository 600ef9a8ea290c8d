//! ---
//! ota_section: "11-test-harness"
//! ota_subsection: "01-bootstrap"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Test harness wiring and shared exports."
//! ota_version: "v0.1.0"
//! ota_owner: "tbd"
//! ---
//! Scripted collaborators and a pre-wired engine for integration tests.
//!
//! [`Harness`] owns a temporary ledger directory plus one fake of each
//! collaborator, and builds finalizers, pipelines and daemon loops over them.

pub mod fakes;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ota_common::{Target, VerificationFailurePolicy};
use ota_core::daemon::METADATA_RETRY;
use ota_core::{
    BootFinalizer, DaemonLoop, DaemonSettings, EcuIdentity, NotificationEmitter, ReportSink,
    UpdatePipeline,
};
use ota_persistence::{FileLedger, Ledger};
use tempfile::TempDir;

pub use fakes::{
    FakeBootOracle, FakeMetadataSource, FakePackageManager, FakeRebootTrigger, PackageCall,
    RecordingReportSink,
};

pub const HARDWARE_ID: &str = "raspberrypi4-64";
pub const ECU_SERIAL: &str = "ecu-test-0001";

/// Target compatible with [`HARDWARE_ID`].
pub fn target(filename: &str, sha256: &str, version: &str) -> Target {
    Target::new(filename, sha256)
        .with_version(version)
        .with_hardware_id(HARDWARE_ID)
}

/// A ledger on disk plus one fake per collaborator.
pub struct Harness {
    dir: TempDir,
    pub ledger: Arc<FileLedger>,
    pub metadata: Arc<FakeMetadataSource>,
    pub boot: Arc<FakeBootOracle>,
    pub packages: Arc<FakePackageManager>,
    pub reboot: Arc<FakeRebootTrigger>,
    pub reports: Arc<RecordingReportSink>,
    pub verification: VerificationFailurePolicy,
    pub report_events: bool,
}

impl Harness {
    /// Fresh harness with the device booted into `booted_hash`.
    pub fn new(booted_hash: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let ledger = Arc::new(FileLedger::open(dir.path().join("sota"))?);
        let packages = FakePackageManager::default();
        packages.set_booted(booted_hash);
        Ok(Self {
            dir,
            ledger,
            metadata: Arc::new(FakeMetadataSource::default()),
            boot: Arc::new(FakeBootOracle::booted(booted_hash)),
            packages: Arc::new(packages),
            reboot: Arc::new(FakeRebootTrigger::default()),
            reports: Arc::new(RecordingReportSink::default()),
            verification: VerificationFailurePolicy::default(),
            report_events: true,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn lockfile(&self) -> PathBuf {
        self.dir.path().join("ota.lock")
    }

    /// Reopen the ledger from disk, as a restarted process would.
    pub fn restart(&mut self) -> anyhow::Result<()> {
        self.ledger = Arc::new(FileLedger::open(self.dir.path().join("sota"))?);
        Ok(())
    }

    /// Reboot the fake device into `hash`, keeping the package manager in sync.
    pub fn reboot_into(&self, hash: &str) {
        self.boot.reboot_into(hash);
        self.packages.set_booted(hash);
    }

    pub fn notifier(&self) -> NotificationEmitter {
        if !self.report_events {
            return NotificationEmitter::disabled();
        }
        let sink: Arc<dyn ReportSink> = self.reports.clone();
        NotificationEmitter::new(Some(sink), ECU_SERIAL)
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }

    pub fn finalizer(&self) -> BootFinalizer {
        BootFinalizer::new(self.ledger(), self.boot.clone(), self.notifier(), None)
    }

    pub fn pipeline(&self) -> UpdatePipeline {
        UpdatePipeline::new(
            self.packages.clone(),
            self.ledger(),
            self.boot.clone(),
            self.notifier(),
            EcuIdentity {
                serial: ECU_SERIAL.to_owned(),
                hardware_id: HARDWARE_ID.to_owned(),
            },
        )
        .with_verification_policy(self.verification)
    }

    /// Settings pointing at an executable fake reboot script in the harness dir.
    pub fn daemon_settings(&self) -> anyhow::Result<DaemonSettings> {
        use std::os::unix::fs::PermissionsExt;

        let reboot_command = self.dir.path().join("reboot.sh");
        std::fs::write(&reboot_command, "#!/bin/sh\nexit 0\n")?;
        std::fs::set_permissions(&reboot_command, std::fs::Permissions::from_mode(0o755))?;
        Ok(DaemonSettings {
            hardware_id: HARDWARE_ID.to_owned(),
            tags: Vec::new(),
            compare_apps: false,
            interval: Duration::from_millis(20),
            lockfile: Some(self.lockfile()),
            reboot_command,
            repo_server: Some("https://ota.example.invalid/repo".to_owned()),
            report_network: true,
            metadata_retry: METADATA_RETRY.min(Duration::from_millis(20)),
        })
    }

    pub fn daemon(&self, settings: DaemonSettings, active: Target) -> DaemonLoop {
        DaemonLoop::new(
            settings,
            self.metadata.clone(),
            self.pipeline(),
            self.boot.clone(),
            self.reboot.clone(),
            active,
        )
    }
}
