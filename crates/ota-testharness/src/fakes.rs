//! ---
//! ota_section: "11-test-harness"
//! ota_subsection: "02-fakes"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Scripted fake collaborators for the update engine."
//! ota_version: "v0.1.0"
//! ota_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ota_common::Target;
use ota_core::{
    BootOracle, InstallOutcome, MetadataSource, PackageManager, RebootTrigger, ReportEvent,
    ReportSink, ResultCode, TargetStatus,
};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct MetadataState {
    remote: Vec<Target>,
    cached: Option<Vec<Target>>,
    loaded: Vec<Target>,
    online: bool,
    refreshes: usize,
}

/// Metadata source with a switchable "network" and a local cache.
#[derive(Debug)]
pub struct FakeMetadataSource {
    state: Mutex<MetadataState>,
}

impl Default for FakeMetadataSource {
    fn default() -> Self {
        Self {
            state: Mutex::new(MetadataState {
                online: true,
                ..MetadataState::default()
            }),
        }
    }
}

impl FakeMetadataSource {
    pub fn with_targets(targets: Vec<Target>) -> Self {
        let source = Self::default();
        source.publish(targets);
        source
    }

    /// Replace what the repository serves.
    pub fn publish(&self, targets: Vec<Target>) {
        self.state.lock().remote = targets;
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Seed the local cache as if a previous refresh had succeeded.
    pub fn seed_cache(&self, targets: Vec<Target>) {
        self.state.lock().cached = Some(targets);
    }

    pub fn refreshes(&self) -> usize {
        self.state.lock().refreshes
    }
}

#[async_trait]
impl MetadataSource for FakeMetadataSource {
    async fn refresh(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.refreshes += 1;
        if !state.online {
            return Err(anyhow!("repository unreachable"));
        }
        state.loaded = state.remote.clone();
        state.cached = Some(state.remote.clone());
        Ok(())
    }

    async fn targets_offline(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.cached.clone() {
            Some(cached) => {
                state.loaded = cached;
                Ok(())
            }
            None => Err(anyhow!("no cached metadata")),
        }
    }

    fn all_targets(&self) -> Vec<Target> {
        self.state.lock().loaded.clone()
    }
}

#[derive(Debug, Default)]
struct BootState {
    booted: String,
    boot_generation: u64,
    flag: Option<u64>,
    fail_hash: bool,
}

/// Boot oracle whose booted image and reboots are driven by the test.
#[derive(Debug, Default)]
pub struct FakeBootOracle {
    state: Mutex<BootState>,
}

impl FakeBootOracle {
    pub fn booted(hash: impl Into<String>) -> Self {
        let oracle = Self::default();
        oracle.state.lock().booted = hash.into();
        oracle
    }

    /// Reboot into `hash`.
    pub fn reboot_into(&self, hash: impl Into<String>) {
        let mut state = self.state.lock();
        state.booted = hash.into();
        state.boot_generation += 1;
    }

    pub fn fail_booted_hash(&self, fail: bool) {
        self.state.lock().fail_hash = fail;
    }

    pub fn flag_set(&self) -> bool {
        self.state.lock().flag.is_some()
    }
}

impl BootOracle for FakeBootOracle {
    fn booted_image_hash(&self) -> Result<String> {
        let state = self.state.lock();
        if state.fail_hash {
            return Err(anyhow!("no booted deployment"));
        }
        Ok(state.booted.clone())
    }

    fn reboot_detected(&self) -> bool {
        let state = self.state.lock();
        state.flag != Some(state.boot_generation)
    }

    fn set_reboot_flag(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.flag = Some(state.boot_generation);
        Ok(())
    }

    fn clear_reboot_flag(&self) -> Result<()> {
        self.state.lock().flag = None;
        Ok(())
    }
}

/// One call observed by [`FakePackageManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageCall {
    Download(String),
    Verify(String),
    Install(String),
}

#[derive(Debug)]
struct PackageScript {
    download_error: Option<String>,
    verify: TargetStatus,
    install: Option<InstallOutcome>,
    booted: Option<String>,
    calls: Vec<PackageCall>,
    installed: Vec<Target>,
}

/// Package manager with scripted results.
///
/// Unless an install outcome is scripted, installs report `NeedCompletion`
/// when the target hash differs from the hash set via [`Self::set_booted`],
/// and `Ok` otherwise.
#[derive(Debug)]
pub struct FakePackageManager {
    script: Mutex<PackageScript>,
}

impl Default for FakePackageManager {
    fn default() -> Self {
        Self {
            script: Mutex::new(PackageScript {
                download_error: None,
                verify: TargetStatus::Good,
                install: None,
                booted: None,
                calls: Vec::new(),
                installed: Vec::new(),
            }),
        }
    }
}

impl FakePackageManager {
    pub fn fail_download(&self, reason: impl Into<String>) {
        self.script.lock().download_error = Some(reason.into());
    }

    pub fn set_verify(&self, status: TargetStatus) {
        self.script.lock().verify = status;
    }

    pub fn set_install(&self, outcome: InstallOutcome) {
        self.script.lock().install = Some(outcome);
    }

    pub fn set_booted(&self, hash: impl Into<String>) {
        self.script.lock().booted = Some(hash.into());
    }

    pub fn calls(&self) -> Vec<PackageCall> {
        self.script.lock().calls.clone()
    }

    /// Targets as handed to `install`, correlation id and ECUs included.
    pub fn installed(&self) -> Vec<Target> {
        self.script.lock().installed.clone()
    }
}

#[async_trait]
impl PackageManager for FakePackageManager {
    async fn download(&self, target: &Target) -> Result<()> {
        let mut script = self.script.lock();
        script
            .calls
            .push(PackageCall::Download(target.filename.clone()));
        match &script.download_error {
            Some(reason) => Err(anyhow!(reason.clone())),
            None => Ok(()),
        }
    }

    async fn verify(&self, target: &Target) -> TargetStatus {
        let mut script = self.script.lock();
        script.calls.push(PackageCall::Verify(target.filename.clone()));
        script.verify.clone()
    }

    async fn install(&self, target: &Target) -> InstallOutcome {
        let mut script = self.script.lock();
        script
            .calls
            .push(PackageCall::Install(target.filename.clone()));
        script.installed.push(target.clone());
        if let Some(outcome) = &script.install {
            return outcome.clone();
        }
        let unchanged = script
            .booted
            .as_deref()
            .is_some_and(|booted| target.matches_sha256(booted));
        if unchanged {
            InstallOutcome::new(ResultCode::Ok, "image already deployed")
        } else {
            InstallOutcome::new(
                ResultCode::NeedCompletion,
                "deployment staged, reboot to activate",
            )
        }
    }
}

/// Reboot trigger that records invocations instead of rebooting.
#[derive(Debug, Default)]
pub struct FakeRebootTrigger {
    exit_code: Mutex<i32>,
    spawn_error: Mutex<bool>,
    calls: Mutex<Vec<PathBuf>>,
}

impl FakeRebootTrigger {
    pub fn exiting_with(code: i32) -> Self {
        let trigger = Self::default();
        *trigger.exit_code.lock() = code;
        trigger
    }

    pub fn fail_spawn(&self) {
        *self.spawn_error.lock() = true;
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RebootTrigger for FakeRebootTrigger {
    async fn execute(&self, command: &Path) -> Result<i32> {
        self.calls.lock().push(command.to_path_buf());
        if *self.spawn_error.lock() {
            return Err(anyhow!("failed to spawn {}", command.display()));
        }
        Ok(*self.exit_code.lock())
    }
}

/// Report sink that keeps every queued event.
#[derive(Debug, Default)]
pub struct RecordingReportSink {
    events: Mutex<Vec<ReportEvent>>,
    network_reports: Mutex<usize>,
}

impl RecordingReportSink {
    pub fn events(&self) -> Vec<ReportEvent> {
        self.events.lock().clone()
    }

    /// Event type ids in queue order.
    pub fn event_ids(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|event| event.type_id().to_owned())
            .collect()
    }

    pub fn count(&self, type_id: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.type_id() == type_id)
            .count()
    }

    pub fn network_reports(&self) -> usize {
        *self.network_reports.lock()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl ReportSink for RecordingReportSink {
    fn enqueue(&self, event: ReportEvent) {
        self.events.lock().push(event);
    }

    async fn report_network_info(&self) -> Result<()> {
        *self.network_reports.lock() += 1;
        Ok(())
    }
}
