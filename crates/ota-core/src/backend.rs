//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Collaborator seams of the engine. Concrete implementations live in
//! `ota-net` (HTTP), [`crate::deployment`] (sysroot, reboot command) and the
//! test harness.

use std::path::Path;

use async_trait::async_trait;
use ota_common::Target;

use crate::notify::ReportEvent;
use crate::result::{InstallOutcome, TargetStatus};

/// Source of the signed-elsewhere targets list.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetch fresh metadata from the repository and make it current.
    async fn refresh(&self) -> anyhow::Result<()>;
    /// Load the last-known-good local copy and make it current.
    async fn targets_offline(&self) -> anyhow::Result<()>;
    /// Targets from the most recently loaded metadata.
    fn all_targets(&self) -> Vec<Target>;
}

/// What the device actually booted, and whether it rebooted since an install.
pub trait BootOracle: Send + Sync {
    /// Primary hash of the running image.
    fn booted_image_hash(&self) -> anyhow::Result<String>;
    /// True when a reboot happened since the flag was set.
    fn reboot_detected(&self) -> bool;
    /// Remember that an install now waits for a reboot.
    fn set_reboot_flag(&self) -> anyhow::Result<()>;
    fn clear_reboot_flag(&self) -> anyhow::Result<()>;
}

/// Fetches, checks and applies images.
#[async_trait]
pub trait PackageManager: Send + Sync {
    async fn download(&self, target: &Target) -> anyhow::Result<()>;
    async fn verify(&self, target: &Target) -> TargetStatus;
    async fn install(&self, target: &Target) -> InstallOutcome;
}

/// Runs the configured reboot command.
#[async_trait]
pub trait RebootTrigger: Send + Sync {
    /// Execute `command` and return its exit code.
    async fn execute(&self, command: &Path) -> anyhow::Result<i32>;
}

/// Best-effort delivery of lifecycle events to the backend.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Queue an event; never blocks on the network.
    fn enqueue(&self, event: ReportEvent);
    /// Publish the device's network details.
    async fn report_network_info(&self) -> anyhow::Result<()>;
}
