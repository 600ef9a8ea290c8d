//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Polling loop: refresh metadata, pick the latest target, install it, and
//! decide whether the device has to reboot.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ota_common::{AgentConfig, Target};
use ota_metrics::AgentMetrics;
use tracing::{debug, error, info, warn};

use crate::backend::{BootOracle, MetadataSource, RebootTrigger};
use crate::deployment::is_executable;
use crate::error::{Result, UpdateError};
use crate::lock::UpdateLock;
use crate::matcher::{known_local_target, select_latest, targets_eq};
use crate::pipeline::UpdatePipeline;
use crate::result::ResultCode;

/// Wait after a failed metadata refresh.
pub const METADATA_RETRY: Duration = Duration::from_secs(10);

/// Static inputs of the loop.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub hardware_id: String,
    pub tags: Vec<String>,
    pub compare_apps: bool,
    pub interval: Duration,
    pub lockfile: Option<PathBuf>,
    pub reboot_command: PathBuf,
    pub repo_server: Option<String>,
    pub report_network: bool,
    pub metadata_retry: Duration,
}

impl DaemonSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            hardware_id: config.provision.primary_ecu_hardware_id.clone(),
            tags: config.pacman.tags.clone(),
            compare_apps: config.compare_apps(),
            interval: config.uptane.polling_sec,
            lockfile: config.update.lockfile.clone(),
            reboot_command: config.bootloader.reboot_command.clone(),
            repo_server: config.uptane.repo_server.clone(),
            report_network: config.report_network(),
            metadata_retry: METADATA_RETRY,
        }
    }

    /// Startup requirements; failing either is fatal.
    pub fn check_preconditions(&self) -> Result<()> {
        if self
            .repo_server
            .as_deref()
            .map_or(true, |server| server.trim().is_empty())
        {
            return Err(UpdateError::Precondition(
                "[uptane]/repo_server is not configured".into(),
            ));
        }
        if !is_executable(&self.reboot_command) {
            return Err(UpdateError::Precondition(format!(
                "reboot command: {} is not executable",
                self.reboot_command.display()
            )));
        }
        Ok(())
    }
}

/// Where the loop stands between iterations.
#[derive(Debug, Default)]
pub enum DaemonState {
    #[default]
    Idle,
    /// Reboot requested for `target`; the update lock stays held until then.
    AwaitingReboot {
        target: Target,
        lock: Option<UpdateLock>,
    },
}

impl DaemonState {
    pub fn is_awaiting_reboot(&self) -> bool {
        matches!(self, DaemonState::AwaitingReboot { .. })
    }
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum Iteration {
    /// Metadata refresh failed; retry after the backoff.
    MetadataUnavailable,
    /// Nothing eligible, or the selection equals the active target.
    UpToDate,
    /// Selection skipped (awaiting reboot or previously rolled back).
    Skipped(Target),
    /// The attempt failed without ending the loop.
    UpdateFailed(Target),
    /// Installed with an unchanged image hash; adopted without reboot.
    Adopted(Target),
    /// Installed and the reboot command succeeded.
    RebootRequested(Target),
}

pub struct DaemonLoop {
    settings: DaemonSettings,
    metadata: Arc<dyn MetadataSource>,
    pipeline: UpdatePipeline,
    boot: Arc<dyn BootOracle>,
    reboot: Arc<dyn RebootTrigger>,
    metrics: Option<AgentMetrics>,
    active: Target,
    state: DaemonState,
}

impl DaemonLoop {
    pub fn new(
        settings: DaemonSettings,
        metadata: Arc<dyn MetadataSource>,
        pipeline: UpdatePipeline,
        boot: Arc<dyn BootOracle>,
        reboot: Arc<dyn RebootTrigger>,
        active: Target,
    ) -> Self {
        Self {
            settings,
            metadata,
            pipeline,
            boot,
            reboot,
            metrics: None,
            active,
            state: DaemonState::Idle,
        }
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn active(&self) -> &Target {
        &self.active
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// Run iterations until `shutdown` resolves or a fatal error occurs.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.settings.check_preconditions()?;
        info!(active = %self.active, interval_s = self.settings.interval.as_secs(), "daemon started");
        tokio::pin!(shutdown);

        loop {
            let wait = match self.iterate().await? {
                Iteration::MetadataUnavailable => self.settings.metadata_retry,
                _ => self.settings.interval,
            };
            tokio::select! {
                _ = &mut shutdown => {
                    info!("daemon shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
        Ok(())
    }

    /// One pass of the loop body, without the trailing sleep.
    pub async fn iterate(&mut self) -> Result<Iteration> {
        info!("refreshing target metadata");
        if let Err(err) = self.metadata.refresh().await {
            warn!(error = %format!("{err:#}"), "unable to update latest metadata");
            if let Some(metrics) = &self.metrics {
                metrics.inc_metadata_failure();
            }
            return Ok(Iteration::MetadataUnavailable);
        }

        if self.settings.report_network {
            if let Some(sink) = self.pipeline.notifier().sink() {
                if let Err(err) = sink.report_network_info().await {
                    debug!(error = %format!("{err:#}"), "network info report failed");
                }
            }
        }

        let targets = self.metadata.all_targets();
        let Some(target) = select_latest(&targets, &self.settings.hardware_id, &self.settings.tags)
        else {
            debug!(candidates = targets.len(), "no eligible target");
            return Ok(Iteration::UpToDate);
        };
        if targets_eq(&target, &self.active, self.settings.compare_apps) {
            debug!(target_name = %target.filename, "active target is latest");
            return Ok(Iteration::UpToDate);
        }
        // A reboot is committed and the update lock is still held.
        if let DaemonState::AwaitingReboot { target: waiting, .. } = &self.state {
            info!(
                target_name = %target.filename,
                waiting = %waiting.filename,
                "update installed, waiting for reboot"
            );
            return Ok(Iteration::Skipped(target));
        }
        if self.previously_rolled_back(&target)? {
            return Ok(Iteration::Skipped(target));
        }

        info!(target_name = %target.filename, version = %target.custom_version, "updating base image");
        let report = match self
            .pipeline
            .run(&target, self.settings.lockfile.as_deref())
            .await
        {
            Ok(report) => report,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(target_name = %target.filename, error = %err, "update attempt failed");
                return Ok(Iteration::UpdateFailed(target));
            }
        };

        if self.same_image(&report.target) {
            info!("update applied, hashes haven't changed");
            if report.code == ResultCode::NeedCompletion {
                self.pipeline.ledger().save_current(&report.target)?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_ledger_write("current");
                }
            }
            drop(report.retained_lock);
            if let Err(err) = self.boot.clear_reboot_flag() {
                warn!(error = %format!("{err:#}"), "unable to clear reboot flag");
            }
            self.active = report.target.clone();
            self.set_state(DaemonState::Idle);
            return Ok(Iteration::Adopted(report.target));
        }

        self.trigger_reboot().await?;
        self.set_state(DaemonState::AwaitingReboot {
            target: report.target.clone(),
            lock: report.retained_lock,
        });
        Ok(Iteration::RebootRequested(report.target))
    }

    fn previously_rolled_back(&self, target: &Target) -> Result<bool> {
        let ledger = self.pipeline.ledger();
        let log = ledger.installation_log()?;
        let pending = ledger.load_pending()?;
        let pending_hash = pending.as_ref().and_then(|t| t.primary_hash());
        Ok(known_local_target(
            target,
            &self.active,
            &log,
            pending_hash,
        ))
    }

    fn same_image(&self, installed: &Target) -> bool {
        if let Some(hash) = self.active.primary_hash() {
            return installed.matches_hash(hash);
        }
        match self.boot.booted_image_hash() {
            Ok(booted) => installed.matches_sha256(&booted),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "unable to read booted image hash");
                false
            }
        }
    }

    async fn trigger_reboot(&self) -> Result<()> {
        let command = &self.settings.reboot_command;
        if let Some(metrics) = &self.metrics {
            metrics.inc_reboot();
        }
        match self.reboot.execute(command).await {
            Ok(0) => Ok(()),
            Ok(code) => {
                error!(command = %command.display(), code, "unable to reboot system");
                Err(UpdateError::RebootTriggerFailed(format!(
                    "{} exited with {}",
                    command.display(),
                    code
                )))
            }
            Err(err) => {
                error!(command = %command.display(), error = %format!("{err:#}"), "unable to reboot system");
                Err(UpdateError::RebootTriggerFailed(format!("{err:#}")))
            }
        }
    }

    fn set_state(&mut self, state: DaemonState) {
        if let Some(metrics) = &self.metrics {
            metrics.set_awaiting_reboot(state.is_awaiting_reboot());
        }
        self.state = state;
    }
}
