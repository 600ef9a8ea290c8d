//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! One update attempt: prepare, download, verify, lock, install, persist.

use std::path::Path;
use std::sync::Arc;

use ota_common::{Target, VerificationFailurePolicy};
use ota_logging::{
    log_update_event, ota_error, ota_info, ota_warn, UpdateEventOutcome, UpdateLogContext,
    UpdateStage,
};
use ota_metrics::AgentMetrics;
use ota_persistence::Ledger;
use uuid::Uuid;

use crate::backend::{BootOracle, PackageManager};
use crate::error::{Result, UpdateError};
use crate::lock::UpdateLock;
use crate::notify::NotificationEmitter;
use crate::result::{ResultCode, TargetStatus};

/// Identity of the primary ECU attached to every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuIdentity {
    pub serial: String,
    pub hardware_id: String,
}

/// Outcome of a successful attempt.
#[derive(Debug)]
pub struct InstallReport {
    /// Target as installed, with ECU identity and correlation id attached.
    pub target: Target,
    pub code: ResultCode,
    pub description: String,
    /// Lock kept across the pending reboot; `None` once released.
    pub retained_lock: Option<UpdateLock>,
}

impl InstallReport {
    pub fn needs_reboot(&self) -> bool {
        self.code == ResultCode::NeedCompletion
    }
}

/// Fresh per-attempt correlation id.
pub fn correlation_id_for(target: &Target) -> String {
    format!("{}-{}", target.display_name(), Uuid::new_v4())
}

/// Drives a single target through the install stages.
#[derive(Clone)]
pub struct UpdatePipeline {
    package_manager: Arc<dyn PackageManager>,
    ledger: Arc<dyn Ledger>,
    boot: Arc<dyn BootOracle>,
    notifier: NotificationEmitter,
    identity: EcuIdentity,
    verification: VerificationFailurePolicy,
    metrics: Option<AgentMetrics>,
}

impl UpdatePipeline {
    pub fn new(
        package_manager: Arc<dyn PackageManager>,
        ledger: Arc<dyn Ledger>,
        boot: Arc<dyn BootOracle>,
        notifier: NotificationEmitter,
        identity: EcuIdentity,
    ) -> Self {
        Self {
            package_manager,
            ledger,
            boot,
            notifier,
            identity,
            verification: VerificationFailurePolicy::default(),
            metrics: None,
        }
    }

    pub fn with_verification_policy(mut self, policy: VerificationFailurePolicy) -> Self {
        self.verification = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn notifier(&self) -> &NotificationEmitter {
        &self.notifier
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Run every stage for `target`, taking the lock at `lockfile` before install.
    pub async fn run(&self, target: &Target, lockfile: Option<&Path>) -> Result<InstallReport> {
        let result = self.run_stages(target, lockfile).await;
        if let Some(metrics) = &self.metrics {
            let label = match &result {
                Ok(report) => report.code.label(),
                Err(UpdateError::DownloadFailed { .. }) => "download_failed",
                Err(UpdateError::VerificationFailed { .. }) => "verification_failed",
                Err(UpdateError::LockUnavailable { .. }) => "lock_unavailable",
                Err(UpdateError::InstallFailed { code, .. }) => code.label(),
                Err(_) => "error",
            };
            metrics.record_attempt(label);
        }
        result
    }

    fn record_write(&self, mode: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_ledger_write(mode);
        }
    }

    async fn run_stages(&self, target: &Target, lockfile: Option<&Path>) -> Result<InstallReport> {
        // Prepare
        let mut target = target.clone();
        target.insert_ecu(&self.identity.serial, &self.identity.hardware_id);
        let correlation_id = correlation_id_for(&target);
        target.correlation_id = Some(correlation_id.clone());
        let base = UpdateLogContext::new()
            .with_correlation_id(&correlation_id)
            .with_target(&target.filename)
            .with_version(&target.custom_version);
        ota_info!(context = base.at(UpdateStage::Prepare), "updating to {}", target);

        // Download
        let ctx = base.at(UpdateStage::Download);
        self.notifier.download_started(&target);
        if let Err(err) = self.package_manager.download(&target).await {
            self.notifier.download_completed(&target, false);
            ota_error!(context = ctx, "download failed: {err:#}");
            return Err(UpdateError::DownloadFailed {
                target: target.filename.clone(),
                reason: format!("{err:#}"),
            });
        }
        self.notifier.download_completed(&target, true);
        log_update_event(
            Some(&ctx),
            "update.downloaded",
            "download complete",
            UpdateEventOutcome::Success,
        );

        // Verify
        let ctx = base.at(UpdateStage::Verify);
        if let TargetStatus::Invalid(reason) = self.package_manager.verify(&target).await {
            self.notifier
                .install_finished(&target, ResultCode::VerificationFailed);
            ota_error!(context = ctx, "downloaded target is invalid: {}", reason);
            if self.verification == VerificationFailurePolicy::Abort {
                return Err(UpdateError::VerificationFailed {
                    target: target.filename.clone(),
                    reason,
                });
            }
            ota_warn!(context = ctx, "continuing with unverified target");
        }

        // Lock
        let lock = match lockfile {
            Some(path) => {
                let lock = UpdateLock::acquire(path).await.inspect_err(|err| {
                    ota_error!(context = base.at(UpdateStage::Lock), "{}", err);
                })?;
                Some(lock)
            }
            None => None,
        };

        // Install
        let ctx = base.at(UpdateStage::Install);
        self.notifier.install_started(&target);
        let outcome = self.package_manager.install(&target).await;
        self.notifier.install_finished(&target, outcome.code);

        // Persist
        let ctx_persist = base.at(UpdateStage::Persist);
        let retained_lock = match outcome.code {
            ResultCode::NeedCompletion => {
                if let Err(err) = self.boot.set_reboot_flag() {
                    ota_warn!(context = ctx_persist, "unable to set reboot flag: {err:#}");
                }
                self.ledger.save_pending(&target)?;
                self.record_write("pending");
                ota_info!(
                    context = ctx_persist,
                    "update complete, please reboot the device to activate"
                );
                lock
            }
            ResultCode::Ok => {
                self.ledger.save_current(&target)?;
                self.record_write("current");
                drop(lock);
                None
            }
            code => {
                ota_error!(
                    context = ctx,
                    "unable to install update: {}",
                    outcome.description
                );
                drop(lock);
                return Err(UpdateError::InstallFailed {
                    code,
                    description: outcome.description,
                });
            }
        };
        if !outcome.description.is_empty() {
            ota_info!(context = ctx, "{}", outcome.description);
        }

        Ok(InstallReport {
            target,
            code: outcome.code,
            description: outcome.description,
            retained_lock,
        })
    }
}
