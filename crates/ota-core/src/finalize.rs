//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Boot-time reconciliation of the ledger's pending record against the
//! image that actually booted.

use std::sync::Arc;

use ota_common::{Target, TargetHash};
use ota_logging::{ota_error, ota_info, ota_warn, UpdateLogContext, UpdateStage};
use ota_metrics::AgentMetrics;
use ota_persistence::Ledger;
use tracing::{debug, info};

use crate::backend::BootOracle;
use crate::error::{Result, UpdateError};
use crate::notify::NotificationEmitter;
use crate::result::ResultCode;

/// What the finalizer concluded about the last install.
#[derive(Debug, Clone, PartialEq)]
pub enum BootFinalizationOutcome {
    /// Nothing pending and the booted image is not in the history.
    NoPendingUpdate,
    /// The pending image booted and is now current.
    Completed(Target),
    /// A reboot happened but the pending image did not come up.
    RolledBack(Target),
    /// The pending image still waits for a reboot.
    StillPending(Target),
    /// Nothing pending; the booted image is a previously recorded one.
    HistoricalMatch(Target),
}

impl BootFinalizationOutcome {
    pub fn result_code(&self) -> ResultCode {
        match self {
            BootFinalizationOutcome::NoPendingUpdate => ResultCode::Unknown,
            BootFinalizationOutcome::Completed(_) => ResultCode::Ok,
            BootFinalizationOutcome::RolledBack(_) => ResultCode::InstallFailed,
            BootFinalizationOutcome::StillPending(_) => ResultCode::NeedCompletion,
            BootFinalizationOutcome::HistoricalMatch(_) => ResultCode::AlreadyProcessed,
        }
    }

    /// Target the outcome refers to, `Target::unknown()` when there is none.
    pub fn target(&self) -> Target {
        match self {
            BootFinalizationOutcome::NoPendingUpdate => Target::unknown(),
            BootFinalizationOutcome::Completed(target)
            | BootFinalizationOutcome::RolledBack(target)
            | BootFinalizationOutcome::StillPending(target)
            | BootFinalizationOutcome::HistoricalMatch(target) => target.clone(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BootFinalizationOutcome::NoPendingUpdate => "no_pending_update",
            BootFinalizationOutcome::Completed(_) => "completed",
            BootFinalizationOutcome::RolledBack(_) => "rolled_back",
            BootFinalizationOutcome::StillPending(_) => "still_pending",
            BootFinalizationOutcome::HistoricalMatch(_) => "historical_match",
        }
    }

    fn notifies(&self) -> bool {
        !matches!(self, BootFinalizationOutcome::HistoricalMatch(_))
    }
}

/// Result of one finalization pass.
#[derive(Debug, Clone)]
pub struct FinalizationReport {
    pub outcome: BootFinalizationOutcome,
    /// Hash of the running image.
    pub booted_hash: String,
    /// Best-known description of the running image; unknown if unrecorded.
    pub active: Target,
}

/// Runs once per process start, before any update attempt.
pub struct BootFinalizer {
    ledger: Arc<dyn Ledger>,
    boot: Arc<dyn BootOracle>,
    notifier: NotificationEmitter,
    metrics: Option<AgentMetrics>,
}

impl BootFinalizer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        boot: Arc<dyn BootOracle>,
        notifier: NotificationEmitter,
        metrics: Option<AgentMetrics>,
    ) -> Self {
        Self {
            ledger,
            boot,
            notifier,
            metrics,
        }
    }

    pub fn finalize(&self) -> Result<FinalizationReport> {
        let booted_hash = self.boot.booted_image_hash().map_err(|err| {
            UpdateError::Precondition(format!("could not determine booted image: {err:#}"))
        })?;
        let booted = TargetHash::sha256(booted_hash.clone());

        let outcome = match self.ledger.load_pending()? {
            Some(pending) => self.reconcile_pending(pending, &booted)?,
            None => match self.ledger.find_by_hash(&booted)? {
                Some(found) => BootFinalizationOutcome::HistoricalMatch(found),
                None => BootFinalizationOutcome::NoPendingUpdate,
            },
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_finalization(outcome.label());
        }
        if outcome.notifies() {
            self.notifier
                .install_finished(&outcome.target(), outcome.result_code());
        }

        let active = self.resolve_active(&booted)?;
        info!(
            outcome = outcome.label(),
            result = %outcome.result_code(),
            booted = %booted_hash,
            active = %active,
            "boot finalization complete"
        );
        Ok(FinalizationReport {
            outcome,
            booted_hash,
            active,
        })
    }

    fn reconcile_pending(
        &self,
        pending: Target,
        booted: &TargetHash,
    ) -> Result<BootFinalizationOutcome> {
        let ctx = UpdateLogContext::new()
            .with_target(&pending.filename)
            .with_version(&pending.custom_version)
            .at(UpdateStage::Finalize);

        if pending.matches_hash(booted) {
            ota_info!(context = ctx, "marking target install complete");
            self.ledger.save_current(&pending)?;
            self.record_write("current");
            self.clear_flag();
            return Ok(BootFinalizationOutcome::Completed(pending));
        }

        if self.boot.reboot_detected() {
            ota_error!(
                context = ctx,
                "pending image did not boot (running {}), rolled back",
                booted.digest
            );
            self.ledger.mark_none(&pending)?;
            self.record_write("none");
            self.clear_flag();
            return Ok(BootFinalizationOutcome::RolledBack(pending));
        }

        ota_info!(context = ctx, "update pending, reboot required to activate");
        Ok(BootFinalizationOutcome::StillPending(pending))
    }

    fn record_write(&self, mode: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_ledger_write(mode);
        }
    }

    fn clear_flag(&self) {
        if let Err(err) = self.boot.clear_reboot_flag() {
            ota_warn!("unable to clear reboot flag: {err:#}");
        }
    }

    fn resolve_active(&self, booted: &TargetHash) -> Result<Target> {
        if let Some(current) = self.ledger.load_current()? {
            if current.matches_hash(booted) {
                return Ok(current);
            }
        }
        let found = self.ledger.find_by_hash(booted)?;
        debug!(found = found.is_some(), "active target resolved from history");
        Ok(found.unwrap_or_else(Target::unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_codes() {
        let target = Target::new("lmp-1", "aa");
        assert_eq!(
            BootFinalizationOutcome::Completed(target.clone()).result_code(),
            ResultCode::Ok
        );
        assert_eq!(
            BootFinalizationOutcome::RolledBack(target.clone()).result_code(),
            ResultCode::InstallFailed
        );
        assert_eq!(
            BootFinalizationOutcome::StillPending(target.clone()).result_code(),
            ResultCode::NeedCompletion
        );
        assert_eq!(
            BootFinalizationOutcome::HistoricalMatch(target).result_code(),
            ResultCode::AlreadyProcessed
        );
        assert!(BootFinalizationOutcome::NoPendingUpdate
            .target()
            .is_unknown());
    }

    #[test]
    fn only_historical_match_is_silent() {
        assert!(BootFinalizationOutcome::NoPendingUpdate.notifies());
        assert!(!BootFinalizationOutcome::HistoricalMatch(Target::new("a", "b")).notifies());
    }
}
