//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome classification of an install or finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    /// Installed and active.
    Ok,
    /// Installed; a reboot is needed to activate it.
    NeedCompletion,
    /// The installer or the reboot rejected the image.
    InstallFailed,
    /// The downloaded image did not verify.
    VerificationFailed,
    /// The booted image was already recorded before this start.
    AlreadyProcessed,
    /// Nothing could be determined.
    Unknown,
}

impl ResultCode {
    /// Wire label, e.g. `NEED_COMPLETION`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::NeedCompletion => "NEED_COMPLETION",
            ResultCode::InstallFailed => "INSTALL_FAILED",
            ResultCode::VerificationFailed => "VERIFICATION_FAILED",
            ResultCode::AlreadyProcessed => "ALREADY_PROCESSED",
            ResultCode::Unknown => "UNKNOWN",
        }
    }

    /// Lowercase label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::NeedCompletion => "need_completion",
            ResultCode::InstallFailed => "install_failed",
            ResultCode::VerificationFailed => "verification_failed",
            ResultCode::AlreadyProcessed => "already_processed",
            ResultCode::Unknown => "unknown",
        }
    }

    /// An attempt succeeds when the image is active or awaiting reboot.
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Ok | ResultCode::NeedCompletion)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result code plus the installer's human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub code: ResultCode,
    pub description: String,
}

impl InstallOutcome {
    pub fn new(code: ResultCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Verdict of the verification stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    Good,
    Invalid(String),
}
