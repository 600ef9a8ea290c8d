//! ---
//! ota_section: "03-persistence-logging"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Structured logging adapters for update attempts."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Log context carried through an update attempt so every line emitted by
//! the pipeline can be joined on the correlation id.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for one-shot commands and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Pipeline stage an update attempt is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    /// ECU identity and correlation id assignment.
    Prepare,
    /// Fetching the image.
    Download,
    /// Checking the fetched image.
    Verify,
    /// Waiting on the update lock.
    Lock,
    /// Handing the image to the package manager.
    Install,
    /// Recording the install result in the ledger.
    Persist,
    /// Boot-time reconciliation of a pending install.
    Finalize,
}

impl UpdateStage {
    /// Stable lowercase label for structured fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStage::Prepare => "prepare",
            UpdateStage::Download => "download",
            UpdateStage::Verify => "verify",
            UpdateStage::Lock => "lock",
            UpdateStage::Install => "install",
            UpdateStage::Persist => "persist",
            UpdateStage::Finalize => "finalize",
        }
    }
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateLogContext<'a> {
    /// Correlation id of the running attempt.
    pub correlation_id: Option<&'a str>,
    /// Target filename.
    pub target: Option<&'a str>,
    /// Target custom version.
    pub version: Option<&'a str>,
    /// Current pipeline stage.
    pub stage: Option<UpdateStage>,
}

impl<'a> UpdateLogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: &'a str) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach the target filename.
    pub fn with_target(mut self, target: &'a str) -> Self {
        self.target = Some(target);
        self
    }

    /// Attach the target version.
    pub fn with_version(mut self, version: &'a str) -> Self {
        self.version = Some(version);
        self
    }

    /// Move the context to another stage.
    pub fn at(mut self, stage: UpdateStage) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEventOutcome {
    /// The step completed successfully.
    Success,
    /// The step failed or was aborted.
    Fault,
}

impl UpdateEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            UpdateEventOutcome::Success => "success",
            UpdateEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized update lifecycle event with a success/fault outcome.
pub fn log_update_event(
    context: Option<&UpdateLogContext>,
    event: &str,
    message: &str,
    outcome: UpdateEventOutcome,
) {
    let ctx = context.copied().unwrap_or_default();
    let stage = ctx.stage.map(|stage| stage.as_str()).unwrap_or("");
    // `tracing::event!` needs a constant level, hence the split.
    match outcome {
        UpdateEventOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            correlation_id = ctx.correlation_id.unwrap_or(""),
            target_name = ctx.target.unwrap_or(""),
            version = ctx.version.unwrap_or(""),
            stage,
            message = %message
        ),
        UpdateEventOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            correlation_id = ctx.correlation_id.unwrap_or(""),
            target_name = ctx.target.unwrap_or(""),
            version = ctx.version.unwrap_or(""),
            stage,
            message = %message
        ),
    }
}
