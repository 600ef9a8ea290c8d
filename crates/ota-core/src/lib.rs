//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Update orchestration and reconciliation engine for ota-lite.
//!
//! [`finalize::BootFinalizer`] runs once per start, [`pipeline::UpdatePipeline`]
//! executes single attempts, and [`daemon::DaemonLoop`] ties them to the
//! metadata polling cycle. I/O goes through the traits in [`backend`].

pub mod backend;
pub mod daemon;
pub mod deployment;
pub mod error;
pub mod finalize;
pub mod lock;
pub mod matcher;
pub mod notify;
pub mod pipeline;
pub mod result;

pub use backend::{BootOracle, MetadataSource, PackageManager, RebootTrigger, ReportSink};
pub use daemon::{DaemonLoop, DaemonSettings, DaemonState, Iteration};
pub use deployment::{CommandRebootTrigger, SysrootBootOracle};
pub use error::{Result, UpdateError};
pub use finalize::{BootFinalizationOutcome, BootFinalizer, FinalizationReport};
pub use lock::UpdateLock;
pub use notify::{NotificationEmitter, ReportEvent, UpdateEvent};
pub use pipeline::{EcuIdentity, InstallReport, UpdatePipeline};
pub use result::{InstallOutcome, ResultCode, TargetStatus};
