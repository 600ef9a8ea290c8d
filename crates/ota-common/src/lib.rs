//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Shared primitives and utilities for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Core shared primitives for the ota-lite workspace.
//! This crate exposes configuration loading, tracing initialisation, the
//! target data model, and re-exports version metadata.

pub mod config;
pub mod logging;
pub mod target;

pub use ota_versioning as version;

pub use config::{
    AgentConfig, BootloaderConfig, LoggingConfig, MetricsConfig, PackageConfig,
    PackageManagerKind, ProvisionConfig, StorageConfig, TelemetryConfig, TlsConfig,
    UpdateConfig, UptaneConfig, VerificationFailurePolicy,
};
pub use logging::{init_tracing, level_from_numeric, LogFormat};
pub use target::{AppRef, Target, TargetHash};
