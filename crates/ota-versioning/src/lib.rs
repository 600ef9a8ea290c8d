//! ---
//! ota_section: "14-versioning"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Version metadata and target version ordering."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Build metadata for the agent binary and the ordering used to pick the
//! newest target out of a metadata listing.

pub mod build_info;
pub mod custom;

pub use build_info::VersionInfo;
pub use custom::{compare_versions, CustomVersion};
