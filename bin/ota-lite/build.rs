//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "binary"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Build script capturing version metadata for the agent binary."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Source tarballs have no git metadata; `VersionInfo` falls back to UNKNOWN.
    EmitBuilder::builder()
        .build_timestamp()
        .all_cargo()
        .all_git()
        .emit()?;
    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
