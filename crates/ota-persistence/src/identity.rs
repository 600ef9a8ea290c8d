//! ---
//! ota_section: "03-persistence-logging"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Installed-version ledger and storage bindings."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;

use tracing::info;
use uuid::Uuid;

use crate::Result;

const SERIAL_FILE: &str = "ecu_serial";

/// Return the persisted primary ECU serial, generating one on first use.
///
/// An explicitly configured serial always wins and is written through so the
/// file reflects the identity actually reported.
pub fn load_or_create_serial(dir: &Path, configured: Option<&str>) -> Result<String> {
    let path = dir.join(SERIAL_FILE);
    if let Some(serial) = configured.filter(|serial| !serial.is_empty()) {
        if fs::read_to_string(&path).ok().as_deref().map(str::trim) != Some(serial) {
            fs::create_dir_all(dir)?;
            fs::write(&path, serial)?;
        }
        return Ok(serial.to_owned());
    }

    if let Ok(existing) = fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_owned());
        }
    }

    let serial = Uuid::new_v4().to_string();
    fs::create_dir_all(dir)?;
    fs::write(&path, &serial)?;
    info!(serial = %serial, "generated primary ECU serial");
    Ok(serial)
}
