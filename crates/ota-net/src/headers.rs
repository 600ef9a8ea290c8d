//! ---
//! ota_section: "05-networking-external-interfaces"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "HTTP collaborators for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Device identification headers sent with every backend request.

use std::time::Duration;

use ota_common::{AgentConfig, PackageManagerKind, Target};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use crate::{NetError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const UNKNOWN_HASH: &str = "?";

/// Snapshot of what the backend is told about this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHeaders {
    /// Booted image hash, if it could be read.
    pub ostree_hash: Option<String>,
    /// Filename of the active target.
    pub target: String,
    /// Configured tag filter.
    pub tags: Vec<String>,
    /// Configured apps, only in docker-app mode.
    pub docker_apps: Option<Vec<String>>,
    /// ECU serial, sent only when network reporting is off.
    pub primary: Option<String>,
}

impl DeviceHeaders {
    /// Derive the headers from configuration and the reconciled boot state.
    pub fn from_config(
        config: &AgentConfig,
        booted_hash: Option<&str>,
        active: &Target,
        ecu_serial: &str,
    ) -> Self {
        let docker_apps = (config.pacman.kind == PackageManagerKind::OstreeDockerApp)
            .then(|| config.pacman.docker_apps.clone());
        let primary = (!config.report_network()).then(|| ecu_serial.to_owned());
        Self {
            ostree_hash: booted_hash.map(str::to_owned),
            target: active.filename.clone(),
            tags: config.pacman.tags.clone(),
            docker_apps,
            primary,
        }
    }

    /// Render as an HTTP header map.
    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        insert(
            &mut map,
            "x-ats-ostreehash",
            self.ostree_hash.as_deref().unwrap_or(UNKNOWN_HASH),
        )?;
        if let Some(apps) = &self.docker_apps {
            insert(&mut map, "x-ats-dockerapps", &apps.join(","))?;
        }
        insert(&mut map, "x-ats-target", &self.target)?;
        if let Some(serial) = &self.primary {
            insert(&mut map, "x-ats-primary", serial)?;
        }
        insert(&mut map, "x-ats-tags", &self.tags.join(","))?;
        Ok(map)
    }
}

fn insert(map: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value).map_err(|err| NetError::Header {
        name,
        reason: err.to_string(),
    })?;
    map.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Shared client carrying the device headers on every request.
pub fn build_client(headers: &DeviceHeaders) -> Result<Client> {
    let client = Client::builder()
        .default_headers(headers.to_header_map()?)
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("ota-lite/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}
