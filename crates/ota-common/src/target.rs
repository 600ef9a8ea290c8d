//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Shared primitives and utilities for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;

use ota_versioning::CustomVersion;
use serde::{Deserialize, Serialize};

const UNKNOWN_FILENAME: &str = "unknown";

/// A single content digest for a target image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHash {
    /// Digest algorithm, e.g. `sha256`.
    pub algorithm: String,
    /// Hex-encoded digest.
    pub digest: String,
}

impl TargetHash {
    pub fn sha256(digest: impl Into<String>) -> Self {
        Self {
            algorithm: "sha256".to_owned(),
            digest: digest.into(),
        }
    }
}

/// Reference to an application bundled with a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRef {
    pub filename: String,
}

/// An installable image version.
///
/// `==` compares content hashes only. Use `ota_core::matcher::targets_eq`
/// for the comparison that optionally includes the bundled apps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub filename: String,
    #[serde(default)]
    pub hashes: Vec<TargetHash>,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub custom_version: String,
    #[serde(default)]
    pub hardware_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub apps: BTreeMap<String, AppRef>,
    #[serde(default)]
    pub uri: Option<String>,
    /// ECU serial -> hardware id, attached when an update attempt starts.
    #[serde(default)]
    pub ecus: BTreeMap<String, String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl Target {
    /// Build a target with a single sha256 digest.
    pub fn new(filename: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            hashes: vec![TargetHash::sha256(sha256)],
            length: 0,
            custom_version: String::new(),
            hardware_ids: Vec::new(),
            tags: Vec::new(),
            apps: BTreeMap::new(),
            uri: None,
            ecus: BTreeMap::new(),
            correlation_id: None,
        }
    }

    /// Placeholder for "no known target".
    pub fn unknown() -> Self {
        Self {
            hashes: Vec::new(),
            ..Self::new(UNKNOWN_FILENAME, "")
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.filename == UNKNOWN_FILENAME && self.hashes.is_empty()
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.custom_version = version.into();
        self
    }

    pub fn with_hardware_id(mut self, hardware_id: impl Into<String>) -> Self {
        self.hardware_ids.push(hardware_id.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_app(mut self, name: impl Into<String>, filename: impl Into<String>) -> Self {
        self.apps.insert(
            name.into(),
            AppRef {
                filename: filename.into(),
            },
        );
        self
    }

    /// First listed digest; the one reported to the backend.
    pub fn primary_hash(&self) -> Option<&TargetHash> {
        self.hashes.first()
    }

    pub fn sha256_hash(&self) -> Option<&str> {
        self.hashes
            .iter()
            .find(|hash| hash.algorithm.eq_ignore_ascii_case("sha256"))
            .map(|hash| hash.digest.as_str())
    }

    /// True when this target carries `hash` under the same algorithm.
    pub fn matches_hash(&self, hash: &TargetHash) -> bool {
        self.hashes.iter().any(|own| {
            own.algorithm.eq_ignore_ascii_case(&hash.algorithm)
                && own.digest.eq_ignore_ascii_case(&hash.digest)
        })
    }

    /// True when the sha256 digest equals `digest`.
    pub fn matches_sha256(&self, digest: &str) -> bool {
        self.sha256_hash()
            .is_some_and(|own| own.eq_ignore_ascii_case(digest))
    }

    /// Hash lists match when they share an algorithm and agree on every shared one.
    pub fn same_content(&self, other: &Target) -> bool {
        let mut shared = false;
        for own in &self.hashes {
            for theirs in &other.hashes {
                if own.algorithm.eq_ignore_ascii_case(&theirs.algorithm) {
                    if !own.digest.eq_ignore_ascii_case(&theirs.digest) {
                        return false;
                    }
                    shared = true;
                }
            }
        }
        shared
    }

    pub fn version(&self) -> CustomVersion {
        CustomVersion::new(self.custom_version.clone())
    }

    /// Custom version when present, else the filename.
    pub fn display_name(&self) -> &str {
        if self.custom_version.is_empty() {
            &self.filename
        } else {
            &self.custom_version
        }
    }

    pub fn supports_hardware(&self, hardware_id: &str) -> bool {
        self.hardware_ids.iter().any(|id| id == hardware_id)
    }

    /// Record the ECU this target is being installed on.
    pub fn insert_ecu(&mut self, serial: impl Into<String>, hardware_id: impl Into<String>) {
        self.ecus.insert(serial.into(), hardware_id.into());
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        if self.is_unknown() || other.is_unknown() {
            return self.is_unknown() && other.is_unknown();
        }
        self.same_content(other)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sha256_hash() {
            Some(hash) => write!(f, "{} (sha256:{})", self.filename, hash),
            None => f.write_str(&self.filename),
        }
    }
}
