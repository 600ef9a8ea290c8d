//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Target filtering, comparison and selection.
//!
//! Everything here is pure except [`find_target`], which first makes sure
//! the metadata source holds fresh (or at least last-known-good) metadata.

use ota_common::{Target, TargetHash};
use tracing::{debug, error, info, warn};

use crate::backend::MetadataSource;
use crate::error::{Result, UpdateError};

/// Name that selects the highest version instead of a specific one.
pub const LATEST: &str = "latest";

/// True when `configured` is empty or shares a tag with the target.
pub fn has_tags(target: &Target, configured: &[String]) -> bool {
    configured.is_empty() || target.tags.iter().any(|tag| configured.contains(tag))
}

/// Content equality, optionally extended to the bundled app set.
pub fn targets_eq(a: &Target, b: &Target, compare_apps: bool) -> bool {
    if a != b {
        return false;
    }
    if !compare_apps {
        return true;
    }

    let mut remaining = b.apps.clone();
    for (name, app) in &a.apps {
        match remaining.remove(name) {
            None => {
                debug!(app = %name, "app removed from target");
                return false;
            }
            Some(other) if other.filename != app.filename => {
                debug!(app = %name, from = %app.filename, to = %other.filename, "app changed");
                return false;
            }
            Some(_) => {}
        }
    }
    if let Some(name) = remaining.keys().next() {
        debug!(app = %name, "app added to target");
        return false;
    }
    true
}

fn eligible<'a>(
    targets: &'a [Target],
    hardware_id: &'a str,
    tags: &'a [String],
) -> impl Iterator<Item = &'a Target> + 'a {
    targets
        .iter()
        .filter(move |target| has_tags(target, tags) && target.supports_hardware(hardware_id))
}

/// Highest custom version among eligible targets; first seen wins ties.
pub fn select_latest(targets: &[Target], hardware_id: &str, tags: &[String]) -> Option<Target> {
    let mut latest: Option<&Target> = None;
    for target in eligible(targets, hardware_id, tags) {
        match latest {
            Some(best) if best.version() >= target.version() => {}
            _ => latest = Some(target),
        }
    }
    latest.cloned()
}

/// First eligible target whose filename or custom version equals `name`.
pub fn select_by_name(
    targets: &[Target],
    hardware_id: &str,
    tags: &[String],
    name: &str,
) -> Option<Target> {
    eligible(targets, hardware_id, tags)
        .find(|target| target.filename == name || target.custom_version == name)
        .cloned()
}

/// Eligible targets in metadata order, for listing.
pub fn eligible_targets(targets: &[Target], hardware_id: &str, tags: &[String]) -> Vec<Target> {
    eligible(targets, hardware_id, tags).cloned().collect()
}

/// Make sure `source` holds usable metadata, preferring a fresh copy.
pub async fn ensure_metadata(source: &dyn MetadataSource) -> Result<()> {
    info!("refreshing target metadata");
    let online = match source.refresh().await {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    warn!(error = %online, "unable to update latest metadata, using local copy");
    source.targets_offline().await.map_err(|offline| {
        error!(error = %offline, "unable to use local copy of metadata");
        UpdateError::MetadataUnavailable(format!("online: {online:#}; offline: {offline:#}"))
    })
}

/// Select `name` (or [`LATEST`]) from freshly loaded metadata.
pub async fn find_target(
    source: &dyn MetadataSource,
    hardware_id: &str,
    tags: &[String],
    name: &str,
) -> Result<Option<Target>> {
    ensure_metadata(source).await?;
    let targets = source.all_targets();
    let found = if name == LATEST {
        select_latest(&targets, hardware_id, tags)
    } else {
        select_by_name(&targets, hardware_id, tags, name)
    };
    debug!(
        requested = name,
        candidates = targets.len(),
        found = ?found.as_ref().map(|t| t.filename.as_str()),
        "target selection"
    );
    Ok(found)
}

/// True when `target` was installed here before and is neither the running
/// image nor the pending install.
///
/// Used to refuse re-installing an image the device already rolled back from.
pub fn known_local_target(
    target: &Target,
    active: &Target,
    installation_log: &[Target],
    pending_hash: Option<&TargetHash>,
) -> bool {
    let Some(hash) = target.primary_hash() else {
        return false;
    };
    if active.matches_hash(hash) {
        return false;
    }
    if pending_hash.is_some_and(|pending| target.matches_hash(pending)) {
        return false;
    }
    let known = installation_log
        .iter()
        .rev()
        .any(|logged| logged.matches_hash(hash));
    if known {
        info!(target_name = %target.filename, sha256 = %hash.digest, "target known locally (rollback?), skipping");
    }
    known
}
