//! ---
//! ota_section: "14-versioning"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Version metadata and target version ordering."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use serde::Serialize;

/// Compile-time version metadata captured via `vergen` in the binary crate.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    /// Workspace semantic version.
    pub semver: String,
    /// Git commit hash captured at build time.
    pub git_sha: String,
    /// Build timestamp from the compilation environment.
    pub build_timestamp: String,
    /// Target triple used for the build.
    pub target: String,
    /// Cargo profile used during compilation.
    pub profile: String,
}

impl VersionInfo {
    /// Construct a new [`VersionInfo`] instance using environment metadata.
    #[must_use]
    pub fn current() -> Self {
        Self {
            semver: env!("CARGO_PKG_VERSION").to_owned(),
            git_sha: option_env!("VERGEN_GIT_SHA")
                .unwrap_or("UNKNOWN")
                .to_owned(),
            build_timestamp: option_env!("VERGEN_BUILD_TIMESTAMP")
                .unwrap_or("UNKNOWN")
                .to_owned(),
            target: option_env!("VERGEN_CARGO_TARGET_TRIPLE")
                .unwrap_or("UNKNOWN")
                .to_owned(),
            profile: option_env!("VERGEN_CARGO_PROFILE")
                .unwrap_or("UNKNOWN")
                .to_owned(),
        }
    }

    /// Override the fields `vergen` populates in the calling crate.
    ///
    /// `option_env!` resolves in the crate that expands it, so binaries pass
    /// their own build-script values through here.
    #[must_use]
    pub fn with_build(
        mut self,
        git_sha: Option<&str>,
        build_timestamp: Option<&str>,
        target: Option<&str>,
        profile: Option<&str>,
    ) -> Self {
        if let Some(sha) = git_sha {
            self.git_sha = sha.to_owned();
        }
        if let Some(ts) = build_timestamp {
            self.build_timestamp = ts.to_owned();
        }
        if let Some(target) = target {
            self.target = target.to_owned();
        }
        if let Some(profile) = profile {
            self.profile = profile.to_owned();
        }
        self
    }

    /// Returns a concise CLI string combining semantic version and git hash.
    #[must_use]
    pub fn cli_string(&self) -> String {
        format!("{} ({})", self.semver, self.git_sha)
    }

    /// Human readable banner used in logging surfaces.
    #[must_use]
    pub fn banner(&self) -> String {
        format!("ota-lite v{} (git {})", self.semver, self.git_sha)
    }

    /// Extended string containing build metadata suitable for `--version` flags.
    #[must_use]
    pub fn extended(&self) -> String {
        format!(
            "{banner}\nBuilt: {built}\nTarget: {target}\nProfile: {profile}",
            banner = self.banner(),
            built = self.build_timestamp,
            target = self.target,
            profile = self.profile
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_contains_semver() {
        let info = VersionInfo::current();
        let extended = info.extended();
        assert!(extended.contains(&info.semver));
    }

    #[test]
    fn build_overrides_replace_defaults() {
        let info = VersionInfo::current().with_build(Some("abc123"), None, None, Some("release"));
        assert_eq!(info.git_sha, "abc123");
        assert_eq!(info.profile, "release");
        assert!(info.cli_string().ends_with("(abc123)"));
    }
}
