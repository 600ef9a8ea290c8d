//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Shared primitives and utilities for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_polling_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_sysroot() -> PathBuf {
    PathBuf::from("/")
}

fn default_cmdline_path() -> PathBuf {
    PathBuf::from("/proc/cmdline")
}

fn default_install_command() -> PathBuf {
    PathBuf::from("/usr/libexec/ota-lite/install-image")
}

fn default_reboot_command() -> PathBuf {
    PathBuf::from("/sbin/reboot")
}

fn default_reboot_sentinel_dir() -> PathBuf {
    PathBuf::from("/var/run/ota-lite-session")
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/sota")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9797))
}

/// Primary configuration object for the update agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub provision: ProvisionConfig,
    #[serde(default)]
    pub uptane: UptaneConfig,
    #[serde(default)]
    pub pacman: PackageConfig,
    #[serde(default)]
    pub bootloader: BootloaderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AgentConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAgentConfig {
    pub config: AgentConfig,
    pub source: PathBuf,
}

impl AgentConfig {
    pub const ENV_CONFIG_PATH: &str = "OTA_LITE_CONFIG";

    /// Load configuration from disk, respecting the `OTA_LITE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    ///
    /// Validation is left to the caller so command-line overrides can be
    /// applied first.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAgentConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAgentConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAgentConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<AgentConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Validate structural invariants that every command depends on.
    pub fn validate(&self) -> Result<()> {
        if self.provision.primary_ecu_hardware_id.trim().is_empty() {
            return Err(anyhow!(
                "[provision]/primary_ecu_hardware_id must not be empty"
            ));
        }
        if self.storage.path.as_os_str().is_empty() {
            return Err(anyhow!("[storage]/path must not be empty"));
        }
        if self.uptane.polling_sec.is_zero() {
            return Err(anyhow!("[uptane]/polling_sec must be greater than zero"));
        }
        Ok(())
    }

    /// Whether strict target comparison should include bundled apps.
    pub fn compare_apps(&self) -> bool {
        self.pacman.kind == PackageManagerKind::OstreeDockerApp && !self.pacman.docker_apps.is_empty()
    }

    /// Whether network details are reported to the backend.
    ///
    /// Defaults to on whenever a device gateway is configured.
    pub fn report_network(&self) -> bool {
        self.telemetry
            .report_network
            .unwrap_or_else(|| self.tls.server.is_some())
    }

    /// Directory holding the cached target metadata.
    pub fn metadata_dir(&self) -> PathBuf {
        self.storage.path.join("metadata")
    }

    /// Directory downloaded images are staged in.
    pub fn images_dir(&self) -> PathBuf {
        self.storage.path.join("images")
    }
}

impl std::str::FromStr for AgentConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AgentConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub primary_ecu_hardware_id: String,
    #[serde(default)]
    pub primary_ecu_serial: Option<String>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptaneConfig {
    #[serde(default)]
    pub repo_server: Option<String>,
    #[serde(default = "default_polling_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub polling_sec: Duration,
}

impl Default for UptaneConfig {
    fn default() -> Self {
        Self {
            repo_server: None,
            polling_sec: default_polling_interval(),
        }
    }
}

/// Flavour of package manager the device runs.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PackageManagerKind {
    #[default]
    #[serde(rename = "ostree")]
    Ostree,
    #[serde(rename = "ostree+docker-app")]
    OstreeDockerApp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    #[serde(default, rename = "type")]
    pub kind: PackageManagerKind,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub docker_apps: Vec<String>,
    #[serde(default = "default_sysroot")]
    pub sysroot: PathBuf,
    #[serde(default = "default_cmdline_path")]
    pub cmdline_path: PathBuf,
    #[serde(default)]
    pub ostree_server: Option<String>,
    #[serde(default = "default_install_command")]
    pub install_command: PathBuf,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            kind: PackageManagerKind::default(),
            tags: Vec::new(),
            docker_apps: Vec::new(),
            sysroot: default_sysroot(),
            cmdline_path: default_cmdline_path(),
            ostree_server: None,
            install_command: default_install_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootloaderConfig {
    #[serde(default = "default_reboot_command")]
    pub reboot_command: PathBuf,
    #[serde(default = "default_reboot_sentinel_dir")]
    pub reboot_sentinel_dir: PathBuf,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            reboot_command: default_reboot_command(),
            reboot_sentinel_dir: default_reboot_sentinel_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Device gateway used for event reporting and telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub report_network: Option<bool>,
}

/// What the pipeline does after the downloaded artifact fails verification.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerificationFailurePolicy {
    /// Report the failure and continue to lock and install.
    #[default]
    Proceed,
    /// Report the failure and end the attempt before the lock is taken.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateConfig {
    #[serde(default)]
    pub verification_failure: VerificationFailurePolicy,
    #[serde(default)]
    pub lockfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
            level: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
