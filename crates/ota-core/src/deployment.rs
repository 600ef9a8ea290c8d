//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Local collaborators: the sysroot-backed boot oracle and the shell reboot trigger.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ota_common::AgentConfig;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backend::{BootOracle, RebootTrigger};

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";
const SENTINEL_FILE: &str = "need_reboot";
const OSTREE_ARG: &str = "ostree=";

/// Reads the booted deployment from the kernel command line and tracks
/// reboots with a boot-id sentinel.
#[derive(Debug, Clone)]
pub struct SysrootBootOracle {
    sysroot: PathBuf,
    cmdline_path: PathBuf,
    sentinel_dir: PathBuf,
    boot_id_path: PathBuf,
}

impl SysrootBootOracle {
    pub fn new(
        sysroot: impl Into<PathBuf>,
        cmdline_path: impl Into<PathBuf>,
        sentinel_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sysroot: sysroot.into(),
            cmdline_path: cmdline_path.into(),
            sentinel_dir: sentinel_dir.into(),
            boot_id_path: PathBuf::from(BOOT_ID_PATH),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            &config.pacman.sysroot,
            &config.pacman.cmdline_path,
            &config.bootloader.reboot_sentinel_dir,
        )
    }

    /// Read the boot id from `path` instead of procfs.
    pub fn with_boot_id_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.boot_id_path = path.into();
        self
    }

    fn sentinel(&self) -> PathBuf {
        self.sentinel_dir.join(SENTINEL_FILE)
    }

    fn boot_id(&self) -> anyhow::Result<String> {
        let id = fs::read_to_string(&self.boot_id_path)
            .with_context(|| format!("reading {}", self.boot_id_path.display()))?;
        Ok(id.trim().to_owned())
    }

    fn deployment_path(&self) -> anyhow::Result<PathBuf> {
        let cmdline = fs::read_to_string(&self.cmdline_path)
            .with_context(|| format!("reading {}", self.cmdline_path.display()))?;
        let arg = cmdline
            .split_whitespace()
            .find_map(|token| token.strip_prefix(OSTREE_ARG))
            .ok_or_else(|| anyhow!("no {} argument in {}", OSTREE_ARG, self.cmdline_path.display()))?;
        Ok(self.sysroot.join(arg.trim_start_matches('/')))
    }
}

/// Checksum part of a deployment directory name (`<checksum>.<serial>`).
fn checksum_from_deployment(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let checksum = name.split('.').next()?;
    (!checksum.is_empty()).then(|| checksum.to_owned())
}

impl BootOracle for SysrootBootOracle {
    fn booted_image_hash(&self) -> anyhow::Result<String> {
        let link = self.deployment_path()?;
        let deployment = fs::canonicalize(&link)
            .with_context(|| format!("resolving booted deployment {}", link.display()))?;
        let checksum = checksum_from_deployment(&deployment)
            .ok_or_else(|| anyhow!("unexpected deployment path {}", deployment.display()))?;
        debug!(deployment = %deployment.display(), checksum = %checksum, "booted deployment");
        Ok(checksum)
    }

    fn reboot_detected(&self) -> bool {
        let recorded = match fs::read_to_string(self.sentinel()) {
            Ok(recorded) => recorded,
            Err(_) => return true,
        };
        match self.boot_id() {
            Ok(current) => recorded.trim() != current,
            Err(_) => true,
        }
    }

    fn set_reboot_flag(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.sentinel_dir)
            .with_context(|| format!("creating {}", self.sentinel_dir.display()))?;
        fs::write(self.sentinel(), self.boot_id()?)
            .with_context(|| format!("writing {}", self.sentinel().display()))?;
        Ok(())
    }

    fn clear_reboot_flag(&self) -> anyhow::Result<()> {
        match fs::remove_file(self.sentinel()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", self.sentinel().display())),
        }
    }
}

/// Executes the reboot command through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct CommandRebootTrigger;

#[async_trait]
impl RebootTrigger for CommandRebootTrigger {
    async fn execute(&self, command: &Path) -> anyhow::Result<i32> {
        info!(command = %command.display(), "executing reboot command");
        let status = Command::new("sh")
            .arg("-c")
            .arg(command.as_os_str())
            .status()
            .await
            .with_context(|| format!("spawning {}", command.display()))?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// True when `path` is a regular file with an execute bit set.
pub fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
