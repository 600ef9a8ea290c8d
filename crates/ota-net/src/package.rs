//! ---
//! ota_section: "05-networking-external-interfaces"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "HTTP collaborators for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Image package manager: fetch over HTTP, check the digest, hand the image
//! to the install command.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ota_common::{AgentConfig, Target};
use ota_core::{BootOracle, InstallOutcome, PackageManager, ResultCode, TargetStatus};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{endpoint, io_error, NetError};

/// Fetches images into the staging directory and installs them with an
/// external command (`<install_command> <image> <sha256>`).
pub struct ImagePackageManager {
    client: Client,
    ostree_server: Option<String>,
    images_dir: PathBuf,
    install_command: PathBuf,
    boot: Arc<dyn BootOracle>,
}

impl ImagePackageManager {
    /// Package manager staging into `images_dir`.
    pub fn new(
        client: Client,
        ostree_server: Option<String>,
        images_dir: impl Into<PathBuf>,
        install_command: impl Into<PathBuf>,
        boot: Arc<dyn BootOracle>,
    ) -> Self {
        Self {
            client,
            ostree_server,
            images_dir: images_dir.into(),
            install_command: install_command.into(),
            boot,
        }
    }

    /// Package manager for the configured servers and storage directory.
    pub fn from_config(config: &AgentConfig, client: Client, boot: Arc<dyn BootOracle>) -> Self {
        Self::new(
            client,
            config.pacman.ostree_server.clone(),
            config.images_dir(),
            &config.pacman.install_command,
            boot,
        )
    }

    /// Staging path of `target`'s image.
    pub fn image_path(&self, target: &Target) -> anyhow::Result<PathBuf> {
        let sha256 = target
            .sha256_hash()
            .ok_or_else(|| anyhow!("target {} has no sha256 hash", target.filename))?;
        Ok(self.images_dir.join(sha256))
    }

    fn source_url(&self, target: &Target) -> anyhow::Result<url::Url> {
        if let Some(uri) = &target.uri {
            return Ok(url::Url::parse(uri).with_context(|| format!("target uri {uri}"))?);
        }
        let server = self
            .ostree_server
            .as_deref()
            .ok_or(NetError::NotConfigured("[pacman]/ostree_server"))?;
        Ok(endpoint(server, &target.filename)?)
    }

    async fn fetch(&self, url: url::Url, dest: &Path) -> anyhow::Result<u64> {
        let mut response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }

        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(io_error(&partial))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.map_err(io_error(&partial))?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(io_error(&partial))?;
        drop(file);
        tokio::fs::rename(&partial, dest)
            .await
            .map_err(io_error(dest))?;
        Ok(written)
    }
}

/// SHA-256 and size of the file at `path`.
pub fn digest_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), size))
}

async fn check_image(path: PathBuf, target: &Target) -> TargetStatus {
    let Some(expected) = target.sha256_hash().map(str::to_owned) else {
        return TargetStatus::Invalid("target has no sha256 hash".into());
    };
    let joined = tokio::task::spawn_blocking(move || digest_file(&path)).await;
    let (digest, size) = match joined {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return TargetStatus::Invalid(format!("unable to read image: {err}")),
        Err(err) => return TargetStatus::Invalid(format!("digest task failed: {err}")),
    };
    if !digest.eq_ignore_ascii_case(&expected) {
        return TargetStatus::Invalid(format!("sha256 mismatch: expected {expected}, got {digest}"));
    }
    if target.length != 0 && target.length != size {
        return TargetStatus::Invalid(format!(
            "length mismatch: expected {}, got {size}",
            target.length
        ));
    }
    TargetStatus::Good
}

#[async_trait]
impl PackageManager for ImagePackageManager {
    async fn download(&self, target: &Target) -> anyhow::Result<()> {
        let dest = self.image_path(target)?;
        if dest.exists() && check_image(dest.clone(), target).await == TargetStatus::Good {
            info!(image = %dest.display(), "image already staged, skipping download");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.images_dir)
            .await
            .map_err(io_error(&self.images_dir))?;
        let url = self.source_url(target)?;
        info!(url = %url, image = %dest.display(), "downloading image");
        let size = self.fetch(url, &dest).await?;
        debug!(bytes = size, "image downloaded");
        Ok(())
    }

    async fn verify(&self, target: &Target) -> TargetStatus {
        match self.image_path(target) {
            Ok(path) => check_image(path, target).await,
            Err(err) => TargetStatus::Invalid(format!("{err:#}")),
        }
    }

    async fn install(&self, target: &Target) -> InstallOutcome {
        let (image, sha256) = match (self.image_path(target), target.sha256_hash()) {
            (Ok(image), Some(sha256)) => (image, sha256.to_owned()),
            _ => {
                return InstallOutcome::new(ResultCode::InstallFailed, "target has no sha256 hash")
            }
        };

        info!(command = %self.install_command.display(), image = %image.display(), "installing image");
        let output = match Command::new(&self.install_command)
            .arg(&image)
            .arg(&sha256)
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                return InstallOutcome::new(
                    ResultCode::InstallFailed,
                    format!("unable to run {}: {err}", self.install_command.display()),
                )
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            warn!(code = ?output.status.code(), stderr = %stderr, "install command failed");
            return InstallOutcome::new(ResultCode::InstallFailed, stderr);
        }

        match self.boot.booted_image_hash() {
            Ok(booted) if target.matches_sha256(&booted) => {
                InstallOutcome::new(ResultCode::Ok, "image already booted")
            }
            Ok(_) => InstallOutcome::new(
                ResultCode::NeedCompletion,
                "image deployed, reboot to activate",
            ),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "unable to read booted image hash");
                InstallOutcome::new(
                    ResultCode::NeedCompletion,
                    "image deployed, reboot to activate",
                )
            }
        }
    }
}
