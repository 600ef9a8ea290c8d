//! ---
//! ota_section: "05-networking-external-interfaces"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "HTTP collaborators for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Targets metadata fetched from the repository server and cached on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ota_common::{AgentConfig, AppRef, Target, TargetHash};
use ota_core::MetadataSource;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{endpoint, io_error, NetError, Result};

/// Name of the targets document, remotely and in the cache directory.
pub const TARGETS_FILE: &str = "targets.json";

#[derive(Debug, Deserialize)]
struct TargetsDocument {
    signed: SignedTargets,
}

#[derive(Debug, Deserialize)]
struct SignedTargets {
    #[serde(default)]
    version: u64,
    #[serde(default)]
    targets: BTreeMap<String, TargetEntry>,
}

#[derive(Debug, Deserialize)]
struct TargetEntry {
    #[serde(default)]
    hashes: BTreeMap<String, String>,
    #[serde(default)]
    length: u64,
    #[serde(default)]
    custom: TargetCustom,
}

#[derive(Debug, Default, Deserialize)]
struct TargetCustom {
    #[serde(default)]
    version: String,
    #[serde(default, rename = "hardwareIds")]
    hardware_ids: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    docker_apps: BTreeMap<String, serde_json::Value>,
}

impl TargetEntry {
    fn into_target(self, name: String) -> Option<Target> {
        let Some(sha256) = self
            .hashes
            .iter()
            .find(|(algorithm, _)| algorithm.eq_ignore_ascii_case("sha256"))
            .map(|(_, digest)| digest.clone())
        else {
            warn!(target_name = %name, "target has no sha256 hash, skipping");
            return None;
        };

        let mut target = Target::new(name, sha256);
        target.hashes.extend(
            self.hashes
                .into_iter()
                .filter(|(algorithm, _)| !algorithm.eq_ignore_ascii_case("sha256"))
                .map(|(algorithm, digest)| TargetHash { algorithm, digest }),
        );
        target.length = self.length;
        target.custom_version = self.custom.version;
        target.hardware_ids = self.custom.hardware_ids;
        target.tags = self.custom.tags;
        target.uri = self.custom.uri;
        for (app, value) in self.custom.docker_apps {
            match value.get("filename").and_then(|f| f.as_str()) {
                Some(filename) => {
                    target.apps.insert(
                        app,
                        AppRef {
                            filename: filename.to_owned(),
                        },
                    );
                }
                None => error!(target_name = %target.filename, app = %app, "invalid app data, skipping"),
            }
        }
        Some(target)
    }
}

/// Decode a targets document into the targets it lists, in name order.
pub fn parse_targets(body: &[u8]) -> Result<Vec<Target>> {
    let document: TargetsDocument = serde_json::from_slice(body)?;
    debug!(
        version = document.signed.version,
        entries = document.signed.targets.len(),
        "decoded targets metadata"
    );
    Ok(document
        .signed
        .targets
        .into_iter()
        .filter_map(|(name, entry)| entry.into_target(name))
        .collect())
}

/// [`MetadataSource`] backed by `<repo_server>/targets.json`.
pub struct HttpMetadataSource {
    client: Client,
    url: Url,
    cache_dir: PathBuf,
    targets: RwLock<Vec<Target>>,
}

impl HttpMetadataSource {
    /// Source reading from `repo_server`, caching into `cache_dir`.
    pub fn new(client: Client, repo_server: &str, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            client,
            url: endpoint(repo_server, TARGETS_FILE)?,
            cache_dir: cache_dir.into(),
            targets: RwLock::new(Vec::new()),
        })
    }

    /// Source for the configured repository server and storage directory.
    pub fn from_config(config: &AgentConfig, client: Client) -> Result<Self> {
        let server = config
            .uptane
            .repo_server
            .as_deref()
            .ok_or(NetError::NotConfigured("[uptane]/repo_server"))?;
        Self::new(client, server, config.metadata_dir())
    }

    fn cache_path(&self) -> PathBuf {
        self.cache_dir.join(TARGETS_FILE)
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        debug!(url = %self.url, "fetching targets metadata");
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetError::Status {
                url: self.url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn store_cache(&self, body: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(io_error(&self.cache_dir))?;
        let path = self.cache_path();
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(io_error(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_error(&path))?;
        Ok(())
    }

    fn install(&self, targets: Vec<Target>) {
        info!(targets = targets.len(), "targets metadata loaded");
        *self.targets.write() = targets;
    }

    /// Cached metadata path, for diagnostics.
    pub fn cache_file(&self) -> PathBuf {
        self.cache_path()
    }

    /// Endpoint the metadata is fetched from.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

async fn read_cache(path: &Path) -> Result<Vec<Target>> {
    let body = tokio::fs::read(path).await.map_err(io_error(path))?;
    parse_targets(&body)
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn refresh(&self) -> anyhow::Result<()> {
        let body = self.fetch().await?;
        let targets = parse_targets(&body)?;
        if let Err(err) = self.store_cache(&body).await {
            warn!(error = %err, "unable to cache targets metadata");
        }
        self.install(targets);
        Ok(())
    }

    async fn targets_offline(&self) -> anyhow::Result<()> {
        let targets = read_cache(&self.cache_path()).await?;
        self.install(targets);
        Ok(())
    }

    fn all_targets(&self) -> Vec<Target> {
        self.targets.read().clone()
    }
}
