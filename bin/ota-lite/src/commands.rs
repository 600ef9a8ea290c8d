//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "binary"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Binary entrypoint for the ota-lite agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ota_common::{PackageManagerKind, Target};
use ota_core::matcher::{eligible_targets, ensure_metadata, find_target, targets_eq};
use ota_core::{CommandRebootTrigger, DaemonLoop, DaemonSettings, MetadataSource, ResultCode};
use ota_metrics::spawn_http_server;
use tokio::signal;
use tracing::{error, info, warn};

use crate::agent::Agent;

/// Human-readable summary of `target`; apps are listed in docker-app mode.
fn describe_target(prefix: &str, target: &Target, show_apps: bool) -> String {
    let mut out = format!("{prefix}{}", target.display_name());
    let _ = write!(out, "\n\tsha256: {}", target.sha256_hash().unwrap_or("?"));
    if show_apps {
        out.push_str("\n\tDocker Apps:");
        if target.apps.is_empty() {
            out.push_str(" none");
        }
        for (name, app) in &target.apps {
            let _ = write!(out, "\n\t\t{name} -> {}", app.filename);
        }
    }
    out
}

fn docker_app_mode(agent: &Agent) -> bool {
    agent.config.pacman.kind == PackageManagerKind::OstreeDockerApp
}

pub fn status(agent: &Agent) -> ExitCode {
    let active = agent.active();
    if active.is_unknown() {
        println!("No active deployment found");
    } else {
        println!("{}", describe_target("Active image is: ", active, docker_app_mode(agent)));
    }
    ExitCode::SUCCESS
}

pub async fn list(agent: &Agent) -> Result<ExitCode> {
    let metadata = agent.metadata()?;
    if let Err(err) = ensure_metadata(metadata.as_ref()).await {
        error!(error = %err, "unable to list targets");
        return Ok(ExitCode::FAILURE);
    }
    let targets = eligible_targets(
        &metadata.all_targets(),
        &agent.config.provision.primary_ecu_hardware_id,
        &agent.config.pacman.tags,
    );
    if targets.is_empty() {
        println!("No updates available for this device");
    }
    for target in &targets {
        println!("{}", describe_target("", target, docker_app_mode(agent)));
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn update(agent: &Agent, name: &str) -> Result<ExitCode> {
    let metadata = agent.metadata()?;
    let found = match find_target(
        metadata.as_ref(),
        &agent.config.provision.primary_ecu_hardware_id,
        &agent.config.pacman.tags,
        name,
    )
    .await
    {
        Ok(found) => found,
        Err(err) => {
            error!(error = %err, "unable to load target metadata");
            return Ok(ExitCode::FAILURE);
        }
    };
    let Some(target) = found else {
        error!(update_name = name, "Unable to find update");
        return Ok(ExitCode::FAILURE);
    };

    if targets_eq(&target, agent.active(), agent.config.compare_apps()) {
        info!(target_name = %target.filename, "Already up-to-date");
        return Ok(ExitCode::SUCCESS);
    }
    println!("{}", describe_target("Updating to: ", &target, docker_app_mode(agent)));

    let lockfile = agent.config.update.lockfile.as_deref();
    match agent.pipeline().run(&target, lockfile).await {
        Ok(report) => {
            info!(code = %report.code, description = %report.description, "update finished");
            if report.code == ResultCode::NeedCompletion {
                println!("Reboot to activate {}", report.target.display_name());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(error = %err, target_name = %target.filename, "update failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

pub async fn daemon(
    agent: &Agent,
    interval: Option<u64>,
    update_lockfile: Option<PathBuf>,
) -> Result<ExitCode> {
    let mut settings = DaemonSettings::from_config(&agent.config);
    if let Some(seconds) = interval {
        settings.interval = Duration::from_secs(seconds.max(1));
    }
    if update_lockfile.is_some() {
        settings.lockfile = update_lockfile;
    }

    let exporter = if agent.config.metrics.enabled {
        Some(spawn_http_server(
            agent.metrics.registry(),
            agent.config.metrics.listen,
        )?)
    } else {
        None
    };

    let metadata: Arc<dyn MetadataSource> = agent.metadata()?;
    let daemon = DaemonLoop::new(
        settings,
        metadata,
        agent.pipeline(),
        agent.boot.clone(),
        Arc::new(CommandRebootTrigger),
        agent.active().clone(),
    )
    .with_metrics(agent.metrics.clone());
    let result = daemon.run(shutdown_signal()).await;

    if let Some(exporter) = exporter {
        if let Err(err) = exporter.shutdown().await {
            warn!(error = %format!("{err:#}"), "metrics exporter did not stop cleanly");
        }
    }
    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            error!(error = %err, "daemon stopped");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn shutdown_signal() {
    tokio::select! {
        _ = ctrl_c() => {},
        _ = terminate() => {},
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}
