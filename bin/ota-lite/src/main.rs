//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "binary"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Binary entrypoint for the ota-lite agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
mod agent;
mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use ota_common::version::VersionInfo;
use ota_common::{init_tracing, level_from_numeric, AgentConfig};
use ota_core::matcher::LATEST;
use ota_metrics::{new_registry, AgentMetrics};
use tracing::{error, info, warn};

use crate::agent::Agent;

const DEFAULT_CONFIG_PATHS: &[&str] = &["/etc/sota/ota-lite.toml", "/usr/lib/sota/ota-lite.toml"];

#[derive(Debug, Parser)]
#[command(
    name = "ota-lite",
    author,
    disable_version_flag = true,
    about = "Over-the-air update agent for immutable-image devices",
    long_about = None
)]
struct Cli {
    #[arg(
        short = 'c',
        long,
        value_name = "FILE",
        action = ArgAction::Append,
        global = true,
        help = "Configuration file; repeat to list fallbacks in order"
    )]
    config: Vec<PathBuf>,

    #[arg(
        long,
        value_name = "0-5",
        value_parser = clap::value_parser!(u8).range(0..=5),
        global = true,
        help = "Log level: 0 trace, 1 debug, 2 info, 3 warning, 4 error, 5 fatal"
    )]
    loglevel: Option<u8>,

    #[arg(long, value_name = "URL", global = true, help = "URL of the target metadata repository")]
    repo_server: Option<String>,

    #[arg(long, value_name = "URL", global = true, help = "URL images are downloaded from")]
    ostree_server: Option<String>,

    #[arg(long, value_name = "ID", global = true, help = "Hardware ID of the primary ECU")]
    primary_ecu_hardware_id: Option<String>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    #[command(about = "Show the active image")]
    Status,
    #[command(about = "List targets available to this device")]
    List,
    #[command(about = "Install one target and exit")]
    Update {
        #[arg(long, value_name = "NAME", default_value = LATEST, help = "Target name or version to install")]
        update_name: String,
    },
    #[command(about = "Poll for and install updates until stopped")]
    Daemon {
        #[arg(long, value_name = "SECONDS", help = "Override [uptane]/polling_sec")]
        interval: Option<u64>,
        #[arg(long, value_name = "PATH", help = "File to flock(2) around each install")]
        update_lockfile: Option<PathBuf>,
    },
}

impl Cli {
    fn config_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = self.config.clone();
        candidates.extend(DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from));
        candidates
    }

    fn apply_overrides(&self, config: &mut AgentConfig) {
        if let Some(level) = self.loglevel {
            config.logging.level = Some(level_from_numeric(level).to_owned());
        }
        if let Some(server) = &self.repo_server {
            config.uptane.repo_server = Some(server.clone());
        }
        if let Some(server) = &self.ostree_server {
            config.pacman.ostree_server = Some(server.clone());
        }
        if let Some(hardware_id) = &self.primary_ecu_hardware_id {
            config.provision.primary_ecu_hardware_id = hardware_id.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let version = VersionInfo::current().with_build(
        option_env!("VERGEN_GIT_SHA"),
        option_env!("VERGEN_BUILD_TIMESTAMP"),
        option_env!("VERGEN_CARGO_TARGET_TRIPLE"),
        option_env!("VERGEN_CARGO_PROFILE"),
    );
    if cli.version {
        println!("{}", version.extended());
        return ExitCode::SUCCESS;
    }
    let Some(command) = cli.command.clone() else {
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    };

    match run(&cli, command, &version).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "ota-lite failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, command: Commands, version: &VersionInfo) -> Result<ExitCode> {
    let loaded = AgentConfig::load_with_source(&cli.config_candidates())?;
    let mut config = loaded.config;
    cli.apply_overrides(&mut config);
    init_tracing("ota-lite", &config.logging)?;
    config.validate().context("invalid configuration")?;
    info!(
        config_path = %loaded.source.display(),
        version = %version.cli_string(),
        "configuration loaded"
    );

    if effective_uid().is_some_and(|uid| uid != 0) {
        warn!("running as non-root and may not work as expected");
    }

    let metrics = AgentMetrics::new(new_registry())?;
    metrics.set_build_info(&version.semver, &version.git_sha, &version.profile);

    let agent = Agent::start(config, metrics).await?;
    let outcome = dispatch(&agent, command).await;
    agent.shutdown().await;
    outcome
}

async fn dispatch(agent: &Agent, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Status => Ok(commands::status(agent)),
        Commands::List => commands::list(agent).await,
        Commands::Update { update_name } => commands::update(agent, &update_name).await,
        Commands::Daemon {
            interval,
            update_lockfile,
        } => commands::daemon(agent, interval, update_lockfile).await,
    }
}

/// `/proc/self` is owned by the effective uid of the process.
fn effective_uid() -> Option<u32> {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata("/proc/self").ok().map(|meta| meta.uid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn effective_uid_matches_owner_of_created_files() {
        use std::os::unix::fs::MetadataExt;

        let path = std::env::temp_dir().join(format!("ota-lite-uid-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();
        let owner = std::fs::metadata(&path).unwrap().uid();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(effective_uid(), Some(owner));
    }

    #[test]
    fn global_overrides_apply_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ota-lite",
            "daemon",
            "--interval",
            "30",
            "--repo-server",
            "https://ota.example.invalid/repo",
            "--loglevel",
            "1",
            "-c",
            "/tmp/a.toml",
            "-c",
            "/tmp/b.toml",
        ])
        .unwrap();
        let mut config = AgentConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(
            config.uptane.repo_server.as_deref(),
            Some("https://ota.example.invalid/repo")
        );
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
        assert_eq!(cli.config_candidates()[..2], [PathBuf::from("/tmp/a.toml"), PathBuf::from("/tmp/b.toml")]);
        assert!(matches!(
            cli.command,
            Some(Commands::Daemon {
                interval: Some(30),
                update_lockfile: None
            })
        ));
    }

    #[test]
    fn update_defaults_to_latest() {
        let cli = Cli::try_parse_from(["ota-lite", "update"]).unwrap();
        match cli.command {
            Some(Commands::Update { update_name }) => assert_eq!(update_name, LATEST),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn loglevel_out_of_range_is_rejected() {
        assert!(Cli::try_parse_from(["ota-lite", "--loglevel", "9", "status"]).is_err());
    }
}
