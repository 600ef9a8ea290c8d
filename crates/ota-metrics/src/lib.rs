//! ---
//! ota_section: "03-persistence-logging"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Metrics collection and export for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::response::{IntoResponse, Response};
use axum::Router;
use prometheus::{GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the agent.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint. Returns `text/plain` metrics even on large registries.
async fn metrics_handler(registry: SharedRegistry) -> Response {
    let families = registry.gather();
    match TextEncoder::new().encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the update engine.
#[derive(Clone)]
pub struct AgentMetrics {
    registry: SharedRegistry,
    update_attempts: IntCounterVec,
    finalizations: IntCounterVec,
    metadata_failures: IntCounter,
    reboots_triggered: IntCounter,
    ledger_writes: IntCounterVec,
    awaiting_reboot: IntGauge,
    build_info: GaugeVec,
}

impl AgentMetrics {
    /// Register every agent metric with `registry`.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let update_attempts = IntCounterVec::new(
            Opts::new(
                "ota_lite_update_attempts_total",
                "Update attempts by final result code",
            ),
            &["result"],
        )?;
        registry.register(Box::new(update_attempts.clone()))?;

        let finalizations = IntCounterVec::new(
            Opts::new(
                "ota_lite_boot_finalizations_total",
                "Boot-time finalization outcomes",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(finalizations.clone()))?;

        let metadata_failures = IntCounter::with_opts(Opts::new(
            "ota_lite_metadata_refresh_failures_total",
            "Metadata refreshes that failed and triggered the retry backoff",
        ))?;
        registry.register(Box::new(metadata_failures.clone()))?;

        let reboots_triggered = IntCounter::with_opts(Opts::new(
            "ota_lite_reboots_triggered_total",
            "Reboot commands executed after an update",
        ))?;
        registry.register(Box::new(reboots_triggered.clone()))?;

        let ledger_writes = IntCounterVec::new(
            Opts::new(
                "ota_lite_ledger_writes_total",
                "Installed-version ledger mutations by mode",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(ledger_writes.clone()))?;

        let awaiting_reboot = IntGauge::with_opts(Opts::new(
            "ota_lite_awaiting_reboot",
            "Indicator (0/1) whether an installed update waits for a reboot",
        ))?;
        registry.register(Box::new(awaiting_reboot.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new("ota_lite_build_info", "Build metadata for the running agent"),
            &["version", "git_sha", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            update_attempts,
            finalizations,
            metadata_failures,
            reboots_triggered,
            ledger_writes,
            awaiting_reboot,
            build_info,
        })
    }

    /// Instance on a private registry, for one-shot commands and tests.
    pub fn detached() -> Result<Self> {
        Self::new(new_registry())
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_attempt(&self, result: &str) {
        self.update_attempts.with_label_values(&[result]).inc();
    }

    pub fn record_finalization(&self, outcome: &str) {
        self.finalizations.with_label_values(&[outcome]).inc();
    }

    pub fn inc_metadata_failure(&self) {
        self.metadata_failures.inc();
    }

    pub fn inc_reboot(&self) {
        self.reboots_triggered.inc();
    }

    pub fn record_ledger_write(&self, mode: &str) {
        self.ledger_writes.with_label_values(&[mode]).inc();
    }

    pub fn set_awaiting_reboot(&self, waiting: bool) {
        self.awaiting_reboot.set(i64::from(waiting));
    }

    pub fn set_build_info(&self, version: &str, git_sha: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, git_sha, profile])
            .set(1.0);
    }

    pub fn attempts(&self, result: &str) -> u64 {
        self.update_attempts.with_label_values(&[result]).get()
    }

    pub fn reboots(&self) -> u64 {
        self.reboots_triggered.get()
    }
}

impl std::fmt::Debug for AgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;
