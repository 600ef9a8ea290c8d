//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "binary"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Binary entrypoint for the ota-lite agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Wires configuration into the concrete collaborators and runs boot
//! finalization once per process start.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ota_common::{AgentConfig, Target};
use ota_core::{
    BootFinalizer, EcuIdentity, FinalizationReport, NotificationEmitter, ReportEvent, ReportSink,
    SysrootBootOracle, UpdatePipeline,
};
use ota_metrics::AgentMetrics;
use ota_net::{build_client, DeviceHeaders, HttpMetadataSource, ImagePackageManager, ReportQueue};
use ota_persistence::{load_or_create_serial, FileLedger};
use parking_lot::Mutex;
use reqwest::Client;
use tracing::info;

/// Holds finalization events until the real sink exists.
#[derive(Default)]
struct StartupEvents {
    events: Mutex<Vec<ReportEvent>>,
}

impl StartupEvents {
    fn take(&self) -> Vec<ReportEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

#[async_trait]
impl ReportSink for StartupEvents {
    fn enqueue(&self, event: ReportEvent) {
        self.events.lock().push(event);
    }

    async fn report_network_info(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct Agent {
    pub config: AgentConfig,
    pub ledger: Arc<FileLedger>,
    pub boot: Arc<SysrootBootOracle>,
    pub identity: EcuIdentity,
    pub metrics: AgentMetrics,
    pub finalization: FinalizationReport,
    client: Client,
    notifier: NotificationEmitter,
    reports: Option<ReportQueue>,
}

impl Agent {
    pub async fn start(config: AgentConfig, metrics: AgentMetrics) -> Result<Self> {
        let storage = &config.storage.path;
        let ledger = Arc::new(
            FileLedger::open(storage)
                .with_context(|| format!("opening ledger in {}", storage.display()))?,
        );
        let serial = load_or_create_serial(storage, config.provision.primary_ecu_serial.as_deref())
            .context("loading primary ECU serial")?;
        let identity = EcuIdentity {
            serial,
            hardware_id: config.provision.primary_ecu_hardware_id.clone(),
        };
        let boot = Arc::new(SysrootBootOracle::from_config(&config));

        let startup = Arc::new(StartupEvents::default());
        let startup_sink: Arc<dyn ReportSink> = startup.clone();
        let finalization = BootFinalizer::new(
            ledger.clone(),
            boot.clone(),
            NotificationEmitter::new(Some(startup_sink), identity.serial.clone()),
            Some(metrics.clone()),
        )
        .finalize()?;

        let headers = DeviceHeaders::from_config(
            &config,
            Some(&finalization.booted_hash),
            &finalization.active,
            &identity.serial,
        );
        let client = build_client(&headers)?;

        let (reports, notifier) = match &config.tls.server {
            Some(server) => {
                let (queue, sink) = ReportQueue::start(client.clone(), server)?;
                let sink: Arc<dyn ReportSink> = Arc::new(sink);
                for event in startup.take() {
                    sink.enqueue(event);
                }
                (
                    Some(queue),
                    NotificationEmitter::new(Some(sink), identity.serial.clone()),
                )
            }
            None => (None, NotificationEmitter::disabled()),
        };

        info!(
            ecu_serial = %identity.serial,
            hardware_id = %identity.hardware_id,
            active = %finalization.active,
            "agent initialised"
        );
        Ok(Self {
            config,
            ledger,
            boot,
            identity,
            metrics,
            finalization,
            client,
            notifier,
            reports,
        })
    }

    /// Image the device runs, as reconciled at startup.
    pub fn active(&self) -> &Target {
        &self.finalization.active
    }

    pub fn metadata(&self) -> Result<Arc<HttpMetadataSource>> {
        Ok(Arc::new(HttpMetadataSource::from_config(
            &self.config,
            self.client.clone(),
        )?))
    }

    pub fn pipeline(&self) -> UpdatePipeline {
        let packages =
            ImagePackageManager::from_config(&self.config, self.client.clone(), self.boot.clone());
        UpdatePipeline::new(
            Arc::new(packages),
            self.ledger.clone(),
            self.boot.clone(),
            self.notifier.clone(),
            self.identity.clone(),
        )
        .with_verification_policy(self.config.update.verification_failure)
        .with_metrics(self.metrics.clone())
    }

    /// Deliver queued events before exit.
    pub async fn shutdown(self) {
        if let Some(queue) = self.reports {
            queue.shutdown().await;
        }
    }
}
