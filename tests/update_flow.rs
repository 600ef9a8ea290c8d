//! ---
//! ota_section: "15-testing-qa-runbook"
//! ota_subsection: "integration-tests"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "End-to-end update flows against a local HTTP backend."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Router;
use ota_common::Target;
use ota_core::matcher::find_target;
use ota_core::{
    BootFinalizationOutcome, BootFinalizer, DaemonLoop, DaemonSettings, EcuIdentity, Iteration,
    MetadataSource, NotificationEmitter, ReportSink, ResultCode, UpdatePipeline,
};
use ota_metrics::AgentMetrics;
use ota_net::{HttpMetadataSource, ImagePackageManager, ReportQueue};
use ota_persistence::{FileLedger, InstallMode, Ledger};
use ota_testharness::{FakeBootOracle, FakeRebootTrigger, ECU_SERIAL, HARDWARE_ID};
use parking_lot::Mutex;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;

const IMAGE: &[u8] = b"lmp-42 rootfs commit";
const BOOTED: &str = "0000000000000000000000000000000000000000000000000000000000000041";
const TARGET_NAME: &str = "raspberrypi4-64-lmp-42";

fn image_sha() -> String {
    hex::encode(Sha256::digest(IMAGE))
}

fn targets_document() -> String {
    serde_json::json!({
        "signatures": [],
        "signed": {
            "_type": "Targets",
            "version": 3,
            "targets": {
                TARGET_NAME: {
                    "hashes": {"sha256": image_sha()},
                    "length": IMAGE.len(),
                    "custom": {"version": "42", "hardwareIds": [HARDWARE_ID]}
                },
                "intel-corei7-64-lmp-50": {
                    "hashes": {"sha256": "ee".repeat(32)},
                    "length": 10,
                    "custom": {"version": "50", "hardwareIds": ["intel-corei7-64"]}
                }
            }
        }
    })
    .to_string()
}

#[derive(Default)]
struct Backend {
    events: Mutex<Vec<serde_json::Value>>,
    network: Mutex<usize>,
}

impl Backend {
    fn event_ids(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|event| event["eventType"]["id"].as_str().unwrap_or_default().to_owned())
            .collect()
    }
}

async fn receive_events(State(backend): State<Arc<Backend>>, body: Bytes) -> StatusCode {
    let batch: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    backend.events.lock().extend(batch);
    StatusCode::OK
}

async fn receive_network(State(backend): State<Arc<Backend>>) -> StatusCode {
    *backend.network.lock() += 1;
    StatusCode::OK
}

async fn backend() -> (Arc<Backend>, String) {
    let state = Arc::new(Backend::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let document = targets_document();
    let router = Router::new()
        .route("/repo/targets.json", get(move || async move { document }))
        .route(&format!("/treehub/{TARGET_NAME}"), get(|| async { IMAGE }))
        .route("/gateway/events", post(receive_events))
        .route("/gateway/system_info/network", put(receive_network))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (state, format!("http://{addr}"))
}

/// Device wired to the local backend with on-disk ledger and staging.
struct Device {
    dir: tempfile::TempDir,
    server: String,
    boot: Arc<FakeBootOracle>,
    metrics: AgentMetrics,
}

impl Device {
    fn new(server: String) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("install-image");
        std::fs::write(&script, "#!/bin/sh\ntest -f \"$1\" && test -n \"$2\"\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self {
            dir,
            server,
            boot: Arc::new(FakeBootOracle::booted(BOOTED)),
            metrics: AgentMetrics::detached().unwrap(),
        }
    }

    fn storage(&self) -> PathBuf {
        self.dir.path().join("sota")
    }

    fn ledger(&self) -> Arc<FileLedger> {
        Arc::new(FileLedger::open(self.storage()).unwrap())
    }

    fn metadata(&self) -> Arc<HttpMetadataSource> {
        Arc::new(
            HttpMetadataSource::new(
                Client::new(),
                &format!("{}/repo", self.server),
                self.storage().join("metadata"),
            )
            .unwrap(),
        )
    }

    fn pipeline(&self, ledger: Arc<FileLedger>, notifier: NotificationEmitter) -> UpdatePipeline {
        let packages = ImagePackageManager::new(
            Client::new(),
            Some(format!("{}/treehub", self.server)),
            self.storage().join("images"),
            self.dir.path().join("install-image"),
            self.boot.clone(),
        );
        UpdatePipeline::new(
            Arc::new(packages),
            ledger,
            self.boot.clone(),
            notifier,
            EcuIdentity {
                serial: ECU_SERIAL.into(),
                hardware_id: HARDWARE_ID.into(),
            },
        )
        .with_metrics(self.metrics.clone())
    }

    fn finalizer(&self, ledger: Arc<FileLedger>, notifier: NotificationEmitter) -> BootFinalizer {
        BootFinalizer::new(ledger, self.boot.clone(), notifier, Some(self.metrics.clone()))
    }

    fn lockfile(&self) -> PathBuf {
        self.dir.path().join("update.lock")
    }

    fn settings(&self) -> DaemonSettings {
        DaemonSettings {
            hardware_id: HARDWARE_ID.into(),
            tags: Vec::new(),
            compare_apps: false,
            interval: Duration::from_millis(20),
            lockfile: Some(self.lockfile()),
            reboot_command: PathBuf::from("/sbin/reboot"),
            repo_server: Some(format!("{}/repo", self.server)),
            report_network: true,
            metadata_retry: Duration::from_millis(20),
        }
    }
}

fn reporting(queue_sink: ota_net::HttpReportSink) -> NotificationEmitter {
    let sink: Arc<dyn ReportSink> = Arc::new(queue_sink);
    NotificationEmitter::new(Some(sink), ECU_SERIAL)
}

fn staged_image(storage: &Path) -> PathBuf {
    storage.join("images").join(image_sha())
}

#[tokio::test]
async fn install_reboot_and_finalize_over_http() {
    let (backend, server) = backend().await;
    let device = Device::new(server.clone());
    let (queue, sink) = ReportQueue::start(Client::new(), &format!("{server}/gateway")).unwrap();
    let notifier = reporting(sink);

    let metadata = device.metadata();
    let target = find_target(metadata.as_ref(), HARDWARE_ID, &[], "latest")
        .await
        .unwrap()
        .expect("eligible target");
    assert_eq!(target.filename, TARGET_NAME);

    let ledger = device.ledger();
    let report = device
        .pipeline(ledger.clone(), notifier.clone())
        .run(&target, Some(&device.lockfile()))
        .await
        .unwrap();
    assert_eq!(report.code, ResultCode::NeedCompletion);
    assert_eq!(std::fs::read(staged_image(&device.storage())).unwrap(), IMAGE);
    assert_eq!(ledger.load_pending().unwrap().unwrap().filename, TARGET_NAME);
    assert!(device.boot.flag_set());
    assert_eq!(device.metrics.attempts("need_completion"), 1);
    drop(report);
    drop(ledger);

    device.boot.reboot_into(image_sha());
    let ledger = device.ledger();
    let finalized = device.finalizer(ledger.clone(), notifier).finalize().unwrap();
    assert!(matches!(finalized.outcome, BootFinalizationOutcome::Completed(ref t) if t.filename == TARGET_NAME));
    assert_eq!(finalized.active.filename, TARGET_NAME);
    assert!(ledger.load_pending().unwrap().is_none());
    let modes: Vec<InstallMode> = ledger.history().unwrap().iter().map(|e| e.mode).collect();
    assert_eq!(modes, vec![InstallMode::Pending, InstallMode::Current]);

    queue.shutdown().await;
    assert_eq!(
        backend.event_ids(),
        vec![
            "EcuDownloadStarted",
            "EcuDownloadCompleted",
            "EcuInstallationStarted",
            "EcuInstallationApplied",
            "EcuInstallationCompleted",
        ]
    );
    let events = backend.events.lock().clone();
    let correlation = events[0]["event"]["correlationId"].clone();
    assert!(correlation.as_str().unwrap().starts_with("42-"));
    assert!(events.iter().all(|e| e["event"]["correlationId"] == correlation));
    assert_eq!(events[4]["event"]["ecu"], ECU_SERIAL);
    assert_eq!(events[4]["event"]["success"], true);
}

#[tokio::test]
async fn rolled_back_image_is_not_retried() {
    let (backend, server) = backend().await;
    let device = Device::new(server.clone());
    let (queue, sink) = ReportQueue::start(Client::new(), &format!("{server}/gateway")).unwrap();
    let notifier = reporting(sink);
    let reboot = Arc::new(FakeRebootTrigger::exiting_with(0));

    let ledger = device.ledger();
    let mut daemon = DaemonLoop::new(
        device.settings(),
        device.metadata(),
        device.pipeline(ledger.clone(), notifier.clone()),
        device.boot.clone(),
        reboot.clone(),
        Target::unknown(),
    );
    let first = daemon.iterate().await.unwrap();
    assert!(matches!(first, Iteration::RebootRequested(ref t) if t.filename == TARGET_NAME));
    assert_eq!(reboot.calls(), 1);
    drop(daemon);
    drop(ledger);

    // The new image fails to come up and the bootloader falls back.
    device.boot.reboot_into(BOOTED);
    let ledger = device.ledger();
    let finalized = device
        .finalizer(ledger.clone(), notifier.clone())
        .finalize()
        .unwrap();
    assert!(matches!(finalized.outcome, BootFinalizationOutcome::RolledBack(_)));
    assert!(finalized.active.is_unknown());

    let mut daemon = DaemonLoop::new(
        device.settings(),
        device.metadata(),
        device.pipeline(ledger.clone(), notifier),
        device.boot.clone(),
        reboot.clone(),
        finalized.active,
    );
    let second = daemon.iterate().await.unwrap();
    assert!(matches!(second, Iteration::Skipped(ref t) if t.filename == TARGET_NAME));
    assert_eq!(reboot.calls(), 1);

    queue.shutdown().await;
    let ids = backend.event_ids();
    assert_eq!(ids.iter().filter(|id| *id == "EcuInstallationCompleted").count(), 1);
    let completed = backend
        .events
        .lock()
        .iter()
        .find(|e| e["eventType"]["id"] == "EcuInstallationCompleted")
        .cloned()
        .unwrap();
    assert_eq!(completed["event"]["success"], false);
    assert_eq!(*backend.network.lock(), 1);
}

#[tokio::test]
async fn cached_metadata_serves_offline_selection() {
    let (_backend, server) = backend().await;
    let device = Device::new(server);
    let online = device.metadata();
    online.refresh().await.unwrap();

    let offline = Arc::new(
        HttpMetadataSource::new(
            Client::new(),
            "http://127.0.0.1:9/repo",
            device.storage().join("metadata"),
        )
        .unwrap(),
    );
    let target = find_target(offline.as_ref(), HARDWARE_ID, &[], "42")
        .await
        .unwrap()
        .expect("target from cache");
    assert_eq!(target.sha256_hash(), Some(image_sha().as_str()));

    let other_hardware = find_target(offline.as_ref(), "intel-corei7-64", &[], "latest")
        .await
        .unwrap();
    assert_eq!(other_hardware.map(|t| t.custom_version), Some("50".to_owned()));
}
