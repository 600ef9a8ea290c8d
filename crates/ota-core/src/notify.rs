//! ---
//! ota_section: "01-core-functionality"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "Update orchestration and boot reconciliation."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ota_common::Target;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::backend::ReportSink;
use crate::result::ResultCode;

/// Lifecycle events reported for an update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEvent {
    DownloadStarted,
    DownloadCompleted { success: bool },
    InstallStarted,
    /// Installed; activation waits for a reboot.
    InstallationApplied,
    InstallationCompleted { success: bool },
}

impl UpdateEvent {
    /// Backend event type id.
    pub fn id(&self) -> &'static str {
        match self {
            UpdateEvent::DownloadStarted => "EcuDownloadStarted",
            UpdateEvent::DownloadCompleted { .. } => "EcuDownloadCompleted",
            UpdateEvent::InstallStarted => "EcuInstallationStarted",
            UpdateEvent::InstallationApplied => "EcuInstallationApplied",
            UpdateEvent::InstallationCompleted { .. } => "EcuInstallationCompleted",
        }
    }

    pub fn success(&self) -> Option<bool> {
        match self {
            UpdateEvent::DownloadCompleted { success }
            | UpdateEvent::InstallationCompleted { success } => Some(*success),
            _ => None,
        }
    }

    /// Event announcing the end of an install with `code`.
    pub fn install_finished(code: ResultCode) -> Self {
        match code {
            ResultCode::NeedCompletion => UpdateEvent::InstallationApplied,
            ResultCode::Ok => UpdateEvent::InstallationCompleted { success: true },
            _ => UpdateEvent::InstallationCompleted { success: false },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub id: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub correlation_id: String,
    pub ecu: String,
    pub target_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Wire form of a queued lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEvent {
    pub id: String,
    pub device_time: DateTime<Utc>,
    pub event_type: EventType,
    pub event: EventPayload,
}

impl ReportEvent {
    pub fn new(event: UpdateEvent, target: &Target, ecu: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_time: Utc::now(),
            event_type: EventType {
                id: event.id().to_owned(),
                version: 0,
            },
            event: EventPayload {
                correlation_id: target.correlation_id.clone().unwrap_or_default(),
                ecu: ecu.to_owned(),
                target_name: target.display_name().to_owned(),
                version: target.custom_version.clone(),
                success: event.success(),
            },
        }
    }

    pub fn type_id(&self) -> &str {
        &self.event_type.id
    }
}

/// Maps engine progress onto report events; a no-op without a sink.
#[derive(Clone)]
pub struct NotificationEmitter {
    sink: Option<Arc<dyn ReportSink>>,
    ecu_serial: String,
}

impl NotificationEmitter {
    pub fn new(sink: Option<Arc<dyn ReportSink>>, ecu_serial: impl Into<String>) -> Self {
        Self {
            sink,
            ecu_serial: ecu_serial.into(),
        }
    }

    /// Emitter that drops every event.
    pub fn disabled() -> Self {
        Self::new(None, "")
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn sink(&self) -> Option<&Arc<dyn ReportSink>> {
        self.sink.as_ref()
    }

    pub fn emit(&self, event: UpdateEvent, target: &Target) {
        let Some(sink) = &self.sink else {
            return;
        };
        let ecu = target
            .ecus
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or(&self.ecu_serial);
        let report = ReportEvent::new(event, target, ecu);
        debug!(
            event = report.type_id(),
            correlation_id = %report.event.correlation_id,
            success = ?report.event.success,
            "queueing report event"
        );
        sink.enqueue(report);
    }

    pub fn download_started(&self, target: &Target) {
        self.emit(UpdateEvent::DownloadStarted, target);
    }

    pub fn download_completed(&self, target: &Target, success: bool) {
        self.emit(UpdateEvent::DownloadCompleted { success }, target);
    }

    pub fn install_started(&self, target: &Target) {
        self.emit(UpdateEvent::InstallStarted, target);
    }

    pub fn install_finished(&self, target: &Target, code: ResultCode) {
        self.emit(UpdateEvent::install_finished(code), target);
    }
}

impl std::fmt::Debug for NotificationEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationEmitter")
            .field("enabled", &self.is_enabled())
            .field("ecu_serial", &self.ecu_serial)
            .finish()
    }
}
