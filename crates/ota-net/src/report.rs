//! ---
//! ota_section: "05-networking-external-interfaces"
//! ota_subsection: "module"
//! ota_type: "source"
//! ota_scope: "code"
//! ota_description: "HTTP collaborators for the update agent."
//! ota_version: "v0.0.0-prealpha"
//! ota_owner: "tbd"
//! ---
//! Best-effort event delivery to the device gateway.
//!
//! Events go onto an unbounded channel; a background task batches them and
//! POSTs JSON arrays to `<server>/events`. Failed batches stay queued for the
//! next flush, with the backlog capped at [`MAX_BACKLOG`].

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use ota_core::{ReportEvent, ReportSink};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::{endpoint, NetError, Result};

/// Most events kept while the gateway is unreachable; older ones are dropped.
pub const MAX_BACKLOG: usize = 512;
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct NetworkInfo {
    hostname: String,
}

/// [`ReportSink`] feeding a [`ReportQueue`].
pub struct HttpReportSink {
    client: Client,
    network_url: Url,
    events: mpsc::UnboundedSender<ReportEvent>,
    last_network: Mutex<Option<NetworkInfo>>,
}

#[async_trait]
impl ReportSink for HttpReportSink {
    fn enqueue(&self, event: ReportEvent) {
        if self.events.send(event).is_err() {
            debug!("report queue closed, dropping event");
        }
    }

    async fn report_network_info(&self) -> anyhow::Result<()> {
        let info = NetworkInfo {
            hostname: hostname(),
        };
        let unchanged = self.last_network.lock().as_ref() == Some(&info);
        if unchanged {
            return Ok(());
        }
        let response = self
            .client
            .put(self.network_url.clone())
            .json(&info)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetError::Status {
                url: self.network_url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }
        debug!(hostname = %info.hostname, "network info reported");
        *self.last_network.lock() = Some(info);
        Ok(())
    }
}

fn hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Background drain task of the event queue.
pub struct ReportQueue {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ReportQueue {
    /// Start draining into `<server>/events`; returns the queue handle and
    /// the sink to hand to the engine.
    pub fn start(client: Client, server: &str) -> Result<(Self, HttpReportSink)> {
        let events_url = endpoint(server, "events")?;
        let network_url = endpoint(server, "system_info/network")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let drain = Drain {
            client: client.clone(),
            url: events_url,
            backlog: VecDeque::new(),
        };
        let task = tokio::spawn(drain.run(rx, shutdown_rx));
        info!(server = %server, "event reporting enabled");

        let sink = HttpReportSink {
            client,
            network_url,
            events: tx,
            last_network: Mutex::new(None),
        };
        Ok((Self { task, shutdown }, sink))
    }

    /// Flush what is queued and stop the drain task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "report queue task failed");
        }
    }
}

struct Drain {
    client: Client,
    url: Url,
    backlog: VecDeque<ReportEvent>,
}

impl Drain {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ReportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(event) => {
                        self.push(event);
                        while let Ok(event) = rx.try_recv() {
                            self.push(event);
                        }
                        self.flush().await;
                    }
                    None => break,
                },
                _ = ticker.tick(), if !self.backlog.is_empty() => self.flush().await,
                _ = shutdown.changed() => break,
            }
        }
        while let Ok(event) = rx.try_recv() {
            self.push(event);
        }
        self.flush().await;
        if !self.backlog.is_empty() {
            warn!(dropped = self.backlog.len(), "report queue stopped with undelivered events");
        }
    }

    fn push(&mut self, event: ReportEvent) {
        if self.backlog.len() >= MAX_BACKLOG {
            self.backlog.pop_front();
            warn!(limit = MAX_BACKLOG, "report backlog full, dropping oldest event");
        }
        self.backlog.push_back(event);
    }

    async fn flush(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        let batch: Vec<&ReportEvent> = self.backlog.iter().collect();
        let result = self.client.post(self.url.clone()).json(&batch).send().await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(events = self.backlog.len(), "events delivered");
                self.backlog.clear();
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), queued = self.backlog.len(), "event delivery rejected");
            }
            Err(err) => {
                warn!(error = %err, queued = self.backlog.len(), "event delivery failed");
            }
        }
    }
}
