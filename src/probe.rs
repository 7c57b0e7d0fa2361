//! Connectivity probe: periodic HEAD request feeding the monitor.

use crate::config::ProbeConfig;
use crate::connectivity::{ConnectivityMonitor, Transition};
use crate::error::RemoteError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub struct ConnectivityProbe {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    monitor: Arc<ConnectivityMonitor>,
}

impl ConnectivityProbe {
    pub fn new(config: &ProbeConfig, monitor: Arc<ConnectivityMonitor>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RemoteError::Protocol(format!("failed to build probe client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            interval: config.interval(),
            monitor,
        })
    }

    /// True if the probe URL answered with a success or redirect status
    pub async fn check(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(resp) => {
                let status = resp.status();
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "probe failed");
                false
            }
        }
    }

    pub async fn probe_once(&self) -> Transition {
        let online = self.check().await;
        self.monitor.update(online)
    }

    /// Probe every interval until `shutdown` changes or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(url = %self.url, interval_secs = self.interval.as_secs(), "connectivity probe started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }
        info!("connectivity probe stopped");
    }
}
