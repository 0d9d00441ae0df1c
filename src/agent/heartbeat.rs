//! Heartbeat sender
//!
//! A background task that periodically reports the node's resources,
//! liveness, and the supervisor's allocation snapshot to the control
//! plane. Heartbeats are the only path by which agent-side truth reaches
//! the control plane.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::models::{now_ts, Heartbeat};

use super::metrics::SharedResourceCollector;
use super::supervisor::TaskSupervisor;

/// Default heartbeat interval in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Configuration for the heartbeat sender.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Control-plane URL (e.g. "http://localhost:8500").
    pub server_url: String,

    /// This node's id.
    pub node_id: String,

    /// Seconds between heartbeats.
    pub interval_secs: u64,

    /// Consecutive failures before escalating the log level.
    pub max_retries: u32,
}

impl HeartbeatConfig {
    pub fn new(server_url: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            node_id: node_id.into(),
            interval_secs: HEARTBEAT_INTERVAL_SECS,
            max_retries: 3,
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("server error {status}: {message}")]
    ServerError { status: u16, message: String },
}

/// Heartbeat sender that runs as a background task.
pub struct HeartbeatClient {
    config: HeartbeatConfig,
    http_client: Client,
    supervisor: Arc<TaskSupervisor>,
    collector: SharedResourceCollector,
}

impl HeartbeatClient {
    pub fn new(
        config: HeartbeatConfig,
        supervisor: Arc<TaskSupervisor>,
        collector: SharedResourceCollector,
    ) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            config,
            http_client,
            supervisor,
            collector,
        }
    }

    /// Run the heartbeat loop until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.interval_secs);
        let mut consecutive_failures = 0u32;

        info!(
            node_id = %self.config.node_id,
            server = %self.config.server_url,
            interval_secs = self.config.interval_secs,
            "heartbeat sender started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.send_heartbeat().await {
                        Ok(()) => {
                            if consecutive_failures > 0 {
                                info!(
                                    failures = consecutive_failures,
                                    "heartbeat recovered"
                                );
                            }
                            consecutive_failures = 0;
                            debug!("heartbeat sent");
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures >= self.config.max_retries {
                                error!(
                                    failures = consecutive_failures,
                                    error = %e,
                                    "heartbeat failing repeatedly"
                                );
                            } else {
                                warn!(attempt = consecutive_failures, error = %e, "heartbeat failed");
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped shutdown handle also stops the sender.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("heartbeat sender shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&self) -> Result<(), HeartbeatError> {
        let resources = {
            let mut collector = self.collector.write().await;
            collector.collect()
        };
        let allocations = self.supervisor.snapshot().await;

        let heartbeat = Heartbeat {
            node_id: self.config.node_id.clone(),
            resources,
            healthy: true,
            timestamp: now_ts(),
            allocations,
        };

        let url = format!("{}/heartbeat", self.config.server_url);
        let response = self.http_client.post(&url).json(&heartbeat).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(HeartbeatError::ServerError { status, message });
        }
        Ok(())
    }
}

/// Spawn the heartbeat sender. The returned sender stops the loop.
pub fn spawn_heartbeat(
    config: HeartbeatConfig,
    supervisor: Arc<TaskSupervisor>,
    collector: SharedResourceCollector,
) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client = HeartbeatClient::new(config, supervisor, collector);

    tokio::spawn(async move {
        client.run(shutdown_rx).await;
    });

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = HeartbeatConfig::new("http://localhost:8500", "n1").with_interval(30);
        assert_eq!(config.server_url, "http://localhost:8500");
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.interval_secs, 30);
    }

    #[test]
    fn test_config_defaults() {
        let config = HeartbeatConfig::new("http://localhost:8500", "n1");
        assert_eq!(config.interval_secs, HEARTBEAT_INTERVAL_SECS);
        assert_eq!(config.max_retries, 3);
    }
}
