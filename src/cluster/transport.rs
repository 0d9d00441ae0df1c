//! Directed request/response channel from the control plane to agents
//!
//! Three operations: deliver an allocation, query its status, request a
//! stop. Calls carry a short timeout and surface failures to the caller;
//! there is no transparent retry. Endpoints come from the node row in the
//! store; the in-memory map is only a cache over that column, filled at
//! registration time.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use crate::store::StoreError;

use super::models::Allocation;
use super::node_manager::NodeManager;

/// Per-call timeout for agent requests.
pub const TRANSPORT_TIMEOUT_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no endpoint known for node '{0}'")]
    UnknownEndpoint(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("agent returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct AgentTransport {
    client: Client,
    node_manager: Arc<NodeManager>,
    endpoints: DashMap<String, String>,
}

impl AgentTransport {
    pub fn new(node_manager: Arc<NodeManager>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(TRANSPORT_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            node_manager,
            endpoints: DashMap::new(),
        }
    }

    /// Cache an agent endpoint. Called at node registration; the persisted
    /// node row remains the source of truth.
    pub fn register(&self, node_id: impl Into<String>, endpoint: impl Into<String>) {
        let node_id = node_id.into();
        let endpoint = endpoint.into();
        debug!(%node_id, %endpoint, "agent endpoint registered");
        self.endpoints.insert(node_id, endpoint);
    }

    /// Drop every cached endpoint (test reset).
    pub fn clear_cache(&self) {
        self.endpoints.clear();
    }

    fn endpoint_for(&self, node_id: &str) -> Result<String, TransportError> {
        if let Some(endpoint) = self.endpoints.get(node_id) {
            return Ok(endpoint.clone());
        }
        let node = self
            .node_manager
            .get_node(node_id)?
            .ok_or_else(|| TransportError::UnknownEndpoint(node_id.to_string()))?;
        if node.endpoint.is_empty() {
            return Err(TransportError::UnknownEndpoint(node_id.to_string()));
        }
        self.endpoints
            .insert(node_id.to_string(), node.endpoint.clone());
        Ok(node.endpoint)
    }

    /// Deliver an allocation to the agent on its target node.
    pub async fn send(&self, allocation: &Allocation) -> Result<(), TransportError> {
        let endpoint = self.endpoint_for(&allocation.node_id)?;
        debug!(
            allocation_id = %allocation.allocation_id,
            node_id = %allocation.node_id,
            "delivering allocation"
        );
        let response = self
            .client
            .post(format!("{endpoint}/allocations"))
            .json(allocation)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Query the agent-local status of an allocation.
    pub async fn get_status(
        &self,
        node_id: &str,
        allocation_id: &str,
    ) -> Result<serde_json::Value, TransportError> {
        let endpoint = self.endpoint_for(node_id)?;
        let response = self
            .client
            .get(format!("{endpoint}/allocations/{allocation_id}"))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Ask the agent to stop and remove an allocation.
    pub async fn stop(&self, node_id: &str, allocation_id: &str) -> Result<(), TransportError> {
        let endpoint = self.endpoint_for(node_id)?;
        debug!(%allocation_id, %node_id, "requesting allocation stop");
        let response = self
            .client
            .delete(format!("{endpoint}/allocations/{allocation_id}"))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Rejected { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::models::{Node, NodeResources};
    use crate::store::Store;

    fn transport() -> (AgentTransport, Arc<NodeManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        let nm = Arc::new(NodeManager::new(store));
        (AgentTransport::new(nm.clone()), nm, dir)
    }

    #[tokio::test]
    async fn test_unknown_node_is_an_error() {
        let (transport, _nm, _dir) = transport();
        let result = transport.stop("ghost", "a1").await;
        assert!(matches!(result, Err(TransportError::UnknownEndpoint(_))));
    }

    #[tokio::test]
    async fn test_endpoint_falls_back_to_node_row() {
        let (transport, nm, _dir) = transport();
        nm.register_node(&Node {
            node_id: "n1".to_string(),
            ip_address: "10.0.0.1".to_string(),
            resources: NodeResources::default(),
            healthy: true,
            last_heartbeat: 0.0,
            endpoint: "http://10.0.0.1:8501".to_string(),
        })
        .unwrap();

        // Nothing cached, but the persisted row resolves.
        let endpoint = transport.endpoint_for("n1").unwrap();
        assert_eq!(endpoint, "http://10.0.0.1:8501");
        // And now it is cached.
        assert!(transport.endpoints.contains_key("n1"));

        transport.clear_cache();
        assert!(transport.endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_cache_wins_over_store() {
        let (transport, _nm, _dir) = transport();
        transport.register("n1", "http://cached:1");
        assert_eq!(transport.endpoint_for("n1").unwrap(), "http://cached:1");
    }
}
