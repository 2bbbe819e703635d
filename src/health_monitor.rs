//! Node Health Monitor
//!
//! Probes every registered storage node with `hlo` and records what it saw.
//! Writes are level-triggered: each pass writes every node's observed health,
//! changed or not. A failed write is logged and the pass moves on to the next node.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{AuthResult, TokenIssuer, TokenScope, SYSTEM_SUBJECT};
use crate::background::{spawn_periodic, BackgroundHandle};
use crate::catalog_store::{CatalogResult, CatalogStore, NodeAddress, NodeHealth};
use crate::node_client::NodeClient;

/// Outcome of one health pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub active: Vec<NodeAddress>,
    pub fallen: Vec<NodeAddress>,
}

impl HealthReport {
    pub fn probed(&self) -> usize {
        self.active.len() + self.fallen.len()
    }
}

pub struct HealthMonitor {
    store: Arc<CatalogStore>,
    client: NodeClient,
    system_token: String,
}

impl HealthMonitor {
    /// Build a monitor holding one unbounded system token for all probes
    pub fn new(store: Arc<CatalogStore>, issuer: &TokenIssuer, probe_timeout: Duration) -> AuthResult<Self> {
        Ok(Self {
            store,
            client: NodeClient::new(probe_timeout),
            system_token: issuer.issue_unbounded(SYSTEM_SUBJECT, TokenScope::System)?,
        })
    }

    /// Probe every registered node once and record the result
    pub async fn run_pass(&self) -> CatalogResult<HealthReport> {
        let mut report = HealthReport::default();

        let nodes = self.store.run_blocking(|store| store.list_nodes()).await?;

        for node in nodes {
            let address = node.address;
            let health = match self.client.hello(&address, &self.system_token).await {
                Ok(node_id) => {
                    debug!("Node {} ({}) is alive", address, node_id);
                    NodeHealth::Active
                }
                Err(e) => {
                    debug!("Node {} failed its probe: {}", address, e);
                    NodeHealth::Fallen
                }
            };

            if health != node.health {
                info!("Node {} is now {}", address, health.as_str());
            }
            let recorded = address.clone();
            if let Err(e) = self
                .store
                .run_blocking(move |store| store.set_node_health(&recorded, health))
                .await
            {
                warn!("Cannot record health of node {}: {}", address, e);
            }

            match health {
                NodeHealth::Active => report.active.push(address),
                _ => report.fallen.push(address),
            }
        }

        Ok(report)
    }

    /// Run passes every `interval`, starting now
    pub fn spawn(self: Arc<Self>, interval: Duration) -> BackgroundHandle {
        spawn_periodic("health-monitor", interval, move || {
            let monitor = Arc::clone(&self);
            async move {
                if let Err(e) = monitor.run_pass().await {
                    warn!("Health pass failed: {}", e);
                }
            }
        })
    }
}
