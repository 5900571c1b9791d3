//! Node manager: registers this node under a TTL lease, keeps the lease
//! refreshed, discovers peers, and pools outbound RPC channels.
//!
//! Liveness policy: the refresher re-grants the lease every probe interval.
//! A single failed refresh is logged and retried on the next tick; the lease
//! TTL in the coordinator stays the source of truth, so peers observe the
//! node disappear within at most one interval of sustained failure.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{error, info, warn};

use rowmill_common::{MillError, NodeManagerOptions, Result};
use rowmill_coordinator::Coordinator;

use crate::node::{Node, NodeType};

const NODE_NS: &str = "nodes";

/// Cluster membership manager for one process.
pub struct NodeManager {
    crd: Arc<dyn Coordinator>,
    local: RwLock<Option<Node>>,
    channels: Mutex<HashMap<String, Channel>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
    tls: Option<ClientTlsConfig>,
    opt: NodeManagerOptions,
}

impl NodeManager {
    /// Build a manager. Loads TLS credentials when configured; otherwise
    /// inter-node RPC runs in insecure mode with a prominent warning.
    pub fn new(crd: Arc<dyn Coordinator>, opt: NodeManagerOptions) -> Result<Arc<Self>> {
        let tls = match &opt.tls_cert_path {
            Some(path) => {
                let pem = std::fs::read(path)?;
                let mut config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
                if let Some(name) = &opt.tls_cert_server_name {
                    config = config.domain_name(name.clone());
                }
                Some(config)
            }
            None => {
                warn!("inter-node RPC is in insecure mode; configuring TLS credentials is recommended");
                None
            }
        };
        Ok(Arc::new(Self {
            crd,
            local: RwLock::new(None),
            channels: Mutex::new(HashMap::new()),
            refresher: Mutex::new(None),
            tls,
            opt,
        }))
    }

    /// Register this node and start the background liveness refresher.
    pub async fn register_self(self: &Arc<Self>, node: Node) -> Result<()> {
        self.register_or_refresh(&node).await?;
        info!(id = %node.id, host = %node.host, typ = %node.typ, "node registered");
        *self.local.write().await = Some(node.clone());

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.opt.liveness_probe_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = manager.register_or_refresh(&node).await {
                    error!(
                        id = %node.id,
                        error = %e,
                        "liveness refresh failed; node may be invisible until the next tick"
                    );
                }
            }
        });
        let mut refresher = self.refresher.lock().await;
        if let Some(old) = refresher.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// One liveness round-trip: grant a fresh lease and re-write the node
    /// record under it, bounded by the probe timeout.
    async fn register_or_refresh(&self, node: &Node) -> Result<()> {
        let refresh = async {
            let lease = self
                .crd
                .grant_lease(self.opt.liveness_probe_interval)
                .await
                .map_err(|e| MillError::LeaseDenied(e.to_string()))?;
            rowmill_coordinator::put_as(
                self.crd.as_ref(),
                &format!("{NODE_NS}/{}", node.id),
                node,
                Some(lease),
            )
            .await
        };
        tokio::time::timeout(self.opt.liveness_probe_timeout, refresh)
            .await
            .map_err(|_| MillError::Unavailable("liveness probe timed out".to_string()))?
    }

    /// The local node descriptor; `None` until `register_self` completes.
    pub async fn local(&self) -> Option<Node> {
        self.local.read().await.clone()
    }

    /// Return a multiplexed channel to `host`, dialing on first use.
    pub async fn connect(&self, host: &str) -> Result<Channel> {
        if let Some(channel) = self.channels.lock().await.get(host) {
            return Ok(channel.clone());
        }
        self.establish(host).await
    }

    /// Drop a cached channel observed in a terminal failure state so the
    /// next `connect` re-dials.
    pub async fn forget(&self, host: &str) {
        self.channels.lock().await.remove(host);
    }

    async fn establish(&self, host: &str) -> Result<Channel> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{host}"))
            .map_err(|e| MillError::InvalidArgument(format!("bad peer host {host}: {e}")))?
            .connect_timeout(self.opt.connect_timeout);
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| MillError::Internal(format!("tls config: {e}")))?;
        }
        let channel = tokio::time::timeout(self.opt.connect_timeout, endpoint.connect())
            .await
            .map_err(|_| MillError::DialTimeout(host.to_string()))?
            .map_err(|e| MillError::Unavailable(format!("dial {host}: {e}")))?;
        self.channels
            .lock()
            .await
            .insert(host.to_string(), channel.clone());
        Ok(channel)
    }

    /// List registered nodes of one type.
    pub async fn list(&self, typ: NodeType) -> Result<Vec<Node>> {
        let items = self.crd.scan(&format!("{NODE_NS}/")).await?;
        let mut nodes = Vec::new();
        for item in items {
            let node: Node = item.decode()?;
            if node.typ == typ {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Delete a node registration. Unregistering self stops the refresher
    /// first so a late tick cannot resurrect the record.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        let is_self = matches!(&*self.local.read().await, Some(n) if n.id == id);
        if is_self {
            if let Some(handle) = self.refresher.lock().await.take() {
                handle.abort();
            }
            *self.local.write().await = None;
        }
        self.crd.delete(&format!("{NODE_NS}/{id}")).await?;
        Ok(())
    }

    /// Stop the refresher and drop all pooled channels.
    pub async fn close(&self) -> Result<()> {
        if let Some(handle) = self.refresher.lock().await.take() {
            handle.abort();
        }
        self.channels.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowmill_coordinator::MemCoordinator;
    use std::time::Duration;

    fn probe_opts(interval_ms: u64) -> NodeManagerOptions {
        NodeManagerOptions {
            liveness_probe_interval: Duration::from_millis(interval_ms),
            liveness_probe_timeout: Duration::from_millis(interval_ms),
            ..NodeManagerOptions::default()
        }
    }

    #[tokio::test]
    async fn register_list_unregister() {
        let crd: Arc<dyn Coordinator> = Arc::new(MemCoordinator::new());
        let manager = NodeManager::new(Arc::clone(&crd), probe_opts(100)).expect("manager");

        let node = Node::new("127.0.0.1:7466", NodeType::Worker);
        let id = node.id.clone();
        manager.register_self(node).await.expect("register");

        let workers = manager.list(NodeType::Worker).await.expect("list");
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id, id);
        assert!(manager
            .list(NodeType::Master)
            .await
            .expect("list")
            .is_empty());

        manager.unregister(&id).await.expect("unregister");
        assert!(manager.local().await.is_none());
        assert!(manager
            .list(NodeType::Worker)
            .await
            .expect("list")
            .is_empty());
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn lease_expiry_hides_node_until_reregistration() {
        let crd: Arc<dyn Coordinator> = Arc::new(MemCoordinator::new());
        let manager = NodeManager::new(Arc::clone(&crd), probe_opts(60)).expect("manager");
        let observer = NodeManager::new(Arc::clone(&crd), probe_opts(60)).expect("observer");

        let node = Node::new("127.0.0.1:7467", NodeType::Worker);
        manager.register_self(node.clone()).await.expect("register");
        assert_eq!(observer.list(NodeType::Worker).await.expect("list").len(), 1);

        // Pause the refresher; the record must vanish after one TTL.
        manager.close().await.expect("close");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(observer
            .list(NodeType::Worker)
            .await
            .expect("list")
            .is_empty());

        manager.register_self(node).await.expect("re-register");
        assert_eq!(observer.list(NodeType::Worker).await.expect("list").len(), 1);
        manager.close().await.expect("close");
    }
}
